pub mod config;
pub mod definition;
pub mod discovery;
pub mod engine;
pub mod invoke;
pub mod runtime;
