pub mod extractor;
pub mod loader;

pub use extractor::{ProcessTopics, RoutingHint, extract, extract_topics};
