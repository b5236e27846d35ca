use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::runtime::task::Task;

pub mod http;
pub mod memory;
pub mod variables;

pub use http::HttpWorkflowEngine;
pub use memory::InMemoryEngine;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("workflow engine unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("workflow engine returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed engine response: {0}")]
    Decode(String),
    #[error("task {0} not found")]
    TaskNotFound(String),
    #[error("lock on task {0} is not held by this worker")]
    LockNotHeld(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub topics: Vec<String>,
    pub lock_duration: Duration,
    pub max_tasks: usize,
}

/// Failure report; `retries == 0` makes the engine raise an incident.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskFailure {
    pub error_message: String,
    pub error_details: Option<String>,
    pub retries: u32,
    pub retry_timeout: Duration,
}

/// External-task API of the workflow engine. One instance speaks for one worker id.
#[async_trait]
pub trait WorkflowEngine: Send + Sync {
    fn worker_id(&self) -> &str;

    async fn fetch_and_lock(&self, request: &FetchRequest) -> Result<Vec<Task>, EngineError>;

    async fn complete(&self, task_id: &str, variables: &HashMap<String, Value>) -> Result<(), EngineError>;

    async fn fail(&self, task_id: &str, failure: &TaskFailure) -> Result<(), EngineError>;

    async fn extend_lock(&self, task_id: &str, new_duration: Duration) -> Result<(), EngineError>;

    /// Topics that currently have unlocked, fetchable tasks.
    async fn active_topics(&self) -> Result<BTreeSet<String>, EngineError>;

    /// Latest process-definition documents as `(definition id, xml)`.
    async fn process_definitions(&self) -> Result<Vec<(String, String)>, EngineError>;
}
