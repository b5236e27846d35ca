use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;

use crate::engine::{EngineError, FetchRequest, TaskFailure, WorkflowEngine};
use crate::runtime::task::Task;

#[derive(Debug, Clone, PartialEq)]
pub enum TaskStatus {
    Open,
    Completed(HashMap<String, Value>),
    Incident { message: String },
}

#[derive(Debug, Clone)]
struct Lease {
    worker_id: String,
    expires_at: Instant,
}

#[derive(Debug, Clone)]
struct TaskRecord {
    task: Task,
    status: TaskStatus,
    lease: Option<Lease>,
    available_at: Instant,
    failures: Vec<TaskFailure>,
    times_locked: u32,
}

impl TaskRecord {
    fn lockable(&self, now: Instant) -> bool {
        self.status == TaskStatus::Open
            && self.available_at <= now
            && self.lease.as_ref().is_none_or(|l| l.expires_at <= now)
    }

    fn held_by(&self, worker_id: &str, now: Instant) -> bool {
        self.status == TaskStatus::Open
            && self.lease.as_ref().is_some_and(|l| l.worker_id == worker_id && l.expires_at > now)
    }
}

#[derive(Default)]
struct EngineState {
    tasks: DashMap<String, TaskRecord>,
    definitions: DashMap<String, String>,
}

/// In-process stand-in for the workflow engine with real lease semantics.
/// Handles created through [`InMemoryEngine::worker`] share state, so several
/// workers can compete for the same tasks.
#[derive(Clone)]
pub struct InMemoryEngine {
    state: Arc<EngineState>,
    worker_id: String,
}

impl InMemoryEngine {
    pub fn new() -> Self {
        Self {
            state: Arc::new(EngineState::default()),
            worker_id: "memory-worker".to_string(),
        }
    }

    pub fn worker(&self, worker_id: impl Into<String>) -> Self {
        Self {
            state: self.state.clone(),
            worker_id: worker_id.into(),
        }
    }

    pub fn add_task(&self, task: Task) {
        let record = TaskRecord {
            task: task.clone(),
            status: TaskStatus::Open,
            lease: None,
            available_at: Instant::now(),
            failures: Vec::new(),
            times_locked: 0,
        };
        self.state.tasks.insert(task.id, record);
    }

    pub fn deploy(&self, definition_id: impl Into<String>, xml: impl Into<String>) {
        self.state.definitions.insert(definition_id.into(), xml.into());
    }

    pub fn status(&self, task_id: &str) -> Option<TaskStatus> {
        self.state.tasks.get(task_id).map(|r| r.status.clone())
    }

    pub fn retries(&self, task_id: &str) -> Option<u32> {
        self.state.tasks.get(task_id).and_then(|r| r.task.retries)
    }

    pub fn failures(&self, task_id: &str) -> Vec<TaskFailure> {
        self.state.tasks.get(task_id).map(|r| r.failures.clone()).unwrap_or_default()
    }

    pub fn times_locked(&self, task_id: &str) -> u32 {
        self.state.tasks.get(task_id).map_or(0, |r| r.times_locked)
    }

    pub fn lock_holder(&self, task_id: &str) -> Option<String> {
        let now = Instant::now();
        self.state.tasks.get(task_id)
            .and_then(|r| r.lease.clone())
            .filter(|l| l.expires_at > now)
            .map(|l| l.worker_id)
    }

    pub fn open_tasks(&self) -> usize {
        self.state.tasks.iter().filter(|r| r.status == TaskStatus::Open).count()
    }

    /// Makes a failed task fetchable again immediately.
    pub fn release_backoff(&self, task_id: &str) {
        if let Some(mut record) = self.state.tasks.get_mut(task_id) {
            record.available_at = Instant::now();
        }
    }

    fn with_held<T>(&self, task_id: &str, f: impl FnOnce(&mut TaskRecord) -> T) -> Result<T, EngineError> {
        let mut record = self.state.tasks.get_mut(task_id)
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))?;
        if !record.held_by(&self.worker_id, Instant::now()) {
            return Err(EngineError::LockNotHeld(task_id.to_string()));
        }
        Ok(f(&mut record))
    }
}

impl Default for InMemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowEngine for InMemoryEngine {
    fn worker_id(&self) -> &str {
        &self.worker_id
    }

    async fn fetch_and_lock(&self, request: &FetchRequest) -> Result<Vec<Task>, EngineError> {
        let now = Instant::now();
        let mut candidates: Vec<String> = self.state.tasks.iter()
            .filter(|r| request.topics.contains(&r.task.topic) && r.lockable(now))
            .map(|r| r.key().clone())
            .collect();
        candidates.sort();

        let mut locked = Vec::new();
        for id in candidates {
            if locked.len() >= request.max_tasks {
                break;
            }
            let Some(mut record) = self.state.tasks.get_mut(&id) else {
                continue;
            };
            // Another worker may have claimed it since the scan.
            if !record.lockable(Instant::now()) {
                continue;
            }
            record.lease = Some(Lease {
                worker_id: self.worker_id.clone(),
                expires_at: Instant::now() + request.lock_duration,
            });
            record.times_locked += 1;
            let mut task = record.task.clone();
            task.lock_expires_at = chrono::Duration::from_std(request.lock_duration)
                .ok()
                .map(|d| Utc::now() + d);
            locked.push(task);
        }
        Ok(locked)
    }

    async fn complete(&self, task_id: &str, variables: &HashMap<String, Value>) -> Result<(), EngineError> {
        self.with_held(task_id, |record| {
            record.task.variables.extend(variables.clone());
            record.status = TaskStatus::Completed(variables.clone());
            record.lease = None;
        })
    }

    async fn fail(&self, task_id: &str, failure: &TaskFailure) -> Result<(), EngineError> {
        self.with_held(task_id, |record| {
            record.failures.push(failure.clone());
            record.task.retries = Some(failure.retries);
            record.lease = None;
            if failure.retries == 0 {
                record.status = TaskStatus::Incident { message: failure.error_message.clone() };
            } else {
                record.available_at = Instant::now() + failure.retry_timeout;
            }
        })
    }

    async fn extend_lock(&self, task_id: &str, new_duration: Duration) -> Result<(), EngineError> {
        let worker_id = self.worker_id.clone();
        self.with_held(task_id, |record| {
            record.lease = Some(Lease {
                worker_id,
                expires_at: Instant::now() + new_duration,
            });
        })
    }

    async fn active_topics(&self) -> Result<BTreeSet<String>, EngineError> {
        let now = Instant::now();
        Ok(self.state.tasks.iter()
            .filter(|r| r.lockable(now))
            .map(|r| r.task.topic.clone())
            .collect())
    }

    async fn process_definitions(&self) -> Result<Vec<(String, String)>, EngineError> {
        let mut definitions: Vec<(String, String)> = self.state.definitions.iter()
            .map(|d| (d.key().clone(), d.value().clone()))
            .collect();
        definitions.sort();
        Ok(definitions)
    }
}
