use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use chrono::Utc;
use tracing::{debug, warn};

use crate::config::PollerConfig;
use crate::engine::{FetchRequest, WorkflowEngine};
use crate::runtime::task::Task;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Idle,
    Fetching,
    Locking,
}

impl fmt::Display for PollerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollerState::Idle => write!(f, "idle"),
            PollerState::Fetching => write!(f, "fetching"),
            PollerState::Locking => write!(f, "locking"),
        }
    }
}

/// Locks batches of external tasks. Engine failures never escape a cycle.
pub struct TaskPoller {
    engine: Arc<dyn WorkflowEngine>,
    lock_duration: Duration,
    state: Mutex<PollerState>,
}

impl TaskPoller {
    pub fn new(engine: Arc<dyn WorkflowEngine>, config: &PollerConfig) -> Self {
        Self {
            engine,
            lock_duration: config.lock_duration(),
            state: Mutex::new(PollerState::Idle),
        }
    }

    pub fn lock_duration(&self) -> Duration {
        self.lock_duration
    }

    pub fn state(&self) -> PollerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: PollerState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Locks up to `max_tasks` tasks. `None` means the engine could not be
    /// reached, which callers must not mistake for an idle cycle.
    pub async fn fetch_and_lock(&self, topics: &BTreeSet<String>, max_tasks: usize) -> Option<Vec<Task>> {
        if topics.is_empty() || max_tasks == 0 {
            return Some(Vec::new());
        }

        self.set_state(PollerState::Fetching);
        let request = FetchRequest {
            topics: topics.iter().cloned().collect(),
            lock_duration: self.lock_duration,
            max_tasks,
        };
        let fetched = self.engine.fetch_and_lock(&request).await;
        self.set_state(PollerState::Locking);

        let tasks = match fetched {
            Ok(tasks) => {
                let now = Utc::now();
                let (live, expired): (Vec<Task>, Vec<Task>) = tasks.into_iter()
                    .partition(|t| t.lock_expires_at.is_none_or(|at| at > now));
                for task in &expired {
                    warn!(task_id = %task.id, topic = %task.topic, "Dropping task whose lock already expired");
                }
                if !live.is_empty() {
                    debug!(count = live.len(), worker_id = %self.engine.worker_id(), "Locked tasks");
                }
                Some(live)
            }
            Err(e) => {
                warn!(error = %e, "fetchAndLock failed, retrying next cycle");
                None
            }
        };

        self.set_state(PollerState::Idle);
        tasks
    }

    /// Topics with unlocked work, or `None` when the engine could not be asked.
    pub async fn active_topics(&self) -> Option<BTreeSet<String>> {
        match self.engine.active_topics().await {
            Ok(topics) => Some(topics),
            Err(e) => {
                warn!(error = %e, "Failed to list active topics");
                None
            }
        }
    }
}
