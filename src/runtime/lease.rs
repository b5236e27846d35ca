use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::PollerConfig;
use crate::engine::{EngineError, WorkflowEngine};

#[derive(Debug, Error)]
#[error("lost lock on task {task_id}: {reason}")]
pub struct LeaseLost {
    pub task_id: String,
    pub reason: String,
}

/// Keeps a task's lock alive while it is being worked on.
#[derive(Clone)]
pub struct LeaseKeeper {
    engine: Arc<dyn WorkflowEngine>,
    lock_duration: Duration,
    renew_every: Duration,
}

impl LeaseKeeper {
    pub fn new(engine: Arc<dyn WorkflowEngine>, config: &PollerConfig) -> Self {
        Self {
            engine,
            lock_duration: config.lock_duration(),
            renew_every: config.renewal_interval(),
        }
    }

    pub fn renew_every(&self) -> Duration {
        self.renew_every
    }

    /// Renews the lock on `task_id` until cancelled by the caller dropping the
    /// future. Resolves only when a renewal fails or cannot finish before the
    /// current lock lapses.
    pub async fn hold(&self, task_id: &str, acquired: Instant) -> LeaseLost {
        let mut expires_at = acquired + self.lock_duration;
        let mut next = acquired + self.renew_every;
        loop {
            tokio::time::sleep_until(next).await;

            let remaining = expires_at.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return self.lost(task_id, "lock expired before renewal");
            }

            let renewal = self.engine.extend_lock(task_id, self.lock_duration);
            match tokio::time::timeout(remaining, renewal).await {
                Ok(Ok(())) => {
                    let now = Instant::now();
                    expires_at = now + self.lock_duration;
                    next = now + self.renew_every;
                    debug!(task_id = %task_id, "Renewed task lock");
                }
                Ok(Err(EngineError::Status { status, body })) => {
                    return self.lost(task_id, format!("engine refused renewal ({}): {}", status, body));
                }
                Ok(Err(e)) => return self.lost(task_id, e.to_string()),
                Err(_) => return self.lost(task_id, "renewal did not finish before the lock lapsed"),
            }
        }
    }

    fn lost(&self, task_id: &str, reason: impl Into<String>) -> LeaseLost {
        let lost = LeaseLost {
            task_id: task_id.to_string(),
            reason: reason.into(),
        };
        warn!(task_id = %task_id, reason = %lost.reason, "Abandoning task");
        lost
    }
}
