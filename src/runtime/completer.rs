use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::engine::{EngineError, TaskFailure, WorkflowEngine};
use crate::invoke::InvocationResult;
use crate::runtime::task::Task;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Completed,
    RetryScheduled { remaining: u32 },
    Incident,
}

/// Reports invocation outcomes back to the workflow engine.
pub struct TaskCompleter {
    engine: Arc<dyn WorkflowEngine>,
    default_retries: u32,
    default_retry_delay: Duration,
}

impl TaskCompleter {
    pub fn new(engine: Arc<dyn WorkflowEngine>, default_retries: u32, default_retry_delay: Duration) -> Self {
        Self {
            engine,
            default_retries,
            default_retry_delay,
        }
    }

    /// Failure report for an unsuccessful result. The retry budget only ever
    /// shrinks: `remaining - 1` for transient failures, zero otherwise.
    pub fn failure_for(&self, task: &Task, result: &InvocationResult) -> TaskFailure {
        let remaining = task.retries.unwrap_or(self.default_retries);
        let (retries, retry_timeout) = if result.retryable {
            (
                remaining.saturating_sub(1),
                result.retry_delay.unwrap_or(self.default_retry_delay),
            )
        } else {
            (0, Duration::ZERO)
        };

        let kind = result.error_kind.map(|k| k.to_string()).unwrap_or_else(|| "Unknown".to_string());
        let message = result.error_message.as_deref().unwrap_or("invocation failed");
        TaskFailure {
            error_message: format!("{}: {}", kind, message),
            error_details: result.error_details.clone(),
            retries,
            retry_timeout: if retries == 0 { Duration::ZERO } else { retry_timeout },
        }
    }

    pub async fn complete(&self, task: &Task, result: &InvocationResult) -> Result<Completion, EngineError> {
        if result.success {
            return match self.engine.complete(&task.id, &result.output_variables).await {
                Ok(()) => {
                    info!(task_id = %task.id, topic = %task.topic, attempt = result.attempt, "Task completed");
                    Ok(Completion::Completed)
                }
                Err(e) => {
                    error!(task_id = %task.id, error = %e, "Failed to report completion, lock will lapse");
                    Err(e)
                }
            };
        }

        let failure = self.failure_for(task, result);
        if let Err(e) = self.engine.fail(&task.id, &failure).await {
            error!(task_id = %task.id, error = %e, "Failed to report failure, lock will lapse");
            return Err(e);
        }

        if failure.retries == 0 {
            warn!(task_id = %task.id, topic = %task.topic, error = %failure.error_message, "Task failed, incident raised");
            Ok(Completion::Incident)
        } else {
            info!(
                task_id = %task.id,
                remaining = failure.retries,
                retry_in_ms = failure.retry_timeout.as_millis() as u64,
                error = %failure.error_message,
                "Task failed, retry scheduled"
            );
            Ok(Completion::RetryScheduled { remaining: failure.retries })
        }
    }
}
