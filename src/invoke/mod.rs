use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::{BreakerConfig, InvokerConfig};
use crate::discovery::ServiceEndpoint;
use crate::runtime::task::{RoutingMeta, Task};

pub mod breaker;
pub mod http;
pub mod retry;
pub mod sandbox;

pub use breaker::{BreakerRegistry, CircuitBreaker, CircuitState};
pub use http::HttpBackend;
pub use retry::RetryPolicy;
pub use sandbox::SandboxBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    TransientNetwork,
    ServiceUnavailable,
    NoServiceAvailable,
    MissingRoutingMetadata,
    VersionMismatch,
    UnknownService,
    CircuitOpen,
    SandboxViolation,
    ExecutionTimeout,
    ScriptFailed,
    InvalidResponse,
    ServiceRejected,
}

impl ErrorKind {
    /// Whether the failure may go away on its own.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorKind::TransientNetwork
                | ErrorKind::ServiceUnavailable
                | ErrorKind::NoServiceAvailable
                | ErrorKind::CircuitOpen
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(self, f)
    }
}

/// Outcome of one `invoke`, consumed by the completer.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationResult {
    pub success: bool,
    pub output_variables: HashMap<String, Value>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub error_details: Option<String>,
    pub retryable: bool,
    pub retry_delay: Option<Duration>,
    pub attempt: u32,
}

impl InvocationResult {
    pub fn success(output_variables: HashMap<String, Value>, attempt: u32) -> Self {
        Self {
            success: true,
            output_variables,
            error_kind: None,
            error_message: None,
            error_details: None,
            retryable: false,
            retry_delay: None,
            attempt,
        }
    }

    pub fn failure(kind: ErrorKind, message: impl Into<String>, attempt: u32) -> Self {
        Self {
            success: false,
            output_variables: HashMap::new(),
            error_kind: Some(kind),
            error_message: Some(message.into()),
            error_details: None,
            retryable: kind.is_transient(),
            retry_delay: None,
            attempt,
        }
    }

    fn from_failure(failure: AttemptFailure, attempt: u32) -> Self {
        Self {
            success: false,
            output_variables: HashMap::new(),
            error_kind: Some(failure.kind),
            error_message: Some(failure.message),
            error_details: failure.details,
            retryable: failure.retryable,
            retry_delay: failure.retry_delay,
            attempt,
        }
    }
}

/// Payload of `POST /process_task`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessTaskRequest {
    pub task_id: String,
    pub topic: String,
    pub variables: HashMap<String, Value>,
    pub routing: RoutingMeta,
}

impl ProcessTaskRequest {
    pub fn from_task(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            topic: task.topic.clone(),
            variables: task.variables.clone(),
            routing: task.routing.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttemptFailure {
    pub kind: ErrorKind,
    pub message: String,
    pub details: Option<String>,
    pub retryable: bool,
    pub retry_delay: Option<Duration>,
}

impl AttemptFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
            retryable: kind.is_transient(),
            retry_delay: None,
        }
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_delay(mut self, delay: Option<Duration>) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

pub type AttemptOutcome = Result<HashMap<String, Value>, AttemptFailure>;

/// A backend capable of processing one task attempt.
#[async_trait]
pub trait TaskBackend: Send + Sync + Debug {
    fn name(&self) -> &str;
    async fn process_task(&self, endpoint: &ServiceEndpoint, request: &ProcessTaskRequest) -> AttemptOutcome;
}

/// Calls backends with retry and per-endpoint circuit breaking.
#[derive(Debug)]
pub struct Invoker {
    http: Arc<dyn TaskBackend>,
    sandbox: Option<Arc<dyn TaskBackend>>,
    breakers: BreakerRegistry,
    retry: RetryPolicy,
}

impl Invoker {
    pub fn new(
        http: Arc<dyn TaskBackend>,
        sandbox: Option<Arc<dyn TaskBackend>>,
        invoker: &InvokerConfig,
        breaker: &BreakerConfig,
    ) -> Self {
        Self {
            http,
            sandbox,
            breakers: BreakerRegistry::new(breaker.clone()),
            retry: RetryPolicy::from_config(invoker),
        }
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    pub async fn invoke(&self, endpoint: &ServiceEndpoint, task: &Task) -> InvocationResult {
        let request = ProcessTaskRequest::from_task(task);

        if endpoint.is_builtin_sandbox() {
            let Some(sandbox) = &self.sandbox else {
                return InvocationResult::failure(ErrorKind::UnknownService, "sandbox backend is disabled", 0);
            };
            return match sandbox.process_task(endpoint, &request).await {
                Ok(output) => InvocationResult::success(output, 1),
                Err(failure) => InvocationResult::from_failure(failure, 1),
            };
        }

        let breaker = self.breakers.for_endpoint(&endpoint.id);
        let mut attempt = 0;
        loop {
            // `attempt` counts calls actually made
            let Some(permit) = breaker.try_acquire() else {
                debug!(endpoint = %endpoint.id, task_id = %task.id, "Circuit open, short-circuiting call");
                return InvocationResult::failure(
                    ErrorKind::CircuitOpen,
                    format!("circuit open for endpoint {}", endpoint.id),
                    attempt,
                );
            };
            attempt += 1;

            match self.http.process_task(endpoint, &request).await {
                Ok(output) => {
                    permit.success();
                    return InvocationResult::success(output, attempt);
                }
                Err(failure) => {
                    // A deliberate rejection means the endpoint is up.
                    if failure.retryable {
                        permit.failure();
                    } else {
                        permit.success();
                    }

                    if !failure.retryable || attempt > self.retry.max_retries {
                        warn!(
                            endpoint = %endpoint.id,
                            task_id = %task.id,
                            attempt,
                            kind = %failure.kind,
                            error = %failure.message,
                            "Invocation failed"
                        );
                        return InvocationResult::from_failure(failure, attempt);
                    }

                    let delay = self.retry.delay_for(attempt, failure.retry_delay);
                    debug!(
                        endpoint = %endpoint.id,
                        task_id = %task.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %failure.message,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
