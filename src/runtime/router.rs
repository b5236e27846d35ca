use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use dashmap::DashMap;
use thiserror::Error;
use tracing::debug;

use crate::discovery::{ResolveError, ServiceEndpoint, ServiceKey, ServiceRegistry};
use crate::invoke::ErrorKind;
use crate::runtime::task::Task;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    #[error("task {task_id} carries no serviceType/serviceName")]
    MissingRoutingMetadata { task_id: String },
    #[error("no endpoint of {key} advertises version {version}")]
    VersionMismatch { key: ServiceKey, version: String },
    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

impl RoutingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RoutingError::MissingRoutingMetadata { .. } => ErrorKind::MissingRoutingMetadata,
            RoutingError::VersionMismatch { .. } => ErrorKind::VersionMismatch,
            RoutingError::Resolve(ResolveError::UnknownService(_)) => ErrorKind::UnknownService,
            RoutingError::Resolve(ResolveError::NoServiceAvailable(_)) => ErrorKind::NoServiceAvailable,
        }
    }

    /// Routing metadata problems need a model fix; the rest may heal on refresh.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RoutingError::Resolve(ResolveError::NoServiceAvailable(_)))
    }
}

/// Picks an endpoint for a task, round-robin per service key.
pub struct TaskRouter {
    registry: Arc<ServiceRegistry>,
    cursors: DashMap<ServiceKey, AtomicUsize>,
}

impl TaskRouter {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self {
            registry,
            cursors: DashMap::new(),
        }
    }

    pub fn route(&self, task: &Task) -> Result<ServiceEndpoint, RoutingError> {
        let mut candidates = self.candidates(task)?;
        // candidates() never returns an empty list
        Ok(candidates.swap_remove(0))
    }

    /// Every eligible endpoint, rotated so the round-robin pick comes first.
    pub fn candidates(&self, task: &Task) -> Result<Vec<ServiceEndpoint>, RoutingError> {
        let target = task.routing.target().ok_or_else(|| RoutingError::MissingRoutingMetadata {
            task_id: task.id.clone(),
        })?;

        let snapshot = self.registry.snapshot();
        let mut eligible = match (snapshot.resolve(&target.key), &target.version) {
            (Err(ResolveError::UnknownService(key)), _) => return Err(ResolveError::UnknownService(key).into()),
            (_, Some(version)) if !snapshot.advertises(&target.key, version) => {
                return Err(RoutingError::VersionMismatch {
                    key: target.key,
                    version: version.clone(),
                });
            }
            (resolved, _) => resolved?,
        };
        if let Some(version) = &target.version {
            // the version exists but none of its endpoints is healthy right now
            eligible.retain(|e| e.version.as_deref() == Some(version.as_str()));
            if eligible.is_empty() {
                return Err(ResolveError::NoServiceAvailable(target.key).into());
            }
        }

        let turn = self.cursors.entry(target.key.clone())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed);
        let start = turn % eligible.len();
        eligible.rotate_left(start);

        debug!(task_id = %task.id, service = %target.key, endpoint = %eligible[0].id, "Routed task");
        Ok(eligible)
    }
}
