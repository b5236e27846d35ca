use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod consul;
pub mod registry;

pub use consul::ConsulDiscovery;
pub use registry::{RegistrySnapshot, ResolveError, ServiceRegistry, SnapshotSource};

/// Base URL of the built-in script-execution backend.
pub const SANDBOX_BASE_URL: &str = "builtin://sandbox";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceKey {
    pub service_type: String,
    pub service_name: String,
}

impl ServiceKey {
    pub fn new(service_type: impl Into<String>, service_name: impl Into<String>) -> Self {
        Self {
            service_type: service_type.into(),
            service_name: service_name.into(),
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service_type, self.service_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    /// Discovery instance id, or the base URL for static entries.
    pub id: String,
    pub service_type: String,
    pub service_name: String,
    pub version: Option<String>,
    pub base_url: String,
    pub healthy: bool,
    pub last_checked: DateTime<Utc>,
}

impl ServiceEndpoint {
    pub fn key(&self) -> ServiceKey {
        ServiceKey::new(&self.service_type, &self.service_name)
    }

    pub fn is_builtin_sandbox(&self) -> bool {
        self.base_url == SANDBOX_BASE_URL
    }
}

/// Registration payload for the discovery backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRegistration {
    pub id: String,
    pub name: String,
    pub service_type: String,
    pub version: Option<String>,
    pub address: String,
    pub port: u16,
    pub tags: Vec<String>,
    pub meta: BTreeMap<String, String>,
    pub health_check_url: Option<String>,
    pub check_interval: Duration,
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("discovery backend unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("discovery backend returned {status}: {body}")]
    Status { status: u16, body: String },
}

/// Health-checked service catalog.
#[async_trait]
pub trait DiscoveryBackend: Send + Sync {
    /// All known instances across all services, healthy or not.
    async fn catalog(&self) -> Result<Vec<ServiceEndpoint>, DiscoveryError>;
    async fn register(&self, registration: &ServiceRegistration) -> Result<(), DiscoveryError>;
    async fn deregister(&self, id: &str) -> Result<(), DiscoveryError>;
}
