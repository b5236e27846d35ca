use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{Context as AnyhowContext, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::discovery::SANDBOX_BASE_URL;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("poller.lock_duration_ms must be at least 1000, got {0}")]
    LockTooShort(u64),
    #[error("poller.lock_renewal_fraction must be within (0, 1), got {0}")]
    RenewalFraction(f64),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("invoker.base_delay_ms ({base}) exceeds invoker.max_delay_ms ({max})")]
    BackoffRange { base: u64, max: u64 },
    #[error("static service {0} has an empty base_url")]
    EmptyBaseUrl(String),
}

/// Top-level configuration. Every section falls back to documented defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub discovery: DiscoveryConfig,
    pub poller: PollerConfig,
    pub invoker: InvokerConfig,
    pub breaker: BreakerConfig,
    pub sandbox: SandboxConfig,
    pub orchestrator: OrchestratorConfig,
    /// Fallback table used when the discovery backend is unreachable.
    pub services: Vec<StaticService>,
    /// Directory of `.bpmn` files scanned for static topics at boot.
    pub definitions_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub base_url: String,
    pub worker_id: Option<String>,
    pub request_timeout_ms: u64,
    /// Also read process-definition XML from the engine for static topics.
    pub fetch_definitions: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/engine-rest".to_string(),
            worker_id: None,
            request_timeout_ms: 10_000,
            fetch_definitions: true,
        }
    }
}

impl EngineConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn worker_id(&self) -> String {
        self.worker_id.clone().unwrap_or_else(|| format!("taskwire-{}", Uuid::new_v4()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Consul-compatible agent address. `None` runs on the static table alone.
    pub base_url: Option<String>,
    pub request_timeout_ms: u64,
    pub refresh_interval_ms: u64,
    pub evict_after_failed_checks: u32,
    /// Check `GET {base}/health` on static endpoints during refresh.
    pub check_static_health: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            request_timeout_ms: 5_000,
            refresh_interval_ms: 10_000,
            evict_after_failed_checks: 3,
            check_static_health: false,
        }
    }
}

impl DiscoveryConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    pub lock_duration_ms: u64,
    /// Fraction of the lease after which the lock is extended.
    pub lock_renewal_fraction: f64,
    pub max_tasks: usize,
    pub poll_interval_ms: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            lock_duration_ms: 30_000,
            lock_renewal_fraction: 0.5,
            max_tasks: 10,
            poll_interval_ms: 1_000,
        }
    }
}

impl PollerConfig {
    pub fn lock_duration(&self) -> Duration {
        Duration::from_millis(self.lock_duration_ms)
    }

    pub fn renewal_interval(&self) -> Duration {
        self.lock_duration().mul_f64(self.lock_renewal_fraction)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InvokerConfig {
    pub request_timeout_ms: u64,
    /// Retries after the first attempt for transient failures.
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for InvokerConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
            max_retries: 3,
            base_delay_ms: 200,
            max_delay_ms: 10_000,
        }
    }
}

impl InvokerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 30_000,
        }
    }
}

impl BreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkPolicy {
    /// Run scripts in an empty network namespace; refuse to run if unavailable.
    Deny,
    Allow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub enabled: bool,
    pub service_type: String,
    pub service_name: String,
    pub default_language: String,
    pub default_timeout_ms: u64,
    pub max_timeout_ms: u64,
    pub default_memory_mb: u64,
    pub max_memory_mb: u64,
    pub max_output_bytes: usize,
    pub network: NetworkPolicy,
    /// Language name to interpreter argv; the script path is appended.
    pub interpreters: BTreeMap<String, Vec<String>>,
    /// `PATH` visible to executed code.
    pub path: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        let mut interpreters = BTreeMap::new();
        interpreters.insert("python".to_string(), vec!["python3".to_string(), "-I".to_string()]);
        interpreters.insert("sh".to_string(), vec!["sh".to_string()]);
        interpreters.insert("bash".to_string(), vec!["bash".to_string()]);
        Self {
            enabled: true,
            service_type: "sandbox".to_string(),
            service_name: "script".to_string(),
            default_language: "python".to_string(),
            default_timeout_ms: 5_000,
            max_timeout_ms: 60_000,
            default_memory_mb: 256,
            max_memory_mb: 1_024,
            max_output_bytes: 64 * 1024,
            network: NetworkPolicy::Deny,
            interpreters,
            path: "/usr/local/bin:/usr/bin:/bin".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub worker_pool_size: usize,
    /// Idle time after which a fully drained orchestrator stops. `None` runs forever.
    pub idle_grace_ms: Option<u64>,
    pub absolute_timeout_ms: Option<u64>,
    /// Retry budget assumed for tasks the engine has not assigned one yet.
    pub default_retries: u32,
    pub default_retry_delay_ms: u64,
    pub definition_refresh_interval_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 8,
            idle_grace_ms: None,
            absolute_timeout_ms: None,
            default_retries: 3,
            default_retry_delay_ms: 5_000,
            definition_refresh_interval_ms: 60_000,
        }
    }
}

impl OrchestratorConfig {
    pub fn idle_grace(&self) -> Option<Duration> {
        self.idle_grace_ms.map(Duration::from_millis)
    }

    pub fn absolute_timeout(&self) -> Option<Duration> {
        self.absolute_timeout_ms.map(Duration::from_millis)
    }

    pub fn default_retry_delay(&self) -> Duration {
        Duration::from_millis(self.default_retry_delay_ms)
    }

    pub fn definition_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.definition_refresh_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticService {
    pub service_type: String,
    pub service_name: String,
    #[serde(default)]
    pub version: Option<String>,
    pub base_url: String,
}

impl Config {
    pub fn load(file_path: &Path) -> Result<Config> {
        let content = fs::read_to_string(file_path)
            .with_context(|| format!("Failed to read config file from {}", file_path.display()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to deserialize config from {}", file_path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poller.lock_duration_ms < 1_000 {
            return Err(ConfigError::LockTooShort(self.poller.lock_duration_ms));
        }
        let fraction = self.poller.lock_renewal_fraction;
        if !(fraction > 0.0 && fraction < 1.0) {
            return Err(ConfigError::RenewalFraction(fraction));
        }
        if self.poller.max_tasks == 0 {
            return Err(ConfigError::Zero("poller.max_tasks"));
        }
        if self.orchestrator.worker_pool_size == 0 {
            return Err(ConfigError::Zero("orchestrator.worker_pool_size"));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::Zero("breaker.failure_threshold"));
        }
        if self.invoker.base_delay_ms > self.invoker.max_delay_ms {
            return Err(ConfigError::BackoffRange {
                base: self.invoker.base_delay_ms,
                max: self.invoker.max_delay_ms,
            });
        }
        for service in &self.services {
            if service.base_url.trim().is_empty() {
                return Err(ConfigError::EmptyBaseUrl(format!("{}/{}", service.service_type, service.service_name)));
            }
        }
        if self.poller.lock_duration_ms <= self.invoker.request_timeout_ms {
            warn!(
                lock_duration_ms = self.poller.lock_duration_ms,
                request_timeout_ms = self.invoker.request_timeout_ms,
                "Lock lease is not longer than a single invocation; relying on lock renewal"
            );
        }
        Ok(())
    }

    /// Static fallback table, including the built-in sandbox when enabled.
    pub fn static_services(&self) -> Vec<StaticService> {
        let mut services = self.services.clone();
        if self.sandbox.enabled {
            services.push(StaticService {
                service_type: self.sandbox.service_type.clone(),
                service_name: self.sandbox.service_name.clone(),
                version: None,
                base_url: SANDBOX_BASE_URL.to_string(),
            });
        }
        services
    }
}
