use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{DiscoveryConfig, StaticService};
use crate::discovery::{DiscoveryBackend, ServiceEndpoint, ServiceKey};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("no service registered for {0}")]
    UnknownService(ServiceKey),
    #[error("no healthy endpoint for {0}")]
    NoServiceAvailable(ServiceKey),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotSource {
    /// Built from the static table before any refresh.
    Initial,
    Discovery,
    /// Discovery was unreachable on first contact; static table only.
    StaticFallback,
}

/// Immutable view of the catalog. Replaced wholesale on every refresh.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    /// Endpoints per key, sorted by id.
    pub endpoints: BTreeMap<ServiceKey, Vec<ServiceEndpoint>>,
    /// Every key ever seen, so a drained key is not reported as unknown.
    pub known: BTreeSet<ServiceKey>,
    pub refreshed_at: DateTime<Utc>,
    pub source: SnapshotSource,
}

impl RegistrySnapshot {
    fn healthy_count(&self, key: &ServiceKey) -> usize {
        self.endpoints.get(key).map_or(0, |eps| eps.iter().filter(|e| e.healthy).count())
    }

    pub fn resolve(&self, key: &ServiceKey) -> Result<Vec<ServiceEndpoint>, ResolveError> {
        if !self.known.contains(key) {
            return Err(ResolveError::UnknownService(key.clone()));
        }
        let healthy: Vec<ServiceEndpoint> = self.endpoints.get(key)
            .map(|eps| eps.iter().filter(|e| e.healthy).cloned().collect())
            .unwrap_or_default();
        if healthy.is_empty() {
            return Err(ResolveError::NoServiceAvailable(key.clone()));
        }
        Ok(healthy)
    }

    /// Whether any registered endpoint of `key` offers `version`, healthy or not.
    pub fn advertises(&self, key: &ServiceKey, version: &str) -> bool {
        self.endpoints.get(key)
            .is_some_and(|eps| eps.iter().any(|e| e.version.as_deref() == Some(version)))
    }
}

pub struct ServiceRegistry {
    discovery: Option<Arc<dyn DiscoveryBackend>>,
    static_services: Vec<StaticService>,
    health_client: Option<Client>,
    evict_after: u32,
    snapshot: watch::Sender<Arc<RegistrySnapshot>>,
    /// Consecutive failed health checks per endpoint id; owned by `refresh`.
    failed_checks: Mutex<HashMap<String, u32>>,
    discovery_ok: Mutex<bool>,
}

fn static_endpoint(service: &StaticService, healthy: bool) -> ServiceEndpoint {
    ServiceEndpoint {
        id: service.base_url.clone(),
        service_type: service.service_type.clone(),
        service_name: service.service_name.clone(),
        version: service.version.clone(),
        base_url: service.base_url.clone(),
        healthy,
        last_checked: Utc::now(),
    }
}

fn group(endpoints: Vec<ServiceEndpoint>) -> BTreeMap<ServiceKey, Vec<ServiceEndpoint>> {
    let mut grouped: BTreeMap<ServiceKey, Vec<ServiceEndpoint>> = BTreeMap::new();
    for endpoint in endpoints {
        grouped.entry(endpoint.key()).or_default().push(endpoint);
    }
    for eps in grouped.values_mut() {
        eps.sort_by(|a, b| a.id.cmp(&b.id));
        eps.dedup_by(|a, b| a.id == b.id);
    }
    grouped
}

impl ServiceRegistry {
    pub fn new(
        discovery: Option<Arc<dyn DiscoveryBackend>>,
        static_services: Vec<StaticService>,
        config: &DiscoveryConfig,
    ) -> Self {
        let endpoints = group(static_services.iter().map(|s| static_endpoint(s, true)).collect());
        let initial = RegistrySnapshot {
            known: endpoints.keys().cloned().collect(),
            endpoints,
            refreshed_at: Utc::now(),
            source: SnapshotSource::Initial,
        };
        let health_client = if config.check_static_health {
            Client::builder().timeout(config.request_timeout()).build().ok()
        } else {
            None
        };
        let (snapshot, _) = watch::channel(Arc::new(initial));

        Self {
            discovery,
            static_services,
            health_client,
            evict_after: config.evict_after_failed_checks.max(1),
            snapshot,
            failed_checks: Mutex::new(HashMap::new()),
            discovery_ok: Mutex::new(false),
        }
    }

    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<RegistrySnapshot>> {
        self.snapshot.subscribe()
    }

    /// Healthy endpoints for a key, from the last published snapshot.
    pub fn resolve(&self, key: &ServiceKey) -> Result<Vec<ServiceEndpoint>, ResolveError> {
        self.snapshot().resolve(key)
    }

    /// Pulls the catalog and publishes a new snapshot. Never fails: an
    /// unreachable backend leaves the previous snapshot in place.
    pub async fn refresh(&self) {
        let mut discovery_ok = self.discovery_ok.lock().await;
        let previous = self.snapshot();

        let (discovered, source) = match &self.discovery {
            Some(backend) => match backend.catalog().await {
                Ok(endpoints) => {
                    *discovery_ok = true;
                    (endpoints, SnapshotSource::Discovery)
                }
                Err(e) if *discovery_ok => {
                    warn!(error = %e, "Discovery refresh failed, keeping previous snapshot");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "Discovery unreachable, using static service table");
                    (Vec::new(), SnapshotSource::StaticFallback)
                }
            },
            None => (Vec::new(), SnapshotSource::StaticFallback),
        };

        let mut endpoints = self.apply_eviction(discovered).await;
        let covered: BTreeSet<ServiceKey> = endpoints.iter().map(ServiceEndpoint::key).collect();
        for service in &self.static_services {
            let key = ServiceKey::new(&service.service_type, &service.service_name);
            if !covered.contains(&key) {
                let healthy = self.check_static(service).await;
                endpoints.push(static_endpoint(service, healthy));
            }
        }

        let endpoints = group(endpoints);
        let mut known = previous.known.clone();
        known.extend(endpoints.keys().cloned());
        let next = RegistrySnapshot {
            endpoints,
            known,
            refreshed_at: Utc::now(),
            source,
        };

        log_transitions(&previous, &next);
        self.snapshot.send_replace(Arc::new(next));
    }

    /// Drops endpoints that failed `evict_after` consecutive checks.
    async fn apply_eviction(&self, discovered: Vec<ServiceEndpoint>) -> Vec<ServiceEndpoint> {
        let mut failed = self.failed_checks.lock().await;
        let present: BTreeSet<&str> = discovered.iter().map(|e| e.id.as_str()).collect();
        failed.retain(|id, _| present.contains(id.as_str()));

        let mut kept = Vec::with_capacity(discovered.len());
        for endpoint in discovered {
            if endpoint.healthy {
                failed.remove(&endpoint.id);
                kept.push(endpoint);
                continue;
            }
            let count = failed.entry(endpoint.id.clone()).or_insert(0);
            *count += 1;
            if *count >= self.evict_after {
                debug!(endpoint = %endpoint.id, failures = *count, "Evicting endpoint after repeated failed health checks");
            } else {
                kept.push(endpoint);
            }
        }
        kept
    }

    async fn check_static(&self, service: &StaticService) -> bool {
        let Some(client) = &self.health_client else {
            return true;
        };
        if !service.base_url.starts_with("http") {
            return true;
        }
        let url = format!("{}/health", service.base_url.trim_end_matches('/'));
        match client.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                let body: Value = response.json().await.unwrap_or(Value::Null);
                body.get("status").and_then(Value::as_str) == Some("healthy")
            }
            Ok(response) => {
                debug!(url = %url, status = response.status().as_u16(), "Static endpoint health check failed");
                false
            }
            Err(e) => {
                debug!(url = %url, error = %e, "Static endpoint health check failed");
                false
            }
        }
    }

    /// Runs `refresh` on its own timer until `shutdown` is cancelled.
    pub fn spawn_refresh(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => self.refresh().await,
                }
            }
            debug!("Registry refresh loop stopped");
        })
    }
}

fn log_transitions(previous: &RegistrySnapshot, next: &RegistrySnapshot) {
    for key in &next.known {
        let before = previous.healthy_count(key);
        let after = next.healthy_count(key);
        if before > 0 && after == 0 {
            warn!(service = %key, "Service has no healthy endpoints");
        } else if before == 0 && after > 0 && previous.known.contains(key) {
            info!(service = %key, healthy = after, "Service has healthy endpoints again");
        }
    }
}
