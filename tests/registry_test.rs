use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use taskwire::config::{DiscoveryConfig, StaticService};
use taskwire::discovery::{
    ConsulDiscovery, DiscoveryBackend, DiscoveryError, ResolveError, ServiceEndpoint, ServiceKey,
    ServiceRegistration, ServiceRegistry, SnapshotSource,
};
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Discovery backend whose catalog the test scripts.
#[derive(Default)]
struct ScriptedDiscovery {
    catalog: Mutex<Option<Vec<ServiceEndpoint>>>,
}

impl ScriptedDiscovery {
    fn set(&self, endpoints: Option<Vec<ServiceEndpoint>>) {
        *self.catalog.lock().unwrap() = endpoints;
    }
}

#[async_trait]
impl DiscoveryBackend for ScriptedDiscovery {
    async fn catalog(&self) -> Result<Vec<ServiceEndpoint>, DiscoveryError> {
        self.catalog.lock().unwrap().clone().ok_or_else(|| DiscoveryError::Status {
            status: 503,
            body: "unavailable".to_string(),
        })
    }

    async fn register(&self, _registration: &ServiceRegistration) -> Result<(), DiscoveryError> {
        Ok(())
    }

    async fn deregister(&self, _id: &str) -> Result<(), DiscoveryError> {
        Ok(())
    }
}

fn endpoint(id: &str, service_type: &str, name: &str, healthy: bool) -> ServiceEndpoint {
    ServiceEndpoint {
        id: id.to_string(),
        service_type: service_type.to_string(),
        service_name: name.to_string(),
        version: None,
        base_url: format!("http://{}:8000", id),
        healthy,
        last_checked: Utc::now(),
    }
}

fn registry_with(discovery: Arc<ScriptedDiscovery>, statics: Vec<StaticService>) -> ServiceRegistry {
    let config = DiscoveryConfig {
        evict_after_failed_checks: 2,
        ..DiscoveryConfig::default()
    };
    ServiceRegistry::new(Some(discovery as Arc<dyn DiscoveryBackend>), statics, &config)
}

#[tokio::test]
async fn test_resolve_returns_only_healthy_endpoints() {
    let discovery = Arc::new(ScriptedDiscovery::default());
    discovery.set(Some(vec![
        endpoint("a", "ml", "classifier", true),
        endpoint("b", "ml", "classifier", false),
    ]));
    let registry = registry_with(discovery.clone(), Vec::new());
    registry.refresh().await;

    let key = ServiceKey::new("ml", "classifier");
    let resolved = registry.resolve(&key).expect("Expected a healthy endpoint");
    assert_eq!(resolved.len(), 1);
    assert_eq!(resolved[0].id, "a");

    // A goes unhealthy: the key is still known, so this is NoServiceAvailable.
    discovery.set(Some(vec![
        endpoint("a", "ml", "classifier", false),
        endpoint("b", "ml", "classifier", false),
    ]));
    registry.refresh().await;
    assert_eq!(registry.resolve(&key), Err(ResolveError::NoServiceAvailable(key.clone())));

    let unknown = ServiceKey::new("ml", "translator");
    assert_eq!(registry.resolve(&unknown), Err(ResolveError::UnknownService(unknown.clone())));
}

#[tokio::test]
async fn test_drained_key_stays_known() {
    let discovery = Arc::new(ScriptedDiscovery::default());
    discovery.set(Some(vec![endpoint("a", "ml", "classifier", true)]));
    let registry = registry_with(discovery.clone(), Vec::new());
    registry.refresh().await;

    discovery.set(Some(Vec::new()));
    registry.refresh().await;
    let key = ServiceKey::new("ml", "classifier");
    assert_eq!(registry.resolve(&key), Err(ResolveError::NoServiceAvailable(key.clone())));
}

#[tokio::test]
async fn test_unhealthy_endpoint_is_evicted_after_repeated_failures() {
    let discovery = Arc::new(ScriptedDiscovery::default());
    discovery.set(Some(vec![
        endpoint("a", "ml", "classifier", true),
        endpoint("b", "ml", "classifier", false),
    ]));
    let registry = registry_with(discovery.clone(), Vec::new());
    let key = ServiceKey::new("ml", "classifier");

    registry.refresh().await;
    assert_eq!(registry.snapshot().endpoints[&key].len(), 2);

    registry.refresh().await;
    let snapshot = registry.snapshot();
    assert_eq!(snapshot.endpoints[&key].len(), 1);
    assert_eq!(snapshot.endpoints[&key][0].id, "a");
}

#[tokio::test]
async fn test_static_fallback_when_discovery_unreachable() {
    let discovery = Arc::new(ScriptedDiscovery::default());
    let statics = vec![StaticService {
        service_type: "ml".to_string(),
        service_name: "classifier".to_string(),
        version: None,
        base_url: "http://static:9000".to_string(),
    }];
    let registry = registry_with(discovery.clone(), statics);
    registry.refresh().await;

    let snapshot = registry.snapshot();
    assert_eq!(snapshot.source, SnapshotSource::StaticFallback);
    let resolved = registry.resolve(&ServiceKey::new("ml", "classifier")).expect("Expected static endpoint");
    assert_eq!(resolved[0].base_url, "http://static:9000");
}

#[tokio::test]
async fn test_previous_snapshot_survives_discovery_outage() {
    let discovery = Arc::new(ScriptedDiscovery::default());
    discovery.set(Some(vec![endpoint("a", "ml", "classifier", true)]));
    let registry = registry_with(discovery.clone(), Vec::new());
    registry.refresh().await;
    let before = registry.snapshot();

    discovery.set(None);
    registry.refresh().await;
    let after = registry.snapshot();
    assert_eq!(after.source, SnapshotSource::Discovery);
    assert_eq!(after.refreshed_at, before.refreshed_at);
    assert!(registry.resolve(&ServiceKey::new("ml", "classifier")).is_ok());
}

#[tokio::test]
async fn test_discovered_endpoints_override_static_entries() {
    let discovery = Arc::new(ScriptedDiscovery::default());
    discovery.set(Some(vec![endpoint("a", "ml", "classifier", true)]));
    let statics = vec![
        StaticService {
            service_type: "ml".to_string(),
            service_name: "classifier".to_string(),
            version: None,
            base_url: "http://static:9000".to_string(),
        },
        StaticService {
            service_type: "mail".to_string(),
            service_name: "sender".to_string(),
            version: None,
            base_url: "http://mail:9000".to_string(),
        },
    ];
    let registry = registry_with(discovery, statics);
    registry.refresh().await;

    let classifier = registry.resolve(&ServiceKey::new("ml", "classifier")).expect("Expected endpoint");
    assert_eq!(classifier.len(), 1);
    assert_eq!(classifier[0].id, "a");
    assert!(registry.resolve(&ServiceKey::new("mail", "sender")).is_ok());
}

#[tokio::test]
async fn test_static_health_check_marks_endpoint_unhealthy() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "degraded"})))
        .mount(&server)
        .await;

    let config = DiscoveryConfig {
        check_static_health: true,
        ..DiscoveryConfig::default()
    };
    let statics = vec![StaticService {
        service_type: "ml".to_string(),
        service_name: "classifier".to_string(),
        version: None,
        base_url: server.uri(),
    }];
    let registry = ServiceRegistry::new(None, statics, &config);
    let key = ServiceKey::new("ml", "classifier");
    assert!(registry.resolve(&key).is_ok());

    registry.refresh().await;
    assert_eq!(registry.resolve(&key), Err(ResolveError::NoServiceAvailable(key.clone())));
}

#[tokio::test]
async fn test_consul_catalog() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/catalog/services"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "consul": [],
            "classifier": ["type:ml"],
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/health/service/classifier"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {
                "Node": {"Address": "10.0.0.1"},
                "Service": {
                    "ID": "classifier-1",
                    "Service": "classifier",
                    "Tags": ["type:ml", "version:2"],
                    "Address": "",
                    "Port": 9000,
                    "Meta": {}
                },
                "Checks": [{"Status": "passing"}, {"Status": "passing"}]
            },
            {
                "Node": {"Address": "10.0.0.2"},
                "Service": {
                    "ID": "classifier-2",
                    "Service": "classifier",
                    "Tags": [],
                    "Address": "10.0.0.20",
                    "Port": 9001,
                    "Meta": {"service_type": "ml", "version": "3", "scheme": "https"}
                },
                "Checks": [{"Status": "passing"}, {"Status": "critical"}]
            }
        ])))
        .mount(&server)
        .await;

    let consul = ConsulDiscovery::new(server.uri(), Duration::from_secs(2)).expect("Failed to build client");
    let mut endpoints = consul.catalog().await.expect("Catalog request failed");
    endpoints.sort_by(|a, b| a.id.cmp(&b.id));

    assert_eq!(endpoints.len(), 2);
    assert_eq!(endpoints[0].service_type, "ml");
    assert_eq!(endpoints[0].version.as_deref(), Some("2"));
    assert_eq!(endpoints[0].base_url, "http://10.0.0.1:9000");
    assert!(endpoints[0].healthy);
    assert_eq!(endpoints[1].version.as_deref(), Some("3"));
    assert_eq!(endpoints[1].base_url, "https://10.0.0.20:9001");
    assert!(!endpoints[1].healthy);
}

#[tokio::test]
async fn test_consul_register_and_deregister() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/agent/service/register"))
        .and(body_partial_json(json!({
            "ID": "classifier-1",
            "Name": "classifier",
            "Port": 9000,
            "Meta": {"service_type": "ml", "version": "2"},
            "Check": {"HTTP": "http://10.0.0.1:9000/health", "Interval": "10s"}
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/v1/agent/service/deregister/classifier-1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let consul = ConsulDiscovery::new(server.uri(), Duration::from_secs(2)).expect("Failed to build client");
    let registration = ServiceRegistration {
        id: "classifier-1".to_string(),
        name: "classifier".to_string(),
        service_type: "ml".to_string(),
        version: Some("2".to_string()),
        address: "10.0.0.1".to_string(),
        port: 9000,
        tags: vec!["type:ml".to_string()],
        meta: BTreeMap::new(),
        health_check_url: Some("http://10.0.0.1:9000/health".to_string()),
        check_interval: Duration::from_secs(10),
    };
    consul.register(&registration).await.expect("Registration failed");
    consul.deregister("classifier-1").await.expect("Deregistration failed");
}

#[tokio::test]
async fn test_consul_error_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/catalog/services"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let consul = ConsulDiscovery::new(server.uri(), Duration::from_secs(2)).expect("Failed to build client");
    match consul.catalog().await {
        Err(DiscoveryError::Status { status, body }) => {
            assert_eq!(status, 500);
            assert_eq!(body, "boom");
        }
        other => panic!("Expected status error, got {:?}", other.map(|e| e.len())),
    }
}
