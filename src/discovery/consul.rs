use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::discovery::{DiscoveryBackend, DiscoveryError, ServiceEndpoint, ServiceRegistration};

const TYPE_META: &str = "service_type";
const VERSION_META: &str = "version";
const SCHEME_META: &str = "scheme";

/// Consul-compatible catalog client.
#[derive(Debug, Clone)]
pub struct ConsulDiscovery {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthEntry {
    node: NodeInfo,
    service: ServiceInfo,
    #[serde(default)]
    checks: Vec<CheckInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NodeInfo {
    #[serde(default)]
    address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceInfo {
    #[serde(rename = "ID")]
    id: String,
    service: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    address: String,
    port: u16,
    #[serde(default)]
    meta: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CheckInfo {
    status: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct RegisterBody<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    name: &'a str,
    tags: &'a [String],
    address: &'a str,
    port: u16,
    meta: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    check: Option<serde_json::Value>,
}

impl ConsulDiscovery {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, DiscoveryError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn services(&self) -> Result<Vec<String>, DiscoveryError> {
        let url = format!("{}/v1/catalog/services", self.base_url);
        let response = self.client.get(url).send().await?;
        let services: HashMap<String, Vec<String>> = check(response).await?.json().await?;
        let mut names: Vec<String> = services.into_keys().filter(|name| name != "consul").collect();
        names.sort();
        Ok(names)
    }

    async fn instances(&self, name: &str) -> Result<Vec<ServiceEndpoint>, DiscoveryError> {
        let url = format!("{}/v1/health/service/{}", self.base_url, name);
        let response = self.client.get(url).send().await?;
        let entries: Vec<HealthEntry> = check(response).await?.json().await?;
        Ok(entries.into_iter().filter_map(to_endpoint).collect())
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, DiscoveryError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(DiscoveryError::Status { status: status.as_u16(), body })
}

fn tag_value<'a>(tags: &'a [String], prefix: &str) -> Option<&'a str> {
    tags.iter().find_map(|t| t.strip_prefix(prefix))
}

fn to_endpoint(entry: HealthEntry) -> Option<ServiceEndpoint> {
    let service = entry.service;
    let service_type = service.meta.get(TYPE_META).map(String::as_str)
        .or_else(|| tag_value(&service.tags, "type:"))
        .map(str::to_string);
    let Some(service_type) = service_type else {
        debug!(instance = %service.id, service = %service.service, "Instance has no service type, skipping");
        return None;
    };
    let version = service.meta.get(VERSION_META).map(String::as_str)
        .or_else(|| tag_value(&service.tags, "version:"))
        .map(str::to_string);
    let scheme = service.meta.get(SCHEME_META).map(String::as_str).unwrap_or("http");
    let address = if service.address.is_empty() { entry.node.address } else { service.address };
    let healthy = entry.checks.iter().all(|c| c.status == "passing");

    Some(ServiceEndpoint {
        id: service.id,
        service_type,
        service_name: service.service,
        version,
        base_url: format!("{}://{}:{}", scheme, address, service.port),
        healthy,
        last_checked: Utc::now(),
    })
}

#[async_trait]
impl DiscoveryBackend for ConsulDiscovery {
    async fn catalog(&self) -> Result<Vec<ServiceEndpoint>, DiscoveryError> {
        let mut endpoints = Vec::new();
        for name in self.services().await? {
            endpoints.extend(self.instances(&name).await?);
        }
        Ok(endpoints)
    }

    async fn register(&self, registration: &ServiceRegistration) -> Result<(), DiscoveryError> {
        let mut meta = registration.meta.clone();
        meta.insert(TYPE_META.to_string(), registration.service_type.clone());
        if let Some(version) = &registration.version {
            meta.insert(VERSION_META.to_string(), version.clone());
        }
        let health_check = registration.health_check_url.as_ref().map(|url| json!({
            "HTTP": url,
            "Interval": format!("{}s", registration.check_interval.as_secs().max(1)),
        }));
        let body = RegisterBody {
            id: &registration.id,
            name: &registration.name,
            tags: &registration.tags,
            address: &registration.address,
            port: registration.port,
            meta,
            check: health_check,
        };

        let url = format!("{}/v1/agent/service/register", self.base_url);
        let response = self.client.put(url).json(&body).send().await?;
        check(response).await?;
        Ok(())
    }

    async fn deregister(&self, id: &str) -> Result<(), DiscoveryError> {
        let url = format!("{}/v1/agent/service/deregister/{}", self.base_url, id);
        let response = self.client.put(url).send().await?;
        check(response).await?;
        Ok(())
    }
}
