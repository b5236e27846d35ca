use std::collections::HashMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::definition::RoutingHint;
use crate::discovery::ServiceKey;

pub const SERVICE_TYPE: &str = "serviceType";
pub const SERVICE_NAME: &str = "serviceName";
pub const SERVICE_VERSION: &str = "serviceVersion";

/// Routing metadata attached to a task by the process model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingMeta {
    pub service_type: Option<String>,
    pub service_name: Option<String>,
    pub service_version: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, String>,
}

/// Fully specified destination of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingTarget {
    pub key: ServiceKey,
    pub version: Option<String>,
}

impl RoutingMeta {
    /// Extension properties take precedence over variables of the same name.
    pub fn from_sources(extension: &HashMap<String, String>, variables: &HashMap<String, Value>) -> Self {
        let lookup = |name: &str| {
            extension.get(name).cloned()
                .or_else(|| variables.get(name).and_then(Value::as_str).map(str::to_string))
                .filter(|v| !v.trim().is_empty())
        };
        let extra = extension.iter()
            .filter(|(k, _)| !matches!(k.as_str(), SERVICE_TYPE | SERVICE_NAME | SERVICE_VERSION))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Self {
            service_type: lookup(SERVICE_TYPE),
            service_name: lookup(SERVICE_NAME),
            service_version: lookup(SERVICE_VERSION),
            extra,
        }
    }

    /// Fills fields the task left empty from a topic hint.
    pub fn fill_from(&mut self, hint: &RoutingHint) {
        if self.service_type.is_none() {
            self.service_type = hint.service_type.clone();
        }
        if self.service_name.is_none() {
            self.service_name = hint.service_name.clone();
        }
        if self.service_version.is_none() {
            self.service_version = hint.service_version.clone();
        }
    }

    pub fn target(&self) -> Option<RoutingTarget> {
        match (&self.service_type, &self.service_name) {
            (Some(t), Some(n)) => Some(RoutingTarget {
                key: ServiceKey::new(t, n),
                version: self.service_version.clone(),
            }),
            _ => None,
        }
    }
}

/// An external task locked by this worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: String,
    pub topic: String,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub process_instance_id: Option<String>,
    pub process_definition_key: Option<String>,
    pub activity_id: Option<String>,
    /// Remaining retries as set by the engine; `None` until the first failure.
    pub retries: Option<u32>,
    pub variables: HashMap<String, Value>,
    pub routing: RoutingMeta,
}

impl Task {
    pub fn new(id: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            topic: topic.into(),
            lock_expires_at: None,
            process_instance_id: None,
            process_definition_key: None,
            activity_id: None,
            retries: None,
            variables: HashMap::new(),
            routing: RoutingMeta::default(),
        }
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    pub fn with_routing(mut self, service_type: &str, service_name: &str, version: Option<&str>) -> Self {
        self.routing.service_type = Some(service_type.to_string());
        self.routing.service_name = Some(service_name.to_string());
        self.routing.service_version = version.map(str::to_string);
        self
    }
}
