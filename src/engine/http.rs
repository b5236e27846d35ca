use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::engine::variables::{TypedValue, decode_variables, encode_variables};
use crate::engine::{EngineError, FetchRequest, TaskFailure, WorkflowEngine};
use crate::runtime::task::{RoutingMeta, Task};

/// Client for a Camunda-7-compatible external-task REST API.
#[derive(Debug, Clone)]
pub struct HttpWorkflowEngine {
    client: Client,
    base_url: String,
    worker_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FetchAndLockBody<'a> {
    worker_id: &'a str,
    max_tasks: usize,
    use_priority: bool,
    topics: Vec<TopicRequest<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TopicRequest<'a> {
    topic_name: &'a str,
    lock_duration: u64,
    include_extension_properties: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LockedExternalTask {
    id: String,
    topic_name: String,
    lock_expiration_time: Option<String>,
    process_instance_id: Option<String>,
    process_definition_key: Option<String>,
    activity_id: Option<String>,
    retries: Option<i64>,
    #[serde(default)]
    variables: Option<HashMap<String, TypedValue>>,
    #[serde(default)]
    extension_properties: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExternalTaskSummary {
    topic_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProcessDefinitionSummary {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProcessDefinitionXml {
    id: String,
    bpmn20_xml: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CompleteBody<'a> {
    worker_id: &'a str,
    variables: HashMap<String, TypedValue>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FailureBody<'a> {
    worker_id: &'a str,
    error_message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_details: Option<&'a str>,
    retries: u32,
    retry_timeout: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExtendLockBody<'a> {
    worker_id: &'a str,
    new_duration: u64,
}

/// Accepts RFC 3339 as well as the engine's `2015-10-06T16:34:42.000+0200` form.
pub fn parse_lock_expiration(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z"))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

impl LockedExternalTask {
    fn into_task(self) -> Task {
        let variables = decode_variables(self.variables.unwrap_or_default());
        let extension = self.extension_properties.unwrap_or_default();
        let routing = RoutingMeta::from_sources(&extension, &variables);
        let lock_expires_at = self.lock_expiration_time.as_deref().and_then(|raw| {
            let parsed = parse_lock_expiration(raw);
            if parsed.is_none() {
                debug!(task_id = %self.id, raw = %raw, "Unparseable lock expiration time");
            }
            parsed
        });

        Task {
            id: self.id,
            topic: self.topic_name,
            lock_expires_at,
            process_instance_id: self.process_instance_id,
            process_definition_key: self.process_definition_key,
            activity_id: self.activity_id,
            retries: self.retries.map(|r| r.clamp(0, u32::MAX as i64) as u32),
            variables,
            routing,
        }
    }
}

async fn check(response: Response) -> Result<Response, EngineError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(EngineError::Status { status: status.as_u16(), body })
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl HttpWorkflowEngine {
    pub fn new(base_url: impl Into<String>, worker_id: impl Into<String>, timeout: Duration) -> Result<Self, EngineError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            worker_id: worker_id.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl WorkflowEngine for HttpWorkflowEngine {
    fn worker_id(&self) -> &str {
        &self.worker_id
    }

    async fn fetch_and_lock(&self, request: &FetchRequest) -> Result<Vec<Task>, EngineError> {
        let body = FetchAndLockBody {
            worker_id: &self.worker_id,
            max_tasks: request.max_tasks,
            use_priority: true,
            topics: request.topics.iter().map(|topic| TopicRequest {
                topic_name: topic,
                lock_duration: millis(request.lock_duration),
                include_extension_properties: true,
            }).collect(),
        };
        let response = self.client.post(self.url("/external-task/fetchAndLock"))
            .json(&body)
            .send()
            .await?;
        let locked: Vec<LockedExternalTask> = check(response).await?
            .json()
            .await
            .map_err(|e| EngineError::Decode(e.to_string()))?;
        Ok(locked.into_iter().map(LockedExternalTask::into_task).collect())
    }

    async fn complete(&self, task_id: &str, variables: &HashMap<String, Value>) -> Result<(), EngineError> {
        let body = CompleteBody {
            worker_id: &self.worker_id,
            variables: encode_variables(variables),
        };
        let response = self.client.post(self.url(&format!("/external-task/{}/complete", task_id)))
            .json(&body)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn fail(&self, task_id: &str, failure: &TaskFailure) -> Result<(), EngineError> {
        let body = FailureBody {
            worker_id: &self.worker_id,
            error_message: &failure.error_message,
            error_details: failure.error_details.as_deref(),
            retries: failure.retries,
            retry_timeout: millis(failure.retry_timeout),
        };
        let response = self.client.post(self.url(&format!("/external-task/{}/failure", task_id)))
            .json(&body)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn extend_lock(&self, task_id: &str, new_duration: Duration) -> Result<(), EngineError> {
        let body = ExtendLockBody {
            worker_id: &self.worker_id,
            new_duration: millis(new_duration),
        };
        let response = self.client.post(self.url(&format!("/external-task/{}/extendLock", task_id)))
            .json(&body)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn active_topics(&self) -> Result<BTreeSet<String>, EngineError> {
        let response = self.client.get(self.url("/external-task"))
            .query(&[("notLocked", "true"), ("active", "true"), ("withRetriesLeft", "true")])
            .send()
            .await?;
        let tasks: Vec<ExternalTaskSummary> = check(response).await?
            .json()
            .await
            .map_err(|e| EngineError::Decode(e.to_string()))?;
        Ok(tasks.into_iter().filter_map(|t| t.topic_name).collect())
    }

    async fn process_definitions(&self) -> Result<Vec<(String, String)>, EngineError> {
        let response = self.client.get(self.url("/process-definition"))
            .query(&[("latestVersion", "true")])
            .send()
            .await?;
        let definitions: Vec<ProcessDefinitionSummary> = check(response).await?
            .json()
            .await
            .map_err(|e| EngineError::Decode(e.to_string()))?;

        let mut documents = Vec::with_capacity(definitions.len());
        for definition in definitions {
            let response = self.client.get(self.url(&format!("/process-definition/{}/xml", definition.id)))
                .send()
                .await?;
            let xml: ProcessDefinitionXml = check(response).await?
                .json()
                .await
                .map_err(|e| EngineError::Decode(e.to_string()))?;
            if let Some(document) = xml.bpmn20_xml {
                documents.push((xml.id, document));
            }
        }
        Ok(documents)
    }
}
