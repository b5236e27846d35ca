use std::collections::HashMap;
use std::time::Duration;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;

use crate::discovery::ServiceEndpoint;
use crate::invoke::{AttemptFailure, AttemptOutcome, ErrorKind, ProcessTaskRequest, TaskBackend};

/// Reply body of `POST /process_task`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProcessTaskResponse {
    status: String,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    retry: Option<bool>,
    #[serde(default)]
    retry_delay_ms: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

/// Invokes remote worker services over HTTP.
#[derive(Debug)]
pub struct HttpBackend {
    client: Client,
}

impl HttpBackend {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

/// Objects become the output variables; any other result lands under `result`.
fn output_variables(result: Option<Value>) -> HashMap<String, Value> {
    match result {
        None | Some(Value::Null) => HashMap::new(),
        Some(Value::Object(map)) => map.into_iter().collect(),
        Some(other) => HashMap::from([("result".to_string(), other)]),
    }
}

fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response.headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn interpret(reply: ProcessTaskResponse) -> AttemptOutcome {
    match reply.status.as_str() {
        "success" => Ok(output_variables(reply.result)),
        "error" => {
            let message = reply.error
                .or_else(|| reply.result.as_ref().map(|r| match r {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                }))
                .unwrap_or_else(|| "service reported an error".to_string());
            let retryable = reply.retry.unwrap_or(false);
            let kind = if retryable { ErrorKind::ServiceUnavailable } else { ErrorKind::ServiceRejected };
            Err(AttemptFailure::new(kind, message)
                .retryable(retryable)
                .with_delay(reply.retry_delay_ms.map(Duration::from_millis)))
        }
        other => Err(AttemptFailure::new(ErrorKind::InvalidResponse, format!("unknown status {:?}", other))),
    }
}

#[async_trait]
impl TaskBackend for HttpBackend {
    fn name(&self) -> &str {
        "http"
    }

    async fn process_task(&self, endpoint: &ServiceEndpoint, request: &ProcessTaskRequest) -> AttemptOutcome {
        let url = format!("{}/process_task", endpoint.base_url.trim_end_matches('/'));
        let response = match self.client.post(&url).json(request).send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return Err(AttemptFailure::new(ErrorKind::TransientNetwork, format!("request to {} timed out", url)));
            }
            Err(e) => {
                return Err(AttemptFailure::new(ErrorKind::TransientNetwork, format!("request to {} failed: {}", url, e)));
            }
        };

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            let delay = retry_after(&response);
            let body = response.text().await.unwrap_or_default();
            return Err(AttemptFailure::new(ErrorKind::ServiceUnavailable, format!("{} returned {}", url, status))
                .with_delay(delay)
                .with_details(body));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AttemptFailure::new(ErrorKind::ServiceRejected, format!("{} returned {}", url, status))
                .with_details(body));
        }

        match response.json::<ProcessTaskResponse>().await {
            Ok(reply) => interpret(reply),
            Err(e) => Err(AttemptFailure::new(ErrorKind::InvalidResponse, format!("unreadable reply from {}: {}", url, e))),
        }
    }
}
