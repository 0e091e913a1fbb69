//! HTTP workload API client.
//!
//! Talks to a node's control plane:
//! - `GET {api}/apps/listrunningapps` (public read, no credential)
//! - `GET {api}/apps/appremove?appname={name}` (credential in `zelidauth`)
//!
//! Every request carries the configured timeout. A timeout is a transport
//! error, never an authorization failure.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::api::{ListFailure, ListResult, RemoveOutcome, RunningWorkload, WorkloadApi};
use crate::logging::Subsystem;
use crate::registry::Node;

/// Header carrying the session credential.
pub const CREDENTIAL_HEADER: &str = "zelidauth";

pub const LIST_RUNNING_PATH: &str = "/apps/listrunningapps";
pub const REMOVE_PATH: &str = "/apps/appremove";

const STATUS_SUCCESS: &str = "success";
const STATUS_ERROR: &str = "error";

/// HTTP implementation of [`WorkloadApi`].
#[derive(Debug, Clone)]
pub struct HttpWorkloadClient {
    client: reqwest::Client,
    debug: bool,
}

impl HttpWorkloadClient {
    /// Create a client whose requests time out after `timeout`. With `debug`
    /// set, raw response bodies are logged.
    pub fn new(timeout: Duration, debug: bool) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, debug })
    }
}

#[async_trait]
impl WorkloadApi for HttpWorkloadClient {
    async fn list_running(&self, node: &Node) -> ListResult {
        let url = format!("{}{}", node.api_url, LIST_RUNNING_PATH);
        let subsystem = Subsystem::Api(node.id);

        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                info!(subsystem = %subsystem, error = %e, "Listing running workloads failed");
                return ListResult::Failure(ListFailure::Transport(e.to_string()));
            }
        };

        let status = response.status();
        if !status.is_success() {
            info!(subsystem = %subsystem, status = %status, "Listing running workloads rejected");
            return ListResult::Failure(ListFailure::Status(status.as_u16()));
        }

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                info!(subsystem = %subsystem, error = %e, "Reading workload listing failed");
                return ListResult::Failure(ListFailure::Transport(e.to_string()));
            }
        };

        if self.debug {
            debug!(subsystem = %subsystem, body = %body, "Running workloads response");
        }

        let result = parse_list_envelope(&body);
        if let ListResult::Failure(failure) = &result {
            info!(subsystem = %subsystem, reason = %failure, "Workload listing has no success envelope");
        }
        result
    }

    async fn remove_workload(
        &self,
        node: &Node,
        name: &str,
        credential: Option<&str>,
    ) -> RemoveOutcome {
        let subsystem = Subsystem::Api(node.id);

        let Some(credential) = credential else {
            debug!(subsystem = %subsystem, workload = name, "Not logged in, skipping removal");
            return RemoveOutcome::AuthRejected {
                reason: "no credential held".to_string(),
            };
        };

        let url = format!("{}{}", node.api_url, REMOVE_PATH);
        let response = match self
            .client
            .get(&url)
            .query(&[("appname", name)])
            .header(CREDENTIAL_HEADER, credential)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                return RemoveOutcome::Failed {
                    reason: if e.is_timeout() {
                        "request timed out".to_string()
                    } else {
                        e.to_string()
                    },
                };
            }
        };

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return RemoveOutcome::AuthRejected {
                reason: format!("HTTP {}", status.as_u16()),
            };
        }
        if !status.is_success() {
            return RemoveOutcome::Failed {
                reason: format!("HTTP {}", status.as_u16()),
            };
        }

        // A body that cannot be read after a 2xx counts like an empty one.
        let body = response.text().await.unwrap_or_default();
        if self.debug {
            debug!(subsystem = %subsystem, workload = name, body = %body, "Raw removal response");
        }

        interpret_remove_body(&body)
    }
}

#[derive(Debug, Deserialize)]
struct ListEnvelope {
    status: Option<String>,
    data: Option<Value>,
}

/// Accept only `status == "success"` with an array `data`.
pub fn parse_list_envelope(body: &str) -> ListResult {
    let envelope: ListEnvelope = match serde_json::from_str(body) {
        Ok(envelope) => envelope,
        Err(e) => return ListResult::Failure(ListFailure::Envelope(e.to_string())),
    };

    if envelope.status.as_deref() != Some(STATUS_SUCCESS) {
        return ListResult::Failure(ListFailure::Envelope(format!(
            "status {}",
            envelope.status.as_deref().unwrap_or("missing")
        )));
    }

    match envelope.data {
        Some(Value::Array(items)) => ListResult::Success(
            items
                .into_iter()
                .map(|item| serde_json::from_value(item).unwrap_or_default())
                .collect(),
        ),
        _ => ListResult::Failure(ListFailure::Envelope("data is not an array".to_string())),
    }
}

/// Classify a 2xx removal body.
///
/// The control plane may answer with nothing, plain text, one JSON object or
/// a stream of concatenated JSON objects. Any object with an error status, or
/// any message with an unauthorized indicator, fails the removal.
pub fn interpret_remove_body(body: &str) -> RemoveOutcome {
    let body = body.trim();
    if body.is_empty() {
        return RemoveOutcome::Removed { final_status: None };
    }

    let mut final_status = None;
    for value in serde_json::Deserializer::from_str(body).into_iter::<Value>() {
        // Plain text, or a stream that breaks off: keep what was read.
        let Ok(value) = value else { break };

        let status = value.get("status").and_then(Value::as_str);
        let message = envelope_message(&value);

        if let Some(message) = message.as_deref() {
            if is_unauthorized_message(message) {
                return RemoveOutcome::AuthRejected {
                    reason: message.to_string(),
                };
            }
        }

        if status == Some(STATUS_ERROR) {
            let code = value
                .get("data")
                .and_then(|d| d.get("code"))
                .and_then(Value::as_u64);
            let reason = message.unwrap_or_else(|| "error envelope".to_string());
            if matches!(code, Some(401) | Some(403)) {
                return RemoveOutcome::AuthRejected { reason };
            }
            return RemoveOutcome::Failed { reason };
        }

        if let Some(last) = message.or_else(|| status.map(str::to_string)) {
            final_status = Some(last);
        }
    }

    RemoveOutcome::Removed { final_status }
}

fn envelope_message(value: &Value) -> Option<String> {
    let data = value.get("data")?;
    match data {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

fn is_unauthorized_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("unauthorized") || lower.contains("unauthorised") || lower.contains("not authorized")
}
