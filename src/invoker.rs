//! Remote invocation over the registered transports.
//!
//! [`Invoker`] is the seam between the scheduler/saga and the wire: one
//! operation that executes a single remote call. [`RemoteInvoker`] is the
//! production implementation; it selects the transport from the service's
//! registration, routes the call through the service's circuit breaker,
//! and threads the correlation identifiers into every outbound request.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tonic::metadata::MetadataValue;
use tonic::Code;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::proto;
use crate::registry::{ServiceEntry, ServiceRegistry};
use crate::workflow::ServiceKind;

/// Default ceiling for one HTTP exchange.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Executes one remote call by service, method and input map.
#[async_trait]
pub trait Invoker: Send + Sync {
    async fn invoke(
        &self,
        service: &str,
        method: &str,
        input: HashMap<String, JsonValue>,
        workflow_id: &str,
        step_id: &str,
    ) -> Result<JsonValue, EngineError>;
}

pub struct RemoteInvoker {
    registry: Arc<ServiceRegistry>,
    http: reqwest::Client,
}

impl RemoteInvoker {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self {
            registry,
            http: reqwest::Client::new(),
        }
    }

    async fn invoke_grpc(
        &self,
        entry: &ServiceEntry,
        method: &str,
        input: HashMap<String, JsonValue>,
        workflow_id: &str,
        step_id: &str,
    ) -> Result<JsonValue, EngineError> {
        let channel = entry.pool.as_ref().and_then(|pool| pool.get()).ok_or_else(|| {
            EngineError::Connect(format!("no open connections for service {}", entry.name))
        })?;

        let correlation_id = format!("{workflow_id}:{step_id}");
        let mut request = tonic::Request::new(proto::ServiceRequest {
            method: method.to_string(),
            payload: Some(proto::struct_from_json(&input)),
            headers: entry.config.metadata.clone(),
            correlation_id: correlation_id.clone(),
            workflow_id: workflow_id.to_string(),
            step_id: step_id.to_string(),
        });
        insert_metadata(request.metadata_mut(), "workflow-id", workflow_id);
        insert_metadata(request.metadata_mut(), "step-id", step_id);
        insert_metadata(request.metadata_mut(), "correlation-id", &correlation_id);

        let mut client = proto::RemoteServiceClient::new(channel);
        let response = client.execute(request).await?;
        let reply = response.into_inner();

        if !reply.success {
            return Err(EngineError::Remote(reply.error));
        }
        Ok(reply
            .data
            .map(proto::json_from_struct)
            .unwrap_or(JsonValue::Null))
    }

    async fn invoke_http(
        &self,
        entry: &ServiceEntry,
        method: &str,
        input: HashMap<String, JsonValue>,
        workflow_id: &str,
        step_id: &str,
    ) -> Result<JsonValue, EngineError> {
        let (verb, path) = parse_http_method(method);
        let url = format!("{}{}", entry.config.endpoint.trim_end_matches('/'), path);

        let mut request = self
            .http
            .request(verb.clone(), &url)
            .timeout(HTTP_TIMEOUT)
            .header("x-workflow-id", workflow_id)
            .header("x-step-id", step_id)
            .header("x-correlation-id", format!("{workflow_id}:{step_id}"));
        for (key, value) in &entry.config.metadata {
            request = request.header(key, value);
        }

        if verb == reqwest::Method::GET {
            let query: Vec<(String, String)> = input
                .iter()
                .map(|(key, value)| (key.clone(), query_value(value)))
                .collect();
            request = request.query(&query);
        } else {
            request = request.json(&input);
        }

        let response = request
            .send()
            .await
            .map_err(|err| EngineError::Connect(err.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|err| EngineError::Connect(err.to_string()))?;

        if status >= 400 {
            return Err(EngineError::Http { status, body });
        }
        Ok(serde_json::from_str(&body).unwrap_or(JsonValue::String(body)))
    }
}

#[async_trait]
impl Invoker for RemoteInvoker {
    async fn invoke(
        &self,
        service: &str,
        method: &str,
        input: HashMap<String, JsonValue>,
        workflow_id: &str,
        step_id: &str,
    ) -> Result<JsonValue, EngineError> {
        let entry = self.registry.get(service)?;
        let generation = entry.breaker.acquire()?;

        debug!(
            service,
            method,
            workflow_id,
            step_id,
            kind = entry.config.kind.as_str(),
            "invoking remote service"
        );
        let result = match entry.config.kind {
            ServiceKind::Grpc => {
                self.invoke_grpc(&entry, method, input, workflow_id, step_id)
                    .await
            }
            ServiceKind::Http => {
                self.invoke_http(&entry, method, input, workflow_id, step_id)
                    .await
            }
        };

        entry.breaker.record(generation, result.is_ok());

        if let Err(EngineError::Rpc(status)) = &result {
            if matches!(status.code(), Code::Unavailable | Code::DeadlineExceeded) {
                warn!(service, code = ?status.code(), "marking service unhealthy");
                entry.set_healthy(false);
            }
        }

        result
    }
}

fn insert_metadata(map: &mut tonic::metadata::MetadataMap, key: &'static str, value: &str) {
    match MetadataValue::try_from(value) {
        Ok(value) => {
            map.insert(key, value);
        }
        Err(_) => warn!(key, "dropping non-ascii metadata value"),
    }
}

/// Interpret a step's `method` for an HTTP service: `"VERB /path"`, a
/// bare `"/path"` (POST assumed), or a bare name mapped to
/// `POST /api/<name>`.
fn parse_http_method(method: &str) -> (reqwest::Method, String) {
    if let Some((verb, path)) = method.split_once(' ') {
        let verb = reqwest::Method::from_bytes(verb.to_uppercase().as_bytes())
            .unwrap_or(reqwest::Method::POST);
        (verb, path.to_string())
    } else if method.starts_with('/') {
        (reqwest::Method::POST, method.to_string())
    } else {
        (reqwest::Method::POST, format!("/api/{}", method.to_lowercase()))
    }
}

fn query_value(value: &JsonValue) -> String {
    match value {
        JsonValue::String(text) => text.clone(),
        other => other.to_string(),
    }
}
