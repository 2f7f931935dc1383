//! Workflow document model.
//!
//! A [`Workflow`] is immutable once loaded: the loader parses the YAML
//! document, fills in defaults, and validates it before the engine ever
//! sees it. Runtime state lives in
//! [`ExecutionContext`](crate::context::ExecutionContext), never here.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;

use crate::retry::BackoffKind;

/// A declarative pipeline of remote service calls.
#[derive(Debug, Clone, Deserialize)]
pub struct Workflow {
    pub name: String,
    pub version: String,
    /// Overall deadline for one execution. Zero or absent means unbounded.
    #[serde(default, deserialize_with = "deserialize_opt_duration")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub services: HashMap<String, Service>,
    #[serde(default)]
    pub steps: Vec<Step>,
    /// Workflow-level output templates, rendered against the final scope.
    #[serde(default)]
    pub output: HashMap<String, String>,
}

impl Workflow {
    /// The effective execution deadline, with zero normalized away.
    pub fn deadline(&self) -> Option<Duration> {
        self.timeout.filter(|d| !d.is_zero())
    }
}

/// One named remote service a workflow may call.
#[derive(Debug, Clone, Deserialize)]
pub struct Service {
    #[serde(rename = "type")]
    pub kind: ServiceKind,
    pub endpoint: String,
    /// Per-call deadline. Zero or absent means unbounded.
    #[serde(default, deserialize_with = "deserialize_opt_duration")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    /// Opaque key/value pairs forwarded as request headers.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Service {
    pub fn call_timeout(&self) -> Option<Duration> {
        self.timeout.filter(|d| !d.is_zero())
    }
}

/// Transport a service speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ServiceKind {
    #[serde(rename = "grpc", alias = "binary-rpc")]
    Grpc,
    #[serde(rename = "http")]
    Http,
}

impl ServiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Grpc => "grpc",
            ServiceKind::Http => "http",
        }
    }
}

/// Retry policy for a service. `attempts` caps total attempts, so 1 means
/// no retry at all.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryPolicy {
    pub attempts: u32,
    #[serde(default)]
    pub backoff: BackoffKind,
}

/// One unit of work. Exactly one shape is populated: a leaf invocation
/// (`service`/`method`) or a parallel group (`parallel` non-empty).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Step {
    /// Unique within the workflow; auto-filled by the loader if absent.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub method: String,
    /// Step input. String values that look like templates are rendered;
    /// every other value passes through verbatim.
    #[serde(default)]
    pub input: HashMap<String, JsonValue>,
    /// Name under which the step's result lands in the shared scope.
    #[serde(default)]
    pub output: Option<String>,
    /// Guard template; the step runs only when it renders truthy.
    #[serde(default)]
    pub when: Option<String>,
    #[serde(default)]
    pub compensate: Option<Compensation>,
    #[serde(default)]
    pub parallel: Vec<Step>,
}

impl Step {
    pub fn is_parallel(&self) -> bool {
        !self.parallel.is_empty()
    }

    /// Identifier used in logs and error messages.
    pub fn display_id(&self) -> &str {
        if self.is_parallel() {
            "parallel"
        } else {
            &self.id
        }
    }
}

/// Rollback action tied to a step; runs against the step's own service.
#[derive(Debug, Clone, Deserialize)]
pub struct Compensation {
    pub method: String,
    #[serde(default)]
    pub input: HashMap<String, JsonValue>,
}

/// Lifecycle states of one workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
    Compensating,
    Compensated,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Success => "success",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
            WorkflowStatus::Compensating => "compensating",
            WorkflowStatus::Compensated => "compensated",
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a step-input string value is a template. Only values that both
/// begin with `{{` and end with `}}` are rendered; anything else is taken
/// literally even if it contains braces.
pub fn is_template(value: &str) -> bool {
    value.len() >= 4 && value.starts_with("{{") && value.ends_with("}}")
}

/// Parse a Go-style duration string: one or more `<number><unit>` tokens,
/// e.g. `"30s"`, `"1h30m"`, `"1.5s"`, `"250ms"`.
pub fn parse_duration(text: &str) -> Result<Duration, String> {
    let text = text.trim();
    if text.is_empty() {
        return Err("empty duration".to_string());
    }
    if text == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total_secs = 0f64;
    let mut rest = text;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(|| format!("missing unit in duration {text:?}"))?;
        if number_len == 0 {
            return Err(format!("invalid duration {text:?}"));
        }
        let value: f64 = rest[..number_len]
            .parse()
            .map_err(|_| format!("invalid number in duration {text:?}"))?;

        let after_number = &rest[number_len..];
        let unit_len = after_number
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(after_number.len());
        let per_unit = match &after_number[..unit_len] {
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            unit => return Err(format!("unknown unit {unit:?} in duration {text:?}")),
        };

        total_secs += value * per_unit;
        rest = &after_number[unit_len..];
    }

    if !total_secs.is_finite() || total_secs < 0.0 {
        return Err(format!("invalid duration {text:?}"));
    }
    Ok(Duration::from_secs_f64(total_secs))
}

fn deserialize_opt_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw {
        None => Ok(None),
        Some(text) => parse_duration(&text)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}
