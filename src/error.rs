//! Error types for workflow loading and execution.

use thiserror::Error;
use tonic::Code;

/// Errors surfaced while loading or validating a workflow document.
///
/// None of these reach the execution engine: a workflow that fails to load
/// is never registered.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read workflow file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse workflow YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A schema-level problem, reported with its dotted document path.
    #[error("{path}: {message}")]
    Invalid { path: String, message: String },

    #[error("duplicate step id: {0}")]
    DuplicateStepId(String),

    #[error("duplicate output name: {0}")]
    DuplicateOutput(String),

    /// A step input or guard references an output that is not recorded by
    /// any strictly earlier step. Catches forward references, references
    /// between parallel siblings, and therefore every cycle.
    #[error("step {step_id}: references output {reference:?} before it is recorded")]
    EarlyReference { step_id: String, reference: String },
}

impl LoadError {
    pub(crate) fn invalid(path: impl Into<String>, message: impl Into<String>) -> Self {
        LoadError::Invalid {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// A compensation that could not be replayed during rollback.
#[derive(Debug, Clone)]
pub struct CompensationFailure {
    pub step_id: String,
    pub message: String,
}

/// Errors surfaced while executing a workflow.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("workflow {0} not found")]
    WorkflowNotFound(String),

    #[error("service {0} not found")]
    ServiceNotFound(String),

    #[error("service {0} already registered")]
    ServiceExists(String),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("template error: {0}")]
    Template(String),

    #[error("rpc error: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("http error: status {status}: {body}")]
    Http { status: u16, body: String },

    #[error("connection error: {0}")]
    Connect(String),

    /// The remote service replied, but flagged the call as failed.
    #[error("service returned error: {0}")]
    Remote(String),

    #[error("circuit breaker open for service {0}")]
    BreakerOpen(String),

    /// The per-attempt service deadline expired.
    #[error("attempt deadline exceeded")]
    AttemptTimeout,

    #[error("workflow cancelled")]
    Cancelled,

    #[error("step {step_id}: {source}")]
    Step {
        step_id: String,
        #[source]
        source: Box<EngineError>,
    },

    #[error("compensation completed with {} error(s): {}", .0.len(), format_failures(.0))]
    Compensation(Vec<CompensationFailure>),

    #[error("internal error: {0}")]
    Internal(String),
}

fn format_failures(failures: &[CompensationFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.step_id, f.message))
        .collect::<Vec<_>>()
        .join("; ")
}

impl EngineError {
    /// Whether another attempt is permitted under a retry policy.
    ///
    /// Retryable: transport codes for unavailable / deadline exceeded /
    /// resource exhausted, HTTP 5xx plus 408 and 429, network-level
    /// connect or timeout failures, per-attempt deadline expiry, and
    /// in-service failure replies. Everything else is terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Rpc(status) => matches!(
                status.code(),
                Code::Unavailable | Code::DeadlineExceeded | Code::ResourceExhausted
            ),
            EngineError::Http { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            EngineError::Connect(_) => true,
            EngineError::Remote(_) => true,
            EngineError::AttemptTimeout => true,
            EngineError::Step { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Whether this error is a cooperative cancellation of the workflow
    /// scope. Cancellation terminates the run without compensation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            EngineError::Cancelled => true,
            EngineError::Step { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}
