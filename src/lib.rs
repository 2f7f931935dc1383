//! Overture - a stateless orchestrator for declarative service workflows.
//!
//! A workflow is a YAML document naming a set of remote services (binary
//! RPC or JSON over HTTP) and an ordered list of steps, each sequential,
//! parallel-group, or guarded. Step inputs are templates over the caller
//! input and prior step outputs; steps may declare compensating actions
//! that replay in reverse commit order when a later step fails. The key
//! components are:
//!
//! ## Execution engine
//!
//! - [`Engine`]: per-instance driver, lifecycle tracking, result bundle
//! - [`Scheduler`]: step dispatch, worker-pool admission, retry/backoff
//! - [`SagaCoordinator`]: reverse-order compensation on failure
//!
//! ## Resilience layer
//!
//! - [`ServiceRegistry`]: per-service configuration, pools, health flags
//! - [`ChannelPool`]: round-robin transport connections with keepalive
//! - [`CircuitBreaker`]: closed / open / half-open gate per service
//!
//! ## Document model
//!
//! - [`loader`]: YAML parsing with schema and data-flow validation
//! - [`template`]: strict rendering of step inputs, guards and outputs

pub mod breaker;
pub mod context;
pub mod engine;
pub mod error;
pub mod invoker;
pub mod loader;
pub mod pool;
pub mod proto;
pub mod registry;
pub mod retry;
pub mod saga;
pub mod scheduler;
pub mod template;
pub mod validate;
pub mod workflow;

// Engine surface
pub use engine::{Engine, EngineConfig, WorkflowResult};
pub use scheduler::{Scheduler, DEFAULT_WORKER_SLOTS};

// Document model
pub use workflow::{
    is_template, parse_duration, Compensation, RetryPolicy, Service, ServiceKind, Step,
    Workflow, WorkflowStatus,
};

// Execution state
pub use context::{CommittedStep, ExecutionContext, StepOutcome};
pub use saga::SagaCoordinator;

// Transports and resilience
pub use breaker::{BreakerSettings, BreakerState, CircuitBreaker};
pub use invoker::{Invoker, RemoteInvoker};
pub use pool::{ChannelPool, DEFAULT_POOL_SIZE};
pub use registry::{ServiceEntry, ServiceRegistry};
pub use retry::BackoffKind;

// Errors
pub use error::{CompensationFailure, EngineError, LoadError};
