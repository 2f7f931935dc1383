//! Top-level workflow engine: loading, per-instance execution, lifecycle
//! tracking and the final result bundle.
//!
//! One engine hosts any number of loaded workflows and shares one
//! worker pool, one service registry and one invoker across them. Each
//! execution gets its own [`ExecutionContext`] and cancellation scope;
//! both are discarded once the result is returned.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map as JsonMap, Value as JsonValue};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::context::ExecutionContext;
use crate::error::EngineError;
use crate::invoker::{Invoker, RemoteInvoker};
use crate::loader;
use crate::registry::ServiceRegistry;
use crate::saga::SagaCoordinator;
use crate::scheduler::{label_step_error, Scheduler, DEFAULT_WORKER_SLOTS};
use crate::workflow::{Workflow, WorkflowStatus};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Engine-wide cap on concurrent leaf invocations.
    pub worker_slots: usize,
    /// Channels per binary-RPC endpoint.
    pub pool_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_slots: DEFAULT_WORKER_SLOTS,
            pool_size: crate::pool::DEFAULT_POOL_SIZE,
        }
    }
}

/// Result bundle for one workflow execution.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowResult {
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub output: JsonValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

struct RunningEntry {
    status: WorkflowStatus,
    cancel: CancellationToken,
}

pub struct Engine {
    registry: Arc<ServiceRegistry>,
    scheduler: Scheduler,
    saga: SagaCoordinator,
    workflows: RwLock<HashMap<String, Arc<Workflow>>>,
    running: Mutex<HashMap<String, RunningEntry>>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let registry = Arc::new(ServiceRegistry::with_pool_size(config.pool_size));
        let invoker: Arc<dyn Invoker> = Arc::new(RemoteInvoker::new(Arc::clone(&registry)));
        Self::build(registry, invoker, config.worker_slots)
    }

    /// Engine over a caller-supplied invoker, the seam tests use to
    /// script remote behavior without a network.
    pub fn with_invoker(invoker: Arc<dyn Invoker>, config: EngineConfig) -> Self {
        let registry = Arc::new(ServiceRegistry::with_pool_size(config.pool_size));
        Self::build(registry, invoker, config.worker_slots)
    }

    fn build(
        registry: Arc<ServiceRegistry>,
        invoker: Arc<dyn Invoker>,
        worker_slots: usize,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(worker_slots.max(1)));
        Self {
            registry,
            scheduler: Scheduler::new(Arc::clone(&invoker), permits),
            saga: SagaCoordinator::new(invoker),
            workflows: RwLock::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Load a workflow file, register its services, and return its name.
    pub fn load_file(&self, path: &Path) -> Result<String, EngineError> {
        let workflow = loader::load_file(path)?;
        self.add_workflow(workflow)
    }

    /// Load a workflow from YAML text, register its services, and return
    /// its name.
    pub fn load_str(&self, text: &str) -> Result<String, EngineError> {
        let workflow = loader::load_str(text)?;
        self.add_workflow(workflow)
    }

    fn add_workflow(&self, workflow: Workflow) -> Result<String, EngineError> {
        for (name, service) in &workflow.services {
            self.registry.register(name, service.clone())?;
        }

        let name = workflow.name.clone();
        info!(
            workflow = %name,
            version = %workflow.version,
            steps = workflow.steps.len(),
            "workflow loaded"
        );
        self.workflows
            .write()
            .expect("workflow map lock poisoned")
            .insert(name.clone(), Arc::new(workflow));
        Ok(name)
    }

    pub fn workflow_names(&self) -> Vec<String> {
        self.workflows
            .read()
            .expect("workflow map lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Status of an in-flight execution, if it is still running.
    pub fn status(&self, workflow_id: &str) -> Option<WorkflowStatus> {
        self.running
            .lock()
            .expect("running map lock poisoned")
            .get(workflow_id)
            .map(|entry| entry.status)
    }

    /// Cooperatively cancel an in-flight execution.
    pub fn cancel(&self, workflow_id: &str) -> bool {
        let running = self.running.lock().expect("running map lock poisoned");
        match running.get(workflow_id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Execute one instance of a loaded workflow.
    ///
    /// `Err` means the run could not start; otherwise the bundle's
    /// `status` and `error` describe how it ended.
    pub async fn execute(
        &self,
        name: &str,
        input: JsonValue,
        cancel: CancellationToken,
    ) -> Result<WorkflowResult, EngineError> {
        let workflow = self
            .workflows
            .read()
            .expect("workflow map lock poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::WorkflowNotFound(name.to_string()))?;

        let workflow_id = Uuid::new_v4().to_string();
        let ctx = Arc::new(ExecutionContext::new(workflow_id.clone(), input));
        let run_token = cancel.child_token();
        self.track(&workflow_id, WorkflowStatus::Running, run_token.clone());

        let started_at = Utc::now();
        info!(
            workflow_id = %workflow_id,
            workflow = %name,
            version = %workflow.version,
            "starting workflow execution"
        );

        let drive = self.drive(&workflow, &ctx, &run_token);
        let driven = match workflow.deadline() {
            Some(limit) => match timeout(limit, drive).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(workflow_id = %workflow_id, "workflow deadline exceeded");
                    run_token.cancel();
                    Err(EngineError::Cancelled)
                }
            },
            None => drive.await,
        };

        let (status, error) = match driven {
            Ok(()) => (WorkflowStatus::Success, None),
            Err(err) if err.is_cancelled() || run_token.is_cancelled() => {
                info!(workflow_id = %workflow_id, "workflow cancelled");
                (WorkflowStatus::Cancelled, Some(err.to_string()))
            }
            Err(err) => {
                error!(workflow_id = %workflow_id, error = %err, "workflow failed");
                let status = self.roll_back(&workflow_id, &ctx).await;
                (status, Some(err.to_string()))
            }
        };

        let output = if status == WorkflowStatus::Success {
            self.render_output(&workflow, &ctx)
        } else {
            JsonValue::Null
        };

        self.untrack(&workflow_id);
        let completed_at = Utc::now();
        info!(
            workflow_id = %workflow_id,
            status = %status,
            duration_ms = (completed_at - started_at).num_milliseconds(),
            "workflow execution completed"
        );

        Ok(WorkflowResult {
            workflow_id,
            status,
            output,
            error,
            started_at,
            completed_at,
        })
    }

    /// Walk the top-level steps in declaration order, committing each
    /// result before the next step starts.
    async fn drive(
        &self,
        workflow: &Arc<Workflow>,
        ctx: &Arc<ExecutionContext>,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        for step in &workflow.steps {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let outcome = self
                .scheduler
                .run_step(
                    step.clone(),
                    Arc::clone(workflow),
                    Arc::clone(ctx),
                    cancel.clone(),
                )
                .await
                .map_err(|err| label_step_error(step, err))?;

            ctx.commit(step, &outcome);
        }
        Ok(())
    }

    /// Compensate after a failure. With nothing committed the workflow is
    /// plainly failed; otherwise the saga decides between `compensated`
    /// and `failed`.
    async fn roll_back(&self, workflow_id: &str, ctx: &ExecutionContext) -> WorkflowStatus {
        if ctx.executed_len() == 0 {
            return WorkflowStatus::Failed;
        }

        self.set_status(workflow_id, WorkflowStatus::Compensating);
        match self.saga.compensate(ctx).await {
            Ok(()) => WorkflowStatus::Compensated,
            Err(err) => {
                error!(workflow_id = %workflow_id, error = %err, "compensation failed");
                WorkflowStatus::Failed
            }
        }
    }

    /// Union of the rendered `output` templates and any recorded step
    /// outputs not shadowed by an explicit output key.
    fn render_output(&self, workflow: &Workflow, ctx: &ExecutionContext) -> JsonValue {
        let scope = ctx.scope();
        let mut rendered = JsonMap::new();
        for (key, template) in &workflow.output {
            match crate::template::render(template, &scope) {
                Ok(value) => {
                    rendered.insert(key.clone(), JsonValue::String(value));
                }
                Err(err) => {
                    warn!(key = %key, error = %err, "failed to render output template");
                }
            }
        }
        for (name, value) in ctx.output_snapshot() {
            rendered.entry(name).or_insert(value);
        }
        JsonValue::Object(rendered)
    }

    fn track(&self, workflow_id: &str, status: WorkflowStatus, cancel: CancellationToken) {
        self.running
            .lock()
            .expect("running map lock poisoned")
            .insert(workflow_id.to_string(), RunningEntry { status, cancel });
    }

    fn set_status(&self, workflow_id: &str, status: WorkflowStatus) {
        if let Some(entry) = self
            .running
            .lock()
            .expect("running map lock poisoned")
            .get_mut(workflow_id)
        {
            entry.status = status;
        }
    }

    fn untrack(&self, workflow_id: &str) {
        self.running
            .lock()
            .expect("running map lock poisoned")
            .remove(workflow_id);
    }
}
