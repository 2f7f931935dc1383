//! Step scheduling: shape dispatch, guard evaluation, worker-pool
//! admission, per-attempt timeouts and retry with backoff.
//!
//! Top-level ordering is the driver's job; this module guarantees the
//! per-step contract. A parallel group runs every child concurrently
//! under a child cancellation scope, fails fast on the first child error,
//! and commits sibling results through the shared context's mutex. A leaf
//! acquires one engine-wide worker slot, resolves its input templates,
//! then attempts the call under the service's retry policy.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{Map as JsonMap, Value as JsonValue};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::{ExecutionContext, StepOutcome};
use crate::error::EngineError;
use crate::invoker::Invoker;
use crate::retry::BackoffKind;
use crate::template;
use crate::workflow::{Step, Workflow};

/// Engine-wide cap on concurrent leaf invocations.
pub const DEFAULT_WORKER_SLOTS: usize = 10;

#[derive(Clone)]
pub struct Scheduler {
    invoker: Arc<dyn Invoker>,
    permits: Arc<Semaphore>,
}

impl Scheduler {
    pub fn new(invoker: Arc<dyn Invoker>, permits: Arc<Semaphore>) -> Self {
        Self { invoker, permits }
    }

    /// Dispatch one step by shape: parallel group, guarded leaf, or leaf.
    ///
    /// Boxed because parallel groups recurse through it.
    pub fn run_step(
        &self,
        step: Step,
        workflow: Arc<Workflow>,
        ctx: Arc<ExecutionContext>,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<StepOutcome, EngineError>> {
        let scheduler = self.clone();
        Box::pin(async move {
            if step.is_parallel() {
                return scheduler
                    .run_parallel(step.parallel, workflow, ctx, cancel)
                    .await;
            }

            if let Some(guard) = &step.when {
                if !evaluate_guard(guard, &ctx)? {
                    debug!(
                        workflow_id = %ctx.workflow_id,
                        step_id = %step.id,
                        guard = %guard,
                        "skipping step, guard is false"
                    );
                    return Ok(StepOutcome::skipped(step.id.clone()));
                }
            }

            scheduler.run_leaf(step, workflow, ctx, cancel).await
        })
    }

    async fn run_parallel(
        &self,
        steps: Vec<Step>,
        workflow: Arc<Workflow>,
        ctx: Arc<ExecutionContext>,
        cancel: CancellationToken,
    ) -> Result<StepOutcome, EngineError> {
        info!(
            workflow_id = %ctx.workflow_id,
            children = steps.len(),
            "executing parallel group"
        );

        let group = cancel.child_token();
        let mut children: JoinSet<Result<(Step, StepOutcome), EngineError>> = JoinSet::new();
        for step in steps {
            let scheduler = self.clone();
            let workflow = Arc::clone(&workflow);
            let ctx = Arc::clone(&ctx);
            let token = group.clone();
            children.spawn(async move {
                let outcome = scheduler
                    .run_step(step.clone(), workflow, Arc::clone(&ctx), token)
                    .await
                    .map_err(|err| label_step_error(&step, err))?;
                ctx.commit(&step, &outcome);
                Ok((step, outcome))
            });
        }

        let mut completed = Vec::new();
        let mut first_err: Option<EngineError> = None;
        while let Some(joined) = children.join_next().await {
            match joined {
                Ok(Ok(entry)) => completed.push(entry),
                Ok(Err(err)) => {
                    if first_err.is_none() {
                        warn!(error = %err, "parallel child failed, cancelling siblings");
                        group.cancel();
                        first_err = Some(err);
                    }
                }
                Err(join_err) => {
                    if first_err.is_none() {
                        group.cancel();
                        first_err = Some(EngineError::Internal(format!(
                            "parallel branch aborted: {join_err}"
                        )));
                    }
                }
            }
        }

        if let Some(err) = first_err {
            return Err(err);
        }

        // The group's combined view; children committed individually.
        let mut combined = JsonMap::new();
        for (step, outcome) in &completed {
            if let Some(name) = &step.output {
                if !outcome.skipped {
                    combined.insert(name.clone(), outcome.output.clone());
                }
            }
        }
        Ok(StepOutcome::completed("parallel", JsonValue::Object(combined)))
    }

    async fn run_leaf(
        &self,
        step: Step,
        workflow: Arc<Workflow>,
        ctx: Arc<ExecutionContext>,
        cancel: CancellationToken,
    ) -> Result<StepOutcome, EngineError> {
        let service = workflow
            .services
            .get(&step.service)
            .ok_or_else(|| EngineError::ServiceNotFound(step.service.clone()))?;

        let _permit = tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            permit = Arc::clone(&self.permits).acquire_owned() => {
                permit.map_err(|_| EngineError::Cancelled)?
            }
        };

        let resolved = template::resolve_map(&step.input, &ctx.scope())?;

        let attempts = service.retry.as_ref().map(|r| r.attempts.max(1)).unwrap_or(1);
        let backoff = service
            .retry
            .as_ref()
            .map(|r| r.backoff)
            .unwrap_or(BackoffKind::Constant);
        let per_attempt = service.call_timeout();

        info!(
            workflow_id = %ctx.workflow_id,
            step_id = %step.id,
            service = %step.service,
            method = %step.method,
            "executing step"
        );
        let started = Instant::now();

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if attempt > 1 {
                let delay = backoff.delay_after(attempt - 1);
                warn!(
                    step_id = %step.id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying step after backoff"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                    _ = sleep(delay) => {}
                }
            }

            let call = self.attempt_call(&step, &resolved, &ctx, per_attempt);
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                result = call => result,
            };

            match result {
                Ok(output) => {
                    info!(
                        step_id = %step.id,
                        attempt,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "step executed"
                    );
                    return Ok(StepOutcome::completed(step.id.clone(), output));
                }
                Err(err) if attempt < attempts && err.is_retryable() => {
                    warn!(
                        step_id = %step.id,
                        attempt,
                        error = %err,
                        "step attempt failed, will retry"
                    );
                }
                Err(err) => {
                    warn!(
                        step_id = %step.id,
                        attempt,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        error = %err,
                        "step failed"
                    );
                    return Err(err);
                }
            }
        }
    }

    async fn attempt_call(
        &self,
        step: &Step,
        input: &std::collections::HashMap<String, JsonValue>,
        ctx: &ExecutionContext,
        per_attempt: Option<Duration>,
    ) -> Result<JsonValue, EngineError> {
        let call = self.invoker.invoke(
            &step.service,
            &step.method,
            input.clone(),
            &ctx.workflow_id,
            &step.id,
        );
        match per_attempt {
            Some(limit) => timeout(limit, call)
                .await
                .unwrap_or(Err(EngineError::AttemptTimeout)),
            None => call.await,
        }
    }
}

/// Guard truth: the rendered text equals `"true"`, or it names a recorded
/// output whose value is boolean `true`. Anything else is false.
fn evaluate_guard(guard: &str, ctx: &ExecutionContext) -> Result<bool, EngineError> {
    let rendered = template::render(guard, &ctx.scope())?;
    if rendered == "true" {
        return Ok(true);
    }
    Ok(matches!(
        ctx.lookup_output(&rendered),
        Some(JsonValue::Bool(true))
    ))
}

/// Attach the step id to terminal errors; cancellation stays bare so the
/// driver can tell it apart.
pub(crate) fn label_step_error(step: &Step, err: EngineError) -> EngineError {
    match err {
        EngineError::Cancelled => EngineError::Cancelled,
        EngineError::Step { .. } => err,
        other => EngineError::Step {
            step_id: step.display_id().to_string(),
            source: Box::new(other),
        },
    }
}
