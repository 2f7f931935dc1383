//! Reverse-order compensation of committed steps.
//!
//! When the driver declares a workflow failed, the coordinator walks the
//! committed-step log from last to first and replays each compensation
//! against its owning service. A compensation failure never stops the
//! walk: every error is collected and returned as one aggregate at the
//! end. Compensations are assumed idempotent and are never retried here.

use std::sync::Arc;

use tracing::{debug, error, info};

use crate::context::{CommittedStep, ExecutionContext};
use crate::error::{CompensationFailure, EngineError};
use crate::invoker::Invoker;
use crate::template;

pub struct SagaCoordinator {
    invoker: Arc<dyn Invoker>,
}

impl SagaCoordinator {
    pub fn new(invoker: Arc<dyn Invoker>) -> Self {
        Self { invoker }
    }

    /// Replay pending compensations in reverse commit order. Entries
    /// already marked compensated are skipped, so a second call over the
    /// same context is a no-op.
    pub async fn compensate(&self, ctx: &ExecutionContext) -> Result<(), EngineError> {
        let committed = ctx.executed();
        if committed.is_empty() {
            debug!(workflow_id = %ctx.workflow_id, "no steps to compensate");
            return Ok(());
        }

        info!(
            workflow_id = %ctx.workflow_id,
            steps = committed.len(),
            "starting saga compensation"
        );

        let mut failures = Vec::new();
        for index in (0..committed.len()).rev() {
            let entry = &committed[index];
            if entry.compensated {
                debug!(step_id = %entry.step_id, "step already compensated, skipping");
                continue;
            }

            match self.compensate_step(ctx, entry).await {
                Ok(()) => {
                    ctx.mark_compensated(index);
                    info!(step_id = %entry.step_id, "step compensated");
                }
                Err(err) => {
                    error!(
                        step_id = %entry.step_id,
                        error = %err,
                        "failed to compensate step"
                    );
                    failures.push(CompensationFailure {
                        step_id: entry.step_id.clone(),
                        message: err.to_string(),
                    });
                }
            }
        }

        if failures.is_empty() {
            info!(workflow_id = %ctx.workflow_id, "saga compensation completed");
            Ok(())
        } else {
            Err(EngineError::Compensation(failures))
        }
    }

    async fn compensate_step(
        &self,
        ctx: &ExecutionContext,
        entry: &CommittedStep,
    ) -> Result<(), EngineError> {
        // Rendered against the live scope: compensations may reference
        // outputs recorded after this step committed.
        let input = template::resolve_map(&entry.compensation.input, &ctx.scope())?;
        let step_id = format!("{}_compensate", entry.step_id);

        info!(
            workflow_id = %ctx.workflow_id,
            step_id = %entry.step_id,
            service = %entry.service,
            method = %entry.compensation.method,
            "compensating step"
        );
        self.invoker
            .invoke(
                &entry.service,
                &entry.compensation.method,
                input,
                &ctx.workflow_id,
                &step_id,
            )
            .await?;
        Ok(())
    }
}
