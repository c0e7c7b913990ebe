// crates/changegate-worker/src/run_recorder.rs
// ============================================================================
// Module: Run Recorder
// Description: Start/complete/fail bookkeeping for a single stage execution
//              attempt, backed by `Store`'s run methods.
// Purpose: Give every stage job one audit row with a stable content-derived
//          input hash, regardless of which stage produced it.
// Dependencies: changegate-core
// ============================================================================

//! ## Overview
//! A `WorkflowRun` is opened with [`RunRecorder::start_run`] before any
//! stage-specific work happens and closed with exactly one of
//! [`RunRecorder::complete_run`] or [`RunRecorder::fail_run`] once it does;
//! the scoped-acquisition discipline this mirrors is enforced by the stage
//! worker framework calling both ends, never by this module tracking state
//! across calls itself.

use std::sync::Arc;

use changegate_core::hashing::hash_canonical_json;
use changegate_core::identifiers::JobName;
use changegate_core::identifiers::RunId;
use changegate_core::identifiers::WorkflowId;
use changegate_core::interfaces::Store;
use changegate_core::interfaces::StoreError;
use changegate_core::model::RunStatus;
use changegate_core::model::UsageCounters;
use changegate_core::model::WorkflowRun;
use changegate_core::time::Timestamp;
use serde_json::Value;

/// Opens and closes [`WorkflowRun`] rows against a [`Store`].
pub struct RunRecorder {
    /// The store runs are persisted to.
    store: Arc<dyn Store>,
}

impl RunRecorder {
    /// Creates a recorder backed by `store`.
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Starts a new run, hashing `inputs` for later duplicate-delivery
    /// checks.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the inputs cannot be canonicalized or the
    /// row cannot be inserted.
    pub async fn start_run(
        &self,
        run_id: RunId,
        workflow_id: WorkflowId,
        job_name: JobName,
        inputs: Value,
        started_at: Timestamp,
    ) -> Result<WorkflowRun, StoreError> {
        let input_hash = hash_canonical_json(&inputs).map_err(|err| StoreError::Invalid(err.to_string()))?;
        let run = WorkflowRun {
            id: run_id,
            workflow_id,
            job_name,
            status: RunStatus::Running,
            input_hash: input_hash.value,
            inputs,
            outputs: None,
            error_message: None,
            started_at,
            completed_at: None,
            duration_ms: None,
            usage: None,
        };
        self.store.start_run(&run).await?;
        Ok(run)
    }

    /// Marks `run` completed with `outputs`, optionally attaching usage.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the row cannot be updated.
    pub async fn complete_run(
        &self,
        mut run: WorkflowRun,
        outputs: Value,
        usage: Option<UsageCounters>,
        completed_at: Timestamp,
    ) -> Result<WorkflowRun, StoreError> {
        run.status = RunStatus::Completed;
        run.outputs = Some(outputs);
        run.usage = usage;
        run.completed_at = Some(completed_at);
        run.duration_ms = Some(completed_at.saturating_duration_since_ms(run.started_at));
        self.store.update_run(&run).await?;
        Ok(run)
    }

    /// Marks `run` failed with `error_message`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the row cannot be updated.
    pub async fn fail_run(&self, mut run: WorkflowRun, error_message: String, failed_at: Timestamp) -> Result<WorkflowRun, StoreError> {
        run.status = RunStatus::Failed;
        run.error_message = Some(error_message);
        run.completed_at = Some(failed_at);
        run.duration_ms = Some(failed_at.saturating_duration_since_ms(run.started_at));
        self.store.update_run(&run).await?;
        Ok(run)
    }
}
