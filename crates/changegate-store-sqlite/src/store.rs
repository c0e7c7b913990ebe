// crates/changegate-store-sqlite/src/store.rs
// ============================================================================
// Module: SQLite Store
// Description: Durable Store backed by SQLite WAL.
// Purpose: Persist the workflow aggregate and its owned entities with a
//          single writer gateway and a separate read connection.
// Dependencies: changegate-core, rusqlite, serde_json, thiserror, tokio
// ============================================================================

//! ## Overview
//! [`SqliteStore`] implements [`changegate_core::interfaces::Store`] against
//! a single `SQLite` file opened in WAL mode. Writes are serialized through
//! one dedicated writer thread holding the only write-capable connection
//! (`SqliteWriteGateway`); reads go through a separate connection guarded by
//! a `Mutex`, which WAL allows to proceed concurrently with the writer.
//! [`SqliteStore::with_workflow_lock`] layers an additional per-workflow
//! async mutex on top, so two calls racing on the same workflow id still
//! serialize even though the underlying gateway would happily interleave
//! their individual statements.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::mpsc;
use std::thread;
use std::thread::JoinHandle;

use async_trait::async_trait;
use changegate_core::identifiers::ApprovalId;
use changegate_core::identifiers::ArtifactId;
use changegate_core::identifiers::EventId;
use changegate_core::identifiers::JobName;
use changegate_core::identifiers::PatchSetId;
use changegate_core::identifiers::RunId;
use changegate_core::identifiers::StageName;
use changegate_core::identifiers::ViolationId;
use changegate_core::identifiers::WorkflowId;
use changegate_core::interfaces::Store;
use changegate_core::interfaces::StoreError;
use changegate_core::model::Approval;
use changegate_core::model::ApprovalKind;
use changegate_core::model::Artifact;
use changegate_core::model::ArtifactKind;
use changegate_core::model::Patch;
use changegate_core::model::PatchSet;
use changegate_core::model::PatchSetStatus;
use changegate_core::model::PolicyViolation;
use changegate_core::model::Repo;
use changegate_core::model::RunStatus;
use changegate_core::model::Severity;
use changegate_core::model::StageStatus;
use changegate_core::model::UsageCounters;
use changegate_core::model::Workflow;
use changegate_core::model::WorkflowEvent;
use changegate_core::model::WorkflowRun;
use changegate_core::model::WorkflowState;
use changegate_core::time::Timestamp;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rusqlite::params;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;

/// Default busy-timeout applied to both connections.
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

// ============================================================================
// SECTION: Config
// ============================================================================

/// Configuration for [`SqliteStore::open`].
#[derive(Debug, Clone)]
pub struct SqliteStoreConfig {
    /// Filesystem path of the `SQLite` database file.
    pub path: PathBuf,
    /// `busy_timeout` pragma value, in milliseconds.
    pub busy_timeout_ms: u64,
}

impl Default for SqliteStoreConfig {
    fn default() -> Self {
        Self { path: PathBuf::from("changegate.sqlite3"), busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS }
    }
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors internal to the `SQLite` store, bridged into
/// [`changegate_core::interfaces::StoreError`] at the trait boundary.
#[derive(Debug, Error)]
pub enum SqliteStoreError {
    /// A `rusqlite`/`SQLite` failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// A filesystem failure opening or preparing the database path.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// A JSON (de)serialization failure on a stored column.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
    /// The requested row does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// A stored row failed to decode into its domain type.
    #[error("corrupt row: {0}")]
    Corrupt(String),
    /// The writer thread's command channel is gone.
    #[error("writer gateway is shut down")]
    WriterGone,
}

impl From<SqliteStoreError> for StoreError {
    fn from(error: SqliteStoreError) -> Self {
        match error {
            SqliteStoreError::NotFound(what) => Self::NotFound(what),
            SqliteStoreError::Corrupt(what) => Self::Corrupt(what),
            other => Self::Transient(other.to_string()),
        }
    }
}

// ============================================================================
// SECTION: Writer Gateway
// ============================================================================

/// A unit of write work submitted to the writer thread: a closure over the
/// one write connection, and a channel to deliver its result back.
struct WriterCommand {
    /// The write operation to run against the writer's connection.
    run: Box<dyn FnOnce(&mut Connection) -> Result<(), SqliteStoreError> + Send>,
    /// Where to send the operation's result.
    response: mpsc::Sender<Result<(), SqliteStoreError>>,
}

/// Serializes all writes through a single dedicated thread holding the only
/// write-capable connection.
struct SqliteWriteGateway {
    /// Submits commands to the writer thread.
    sender: mpsc::Sender<WriterCommand>,
    /// Kept alive so the writer thread is joined on drop rather than
    /// detached; never read otherwise.
    _handle: JoinHandle<()>,
}

impl SqliteWriteGateway {
    /// Spawns the writer thread owning `connection`.
    fn spawn(connection: Connection) -> Self {
        let (sender, receiver) = mpsc::channel::<WriterCommand>();
        let handle = thread::spawn(move || {
            let mut connection = connection;
            while let Ok(command) = receiver.recv() {
                let result = (command.run)(&mut connection);
                let _ = command.response.send(result);
            }
        });
        Self { sender, _handle: handle }
    }

    /// Runs `run` on the writer thread and waits for its result.
    fn submit(&self, run: impl FnOnce(&mut Connection) -> Result<(), SqliteStoreError> + Send + 'static) -> Result<(), SqliteStoreError> {
        let (response_tx, response_rx) = mpsc::channel();
        self.sender.send(WriterCommand { run: Box::new(run), response: response_tx }).map_err(|_err| SqliteStoreError::WriterGone)?;
        response_rx.recv().map_err(|_err| SqliteStoreError::WriterGone)?
    }
}

// ============================================================================
// SECTION: Store
// ============================================================================

/// A `SQLite`-backed [`Store`].
pub struct SqliteStore {
    /// Single-writer gateway.
    writer: SqliteWriteGateway,
    /// Read-path connection, concurrent with the writer under WAL.
    read_conn: StdMutex<Connection>,
    /// Per-workflow async locks, lazily created.
    workflow_locks: StdMutex<HashMap<WorkflowId, Arc<AsyncMutex<()>>>>,
}

impl SqliteStore {
    /// Opens (creating if absent) the database at `config.path`, applies WAL
    /// pragmas, initializes the schema, and spawns the writer thread.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteStoreError`] if the path cannot be prepared or the
    /// connection cannot be opened.
    pub fn open(config: &SqliteStoreConfig) -> Result<Self, SqliteStoreError> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let writer_conn = open_connection(&config.path, config.busy_timeout_ms)?;
        initialize_schema(&writer_conn)?;
        let read_conn = open_connection(&config.path, config.busy_timeout_ms)?;
        Ok(Self {
            writer: SqliteWriteGateway::spawn(writer_conn),
            read_conn: StdMutex::new(read_conn),
            workflow_locks: StdMutex::new(HashMap::new()),
        })
    }

    /// Returns (creating if absent) the async lock for `workflow_id`.
    fn lock_for(&self, workflow_id: &WorkflowId) -> Arc<AsyncMutex<()>> {
        let mut locks = self.workflow_locks.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        locks.entry(workflow_id.clone()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }
}

fn open_connection(path: &Path, busy_timeout_ms: u64) -> Result<Connection, SqliteStoreError> {
    let connection = Connection::open(path)?;
    connection.busy_timeout(std::time::Duration::from_millis(busy_timeout_ms))?;
    connection.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL; PRAGMA foreign_keys = ON;")?;
    Ok(connection)
}

fn initialize_schema(connection: &Connection) -> Result<(), SqliteStoreError> {
    connection.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS workflows (
            id TEXT PRIMARY KEY,
            state TEXT NOT NULL,
            stage TEXT NOT NULL,
            stage_status TEXT NOT NULL,
            feature_goal TEXT NOT NULL,
            business_justification TEXT NOT NULL,
            repos_json TEXT NOT NULL,
            feedback TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            base_sha TEXT
        );
        CREATE TABLE IF NOT EXISTS artifacts (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT UNIQUE NOT NULL,
            workflow_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            content TEXT NOT NULL,
            content_sha TEXT NOT NULL,
            artifact_version INTEGER NOT NULL,
            supersedes_artifact_id TEXT,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_artifacts_workflow_kind ON artifacts (workflow_id, kind, seq DESC);
        CREATE TABLE IF NOT EXISTS patch_sets (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT UNIQUE NOT NULL,
            workflow_id TEXT NOT NULL,
            artifact_id TEXT NOT NULL,
            title TEXT NOT NULL,
            base_sha TEXT NOT NULL,
            status TEXT NOT NULL,
            patches_json TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_patch_sets_workflow ON patch_sets (workflow_id, seq DESC);
        CREATE TABLE IF NOT EXISTS approvals (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT UNIQUE NOT NULL,
            workflow_id TEXT NOT NULL,
            stage TEXT NOT NULL,
            kind TEXT NOT NULL,
            reason TEXT,
            recorded_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_approvals_workflow ON approvals (workflow_id, seq);
        CREATE TABLE IF NOT EXISTS policy_violations (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT UNIQUE NOT NULL,
            patch_set_id TEXT NOT NULL,
            rule TEXT NOT NULL,
            severity TEXT NOT NULL,
            file TEXT NOT NULL,
            line INTEGER,
            message TEXT NOT NULL,
            evidence TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_violations_patch_set ON policy_violations (patch_set_id);
        CREATE TABLE IF NOT EXISTS workflow_events (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT UNIQUE NOT NULL,
            workflow_id TEXT NOT NULL,
            event_type TEXT NOT NULL,
            payload_json TEXT NOT NULL,
            recorded_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_events_workflow ON workflow_events (workflow_id, seq);
        CREATE TABLE IF NOT EXISTS workflow_runs (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT UNIQUE NOT NULL,
            workflow_id TEXT NOT NULL,
            job_name TEXT NOT NULL,
            status TEXT NOT NULL,
            input_hash TEXT NOT NULL,
            inputs_json TEXT NOT NULL,
            outputs_json TEXT,
            error_message TEXT,
            started_at INTEGER NOT NULL,
            completed_at INTEGER,
            duration_ms INTEGER,
            usage_json TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_runs_input_hash ON workflow_runs (input_hash);
        ",
    )?;
    Ok(())
}

// ============================================================================
// SECTION: Row <-> Domain Mapping
// ============================================================================

fn workflow_state_to_str(state: WorkflowState) -> &'static str {
    match state {
        WorkflowState::Ingested => "INGESTED",
        WorkflowState::PatchesProposed => "PATCHES_PROPOSED",
        WorkflowState::WaitingUserApproval => "WAITING_USER_APPROVAL",
        WorkflowState::ApplyingPatches => "APPLYING_PATCHES",
        WorkflowState::PrOpen => "PR_OPEN",
        WorkflowState::VerifyingCi => "VERIFYING_CI",
        WorkflowState::Done => "DONE",
        WorkflowState::NeedsHuman => "NEEDS_HUMAN",
        WorkflowState::BlockedPolicy => "BLOCKED_POLICY",
        WorkflowState::Failed => "FAILED",
        WorkflowState::Rejected => "REJECTED",
    }
}

fn workflow_state_from_str(value: &str) -> Result<WorkflowState, SqliteStoreError> {
    Ok(match value {
        "INGESTED" => WorkflowState::Ingested,
        "PATCHES_PROPOSED" => WorkflowState::PatchesProposed,
        "WAITING_USER_APPROVAL" => WorkflowState::WaitingUserApproval,
        "APPLYING_PATCHES" => WorkflowState::ApplyingPatches,
        "PR_OPEN" => WorkflowState::PrOpen,
        "VERIFYING_CI" => WorkflowState::VerifyingCi,
        "DONE" => WorkflowState::Done,
        "NEEDS_HUMAN" => WorkflowState::NeedsHuman,
        "BLOCKED_POLICY" => WorkflowState::BlockedPolicy,
        "FAILED" => WorkflowState::Failed,
        "REJECTED" => WorkflowState::Rejected,
        other => return Err(SqliteStoreError::Corrupt(format!("unknown workflow state: {other}"))),
    })
}

fn stage_name_to_str(stage: StageName) -> &'static str {
    stage.as_str()
}

fn stage_name_from_str(value: &str) -> Result<StageName, SqliteStoreError> {
    Ok(match value {
        "ingest" => StageName::Ingest,
        "feasibility" => StageName::Feasibility,
        "architecture" => StageName::Architecture,
        "timeline" => StageName::Timeline,
        "summary" => StageName::Summary,
        "patches" => StageName::Patches,
        "policy" => StageName::Policy,
        "sandbox" => StageName::Sandbox,
        "pr" => StageName::Pr,
        "done" => StageName::Done,
        other => return Err(SqliteStoreError::Corrupt(format!("unknown stage name: {other}"))),
    })
}

fn stage_status_to_str(status: StageStatus) -> &'static str {
    match status {
        StageStatus::Pending => "pending",
        StageStatus::Processing => "processing",
        StageStatus::Ready => "ready",
        StageStatus::Approved => "approved",
        StageStatus::Rejected => "rejected",
        StageStatus::Blocked => "blocked",
        StageStatus::NeedsChanges => "needs_changes",
    }
}

fn stage_status_from_str(value: &str) -> Result<StageStatus, SqliteStoreError> {
    Ok(match value {
        "pending" => StageStatus::Pending,
        "processing" => StageStatus::Processing,
        "ready" => StageStatus::Ready,
        "approved" => StageStatus::Approved,
        "rejected" => StageStatus::Rejected,
        "blocked" => StageStatus::Blocked,
        "needs_changes" => StageStatus::NeedsChanges,
        other => return Err(SqliteStoreError::Corrupt(format!("unknown stage status: {other}"))),
    })
}

fn artifact_kind_to_str(kind: ArtifactKind) -> &'static str {
    match kind {
        ArtifactKind::FeasibilityV1 => "FeasibilityV1",
        ArtifactKind::ArchitectureV1 => "ArchitectureV1",
        ArtifactKind::TimelineV1 => "TimelineV1",
        ArtifactKind::SummaryV1 => "SummaryV1",
        ArtifactKind::PatchSetV1 => "PatchSetV1",
        ArtifactKind::PolicyV1 => "PolicyV1",
        ArtifactKind::SandboxV1 => "SandboxV1",
        ArtifactKind::PrV1 => "PrV1",
    }
}

fn artifact_kind_from_str(value: &str) -> Result<ArtifactKind, SqliteStoreError> {
    Ok(match value {
        "FeasibilityV1" => ArtifactKind::FeasibilityV1,
        "ArchitectureV1" => ArtifactKind::ArchitectureV1,
        "TimelineV1" => ArtifactKind::TimelineV1,
        "SummaryV1" => ArtifactKind::SummaryV1,
        "PatchSetV1" => ArtifactKind::PatchSetV1,
        "PolicyV1" => ArtifactKind::PolicyV1,
        "SandboxV1" => ArtifactKind::SandboxV1,
        "PrV1" => ArtifactKind::PrV1,
        other => return Err(SqliteStoreError::Corrupt(format!("unknown artifact kind: {other}"))),
    })
}

fn patch_set_status_to_str(status: PatchSetStatus) -> &'static str {
    match status {
        PatchSetStatus::Proposed => "proposed",
        PatchSetStatus::Approved => "approved",
        PatchSetStatus::Rejected => "rejected",
    }
}

fn patch_set_status_from_str(value: &str) -> Result<PatchSetStatus, SqliteStoreError> {
    Ok(match value {
        "proposed" => PatchSetStatus::Proposed,
        "approved" => PatchSetStatus::Approved,
        "rejected" => PatchSetStatus::Rejected,
        other => return Err(SqliteStoreError::Corrupt(format!("unknown patch set status: {other}"))),
    })
}

fn approval_kind_to_str(kind: ApprovalKind) -> &'static str {
    match kind {
        ApprovalKind::ApplyPatches => "apply_patches",
        ApprovalKind::StageApproval => "stage_approval",
    }
}

fn approval_kind_from_str(value: &str) -> Result<ApprovalKind, SqliteStoreError> {
    Ok(match value {
        "apply_patches" => ApprovalKind::ApplyPatches,
        "stage_approval" => ApprovalKind::StageApproval,
        other => return Err(SqliteStoreError::Corrupt(format!("unknown approval kind: {other}"))),
    })
}

fn severity_to_str(severity: Severity) -> &'static str {
    match severity {
        Severity::Warn => "WARN",
        Severity::Block => "BLOCK",
    }
}

fn severity_from_str(value: &str) -> Result<Severity, SqliteStoreError> {
    Ok(match value {
        "WARN" => Severity::Warn,
        "BLOCK" => Severity::Block,
        other => return Err(SqliteStoreError::Corrupt(format!("unknown severity: {other}"))),
    })
}

fn run_status_to_str(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Running => "running",
        RunStatus::Completed => "completed",
        RunStatus::Failed => "failed",
    }
}

fn run_status_from_str(value: &str) -> Result<RunStatus, SqliteStoreError> {
    Ok(match value {
        "running" => RunStatus::Running,
        "completed" => RunStatus::Completed,
        "failed" => RunStatus::Failed,
        other => return Err(SqliteStoreError::Corrupt(format!("unknown run status: {other}"))),
    })
}

fn workflow_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Workflow, SqliteStoreError>> {
    let id: String = row.get("id")?;
    let state: String = row.get("state")?;
    let stage: String = row.get("stage")?;
    let stage_status: String = row.get("stage_status")?;
    let repos_json: String = row.get("repos_json")?;
    let created_at: i64 = row.get("created_at")?;
    let updated_at: i64 = row.get("updated_at")?;
    Ok((|| {
        let repos: Vec<Repo> = serde_json::from_str(&repos_json)?;
        Ok(Workflow {
            id: WorkflowId::new(id),
            state: workflow_state_from_str(&state)?,
            stage: stage_name_from_str(&stage)?,
            stage_status: stage_status_from_str(&stage_status)?,
            feature_goal: row.get("feature_goal")?,
            business_justification: row.get("business_justification")?,
            repos,
            feedback: row.get("feedback")?,
            created_at: Timestamp::from_unix_millis(created_at),
            updated_at: Timestamp::from_unix_millis(updated_at),
            base_sha: row.get("base_sha")?,
        })
    })())
}

fn artifact_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Artifact, SqliteStoreError>> {
    let id: String = row.get("id")?;
    let workflow_id: String = row.get("workflow_id")?;
    let kind: String = row.get("kind")?;
    let artifact_version: i64 = row.get("artifact_version")?;
    let supersedes: Option<String> = row.get("supersedes_artifact_id")?;
    let created_at: i64 = row.get("created_at")?;
    Ok((|| {
        Ok(Artifact {
            id: ArtifactId::new(id),
            workflow_id: WorkflowId::new(workflow_id),
            kind: artifact_kind_from_str(&kind)?,
            content: row.get("content")?,
            content_sha: row.get("content_sha")?,
            artifact_version: u64::try_from(artifact_version).unwrap_or(0),
            supersedes_artifact_id: supersedes.map(ArtifactId::new),
            created_at: Timestamp::from_unix_millis(created_at),
        })
    })())
}

fn patch_set_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<PatchSet, SqliteStoreError>> {
    let id: String = row.get("id")?;
    let workflow_id: String = row.get("workflow_id")?;
    let artifact_id: String = row.get("artifact_id")?;
    let status: String = row.get("status")?;
    let patches_json: String = row.get("patches_json")?;
    Ok((|| {
        let patches: Vec<Patch> = serde_json::from_str(&patches_json)?;
        Ok(PatchSet {
            id: PatchSetId::new(id),
            workflow_id: WorkflowId::new(workflow_id),
            artifact_id: ArtifactId::new(artifact_id),
            title: row.get("title")?,
            base_sha: row.get("base_sha")?,
            status: patch_set_status_from_str(&status)?,
            patches,
        })
    })())
}

fn approval_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Approval, SqliteStoreError>> {
    let id: String = row.get("id")?;
    let workflow_id: String = row.get("workflow_id")?;
    let stage: String = row.get("stage")?;
    let kind: String = row.get("kind")?;
    let recorded_at: i64 = row.get("recorded_at")?;
    Ok((|| {
        Ok(Approval {
            id: ApprovalId::new(id),
            workflow_id: WorkflowId::new(workflow_id),
            stage: stage_name_from_str(&stage)?,
            kind: approval_kind_from_str(&kind)?,
            reason: row.get("reason")?,
            recorded_at: Timestamp::from_unix_millis(recorded_at),
        })
    })())
}

fn violation_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<PolicyViolation, SqliteStoreError>> {
    let id: String = row.get("id")?;
    let patch_set_id: String = row.get("patch_set_id")?;
    let severity: String = row.get("severity")?;
    let line: Option<i64> = row.get("line")?;
    Ok((|| {
        Ok(PolicyViolation {
            id: ViolationId::new(id),
            patch_set_id: PatchSetId::new(patch_set_id),
            rule: row.get("rule")?,
            severity: severity_from_str(&severity)?,
            file: row.get("file")?,
            line: line.map(|value| u32::try_from(value).unwrap_or(0)),
            message: row.get("message")?,
            evidence: row.get("evidence")?,
        })
    })())
}

fn event_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<WorkflowEvent, SqliteStoreError>> {
    let id: String = row.get("id")?;
    let workflow_id: String = row.get("workflow_id")?;
    let payload_json: String = row.get("payload_json")?;
    let recorded_at: i64 = row.get("recorded_at")?;
    Ok((|| {
        let payload: Value = serde_json::from_str(&payload_json)?;
        Ok(WorkflowEvent {
            id: EventId::new(id),
            workflow_id: WorkflowId::new(workflow_id),
            event_type: row.get("event_type")?,
            payload,
            recorded_at: Timestamp::from_unix_millis(recorded_at),
        })
    })())
}

fn run_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<WorkflowRun, SqliteStoreError>> {
    let id: String = row.get("id")?;
    let workflow_id: String = row.get("workflow_id")?;
    let status: String = row.get("status")?;
    let inputs_json: String = row.get("inputs_json")?;
    let outputs_json: Option<String> = row.get("outputs_json")?;
    let usage_json: Option<String> = row.get("usage_json")?;
    let started_at: i64 = row.get("started_at")?;
    let completed_at: Option<i64> = row.get("completed_at")?;
    let duration_ms: Option<i64> = row.get("duration_ms")?;
    Ok((|| {
        let inputs: Value = serde_json::from_str(&inputs_json)?;
        let outputs = outputs_json.map(|text| serde_json::from_str(&text)).transpose()?;
        let usage: Option<UsageCounters> = usage_json.map(|text| serde_json::from_str(&text)).transpose()?;
        Ok(WorkflowRun {
            id: RunId::new(id),
            workflow_id: WorkflowId::new(workflow_id),
            job_name: JobName::new(row.get::<_, String>("job_name")?),
            status: run_status_from_str(&status)?,
            input_hash: row.get("input_hash")?,
            inputs,
            outputs,
            error_message: row.get("error_message")?,
            started_at: Timestamp::from_unix_millis(started_at),
            completed_at: completed_at.map(Timestamp::from_unix_millis),
            duration_ms: duration_ms.map(|value| u64::try_from(value).unwrap_or(0)),
            usage,
        })
    })())
}

// ============================================================================
// SECTION: Store impl
// ============================================================================

#[async_trait]
impl Store for SqliteStore {
    async fn load_workflow(&self, id: &WorkflowId) -> Result<Workflow, StoreError> {
        let conn = self.read_conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let workflow_id = id.as_str().to_owned();
        let result = conn
            .query_row("SELECT * FROM workflows WHERE id = ?1", params![workflow_id], workflow_from_row)
            .optional()
            .map_err(|err| StoreError::from(SqliteStoreError::from(err)))?;
        match result {
            Some(Ok(workflow)) => Ok(workflow),
            Some(Err(err)) => Err(err.into()),
            None => Err(StoreError::NotFound(format!("workflow {id}"))),
        }
    }

    async fn insert_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        let workflow = workflow.clone();
        self.writer
            .submit(move |conn| {
                let repos_json = serde_json::to_string(&workflow.repos)?;
                conn.execute(
                    "INSERT INTO workflows (id, state, stage, stage_status, feature_goal, business_justification, repos_json, feedback, created_at, updated_at, base_sha)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    params![
                        workflow.id.as_str(),
                        workflow_state_to_str(workflow.state),
                        stage_name_to_str(workflow.stage),
                        stage_status_to_str(workflow.stage_status),
                        workflow.feature_goal,
                        workflow.business_justification,
                        repos_json,
                        workflow.feedback,
                        workflow.created_at.as_unix_millis(),
                        workflow.updated_at.as_unix_millis(),
                        workflow.base_sha,
                    ],
                )?;
                Ok(())
            })
            .map_err(StoreError::from)
    }

    async fn update_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        let workflow = workflow.clone();
        self.writer
            .submit(move |conn| {
                let changed = conn.execute(
                    "UPDATE workflows SET state = ?1, stage = ?2, stage_status = ?3, feedback = ?4, updated_at = ?5, base_sha = ?6 WHERE id = ?7",
                    params![
                        workflow_state_to_str(workflow.state),
                        stage_name_to_str(workflow.stage),
                        stage_status_to_str(workflow.stage_status),
                        workflow.feedback,
                        workflow.updated_at.as_unix_millis(),
                        workflow.base_sha,
                        workflow.id.as_str(),
                    ],
                )?;
                if changed == 0 {
                    return Err(SqliteStoreError::NotFound(format!("workflow {}", workflow.id)));
                }
                Ok(())
            })
            .map_err(StoreError::from)
    }

    async fn insert_artifact(&self, artifact: &Artifact) -> Result<(), StoreError> {
        let artifact = artifact.clone();
        self.writer
            .submit(move |conn| {
                let version = i64::try_from(artifact.artifact_version).unwrap_or(i64::MAX);
                conn.execute(
                    "INSERT INTO artifacts (id, workflow_id, kind, content, content_sha, artifact_version, supersedes_artifact_id, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        artifact.id.as_str(),
                        artifact.workflow_id.as_str(),
                        artifact_kind_to_str(artifact.kind),
                        artifact.content,
                        artifact.content_sha,
                        version,
                        artifact.supersedes_artifact_id.as_ref().map(ArtifactId::as_str),
                        artifact.created_at.as_unix_millis(),
                    ],
                )?;
                Ok(())
            })
            .map_err(StoreError::from)
    }

    async fn latest_artifact(&self, workflow_id: &WorkflowId, kind: ArtifactKind) -> Result<Option<Artifact>, StoreError> {
        let conn = self.read_conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let result = conn
            .query_row(
                "SELECT * FROM artifacts WHERE workflow_id = ?1 AND kind = ?2 ORDER BY seq DESC LIMIT 1",
                params![workflow_id.as_str(), artifact_kind_to_str(kind)],
                artifact_from_row,
            )
            .optional()
            .map_err(|err| StoreError::from(SqliteStoreError::from(err)))?;
        result.transpose().map_err(StoreError::from)
    }

    async fn load_artifact(&self, id: &ArtifactId) -> Result<Artifact, StoreError> {
        let conn = self.read_conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let result = conn
            .query_row("SELECT * FROM artifacts WHERE id = ?1", params![id.as_str()], artifact_from_row)
            .optional()
            .map_err(|err| StoreError::from(SqliteStoreError::from(err)))?;
        match result {
            Some(Ok(artifact)) => Ok(artifact),
            Some(Err(err)) => Err(err.into()),
            None => Err(StoreError::NotFound(format!("artifact {id}"))),
        }
    }

    async fn insert_patch_set(&self, patch_set: &PatchSet) -> Result<(), StoreError> {
        let patch_set = patch_set.clone();
        self.writer
            .submit(move |conn| {
                let patches_json = serde_json::to_string(&patch_set.patches)?;
                conn.execute(
                    "INSERT INTO patch_sets (id, workflow_id, artifact_id, title, base_sha, status, patches_json)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        patch_set.id.as_str(),
                        patch_set.workflow_id.as_str(),
                        patch_set.artifact_id.as_str(),
                        patch_set.title,
                        patch_set.base_sha,
                        patch_set_status_to_str(patch_set.status),
                        patches_json,
                    ],
                )?;
                Ok(())
            })
            .map_err(StoreError::from)
    }

    async fn update_patch_set(&self, patch_set: &PatchSet) -> Result<(), StoreError> {
        let patch_set = patch_set.clone();
        self.writer
            .submit(move |conn| {
                let patches_json = serde_json::to_string(&patch_set.patches)?;
                let changed = conn.execute(
                    "UPDATE patch_sets SET title = ?1, status = ?2, patches_json = ?3 WHERE id = ?4",
                    params![patch_set.title, patch_set_status_to_str(patch_set.status), patches_json, patch_set.id.as_str()],
                )?;
                if changed == 0 {
                    return Err(SqliteStoreError::NotFound(format!("patch set {}", patch_set.id)));
                }
                Ok(())
            })
            .map_err(StoreError::from)
    }

    async fn latest_patch_set(&self, workflow_id: &WorkflowId) -> Result<Option<PatchSet>, StoreError> {
        let conn = self.read_conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let result = conn
            .query_row("SELECT * FROM patch_sets WHERE workflow_id = ?1 ORDER BY seq DESC LIMIT 1", params![workflow_id.as_str()], patch_set_from_row)
            .optional()
            .map_err(|err| StoreError::from(SqliteStoreError::from(err)))?;
        result.transpose().map_err(StoreError::from)
    }

    async fn load_patch_set(&self, id: &PatchSetId) -> Result<PatchSet, StoreError> {
        let conn = self.read_conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let result = conn
            .query_row("SELECT * FROM patch_sets WHERE id = ?1", params![id.as_str()], patch_set_from_row)
            .optional()
            .map_err(|err| StoreError::from(SqliteStoreError::from(err)))?;
        match result {
            Some(Ok(patch_set)) => Ok(patch_set),
            Some(Err(err)) => Err(err.into()),
            None => Err(StoreError::NotFound(format!("patch set {id}"))),
        }
    }

    async fn insert_approval(&self, approval: &Approval) -> Result<(), StoreError> {
        let approval = approval.clone();
        self.writer
            .submit(move |conn| {
                conn.execute(
                    "INSERT INTO approvals (id, workflow_id, stage, kind, reason, recorded_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        approval.id.as_str(),
                        approval.workflow_id.as_str(),
                        stage_name_to_str(approval.stage),
                        approval_kind_to_str(approval.kind),
                        approval.reason,
                        approval.recorded_at.as_unix_millis(),
                    ],
                )?;
                Ok(())
            })
            .map_err(StoreError::from)
    }

    async fn list_approvals(&self, workflow_id: &WorkflowId) -> Result<Vec<Approval>, StoreError> {
        let conn = self.read_conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut statement = conn.prepare("SELECT * FROM approvals WHERE workflow_id = ?1 ORDER BY seq ASC").map_err(|err| StoreError::from(SqliteStoreError::from(err)))?;
        let rows = statement
            .query_map(params![workflow_id.as_str()], approval_from_row)
            .map_err(|err| StoreError::from(SqliteStoreError::from(err)))?;
        let mut approvals = Vec::new();
        for row in rows {
            approvals.push(row.map_err(|err| StoreError::from(SqliteStoreError::from(err)))?.map_err(StoreError::from)?);
        }
        Ok(approvals)
    }

    async fn replace_violations(&self, patch_set_id: &PatchSetId, violations: &[PolicyViolation]) -> Result<(), StoreError> {
        let patch_set_id = patch_set_id.clone();
        let violations = violations.to_vec();
        self.writer
            .submit(move |conn| {
                let tx = conn.transaction()?;
                tx.execute("DELETE FROM policy_violations WHERE patch_set_id = ?1", params![patch_set_id.as_str()])?;
                for violation in &violations {
                    let line = violation.line.map(i64::from);
                    tx.execute(
                        "INSERT INTO policy_violations (id, patch_set_id, rule, severity, file, line, message, evidence)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                        params![
                            violation.id.as_str(),
                            patch_set_id.as_str(),
                            violation.rule,
                            severity_to_str(violation.severity),
                            violation.file,
                            line,
                            violation.message,
                            violation.evidence,
                        ],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .map_err(StoreError::from)
    }

    async fn list_violations(&self, patch_set_id: &PatchSetId) -> Result<Vec<PolicyViolation>, StoreError> {
        let conn = self.read_conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut statement =
            conn.prepare("SELECT * FROM policy_violations WHERE patch_set_id = ?1 ORDER BY seq ASC").map_err(|err| StoreError::from(SqliteStoreError::from(err)))?;
        let rows = statement
            .query_map(params![patch_set_id.as_str()], violation_from_row)
            .map_err(|err| StoreError::from(SqliteStoreError::from(err)))?;
        let mut violations = Vec::new();
        for row in rows {
            violations.push(row.map_err(|err| StoreError::from(SqliteStoreError::from(err)))?.map_err(StoreError::from)?);
        }
        Ok(violations)
    }

    async fn append_event(&self, event: &WorkflowEvent) -> Result<(), StoreError> {
        let event = event.clone();
        self.writer
            .submit(move |conn| {
                let payload_json = serde_json::to_string(&event.payload)?;
                conn.execute(
                    "INSERT INTO workflow_events (id, workflow_id, event_type, payload_json, recorded_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![event.id.as_str(), event.workflow_id.as_str(), event.event_type, payload_json, event.recorded_at.as_unix_millis()],
                )?;
                Ok(())
            })
            .map_err(StoreError::from)
    }

    async fn list_events(&self, workflow_id: &WorkflowId) -> Result<Vec<WorkflowEvent>, StoreError> {
        let conn = self.read_conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut statement =
            conn.prepare("SELECT * FROM workflow_events WHERE workflow_id = ?1 ORDER BY seq ASC").map_err(|err| StoreError::from(SqliteStoreError::from(err)))?;
        let rows = statement
            .query_map(params![workflow_id.as_str()], event_from_row)
            .map_err(|err| StoreError::from(SqliteStoreError::from(err)))?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row.map_err(|err| StoreError::from(SqliteStoreError::from(err)))?.map_err(StoreError::from)?);
        }
        Ok(events)
    }

    async fn start_run(&self, run: &WorkflowRun) -> Result<(), StoreError> {
        let run = run.clone();
        self.writer
            .submit(move |conn| {
                let inputs_json = serde_json::to_string(&run.inputs)?;
                conn.execute(
                    "INSERT INTO workflow_runs (id, workflow_id, job_name, status, input_hash, inputs_json, started_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        run.id.as_str(),
                        run.workflow_id.as_str(),
                        run.job_name.as_str(),
                        run_status_to_str(run.status),
                        run.input_hash,
                        inputs_json,
                        run.started_at.as_unix_millis(),
                    ],
                )?;
                Ok(())
            })
            .map_err(StoreError::from)
    }

    async fn update_run(&self, run: &WorkflowRun) -> Result<(), StoreError> {
        let run = run.clone();
        self.writer
            .submit(move |conn| {
                let outputs_json = run.outputs.as_ref().map(serde_json::to_string).transpose()?;
                let usage_json = run.usage.as_ref().map(serde_json::to_string).transpose()?;
                let changed = conn.execute(
                    "UPDATE workflow_runs SET status = ?1, outputs_json = ?2, error_message = ?3, completed_at = ?4, duration_ms = ?5, usage_json = ?6 WHERE id = ?7",
                    params![
                        run_status_to_str(run.status),
                        outputs_json,
                        run.error_message,
                        run.completed_at.map(Timestamp::as_unix_millis),
                        run.duration_ms.map(|value| i64::try_from(value).unwrap_or(i64::MAX)),
                        usage_json,
                        run.id.as_str(),
                    ],
                )?;
                if changed == 0 {
                    return Err(SqliteStoreError::NotFound(format!("run {}", run.id)));
                }
                Ok(())
            })
            .map_err(StoreError::from)
    }

    async fn find_runs_by_input_hash(&self, input_hash: &str) -> Result<Vec<WorkflowRun>, StoreError> {
        let conn = self.read_conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut statement =
            conn.prepare("SELECT * FROM workflow_runs WHERE input_hash = ?1 AND status = 'completed' ORDER BY seq ASC").map_err(|err| StoreError::from(SqliteStoreError::from(err)))?;
        let rows = statement.query_map(params![input_hash], run_from_row).map_err(|err| StoreError::from(SqliteStoreError::from(err)))?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row.map_err(|err| StoreError::from(SqliteStoreError::from(err)))?.map_err(StoreError::from)?);
        }
        Ok(runs)
    }

    async fn with_workflow_lock<'a>(
        &'a self,
        workflow_id: &'a WorkflowId,
        f: Box<dyn FnOnce() -> Result<(), StoreError> + Send + 'a>,
    ) -> Result<(), StoreError> {
        let lock = self.lock_for(workflow_id);
        let _guard = lock.lock().await;
        f()
    }
}
