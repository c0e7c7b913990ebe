// crates/changegate-cli/src/main.rs
// ============================================================================
// Module: Changegate CLI
// Description: The operator-facing entry point: runs the orchestrator and
//              worker dispatch loops, and drives workflow lifecycle commands.
// Purpose: Call the same orchestrator entry points an HTTP API would call,
//          without duplicating any orchestration logic here.
// Dependencies: clap, tokio, changegate-config, changegate-core,
//               changegate-orchestrator, changegate-worker
// ============================================================================

//! ## Overview
//! Every subcommand loads a [`ChangegateConfig`], assembles a [`System`],
//! and calls straight into [`Orchestrator`] or the stage/job worker
//! framework. `serve` keeps the process alive, draining the `"workflow"`
//! and `"orchestrator"` queues; every other subcommand does one unit of
//! work and exits.

mod output;
mod prompts;
mod system;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use changegate_config::ChangegateConfig;
use changegate_core::identifiers::JobName;
use changegate_core::identifiers::QueueName;
use changegate_core::identifiers::RunId;
use changegate_core::identifiers::StageName;
use changegate_core::identifiers::WorkflowId;
use changegate_core::model::Repo;
use changegate_core::model::StageStatus;
use changegate_core::model::Workflow;
use changegate_core::model::WorkflowState;
use changegate_core::time::Timestamp;
use changegate_orchestrator::dispatch;
use changegate_orchestrator::run_dispatch_loop;
use changegate_worker::run_stage_job;
use changegate_worker::stage_worker::run_job;
use clap::Parser;
use clap::Subcommand;
use clap::ValueEnum;
use serde_json::Value;
use serde_json::json;
use tokio_stream::StreamExt as _;

use crate::output::CliError;
use crate::output::CliResult;
use crate::output::emit_error;
use crate::output::write_json_value;
use crate::output::write_stdout_line;
use crate::system::ORCHESTRATOR_QUEUE;
use crate::system::System;
use crate::system::WORKFLOW_QUEUE;

#[derive(Debug, Parser)]
#[command(name = "changegate", about = "Drives the Changegate change-request pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Runs the orchestrator dispatch loop and the automatic job workers
    /// until every queue is closed.
    Serve {
        /// Path to a `changegate.toml` file; falls back to `CHANGEGATE_CONFIG`
        /// or `./changegate.toml`.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Workflow lifecycle and inspection commands.
    Workflow {
        #[command(subcommand)]
        command: WorkflowCommand,
    },
}

#[derive(Debug, Subcommand)]
enum WorkflowCommand {
    /// Creates a new workflow and reconciles its initial state.
    Create {
        /// Operator-supplied stable workflow id.
        #[arg(long)]
        id: String,
        /// The feature request being implemented.
        #[arg(long)]
        feature_goal: String,
        /// Business justification for the change.
        #[arg(long)]
        business_justification: String,
        /// A target repository, as `owner/name@base_branch[:role]`. May be
        /// repeated.
        #[arg(long = "repo", required = true)]
        repos: Vec<String>,
        /// The base commit SHA patches will be applied against, if already
        /// known.
        #[arg(long)]
        base_sha: Option<String>,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Approves the workflow's current gated stage.
    ApproveStage {
        #[arg(long)]
        id: String,
        #[arg(long)]
        stage: CliStage,
        #[arg(long)]
        reason: Option<String>,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Rejects the workflow's current gated stage.
    RejectStage {
        #[arg(long)]
        id: String,
        #[arg(long)]
        stage: CliStage,
        #[arg(long)]
        reason: String,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Requests changes on the workflow's current gated stage.
    RequestChanges {
        #[arg(long)]
        id: String,
        #[arg(long)]
        stage: CliStage,
        #[arg(long)]
        comment: String,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Runs the worker bound to the workflow's current gated stage once, and
    /// delivers the resulting completion straight to the orchestrator.
    RunStage {
        #[arg(long)]
        id: String,
        /// Extra fields merged into the job payload (e.g. `taskType`,
        /// `targetFiles` for the patches stage), as a JSON object.
        #[arg(long)]
        payload: Option<String>,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Prints a workflow's current state, recent events, approvals, latest
    /// patch set, and recorded policy violations.
    Show {
        #[arg(long)]
        id: String,
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

/// The ten gated-pipeline stage names, mirrored locally since
/// `changegate_core::identifiers::StageName` has no parsing helper of its
/// own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "kebab-case")]
enum CliStage {
    Ingest,
    Feasibility,
    Architecture,
    Timeline,
    Summary,
    Patches,
    Policy,
    Sandbox,
    Pr,
    Done,
}

impl CliStage {
    const fn to_core(self) -> StageName {
        match self {
            Self::Ingest => StageName::Ingest,
            Self::Feasibility => StageName::Feasibility,
            Self::Architecture => StageName::Architecture,
            Self::Timeline => StageName::Timeline,
            Self::Summary => StageName::Summary,
            Self::Patches => StageName::Patches,
            Self::Policy => StageName::Policy,
            Self::Sandbox => StageName::Sandbox,
            Self::Pr => StageName::Pr,
            Self::Done => StageName::Done,
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            emit_error(&err);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> CliResult<ExitCode> {
    match cli.command {
        Commands::Serve { config } => cmd_serve(config.as_deref()).await,
        Commands::Workflow { command } => cmd_workflow(command).await,
    }
}

/// The current wall-clock time, read at the one point every command needs
/// it: `changegate_core::time::Timestamp` never reads the clock itself.
fn now() -> Timestamp {
    #[allow(clippy::cast_possible_truncation, reason = "millisecond epoch offsets fit i64 until the year 292,471,208")]
    let millis = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64;
    Timestamp::from_unix_millis(millis)
}

fn load_config(path: Option<&std::path::Path>) -> CliResult<ChangegateConfig> {
    ChangegateConfig::load(path).map_err(CliError::from_display)
}

/// Parses `owner/name@base_branch[:role]` into a [`Repo`], defaulting
/// `role` to `"primary"`.
fn parse_repo(raw: &str) -> CliResult<Repo> {
    let (owner_name, rest) = raw.split_once('@').ok_or_else(|| CliError::from(format!("repo '{raw}' is missing '@base_branch'")))?;
    let (owner, name) = owner_name.split_once('/').ok_or_else(|| CliError::from(format!("repo '{raw}' is missing 'owner/'")))?;
    let (base_branch, role) = rest.split_once(':').map_or((rest, "primary"), |(branch, role)| (branch, role));
    Ok(Repo { owner: owner.to_owned(), name: name.to_owned(), base_branch: base_branch.to_owned(), role: role.to_owned() })
}

async fn cmd_serve(config_path: Option<&std::path::Path>) -> CliResult<ExitCode> {
    let config = load_config(config_path)?;
    let (mut system, mut subscriptions) = System::assemble(&config)?;

    let workflow_stream = subscriptions.take(WORKFLOW_QUEUE).ok_or_else(|| CliError::from("workflow queue has no subscriber"))?;
    let orchestrator_stream = subscriptions.take(ORCHESTRATOR_QUEUE).ok_or_else(|| CliError::from("orchestrator queue has no subscriber"))?;

    let job_workers = std::mem::take(&mut system.job_workers);
    let store = system.store.clone();
    let queues = system.queues.clone();
    let run_recorder = system.run_recorder;
    let orchestrator_queue_name = QueueName::new(ORCHESTRATOR_QUEUE);

    let workflow_loop = tokio::spawn(async move {
        let mut stream = workflow_stream;
        while let Some(job) = stream.next().await {
            let Some(job_name) = job.payload.get("job").and_then(Value::as_str).map(str::to_owned) else { continue };
            let Some(worker) = job_workers.get(job_name.as_str()) else { continue };
            let Some(workflow_id) = job.payload.get("workflowId").and_then(Value::as_str) else { continue };
            let workflow_id = WorkflowId::new(workflow_id);
            let run_id = RunId::new(format!("{workflow_id}:{job_name}:{}", now().as_unix_millis()));
            let _ = run_job(worker.as_ref(), &store, &queues, &run_recorder, workflow_id, run_id, JobName::new(job_name), job.payload.clone(), &orchestrator_queue_name, now()).await;
        }
    });

    let orchestrator = system.orchestrator.clone();
    let dispatch_loop = tokio::spawn(async move { run_dispatch_loop(&orchestrator, orchestrator_stream, now).await });

    write_stdout_line("changegate serving; draining workflow and orchestrator queues");
    let _ = workflow_loop.await;
    dispatch_loop.await.map_err(CliError::from_display)?.map_err(CliError::from_display)?;
    Ok(ExitCode::SUCCESS)
}

async fn cmd_workflow(command: WorkflowCommand) -> CliResult<ExitCode> {
    match command {
        WorkflowCommand::Create { id, feature_goal, business_justification, repos, base_sha, config } => cmd_create(id, feature_goal, business_justification, repos, base_sha, config.as_deref()).await,
        WorkflowCommand::ApproveStage { id, stage, reason, config } => cmd_approve_stage(id, stage, reason, config.as_deref()).await,
        WorkflowCommand::RejectStage { id, stage, reason, config } => cmd_reject_stage(id, stage, reason, config.as_deref()).await,
        WorkflowCommand::RequestChanges { id, stage, comment, config } => cmd_request_changes(id, stage, comment, config.as_deref()).await,
        WorkflowCommand::RunStage { id, payload, config } => cmd_run_stage(id, payload, config.as_deref()).await,
        WorkflowCommand::Show { id, config } => cmd_show(id, config.as_deref()).await,
    }
}

async fn cmd_create(id: String, feature_goal: String, business_justification: String, repos: Vec<String>, base_sha: Option<String>, config_path: Option<&std::path::Path>) -> CliResult<ExitCode> {
    let config = load_config(config_path)?;
    let (system, _subscriptions) = System::assemble(&config)?;
    let repos = repos.iter().map(|raw| parse_repo(raw)).collect::<CliResult<Vec<_>>>()?;
    let now = now();

    let workflow = Workflow {
        id: WorkflowId::new(id),
        state: WorkflowState::Ingested,
        stage: StageName::Ingest,
        stage_status: StageStatus::Pending,
        feature_goal,
        business_justification,
        repos,
        feedback: None,
        created_at: now,
        updated_at: now,
        base_sha,
    };

    let decision = system.orchestrator.create_workflow(workflow, now).await.map_err(CliError::from_display)?;
    write_json_value(&json!({ "nextState": format!("{:?}", decision.next_state), "reason": decision.reason }));
    Ok(ExitCode::SUCCESS)
}

async fn cmd_approve_stage(id: String, stage: CliStage, reason: Option<String>, config_path: Option<&std::path::Path>) -> CliResult<ExitCode> {
    let config = load_config(config_path)?;
    let (system, _subscriptions) = System::assemble(&config)?;
    let decision = system.orchestrator.approve_stage(&WorkflowId::new(id), stage.to_core(), reason, now()).await.map_err(CliError::from_display)?;
    write_json_value(&json!({ "reconciled": decision.map(|decision| json!({ "nextState": format!("{:?}", decision.next_state), "reason": decision.reason })) }));
    Ok(ExitCode::SUCCESS)
}

async fn cmd_reject_stage(id: String, stage: CliStage, reason: String, config_path: Option<&std::path::Path>) -> CliResult<ExitCode> {
    let config = load_config(config_path)?;
    let (system, _subscriptions) = System::assemble(&config)?;
    system.orchestrator.reject_stage(&WorkflowId::new(id), stage.to_core(), reason, now()).await.map_err(CliError::from_display)?;
    write_stdout_line("stage rejected");
    Ok(ExitCode::SUCCESS)
}

async fn cmd_request_changes(id: String, stage: CliStage, comment: String, config_path: Option<&std::path::Path>) -> CliResult<ExitCode> {
    let config = load_config(config_path)?;
    let (system, _subscriptions) = System::assemble(&config)?;
    system.orchestrator.request_stage_changes(&WorkflowId::new(id), stage.to_core(), comment, now()).await.map_err(CliError::from_display)?;
    write_stdout_line("changes requested");
    Ok(ExitCode::SUCCESS)
}

/// Runs the worker bound to the workflow's current gated stage once, in
/// process, then hands the resulting orchestrator-queue message straight to
/// [`dispatch`] — the one-shot substitute for a worker pool, for operators
/// driving a workflow stage by stage from the command line.
async fn cmd_run_stage(id: String, payload: Option<String>, config_path: Option<&std::path::Path>) -> CliResult<ExitCode> {
    let config = load_config(config_path)?;
    let (system, mut subscriptions) = System::assemble(&config)?;
    let orchestrator_queue = QueueName::new(ORCHESTRATOR_QUEUE);
    let mut orchestrator_stream = subscriptions.take(ORCHESTRATOR_QUEUE).ok_or_else(|| CliError::from("orchestrator queue has no subscriber"))?;

    let workflow_id = WorkflowId::new(id);
    let workflow = system.store.load_workflow(&workflow_id).await.map_err(CliError::from_display)?;
    let worker = system.stage_workers.get(&workflow.stage).ok_or_else(|| CliError::from(format!("no stage worker registered for stage {}", workflow.stage)))?;

    let extra_payload: Value = payload.as_deref().map(serde_json::from_str).transpose().map_err(CliError::from_display)?.unwrap_or_else(|| json!({}));
    let run_id = RunId::new(format!("{workflow_id}:{}:{}", workflow.stage.as_str(), now().as_unix_millis()));
    let job_name = JobName::new(workflow.stage.as_str());

    run_stage_job(worker.as_ref(), &system.store, &system.queues, &system.run_recorder, workflow_id.clone(), run_id, job_name, extra_payload, &orchestrator_queue, now())
        .await
        .map_err(CliError::from_display)?;

    let Some(job) = orchestrator_stream.next().await else {
        return Err(CliError::from("stage run produced no orchestrator delivery"));
    };
    let decision = dispatch(&system.orchestrator, &job.payload, now()).await.map_err(CliError::from_display)?;
    write_json_value(&json!({
        "stage": workflow.stage.as_str(),
        "delivery": job.payload,
        "reconciled": decision.map(|decision| json!({ "nextState": format!("{:?}", decision.next_state), "reason": decision.reason })),
    }));
    Ok(ExitCode::SUCCESS)
}

async fn cmd_show(id: String, config_path: Option<&std::path::Path>) -> CliResult<ExitCode> {
    let config = load_config(config_path)?;
    let (system, _subscriptions) = System::assemble(&config)?;
    let workflow_id = WorkflowId::new(id);

    let workflow = system.store.load_workflow(&workflow_id).await.map_err(CliError::from_display)?;
    let events = system.store.list_events(&workflow_id).await.map_err(CliError::from_display)?;
    let approvals = system.store.list_approvals(&workflow_id).await.map_err(CliError::from_display)?;
    let latest_patch_set = system.store.latest_patch_set(&workflow_id).await.map_err(CliError::from_display)?;
    let violations = match &latest_patch_set {
        Some(patch_set) => system.store.list_violations(&patch_set.id).await.map_err(CliError::from_display)?,
        None => Vec::new(),
    };

    write_json_value(&json!({
        "workflow": workflow,
        "events": events,
        "approvals": approvals,
        "latestPatchSet": latest_patch_set,
        "violations": violations,
    }));
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, reason = "test assertions")]

    use super::*;

    #[test]
    fn parses_a_repo_with_an_explicit_role() {
        let repo = parse_repo("acme/widgets@main:primary").expect("parses");
        assert_eq!(repo.owner, "acme");
        assert_eq!(repo.name, "widgets");
        assert_eq!(repo.base_branch, "main");
        assert_eq!(repo.role, "primary");
    }

    #[test]
    fn parses_a_repo_defaulting_the_role() {
        let repo = parse_repo("acme/widgets@main").expect("parses");
        assert_eq!(repo.role, "primary");
    }

    #[test]
    fn rejects_a_repo_missing_the_base_branch() {
        assert!(parse_repo("acme/widgets").is_err());
    }

    #[test]
    fn rejects_a_repo_missing_the_owner() {
        assert!(parse_repo("widgets@main").is_err());
    }

    #[test]
    fn cli_stage_maps_every_variant_to_its_core_counterpart() {
        assert_eq!(CliStage::Ingest.to_core(), StageName::Ingest);
        assert_eq!(CliStage::Done.to_core(), StageName::Done);
    }
}
