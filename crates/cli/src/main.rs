//! escalatesafe-control
//!
//! Control-plane CLI exercising the pipeline end to end: create a run
//! (ingest -> detect -> redact -> leak-verify), approve it (export to a
//! downstream issue tracker, best-effort attach + notify), cancel it, or
//! verify an audit log's hash chain. HTTP routing (`original_source/api/routes`)
//! is out of scope (SPEC_FULL §1 non-goals); this CLI is the in-workspace
//! substitute, grounded on `control_cli/src/main.rs`'s clap/tokio/dotenvy
//! idiom: a `Subcommand` enum, an aggregated `CliError`, `.env` loaded
//! from repo root or CWD, `#[tokio::main]` delegating to a fallible `run()`.
//!
//! A single CLI invocation only lives as long as its process, so a
//! multi-step flow (create-run, then later approve) threads state through
//! a JSON snapshot file — the same role `RedactOnly`'s artifact files play
//! for the teacher's `DispatchDir`. `RunState::load` replays the snapshot
//! into a fresh `InMemoryRunStore` via `create_run`/`insert_asset`, which
//! insert as given without re-validating the transition history; the real
//! transition validation happens when the command under `run()` calls
//! `transition_run`/`commit_export_once` against that rehydrated state.

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use dotenvy::from_path as dotenv_from_path;
use escalatesafe_audit::{
    verify_log, AssetCompleted, AssetKind as AuditAssetKind, AuditAppender, AuditEvent, RunCancelled, RunCreated,
    RunFailed, RunReadyForReview, RunRejected,
};
use escalatesafe_common::{sha256_bytes, sha256_canonical_json};
use escalatesafe_detector::{Detector, HeuristicNer, RedactionPolicy};
use escalatesafe_domain::{
    check_internal_notes_gate, dedup::dedupe_against_description, now_unix, AssetId, AssetKind, AssetStatus,
    Export, InMemoryRunStore, IssueTrackerConfig, NotifierConfig, RedactionPolicyConfig, RedactionReport, Run,
    RunAsset, RunId, RunOptions, RunStatus, RunStore, Tenant, TenantConfig, TenantId,
};
use escalatesafe_export::{
    AttachmentResult, BlobStore, CreatedIssue, DownstreamError, DownstreamErrorCategory, ExportOrchestrator,
    IssueTracker, NewIssue, Notifier,
};
use escalatesafe_media::verify_text;
use escalatesafe_redactor::{redact, TokenPolicy};
use escalatesafe_vault::Vault;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
enum CliError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("domain error: {0}")]
    Domain(#[from] escalatesafe_domain::DomainError),
    #[error("canonical json error: {0}")]
    Canon(#[from] escalatesafe_common::CanonError),
    #[error("export error: {0}")]
    Export(#[from] escalatesafe_export::ExportError),
    #[error("audit error: {0}")]
    Audit(#[from] escalatesafe_audit::AuditLogError),
    #[error("vault error: {0}")]
    Vault(#[from] escalatesafe_vault::VaultError),
    #[error("run was rejected: {0}")]
    Rejected(String),
    #[error("no state file at {0}")]
    MissingState(PathBuf),
}

#[derive(Parser)]
#[command(name = "escalatesafe-control", version, about = "EscalateSafe Rust control-plane utilities")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest a ticket description + comments, detect and redact PII,
    /// leak-verify the result, and leave the run `ready_for_review`.
    CreateRun {
        /// Repo root containing runtime/ (for .env lookup and artifact storage).
        #[arg(long)]
        repo_root: PathBuf,

        #[arg(long)]
        tenant_id: String,

        #[arg(long)]
        ticket_id: String,

        /// Path to a text file containing the ticket description.
        #[arg(long)]
        description: PathBuf,

        /// Path to a JSON array of comment strings (public comments).
        #[arg(long)]
        comments: Option<PathBuf>,

        #[arg(long, default_value_t = false)]
        include_internal_notes: bool,

        #[arg(long, default_value_t = false)]
        allow_internal_notes: bool,

        #[arg(long, default_value_t = false)]
        enable_national_ids: bool,

        /// Where to persist the run's state for a later approve/cancel.
        #[arg(long)]
        state_file: PathBuf,

        #[arg(long, default_value = "runtime/logs/audit.jsonl")]
        audit_log: PathBuf,
    },

    /// Approve a `ready_for_review` run: export to the downstream issue
    /// tracker, attach sanitized assets, and fire the notifier.
    Approve {
        #[arg(long)]
        repo_root: PathBuf,

        #[arg(long)]
        state_file: PathBuf,

        #[arg(long, default_value = "runtime/logs/audit.jsonl")]
        audit_log: PathBuf,

        #[arg(long, default_value = "SUP")]
        project_key: String,

        #[arg(long, default_value = "Bug")]
        issue_type: String,

        /// Use the real HTTP-backed Jira/Slack clients instead of the
        /// local fixture. Requires JIRA_BASE_URL / JIRA_API_TOKEN and,
        /// if the tenant's notifier is enabled, SLACK_WEBHOOK_URL.
        #[arg(long, default_value_t = false)]
        live: bool,
    },

    /// Cancel a run from any non-terminal state.
    Cancel {
        #[arg(long)]
        repo_root: PathBuf,

        #[arg(long)]
        state_file: PathBuf,

        #[arg(long, default_value = "runtime/logs/audit.jsonl")]
        audit_log: PathBuf,
    },

    /// Replay an audit log's hash chain and print the final hash.
    VerifyAudit {
        #[arg(long)]
        audit_log: PathBuf,
    },
}

/// Everything `InMemoryRunStore` needs rehydrated between CLI invocations.
/// `redacted_text` is the already-sanitized body (safe to persist locally;
/// it is never written to the audit log, per global invariant 5).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RunState {
    tenant: Tenant,
    tenant_config: TenantConfig,
    run: Run,
    assets: Vec<RunAsset>,
    export: Option<Export>,
    redacted_text: String,
}

impl RunState {
    fn load(path: &Path) -> Result<Self, CliError> {
        if !path.exists() {
            return Err(CliError::MissingState(path.to_path_buf()));
        }
        let bytes = fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn save(&self, path: &Path) -> Result<(), CliError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    /// Rebuilds an `InMemoryRunStore` holding exactly this run's rows.
    /// `create_run`/`insert_asset`/`update_export` insert as given and do
    /// not re-run `validate_transition` — the real validation happens
    /// when the caller subsequently calls `transition_run` or
    /// `commit_export_once` against this rehydrated state.
    async fn into_store(self) -> Result<(Arc<InMemoryRunStore>, RunId, String), CliError> {
        let store = Arc::new(InMemoryRunStore::new());
        store.upsert_tenant(self.tenant).await?;
        store.put_tenant_config(self.tenant_config).await?;
        let run = store.create_run(self.run).await?;
        for asset in self.assets {
            store.insert_asset(asset).await?;
        }
        if let Some(export) = self.export {
            store.update_export(export).await?;
        }
        Ok((store, run.id, self.redacted_text))
    }

    async fn snapshot(store: &InMemoryRunStore, run_id: &RunId, redacted_text: String) -> Result<Self, CliError> {
        let run = store.get_run(run_id).await?;
        let tenant = store.get_tenant(&run.tenant_id).await?;
        let tenant_config = store.get_tenant_config(&run.tenant_id).await?;
        let assets = store.list_assets(run_id).await;
        let export = store.get_export_by_run(run_id).await;
        Ok(Self { tenant, tenant_config, run, assets, export, redacted_text })
    }
}

fn load_env(repo_root: &Path) {
    let repo_env = repo_root.join(".env");
    if repo_env.exists() {
        let _ = dotenv_from_path(&repo_env);
        eprintln!("loaded env from {}", repo_env.display());
    } else if Path::new(".env").exists() {
        let _ = dotenv_from_path(".env");
        eprintln!("loaded env from ./.env");
    } else {
        eprintln!("no .env file found (expected at {} or CWD)", repo_env.display());
    }
}

fn ensure_runtime_dirs(repo_root: &Path) -> Result<(), CliError> {
    fs::create_dir_all(repo_root.join("runtime/logs"))?;
    fs::create_dir_all(repo_root.join("runtime/artifacts"))?;
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("ERROR: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    let _ = tracing_subscriber::fmt::try_init();
    let args = Args::parse();
    match args.cmd {
        Command::VerifyAudit { audit_log } => {
            let last = verify_log(audit_log)?;
            println!("{last}");
            Ok(())
        }
        Command::CreateRun {
            repo_root,
            tenant_id,
            ticket_id,
            description,
            comments,
            include_internal_notes,
            allow_internal_notes,
            enable_national_ids,
            state_file,
            audit_log,
        } => {
            load_env(&repo_root);
            ensure_runtime_dirs(&repo_root)?;
            create_run_cmd(
                &repo_root,
                tenant_id,
                ticket_id,
                description,
                comments,
                include_internal_notes,
                allow_internal_notes,
                enable_national_ids,
                &state_file,
                &audit_log,
            )
            .await
        }
        Command::Approve { repo_root, state_file, audit_log, project_key, issue_type, live } => {
            load_env(&repo_root);
            ensure_runtime_dirs(&repo_root)?;
            approve_cmd(&repo_root, &state_file, &audit_log, project_key, issue_type, live).await
        }
        Command::Cancel { repo_root, state_file, audit_log } => {
            load_env(&repo_root);
            cancel_cmd(&state_file, &audit_log).await
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn create_run_cmd(
    repo_root: &Path,
    tenant_id: String,
    ticket_id: String,
    description_path: PathBuf,
    comments_path: Option<PathBuf>,
    include_internal_notes: bool,
    allow_internal_notes: bool,
    enable_national_ids: bool,
    state_file: &Path,
    audit_log: &Path,
) -> Result<(), CliError> {
    let tenant_id = TenantId(tenant_id);
    let description = fs::read_to_string(&description_path)?;
    let comments: Vec<String> = match comments_path {
        Some(p) => serde_json::from_slice(&fs::read(p)?)?,
        None => Vec::new(),
    };

    let mut audit = AuditAppender::open(audit_log)?;

    let options = RunOptions { include_internal_notes, ..RunOptions::default() };
    let policy_config = RedactionPolicyConfig { allow_internal_notes, enable_national_ids, ..RedactionPolicyConfig::default() };

    // §4.6: reject before a Run row ever exists.
    if let Err(e) = check_internal_notes_gate(&options, &policy_config) {
        audit.append(AuditEvent::RunRejected(RunRejected {
            schema_version: 1,
            tenant_id: tenant_id.clone(),
            ticket_id,
            ts: now_unix(),
            reason: e.to_string(),
        }))?;
        return Err(CliError::Rejected(e.to_string()));
    }

    let run_id = RunId(Uuid::new_v4());
    let store = InMemoryRunStore::new();
    let tenant = Tenant::new(tenant_id.clone(), tenant_id.0.clone());
    store.upsert_tenant(tenant.clone()).await?;
    let tenant_config = TenantConfig {
        tenant_id: tenant_id.clone(),
        redaction_policy: policy_config.clone(),
        issue_tracker_config: IssueTrackerConfig::default(),
        notifier_config: NotifierConfig::default(),
    };
    store.put_tenant_config(tenant_config.clone()).await?;

    let run = Run::new(run_id, tenant_id.clone(), ticket_id.clone(), options);
    let run = store.create_run(run).await?;

    let options_hash = sha256_canonical_json(&run.options)?;
    audit.append(AuditEvent::RunCreated(RunCreated {
        schema_version: 1,
        tenant_id: tenant_id.clone(),
        run_id: run.id,
        ticket_id: ticket_id.clone(),
        ts: now_unix(),
        options_hash,
    }))?;

    let run = store.transition_run(&run.id, RunStatus::Processing, |_| {}).await?;

    // `original_source/api/routes/runs.py::create_run`'s dedup-against-description
    // step, applied before the kept comments are folded into the analysis text.
    let kept_comments: Vec<&str> = comments
        .iter()
        .filter(|c| !dedupe_against_description(&description, c))
        .map(|c| c.as_str())
        .collect();
    let mut text_to_analyze = description.clone();
    for comment in &kept_comments {
        text_to_analyze.push_str("\n\n");
        text_to_analyze.push_str(comment);
    }

    let redaction_policy = RedactionPolicy {
        confidence_threshold: policy_config.confidence_threshold,
        warn_threshold: policy_config.warn_threshold,
        enable_national_ids: policy_config.enable_national_ids,
    };
    let detector = Detector::new(redaction_policy);
    let analysis = detector.analyze(&text_to_analyze);
    let counts_by_kind = Detector::<HeuristicNer>::entity_counts(&analysis);
    let redaction = redact(&text_to_analyze, &analysis.spans, &TokenPolicy::default());

    let report = RedactionReport {
        counts_by_kind: counts_by_kind.clone(),
        low_confidence_count: analysis.low_confidence.len() as u64,
        total_redactions: redaction.counts_by_kind.values().sum(),
    };

    let run_hash = sha256_bytes(format!("{}:{}:{}", tenant_id.0, ticket_id, redaction.redacted_text).as_bytes());

    audit.append(AuditEvent::RedactionCompleted(escalatesafe_audit::RedactionCompleted {
        schema_version: 1,
        tenant_id: tenant_id.clone(),
        run_id: run.id,
        ts: now_unix(),
        counts_by_kind: counts_by_kind.clone(),
        low_confidence_count: report.low_confidence_count,
        run_hash: run_hash.clone(),
    }))?;

    // Leak Verifier (§4.5): re-run the same detector over the redacted
    // text before the text asset is ever allowed to leave `processing`.
    let verification = verify_text(&redaction.redacted_text, &detector);

    let asset_dir = repo_root.join("runtime/artifacts").join(run.id.0.to_string());
    fs::create_dir_all(&asset_dir)?;
    let asset_path = asset_dir.join("ticket.txt");
    fs::write(&asset_path, &redaction.redacted_text)?;
    let checksum = sha256_bytes(redaction.redacted_text.as_bytes());

    let asset = RunAsset::new(AssetId(Uuid::new_v4()), run.id, AssetKind::RedactedText, "ticket.txt", Some("text/plain".to_string()));
    let asset = store.insert_asset(asset).await?;

    let asset = if verification.passed {
        store
            .cas_asset(&asset.id, AssetStatus::Pending, |a| {
                a.status = AssetStatus::Completed;
                a.storage_ref = Some(asset_path.to_string_lossy().to_string());
                a.checksum = Some(checksum.clone());
            })
            .await?
    } else {
        store
            .cas_asset(&asset.id, AssetStatus::Pending, |a| a.status = AssetStatus::Blocked)
            .await?
    };

    audit.append(if asset.status == AssetStatus::Completed {
        AuditEvent::AssetCompleted(AssetCompleted {
            schema_version: 1,
            tenant_id: tenant_id.clone(),
            run_id: run.id,
            asset_id: asset.id,
            ts: now_unix(),
            asset_kind: AuditAssetKind::RedactedText,
            checksum,
        })
    } else {
        AuditEvent::AssetBlocked(escalatesafe_audit::AssetBlocked {
            schema_version: 1,
            tenant_id: tenant_id.clone(),
            run_id: run.id,
            asset_id: asset.id,
            ts: now_unix(),
            asset_kind: AuditAssetKind::RedactedText,
            residual_kind_count: verification.residuals.len() as u64,
        })
    })?;

    let blocked_count = if asset.status == AssetStatus::Blocked { 1 } else { 0 };
    // This CLI only ever creates the one text asset per run, so a blocked
    // asset here means zero assets remain exportable (§4.5).
    let no_exportable_assets = asset.status == AssetStatus::Blocked;

    let run = store
        .transition_run(
            &run.id,
            if no_exportable_assets { RunStatus::Failed } else { RunStatus::ReadyForReview },
            |r| {
                r.run_hash = Some(run_hash);
                r.redaction_report = Some(report);
            },
        )
        .await?;

    if no_exportable_assets {
        audit.append(AuditEvent::RunFailed(RunFailed {
            schema_version: 1,
            tenant_id,
            run_id: run.id,
            ts: now_unix(),
            error_code: "LEAK_VERIFICATION_FAILED".to_string(),
        }))?;
    } else {
        audit.append(AuditEvent::RunReadyForReview(RunReadyForReview {
            schema_version: 1,
            tenant_id,
            run_id: run.id,
            ts: now_unix(),
            blocked_asset_count: blocked_count,
        }))?;
    }

    let state = RunState::snapshot(&store, &run.id, redaction.redacted_text).await?;
    state.save(state_file)?;

    println!(
        "{{\"run_id\":\"{}\",\"status\":\"{:?}\",\"total_redactions\":{},\"leak_check_passed\":{}}}",
        run.id.0, run.status, state.run.redaction_report.as_ref().map(|r| r.total_redactions).unwrap_or(0), verification.passed
    );
    Ok(())
}

async fn approve_cmd(
    repo_root: &Path,
    state_file: &Path,
    audit_log: &Path,
    project_key: String,
    issue_type: String,
    live: bool,
) -> Result<(), CliError> {
    let state = RunState::load(state_file)?;
    let tenant_config = state.tenant_config.clone();
    let mut tracker_config = tenant_config.issue_tracker_config.clone();
    if tracker_config.project_key.is_none() {
        tracker_config.project_key = Some(project_key);
    }
    if tracker_config.issue_type.is_none() {
        tracker_config.issue_type = Some(issue_type);
    }
    let notifier_config = tenant_config.notifier_config.clone();

    let (store, run_id, redacted_text) = state.into_store().await?;

    let orchestrator = build_orchestrator(repo_root, audit_log, &store, &tracker_config, live)?;

    let outcome = orchestrator.approve(&run_id, &tracker_config, &notifier_config, &redacted_text).await?;

    let snapshot = RunState::snapshot(&store, &run_id, redacted_text).await?;
    snapshot.save(state_file)?;

    println!(
        "{{\"run_id\":\"{}\",\"status\":\"{:?}\",\"downstream_key\":{},\"attachments_succeeded\":{}}}",
        outcome.run_id.0,
        outcome.status,
        outcome.downstream_key.as_ref().map(|k| format!("\"{k}\"")).unwrap_or_else(|| "null".to_string()),
        outcome.attachments.iter().filter(|a| a.succeeded).count(),
    );
    Ok(())
}

/// Picks the downstream clients: `FixtureIssueTracker`/`FixtureNotifier`
/// by default (so `approve` is runnable offline), or the HTTP-backed
/// `JiraIssueTracker`/`SlackNotifier` under `--live`. The Jira API token
/// is read from the tenant's encrypted `api_token_ciphertext` when one is
/// configured (via `escalatesafe_vault`), falling back to `JIRA_API_TOKEN`
/// for a tenant that hasn't onboarded credentials through the vault yet.
fn build_orchestrator(
    repo_root: &Path,
    audit_log: &Path,
    store: &Arc<InMemoryRunStore>,
    tracker_config: &IssueTrackerConfig,
    live: bool,
) -> Result<ExportOrchestrator, CliError> {
    let audit = Arc::new(std::sync::Mutex::new(AuditAppender::open(audit_log)?));
    let audit_sink = move |event: AuditEvent| {
        if let Ok(mut a) = audit.lock() {
            let _ = a.append(event);
        }
    };

    let blobs: Arc<dyn BlobStore> = Arc::new(LocalBlobStore);

    if live {
        let base_url = std::env::var("JIRA_BASE_URL").unwrap_or_default();
        let api_token = match &tracker_config.api_token_ciphertext {
            Some(ciphertext) => {
                let vault = Vault::from_env(true)?;
                vault.decrypt(ciphertext)?
            }
            None => std::env::var("JIRA_API_TOKEN").unwrap_or_default(),
        };
        let tracker: Arc<dyn IssueTracker> = Arc::new(JiraIssueTracker::new(base_url, api_token));
        let notifier: Option<Arc<dyn Notifier>> = std::env::var("SLACK_WEBHOOK_URL")
            .ok()
            .map(|url| Arc::new(SlackNotifier::new(url)) as Arc<dyn Notifier>);
        Ok(ExportOrchestrator::new(store.clone(), tracker, notifier, blobs, audit_sink))
    } else {
        let tracker: Arc<dyn IssueTracker> = Arc::new(FixtureIssueTracker::new(repo_root.join("runtime/artifacts/exports")));
        let notifier: Option<Arc<dyn Notifier>> = Some(Arc::new(FixtureNotifier));
        Ok(ExportOrchestrator::new(store.clone(), tracker, notifier, blobs, audit_sink))
    }
}

async fn cancel_cmd(state_file: &Path, audit_log: &Path) -> Result<(), CliError> {
    let state = RunState::load(state_file)?;
    let (store, run_id, redacted_text) = state.into_store().await?;

    let run = store.transition_run(&run_id, RunStatus::Cancelled, |_| {}).await?;

    let mut audit = AuditAppender::open(audit_log)?;
    audit.append(AuditEvent::RunCancelled(RunCancelled {
        schema_version: 1,
        tenant_id: run.tenant_id.clone(),
        run_id: run.id,
        ts: now_unix(),
    }))?;

    let snapshot = RunState::snapshot(&store, &run_id, redacted_text).await?;
    snapshot.save(state_file)?;

    println!("{{\"run_id\":\"{}\",\"status\":\"{:?}\"}}", run.id.0, run.status);
    Ok(())
}

/// Reads sanitized asset bytes back from the local filesystem path
/// `create-run` wrote as the asset's `storage_ref`. Production wiring
/// would point this at object storage (§1 non-goals) — this CLI only
/// exercises the abstract contract against local files.
struct LocalBlobStore;

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, std::io::Error> {
        fs::read(key)
    }
}

/// Records issues/attachments as local JSON files instead of calling a
/// real downstream — the CLI's default so `approve` is runnable without
/// credentials. Keys are deterministic per run so repeated attachment
/// calls land on the same file.
struct FixtureIssueTracker {
    dir: PathBuf,
}

impl FixtureIssueTracker {
    fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

#[async_trait]
impl IssueTracker for FixtureIssueTracker {
    async fn create_issue(&self, issue: &NewIssue) -> Result<CreatedIssue, DownstreamError> {
        fs::create_dir_all(&self.dir).map_err(|e| DownstreamError::new(DownstreamErrorCategory::Server, e.to_string()))?;
        let key = format!("{}-{}", issue.project_key, &Uuid::new_v4().to_string()[..8]);
        let path = self.dir.join(format!("{key}.json"));
        fs::write(&path, serde_json::to_vec_pretty(issue).unwrap_or_default())
            .map_err(|e| DownstreamError::new(DownstreamErrorCategory::Server, e.to_string()))?;
        Ok(CreatedIssue { id: key.clone(), url: format!("file://{}", path.display()), key })
    }

    async fn attach(&self, issue_key: &str, filename: &str, bytes: &[u8]) -> Result<AttachmentResult, DownstreamError> {
        let path = self.dir.join(format!("{issue_key}.{filename}"));
        fs::write(&path, bytes).map_err(|e| DownstreamError::new(DownstreamErrorCategory::Server, e.to_string()))?;
        Ok(AttachmentResult { id: filename.to_string(), size: bytes.len() as u64 })
    }
}

struct FixtureNotifier;

#[async_trait]
impl Notifier for FixtureNotifier {
    async fn post(&self, _text: &str, _blocks: Option<serde_json::Value>) -> Result<String, DownstreamError> {
        Ok("fixture-notify".to_string())
    }
}

/// Grounded on `original_source/api/services/integrations/jira.py`'s
/// `create_issue`/`upload_attachment` — bearer-token REST calls against
/// `{base_url}/rest/api/2/issue{,/{key}/attachments}`, same `reqwest`
/// client idiom as the teacher's `OpenAICompatProvider`. Status-code
/// mapping mirrors `jira.py::retry_with_backoff`'s no-retry set
/// (401/403/404), reclassified here into `DownstreamErrorCategory`.
struct JiraIssueTracker {
    client: reqwest::Client,
    base_url: String,
    api_token: String,
}

impl JiraIssueTracker {
    fn new(base_url: String, api_token: String) -> Self {
        Self { client: reqwest::Client::new(), base_url, api_token }
    }

    fn category_for(status: reqwest::StatusCode) -> DownstreamErrorCategory {
        match status.as_u16() {
            401 | 403 => DownstreamErrorCategory::Auth,
            404 => DownstreamErrorCategory::NotFound,
            429 => DownstreamErrorCategory::RateLimited,
            500..=599 => DownstreamErrorCategory::Server,
            _ => DownstreamErrorCategory::Server,
        }
    }
}

#[async_trait]
impl IssueTracker for JiraIssueTracker {
    async fn create_issue(&self, issue: &NewIssue) -> Result<CreatedIssue, DownstreamError> {
        let url = format!("{}/rest/api/2/issue", self.base_url);
        let body = serde_json::json!({
            "fields": {
                "project": { "key": issue.project_key },
                "summary": issue.summary,
                "description": issue.description,
                "issuetype": { "name": issue.issue_type },
                "labels": issue.labels,
                "components": issue.components.iter().map(|c| serde_json::json!({"name": c})).collect::<Vec<_>>(),
            }
        });

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| DownstreamError::new(DownstreamErrorCategory::Network, e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(DownstreamError::new(Self::category_for(status), format!("create_issue failed: {status}")));
        }

        let parsed: serde_json::Value =
            resp.json().await.map_err(|e| DownstreamError::new(DownstreamErrorCategory::Server, e.to_string()))?;
        let key = parsed.get("key").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let id = parsed.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        Ok(CreatedIssue { url: format!("{}/browse/{}", self.base_url, key), key, id })
    }

    async fn attach(&self, issue_key: &str, filename: &str, bytes: &[u8]) -> Result<AttachmentResult, DownstreamError> {
        let url = format!("{}/rest/api/2/issue/{}/attachments", self.base_url, issue_key);
        let part = reqwest::multipart::Part::bytes(bytes.to_vec()).file_name(filename.to_string());
        let form = reqwest::multipart::Form::new().part("file", part);

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_token)
            .header("X-Atlassian-Token", "no-check")
            .multipart(form)
            .send()
            .await
            .map_err(|e| DownstreamError::new(DownstreamErrorCategory::Network, e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(DownstreamError::new(Self::category_for(status), format!("attach failed: {status}")));
        }
        Ok(AttachmentResult { id: filename.to_string(), size: bytes.len() as u64 })
    }
}

/// Grounded on `original_source/api/services/integrations/slack.py`'s
/// `post_message` — a bare `POST {json: payload}` against an incoming
/// webhook URL, no auth header.
struct SlackNotifier {
    client: reqwest::Client,
    webhook_url: String,
}

impl SlackNotifier {
    fn new(webhook_url: String) -> Self {
        Self { client: reqwest::Client::new(), webhook_url }
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn post(&self, text: &str, blocks: Option<serde_json::Value>) -> Result<String, DownstreamError> {
        let mut payload = serde_json::json!({ "text": text });
        if let Some(blocks) = blocks {
            payload["blocks"] = blocks;
        }
        let resp = self
            .client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| DownstreamError::new(DownstreamErrorCategory::Network, e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(DownstreamError::new(JiraIssueTracker::category_for(status), format!("notify failed: {status}")));
        }
        Ok("ok".to_string())
    }
}
