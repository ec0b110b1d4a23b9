//! escalatesafe_export
//!
//! C8: the export orchestrator. Turns a `ready_for_review` Run into a
//! downstream issue exactly once, then best-effort attaches sanitized
//! assets and posts a fire-and-forget notifier message.
//!
//! Grounded on `original_source/api/routes/runs.py::approve_and_export`
//! (idempotency-by-existing-key check, description template, Slack
//! fire-and-forget, failure categorization) and
//! `original_source/api/services/integrations/jira.py::retry_with_backoff`
//! for the exponential-backoff shape — reimplemented against
//! `escalatesafe_domain::RunStore::commit_export_once` so the idempotency
//! guarantee (§4.6, invariant 4) is enforced by the store's single-writer
//! commit rather than by a pre-check race.

use async_trait::async_trait;
use escalatesafe_audit::{
    AssetId, AttachFailed, AuditEvent, ExportFailed, ExportStarted, ExportSucceeded, NotifyFailed, RunId, TenantId,
};
use escalatesafe_domain::{
    now_unix, AssetStatus, Export, ExportStatus, IssueTrackerConfig, NotifierConfig, RedactionReport, Run, RunAsset,
    RunStatus, RunStore,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const MAX_ATTEMPTS: u32 = 5;
const BASE_DELAY_MS: u64 = 1000;
const SUMMARY_MAX_LEN: usize = 120;

/// §7 taxonomy subcodes for `DOWNSTREAM_API_ERROR`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownstreamErrorCategory {
    Auth,
    NotFound,
    RateLimited,
    Server,
    Network,
}

impl DownstreamErrorCategory {
    /// §4.8 step 3: retry only on transient categories.
    pub fn is_retryable(self) -> bool {
        matches!(self, DownstreamErrorCategory::Network | DownstreamErrorCategory::Server | DownstreamErrorCategory::RateLimited)
    }

    pub fn as_code(self) -> &'static str {
        match self {
            DownstreamErrorCategory::Auth => "AUTH",
            DownstreamErrorCategory::NotFound => "NOT_FOUND",
            DownstreamErrorCategory::RateLimited => "RATE_LIMITED",
            DownstreamErrorCategory::Server => "SERVER",
            DownstreamErrorCategory::Network => "NETWORK",
        }
    }
}

#[derive(Debug, Error)]
#[error("DOWNSTREAM_API_ERROR[{category:?}]: {message}")]
pub struct DownstreamError {
    pub category: DownstreamErrorCategory,
    pub message: String,
}

impl DownstreamError {
    pub fn new(category: DownstreamErrorCategory, message: impl Into<String>) -> Self {
        Self { category, message: message.into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewIssue {
    pub project_key: String,
    pub summary: String,
    pub description: String,
    pub issue_type: String,
    pub priority: Option<String>,
    pub labels: Vec<String>,
    pub components: Vec<String>,
    #[serde(default)]
    pub custom_fields: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct CreatedIssue {
    pub key: String,
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct AttachmentResult {
    pub id: String,
    pub size: u64,
}

/// §6 downstream (issue tracker) contract.
#[async_trait]
pub trait IssueTracker: Send + Sync {
    async fn create_issue(&self, issue: &NewIssue) -> Result<CreatedIssue, DownstreamError>;
    async fn attach(&self, issue_key: &str, filename: &str, bytes: &[u8]) -> Result<AttachmentResult, DownstreamError>;
}

/// §6 notifier (webhook) contract. Failure here is logged, never
/// propagated to the caller of `approve` (§4.8 step 5).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn post(&self, text: &str, blocks: Option<serde_json::Value>) -> Result<String, DownstreamError>;
}

/// §6 blob store contract. The core issues get requests against this
/// abstraction; it never moves bytes itself (§1 non-goals).
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Vec<u8>, std::io::Error>;
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error(transparent)]
    Domain(#[from] escalatesafe_domain::DomainError),
    #[error("run {0:?} is not ready for review")]
    NotReadyForReview(RunId),
    #[error("no exportable assets remain for run {0:?}")]
    NoExportableAssets(RunId),
    #[error(transparent)]
    Downstream(#[from] DownstreamError),
}

#[derive(Debug, Clone)]
pub struct AttachmentOutcome {
    pub asset_id: AssetId,
    pub filename: String,
    pub succeeded: bool,
}

#[derive(Debug, Clone)]
pub struct ApproveOutcome {
    pub run_id: RunId,
    pub status: RunStatus,
    pub downstream_key: Option<String>,
    pub downstream_url: Option<String>,
    pub attachments: Vec<AttachmentOutcome>,
}

pub struct ExportOrchestrator {
    store: Arc<dyn RunStore>,
    tracker: Arc<dyn IssueTracker>,
    notifier: Option<Arc<dyn Notifier>>,
    blobs: Arc<dyn BlobStore>,
    audit: Arc<std::sync::Mutex<dyn FnMut(AuditEvent) + Send>>,
}

fn truncate_summary(s: &str) -> String {
    if s.chars().count() <= SUMMARY_MAX_LEN {
        s.to_string()
    } else {
        s.chars().take(SUMMARY_MAX_LEN).collect()
    }
}

/// Grounded on `runs.py::approve_and_export`'s description template; the
/// body here carries only already-sanitized text plus aggregate counts
/// (global invariant 5 — no raw ticket content ever reaches an audit
/// field, and by construction the issue description is the sanitized
/// text itself, which is the point of the whole pipeline).
fn build_description(ticket_id: &str, redacted_text: &str, report: &RedactionReport) -> String {
    format!(
        "Escalated from ticket #{ticket_id}\n\n{redacted_text}\n\n---\nThis issue was automatically created with PII redaction.\nTotal PII entities redacted: {total}\n",
        total = report.total_redactions,
    )
}

impl ExportOrchestrator {
    pub fn new(
        store: Arc<dyn RunStore>,
        tracker: Arc<dyn IssueTracker>,
        notifier: Option<Arc<dyn Notifier>>,
        blobs: Arc<dyn BlobStore>,
        audit: impl FnMut(AuditEvent) + Send + 'static,
    ) -> Self {
        Self { store, tracker, notifier, blobs, audit: Arc::new(std::sync::Mutex::new(audit)) }
    }

    fn emit(&self, event: AuditEvent) {
        if let Ok(mut f) = self.audit.lock() {
            f(event);
        }
    }

    /// `approve(run_id, export_options) -> {run_id, status, downstream_key?, downstream_url?}` (§4.8).
    pub async fn approve(
        &self,
        run_id: &RunId,
        tracker_config: &IssueTrackerConfig,
        notifier_config: &NotifierConfig,
        redacted_text: &str,
    ) -> Result<ApproveOutcome, ExportError> {
        let run = self.store.get_run(run_id).await?;

        // §4.6 idempotency: a repeat approval after the run already
        // exported (or is mid-export from a concurrent call this process
        // lost the race on) echoes the existing keyed Export rather than
        // erroring — scenario 2, §8.
        if run.status == RunStatus::Exported || run.status == RunStatus::Exporting {
            if let Some(existing) = self.store.get_export_by_run(run_id).await {
                if existing.downstream_issue_key.is_some() {
                    return Ok(ApproveOutcome {
                        run_id: run_id.clone(),
                        status: RunStatus::Exported,
                        downstream_key: existing.downstream_issue_key,
                        downstream_url: existing.downstream_issue_url,
                        attachments: vec![],
                    });
                }
            }
        }

        if run.status != RunStatus::ReadyForReview {
            return Err(ExportError::NotReadyForReview(run_id.clone()));
        }

        let assets = self.store.list_assets(run_id).await;
        let exportable: Vec<RunAsset> = assets.iter().filter(|a| a.status == AssetStatus::Completed).cloned().collect();
        if assets.iter().any(|a| a.status != AssetStatus::Completed && a.status != AssetStatus::Blocked) {
            return Err(ExportError::NotReadyForReview(run_id.clone()));
        }
        if exportable.is_empty() {
            return Err(ExportError::NoExportableAssets(run_id.clone()));
        }

        let report = run
            .redaction_report
            .clone()
            .ok_or_else(|| ExportError::NotReadyForReview(run_id.clone()))?;

        // §4.8 step 1: advance to `exporting` before anything else, via
        // the store's lock-held transition.
        let run = self
            .store
            .transition_run(run_id, RunStatus::Exporting, |_| {})
            .await?;

        self.emit(AuditEvent::ExportStarted(ExportStarted {
            schema_version: 1,
            tenant_id: tenant_id_from(&run),
            run_id: audit_run_id(run_id),
            ts: now_unix(),
        }));

        let summary = truncate_summary(&format!("Escalated from ticket #{}", run.ticket_id));
        let description = build_description(&run.ticket_id, redacted_text, &report);
        let mut labels = vec!["escalatesafe".to_string()];
        labels.extend(tracker_config.labels.clone());
        let issue = NewIssue {
            project_key: tracker_config.project_key.clone().unwrap_or_else(|| "SUP".to_string()),
            summary,
            description,
            issue_type: tracker_config.issue_type.clone().unwrap_or_else(|| "Bug".to_string()),
            priority: tracker_config.priority.clone(),
            labels,
            components: tracker_config.components.clone(),
            custom_fields: serde_json::Value::Null,
        };

        let tracker = self.tracker.clone();
        let run_id_for_produce = run_id.clone();
        let produce = move || {
            let tracker = tracker.clone();
            let issue = issue.clone();
            async move {
                let result = call_with_backoff(|| {
                    let tracker = tracker.clone();
                    let issue = issue.clone();
                    async move { tracker.create_issue(&issue).await }
                })
                .await;

                // The store only records `exported` transitions for
                // `Success` exports (see `commit_export_once`); a
                // `Failed` export here still needs the row persisted so
                // the caller can inspect it — the run is moved to
                // `failed` by the caller below. Either way this never
                // surfaces as an `Err` to `commit_export_once`: the
                // distinction lives in `Export::status`.
                let export = match result {
                    Ok((created, _attempts)) => {
                        let mut export = Export::new(run_id_for_produce);
                        export.downstream_issue_key = Some(created.key);
                        export.downstream_issue_url = Some(created.url);
                        export.status = ExportStatus::Success;
                        export
                    }
                    Err(e) => {
                        let mut export = Export::new(run_id_for_produce);
                        export.status = ExportStatus::Failed;
                        export.error_code = Some(e.category.as_code().to_string());
                        export.error_message = Some(e.message.clone());
                        export
                    }
                };
                Ok::<Export, escalatesafe_domain::DomainError>(export)
            }
        };

        let export = self.store.commit_export_once(run_id, produce).await?;

        if export.status == ExportStatus::Failed {
            self.store.transition_run(run_id, RunStatus::Failed, |_| {}).await?;
            self.emit(AuditEvent::ExportFailed(ExportFailed {
                schema_version: 1,
                tenant_id: tenant_id_from(&run),
                run_id: audit_run_id(run_id),
                ts: now_unix(),
                error_code: export.error_code.clone().unwrap_or_else(|| "INTERNAL".to_string()),
            }));
            return Ok(ApproveOutcome {
                run_id: run_id.clone(),
                status: RunStatus::Failed,
                downstream_key: None,
                downstream_url: None,
                attachments: vec![],
            });
        }

        let downstream_key = export.downstream_issue_key.clone().unwrap_or_default();

        self.emit(AuditEvent::ExportSucceeded(ExportSucceeded {
            schema_version: 1,
            tenant_id: tenant_id_from(&run),
            run_id: audit_run_id(run_id),
            ts: now_unix(),
            downstream_issue_key: downstream_key.clone(),
            attempt_count: 1,
        }));

        // §4.8 "Asset attachment": independent retry per asset; a failed
        // attachment never reverts the already-durable issue creation.
        let mut attachments = Vec::with_capacity(exportable.len());
        for asset in &exportable {
            let outcome = self.attach_one(&run, &downstream_key, asset).await;
            attachments.push(outcome);
        }

        // §4.8 step 5: fire-and-forget notifier post.
        if let Some(notifier) = &self.notifier {
            if notifier_config.enabled {
                if let Some(webhook) = &notifier_config.webhook_url {
                    let text = format!(
                        "Escalation exported: ticket #{} -> {}",
                        run.ticket_id, downstream_key
                    );
                    let _ = webhook; // URL lives in the notifier impl; kept here for audit context only.
                    match notifier.post(&text, None).await {
                        Ok(_ref) => {}
                        Err(e) => {
                            self.emit(AuditEvent::NotifyFailed(NotifyFailed {
                                schema_version: 1,
                                tenant_id: tenant_id_from(&run),
                                run_id: audit_run_id(run_id),
                                ts: now_unix(),
                                reason: e.category.as_code().to_string(),
                            }));
                        }
                    }
                }
            }
        }

        Ok(ApproveOutcome {
            run_id: run_id.clone(),
            status: RunStatus::Exported,
            downstream_key: Some(downstream_key),
            downstream_url: export.downstream_issue_url.clone(),
            attachments,
        })
    }

    async fn attach_one(&self, run: &Run, issue_key: &str, asset: &RunAsset) -> AttachmentOutcome {
        let Some(storage_ref) = asset.storage_ref.clone() else {
            self.emit_attach_failed(run, asset);
            return AttachmentOutcome { asset_id: audit_asset_id(&asset.id), filename: asset.filename.clone(), succeeded: false };
        };

        let bytes = match self.blobs.get(&storage_ref).await {
            Ok(b) => b,
            Err(_) => {
                self.emit_attach_failed(run, asset);
                return AttachmentOutcome { asset_id: audit_asset_id(&asset.id), filename: asset.filename.clone(), succeeded: false };
            }
        };

        let tracker = self.tracker.clone();
        let issue_key = issue_key.to_string();
        let filename = asset.filename.clone();
        let result = call_with_backoff(move || {
            let tracker = tracker.clone();
            let issue_key = issue_key.clone();
            let filename = filename.clone();
            let bytes = bytes.clone();
            async move { tracker.attach(&issue_key, &filename, &bytes).await }
        })
        .await;

        match result {
            Ok(_) => AttachmentOutcome { asset_id: audit_asset_id(&asset.id), filename: asset.filename.clone(), succeeded: true },
            Err(_) => {
                self.emit_attach_failed(run, asset);
                AttachmentOutcome { asset_id: audit_asset_id(&asset.id), filename: asset.filename.clone(), succeeded: false }
            }
        }
    }

    fn emit_attach_failed(&self, run: &Run, asset: &RunAsset) {
        self.emit(AuditEvent::AttachFailed(AttachFailed {
            schema_version: 1,
            tenant_id: tenant_id_from(run),
            run_id: audit_run_id(&run.id),
            asset_id: audit_asset_id(&asset.id),
            ts: now_unix(),
        }));
    }
}

/// §4.8 step 3: base 1s, factor 2, max 5 attempts, retry only transient
/// categories; never retry on 401/403/404. Returns the successful result
/// and the attempt number it succeeded on, or the last error.
async fn call_with_backoff<F, Fut, T>(mut call: F) -> Result<(T, u32), DownstreamError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, DownstreamError>>,
{
    let mut delay = Duration::from_millis(BASE_DELAY_MS);
    let mut last_err = None;

    for attempt in 1..=MAX_ATTEMPTS {
        match call().await {
            Ok(v) => return Ok((v, attempt)),
            Err(e) => {
                let retryable = e.category.is_retryable();
                last_err = Some(e);
                if !retryable || attempt == MAX_ATTEMPTS {
                    break;
                }
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
    }

    Err(last_err.expect("loop runs at least once"))
}

fn tenant_id_from(run: &Run) -> TenantId {
    run.tenant_id.clone()
}

fn audit_run_id(run_id: &RunId) -> RunId {
    run_id.clone()
}

fn audit_asset_id(asset_id: &AssetId) -> AssetId {
    *asset_id
}
