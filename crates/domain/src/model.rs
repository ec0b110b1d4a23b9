//! Data model: Tenant, TenantConfig, Run, RunAsset, Export.
//!
//! Field-for-field grounded on `original_source/api/db/models.py`, with
//! SQLAlchemy relationships replaced by unidirectional foreign keys (§9
//! design note: no bidirectional in-memory pointers).

pub use escalatesafe_audit::{AssetId, AssetKind, RunId, TenantId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

pub fn now_unix() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallState {
    Pending,
    Active,
    Suspended,
}

/// A tenant's OAuth token material. Values held here are expected to be
/// ciphertext produced by `escalatesafe_vault` once persisted outside this
/// in-memory store; the store itself is agnostic to that encoding.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OauthState {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    /// Unix seconds.
    pub expiry: Option<f64>,
    pub scopes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub subdomain: String,
    /// The upstream's own installation identifier; distinct from `subdomain`.
    pub install_ref: Option<String>,
    pub install_state: InstallState,
    pub oauth: OauthState,
    pub created_at: f64,
}

impl Tenant {
    pub fn new(id: TenantId, subdomain: impl Into<String>) -> Self {
        Self {
            id,
            subdomain: subdomain.into(),
            install_ref: None,
            install_state: InstallState::Pending,
            oauth: OauthState::default(),
            created_at: now_unix(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantUserRole {
    Agent,
    Admin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantUser {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub external_user_id: String,
    pub role: TenantUserRole,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedactionPolicyConfig {
    pub confidence_threshold: f64,
    pub warn_threshold: f64,
    pub enable_national_ids: bool,
    pub allow_internal_notes: bool,
}

impl Default for RedactionPolicyConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            warn_threshold: 0.7,
            enable_national_ids: false,
            allow_internal_notes: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IssueTrackerConfig {
    pub project_key: Option<String>,
    pub issue_type: Option<String>,
    pub priority: Option<String>,
    pub labels: Vec<String>,
    pub components: Vec<String>,
    /// Ciphertext; decrypted at the export boundary only.
    pub api_token_ciphertext: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifierConfig {
    pub webhook_url: Option<String>,
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TenantConfig {
    pub tenant_id: TenantId,
    pub redaction_policy: RedactionPolicyConfig,
    pub issue_tracker_config: IssueTrackerConfig,
    pub notifier_config: NotifierConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Processing,
    ReadyForReview,
    Exporting,
    Exported,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Exported | RunStatus::Failed | RunStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOptions {
    #[serde(default)]
    pub include_internal_notes: bool,
    #[serde(default)]
    pub last_n_public_comments: Option<u32>,
    #[serde(default = "default_true")]
    pub dedupe_against_description: bool,
}

fn default_true() -> bool {
    true
}

impl Default for RunOptions {
    fn default() -> Self {
        Self { include_internal_notes: false, last_n_public_comments: None, dedupe_against_description: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedactionReport {
    pub counts_by_kind: BTreeMap<String, u64>,
    pub low_confidence_count: u64,
    pub total_redactions: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub tenant_id: TenantId,
    pub ticket_id: String,
    pub status: RunStatus,
    pub options: RunOptions,
    pub run_hash: Option<String>,
    pub redaction_report: Option<RedactionReport>,
    /// Modeled per §9/§3 supplement; never populated by this workspace
    /// (the LLM report formatter is out of scope).
    pub llm_pack: Option<serde_json::Value>,
    pub created_by: Option<Uuid>,
    pub approved_by: Option<Uuid>,
    pub created_at: f64,
    pub updated_at: f64,
}

impl Run {
    pub fn new(id: RunId, tenant_id: TenantId, ticket_id: impl Into<String>, options: RunOptions) -> Self {
        let ts = now_unix();
        Self {
            id,
            tenant_id,
            ticket_id: ticket_id.into(),
            status: RunStatus::Pending,
            options,
            run_hash: None,
            redaction_report: None,
            llm_pack: None,
            created_by: None,
            approved_by: None,
            created_at: ts,
            updated_at: ts,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Blocked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunAsset {
    pub id: AssetId,
    pub run_id: RunId,
    pub kind: AssetKind,
    pub status: AssetStatus,
    pub filename: String,
    pub mime: Option<String>,
    pub storage_ref: Option<String>,
    pub checksum: Option<String>,
    pub meta: serde_json::Value,
    pub created_at: f64,
}

impl RunAsset {
    pub fn new(id: AssetId, run_id: RunId, kind: AssetKind, filename: impl Into<String>, mime: Option<String>) -> Self {
        Self {
            id,
            run_id,
            kind,
            status: AssetStatus::Pending,
            filename: filename.into(),
            mime,
            storage_ref: None,
            checksum: None,
            meta: serde_json::Value::Null,
            created_at: now_unix(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportStatus {
    Pending,
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Export {
    pub id: Uuid,
    pub run_id: RunId,
    pub downstream_issue_key: Option<String>,
    pub downstream_issue_url: Option<String>,
    pub notifier_ref: Option<String>,
    pub status: ExportStatus,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub created_at: f64,
    pub updated_at: f64,
}

impl Export {
    pub fn new(run_id: RunId) -> Self {
        let ts = now_unix();
        Self {
            id: Uuid::new_v4(),
            run_id,
            downstream_issue_key: None,
            downstream_issue_url: None,
            notifier_ref: None,
            status: ExportStatus::Pending,
            error_code: None,
            error_message: None,
            created_at: ts,
            updated_at: ts,
        }
    }
}
