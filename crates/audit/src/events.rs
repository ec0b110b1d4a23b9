//! Strongly-typed audit events for the redaction/escalation pipeline.
//!
//! Global invariant 5: no meta field here may contain PII. Every variant
//! below carries only ids, counts, kinds, and error categories — never raw
//! ticket text.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetId(pub Uuid);

/// Entity counts keyed by detector kind name, e.g. `{"EMAIL": 2}`.
pub type KindCounts = std::collections::BTreeMap<String, u64>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCreated {
    pub schema_version: u8,
    pub tenant_id: TenantId,
    pub run_id: RunId,
    pub ticket_id: String,
    pub ts: f64,
    pub options_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRejected {
    pub schema_version: u8,
    pub tenant_id: TenantId,
    pub ticket_id: String,
    pub ts: f64,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedactionCompleted {
    pub schema_version: u8,
    pub tenant_id: TenantId,
    pub run_id: RunId,
    pub ts: f64,
    pub counts_by_kind: KindCounts,
    pub low_confidence_count: u64,
    pub run_hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    RedactedText,
    RedactedImage,
    RedactedPdf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetCompleted {
    pub schema_version: u8,
    pub tenant_id: TenantId,
    pub run_id: RunId,
    pub asset_id: AssetId,
    pub ts: f64,
    pub asset_kind: AssetKind,
    pub checksum: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetBlocked {
    pub schema_version: u8,
    pub tenant_id: TenantId,
    pub run_id: RunId,
    pub asset_id: AssetId,
    pub ts: f64,
    pub asset_kind: AssetKind,
    pub residual_kind_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetFailed {
    pub schema_version: u8,
    pub tenant_id: TenantId,
    pub run_id: RunId,
    pub asset_id: AssetId,
    pub ts: f64,
    pub asset_kind: AssetKind,
    pub error_code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReadyForReview {
    pub schema_version: u8,
    pub tenant_id: TenantId,
    pub run_id: RunId,
    pub ts: f64,
    pub blocked_asset_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunFailed {
    pub schema_version: u8,
    pub tenant_id: TenantId,
    pub run_id: RunId,
    pub ts: f64,
    pub error_code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCancelled {
    pub schema_version: u8,
    pub tenant_id: TenantId,
    pub run_id: RunId,
    pub ts: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OauthTokenRefreshed {
    pub schema_version: u8,
    pub tenant_id: TenantId,
    pub ts: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshFailureCategory {
    InvalidGrant,
    Transient,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OauthRefreshFailed {
    pub schema_version: u8,
    pub tenant_id: TenantId,
    pub ts: f64,
    pub category: RefreshFailureCategory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OauthRevoked {
    pub schema_version: u8,
    pub tenant_id: TenantId,
    pub ts: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportStarted {
    pub schema_version: u8,
    pub tenant_id: TenantId,
    pub run_id: RunId,
    pub ts: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportSucceeded {
    pub schema_version: u8,
    pub tenant_id: TenantId,
    pub run_id: RunId,
    pub ts: f64,
    pub downstream_issue_key: String,
    pub attempt_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportFailed {
    pub schema_version: u8,
    pub tenant_id: TenantId,
    pub run_id: RunId,
    pub ts: f64,
    pub error_code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachFailed {
    pub schema_version: u8,
    pub tenant_id: TenantId,
    pub run_id: RunId,
    pub asset_id: AssetId,
    pub ts: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyFailed {
    pub schema_version: u8,
    pub tenant_id: TenantId,
    pub run_id: RunId,
    pub ts: f64,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum AuditEvent {
    RunCreated(RunCreated),
    RunRejected(RunRejected),
    RedactionCompleted(RedactionCompleted),
    AssetCompleted(AssetCompleted),
    AssetBlocked(AssetBlocked),
    AssetFailed(AssetFailed),
    RunReadyForReview(RunReadyForReview),
    RunFailed(RunFailed),
    RunCancelled(RunCancelled),
    OauthTokenRefreshed(OauthTokenRefreshed),
    OauthRefreshFailed(OauthRefreshFailed),
    OauthRevoked(OauthRevoked),
    ExportStarted(ExportStarted),
    ExportSucceeded(ExportSucceeded),
    ExportFailed(ExportFailed),
    AttachFailed(AttachFailed),
    NotifyFailed(NotifyFailed),
}
