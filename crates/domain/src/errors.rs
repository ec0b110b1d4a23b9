use crate::state_machine::IllegalTransition;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("tenant not found: {0:?}")]
    TenantNotFound(crate::model::TenantId),
    #[error("run not found: {0:?}")]
    RunNotFound(crate::model::RunId),
    #[error("asset not found: {0:?}")]
    AssetNotFound(crate::model::AssetId),
    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransition),
    #[error("internal notes requested but not allowed for this tenant")]
    InternalNotesNotAllowed,
    #[error("run {0:?} is not in a state eligible for this operation")]
    PreconditionFailed(crate::model::RunId),
    #[error("no exportable assets remain for run {0:?}")]
    NoExportableAssets(crate::model::RunId),
    #[error("duplicate tenant user: {0}")]
    DuplicateTenantUser(String),
}
