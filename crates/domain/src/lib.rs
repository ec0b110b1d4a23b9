//! escalatesafe_domain
//!
//! The data model (Tenant, TenantConfig, Run, RunAsset, Export) and the
//! Run state machine (C6), including the internal-notes gate and the
//! comment/description dedup heuristic. Persistence is a `RunStore` trait
//! with an in-memory implementation — DB wiring is out of scope (§1).

pub mod dedup;
pub mod errors;
pub mod model;
pub mod state_machine;
pub mod store;

pub use errors::DomainError;
pub use model::*;
pub use store::{InMemoryRunStore, RunStore};

/// Validates `options.include_internal_notes` against tenant policy
/// before a Run is created (§4.6). Grounded on
/// `original_source/api/routes/runs.py::create_run`'s opt-in check — a
/// rejection here must not create a Run row (scenario 6, §8).
pub fn check_internal_notes_gate(
    options: &RunOptions,
    policy: &RedactionPolicyConfig,
) -> Result<(), DomainError> {
    if options.include_internal_notes && !policy.allow_internal_notes {
        return Err(DomainError::InternalNotesNotAllowed);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_notes_gate_rejects_when_not_allowed() {
        let mut options = RunOptions::default();
        options.include_internal_notes = true;
        let policy = RedactionPolicyConfig { allow_internal_notes: false, ..Default::default() };
        assert!(matches!(
            check_internal_notes_gate(&options, &policy),
            Err(DomainError::InternalNotesNotAllowed)
        ));
    }

    #[test]
    fn internal_notes_gate_allows_when_enabled() {
        let mut options = RunOptions::default();
        options.include_internal_notes = true;
        let policy = RedactionPolicyConfig { allow_internal_notes: true, ..Default::default() };
        assert!(check_internal_notes_gate(&options, &policy).is_ok());
    }

    #[test]
    fn internal_notes_gate_is_moot_when_not_requested() {
        let options = RunOptions::default();
        let policy = RedactionPolicyConfig { allow_internal_notes: false, ..Default::default() };
        assert!(check_internal_notes_gate(&options, &policy).is_ok());
    }
}
