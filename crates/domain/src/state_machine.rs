//! C6: the Run lifecycle DAG (§4.6). Pure transition-legality checks —
//! the store applies them under its row lock so a transition attempt and
//! its validation never interleave with a concurrent one.

use crate::model::RunStatus;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("illegal transition: {from:?} -> {to:?}")]
pub struct IllegalTransition {
    pub from: RunStatus,
    pub to: RunStatus,
}

/// Returns `Ok(())` if `from -> to` is a legal edge in the DAG, per
/// the diagram in §4.6. Backwards transitions are forbidden except the
/// explicit `cancel` edge from any non-terminal state.
pub fn validate_transition(from: RunStatus, to: RunStatus) -> Result<(), IllegalTransition> {
    use RunStatus::*;

    let legal = match (from, to) {
        (Pending, Processing) => true,
        (Processing, ReadyForReview) => true,
        (Processing, Failed) => true,
        (ReadyForReview, Exporting) => true,
        (ReadyForReview, Failed) => true,
        (Exporting, Exported) => true,
        (Exporting, Failed) => true,
        (_, Cancelled) if !from.is_terminal() => true,
        _ => false,
    };

    if legal {
        Ok(())
    } else {
        Err(IllegalTransition { from, to })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use RunStatus::*;

    #[test]
    fn forward_path_is_legal() {
        assert!(validate_transition(Pending, Processing).is_ok());
        assert!(validate_transition(Processing, ReadyForReview).is_ok());
        assert!(validate_transition(ReadyForReview, Exporting).is_ok());
        assert!(validate_transition(Exporting, Exported).is_ok());
    }

    #[test]
    fn cancel_is_legal_from_any_non_terminal_state() {
        for s in [Pending, Processing, ReadyForReview, Exporting] {
            assert!(validate_transition(s, Cancelled).is_ok(), "{s:?} -> Cancelled should be legal");
        }
    }

    #[test]
    fn cancel_from_terminal_state_is_illegal() {
        for s in [Exported, Failed, Cancelled] {
            assert!(validate_transition(s, Cancelled).is_err(), "{s:?} -> Cancelled should be illegal");
        }
    }

    #[test]
    fn backwards_transitions_are_illegal() {
        assert!(validate_transition(ReadyForReview, Processing).is_err());
        assert!(validate_transition(Exported, Exporting).is_err());
        assert!(validate_transition(Failed, Processing).is_err());
    }

    #[test]
    fn skipping_states_is_illegal() {
        assert!(validate_transition(Pending, ReadyForReview).is_err());
        assert!(validate_transition(Processing, Exporting).is_err());
        assert!(validate_transition(Processing, Exported).is_err());
    }
}
