//! escalatesafe_audit
//!
//! Strongly-typed audit events for the redaction/escalation pipeline, plus
//! a hash-chained append-only JSONL writer and verifier. Every meta field
//! is a count, id, or category — raw ticket text never enters this crate.

mod events;
mod log;

pub use events::*;
pub use log::{compute_record_hash, genesis_hash, verify_log, AuditAppender, AuditLogError, AuditRecord};
