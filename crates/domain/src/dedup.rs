//! Comment/description dedup heuristic (§4.6, §9 Open Question).
//!
//! `original_source/api/routes/runs.py::create_run` skips a comment during
//! ingestion if the (lowercased, trimmed) ticket description is longer
//! than 50 characters and appears as a substring of the comment. This is
//! not obviously correct for long, substantially different comments that
//! happen to embed the description — kept here as an explicit,
//! independently testable, disableable step rather than inlined into
//! ingestion (§9 decision: implement as described, documenting the
//! limitation).

/// Returns `true` if `comment` should be skipped as a near-duplicate of
/// `description`.
pub fn dedupe_against_description(description: &str, comment: &str) -> bool {
    let description_normalized = description.trim().to_lowercase();
    let comment_normalized = comment.trim().to_lowercase();

    if comment_normalized.is_empty() || comment_normalized == description_normalized {
        return comment_normalized == description_normalized && !comment_normalized.is_empty();
    }

    description_normalized.len() > 50 && comment_normalized.contains(&description_normalized)
}
