//! escalatesafe_redactor
//!
//! C2: deterministic placeholder substitution over detector spans, producing
//! a redacted text buffer, a lossless diff transcript for UI preview, and
//! counts by entity kind. Replacement is purely positional — this crate
//! never sees a policy's upstream detection logic, only the span list.

use escalatesafe_detector::{EntityKind, Span};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-tenant placeholder table. Fixed across a run once resolved.
#[derive(Debug, Clone)]
pub struct TokenPolicy {
    templates: BTreeMap<&'static str, String>,
}

impl Default for TokenPolicy {
    fn default() -> Self {
        let mut templates = BTreeMap::new();
        templates.insert(EntityKind::Email.as_str(), "[EMAIL_REDACTED]".to_string());
        templates.insert(EntityKind::Phone.as_str(), "[PHONE_REDACTED]".to_string());
        templates.insert(EntityKind::CreditCard.as_str(), "[CREDIT_CARD_REDACTED]".to_string());
        templates.insert(EntityKind::Person.as_str(), "[NAME_REDACTED]".to_string());
        templates.insert(EntityKind::Location.as_str(), "[LOCATION_REDACTED]".to_string());
        templates.insert(EntityKind::ApiKey.as_str(), "[API_KEY_REDACTED]".to_string());
        templates.insert(EntityKind::NationalIdA.as_str(), "[PAN_REDACTED]".to_string());
        templates.insert(EntityKind::NationalIdB.as_str(), "[GSTIN_REDACTED]".to_string());
        Self { templates }
    }
}

impl TokenPolicy {
    pub fn with_override(mut self, kind: EntityKind, template: impl Into<String>) -> Self {
        self.templates.insert(kind.as_str(), template.into());
        self
    }

    pub fn template_for(&self, kind: EntityKind) -> String {
        self.templates
            .get(kind.as_str())
            .cloned()
            .unwrap_or_else(|| format!("[{}_REDACTED]", kind.as_str()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentType {
    Unchanged,
    Redacted,
}

/// One entry in the lossless diff transcript. `redacted` segments never
/// carry the source substring — only the placeholder — per global
/// invariant 5.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffSegment {
    pub kind: Option<EntityKind>,
    #[serde(rename = "type")]
    pub segment_type: SegmentType,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedactionResult {
    pub redacted_text: String,
    pub diff_segments: Vec<DiffSegment>,
    pub counts_by_kind: BTreeMap<String, u64>,
}

/// Replace `spans` in `text` with `policy`'s placeholders. Spans must
/// already be non-overlapping and sorted by `start` (the detector's
/// contract) — this function does not re-sort or merge them.
pub fn redact(text: &str, spans: &[Span], policy: &TokenPolicy) -> RedactionResult {
    let mut redacted_text = String::with_capacity(text.len());
    let mut diff_segments = Vec::new();
    let mut counts_by_kind: BTreeMap<String, u64> = BTreeMap::new();
    let mut cursor = 0usize;

    for span in spans {
        if span.start > cursor {
            let unchanged = &text[cursor..span.start];
            redacted_text.push_str(unchanged);
            diff_segments.push(DiffSegment {
                kind: None,
                segment_type: SegmentType::Unchanged,
                text: unchanged.to_string(),
            });
        }

        let placeholder = policy.template_for(span.kind);
        redacted_text.push_str(&placeholder);
        diff_segments.push(DiffSegment {
            kind: Some(span.kind),
            segment_type: SegmentType::Redacted,
            text: placeholder,
        });
        *counts_by_kind.entry(span.kind.as_str().to_string()).or_insert(0) += 1;

        cursor = span.end;
    }

    if cursor < text.len() {
        let unchanged = &text[cursor..];
        redacted_text.push_str(unchanged);
        diff_segments.push(DiffSegment {
            kind: None,
            segment_type: SegmentType::Unchanged,
            text: unchanged.to_string(),
        });
    }

    RedactionResult { redacted_text, diff_segments, counts_by_kind }
}

/// Concatenation of every diff segment's `text`, in order. Must equal
/// `redacted_text` (invariant 1, §8).
pub fn reassemble(diff_segments: &[DiffSegment]) -> String {
    diff_segments.iter().map(|s| s.text.as_str()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use escalatesafe_detector::{Detector, RedactionPolicy};

    #[test]
    fn diff_segments_reassemble_to_redacted_text() {
        let detector = Detector::new(RedactionPolicy::default());
        let text = "Contact John Doe at john.doe@example.com, phone +1-555-123-4567, card 4532-1234-5678-9012, bearer eyJabc.eyJdef.sigXYZ";
        let analysis = detector.analyze(text);
        let result = redact(text, &analysis.spans, &TokenPolicy::default());

        assert_eq!(reassemble(&result.diff_segments), result.redacted_text);
        assert!(result.redacted_text.contains("[EMAIL_REDACTED]"));
        assert!(result.redacted_text.contains("[PHONE_REDACTED]"));
        assert!(result.redacted_text.contains("[CREDIT_CARD_REDACTED]"));
        assert!(result.redacted_text.contains("[API_KEY_REDACTED]"));
        assert!(!result.redacted_text.contains("john.doe@example.com"));
        assert!(!result.redacted_text.contains("4532-1234-5678-9012"));
    }

    #[test]
    fn is_deterministic_and_idempotent() {
        let detector = Detector::new(RedactionPolicy::default());
        let text = "reach me at jane@example.com or 555-123-4567";
        let analysis = detector.analyze(text);
        let policy = TokenPolicy::default();

        let r1 = redact(text, &analysis.spans, &policy);
        let r2 = redact(text, &analysis.spans, &policy);
        assert_eq!(r1.redacted_text, r2.redacted_text);

        // redact(redact(t)) == redact(t): re-running the detector over the
        // already-redacted text finds no further spans to replace, so a
        // second redaction pass is a no-op.
        let second_pass_analysis = detector.analyze(&r1.redacted_text);
        let r3 = redact(&r1.redacted_text, &second_pass_analysis.spans, &policy);
        assert_eq!(r3.redacted_text, r1.redacted_text);
    }

    #[test]
    fn no_spans_yields_single_unchanged_segment() {
        let text = "nothing sensitive here";
        let result = redact(text, &[], &TokenPolicy::default());
        assert_eq!(result.redacted_text, text);
        assert_eq!(result.diff_segments.len(), 1);
        assert_eq!(result.diff_segments[0].segment_type, SegmentType::Unchanged);
    }

    #[test]
    fn custom_template_override_is_applied() {
        let policy = TokenPolicy::default().with_override(EntityKind::Email, "<<EMAIL>>");
        let span = Span { kind: EntityKind::Email, start: 0, end: 5, score: 0.9 };
        let result = redact("a@b.c rest", &[span], &policy);
        assert!(result.redacted_text.starts_with("<<EMAIL>>"));
    }

    #[test]
    fn counts_by_kind_match_span_count() {
        let detector = Detector::new(RedactionPolicy::default());
        let text = "a@b.com and c@d.com";
        let analysis = detector.analyze(text);
        let result = redact(text, &analysis.spans, &TokenPolicy::default());
        assert_eq!(result.counts_by_kind.get("EMAIL").copied(), Some(2));
    }
}
