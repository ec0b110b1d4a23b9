//! Leak Verifier (C5). Re-extracts text from a produced artifact and runs
//! the full `Detector` again — the same detection code path used on
//! ingress, so a pipeline cannot shortcut its own output check.
//!
//! Diverges from `original_source/worker/tasks/redact_pdf.py::verify_pdf_redaction`,
//! which does a case-insensitive substring search against the original
//! PII pattern list. Re-running the detector is strictly stronger: it
//! also catches PII the substring list never enumerated (SPEC_FULL §4.5).

use escalatesafe_detector::{Detector, NerEngine, Span};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyOutcome {
    pub passed: bool,
    pub residuals: Vec<Span>,
}

/// `verify(artifact, kind) -> {passed, residuals}` where `artifact` has
/// already been reduced to its re-extracted text by the caller (a second
/// OCR pass for images, the post-redaction text layer for PDFs, or the
/// sanitized text itself for text artifacts).
pub fn verify_text<N: NerEngine>(text: &str, detector: &Detector<N>) -> VerifyOutcome {
    let analysis = detector.analyze(text);
    VerifyOutcome { passed: analysis.spans.is_empty(), residuals: analysis.spans }
}
