//! escalatesafe_detector
//!
//! C1: produces typed spans over a text buffer. Two detection layers are
//! composed deterministically — a regex pattern bank (email, phone, credit
//! card, API-key class, optional national IDs) and a heuristic NER layer
//! for PERSON/LOCATION — then merged by score with earlier-registered-kind
//! tie-breaking, thresholded, and returned sorted by start.
//!
//! Pattern bank and scores are ported from the source service's Presidio
//! recognizers (bearer/JWT/api-key, credit card, phone, PAN/GSTIN).

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityKind {
    Email,
    Phone,
    CreditCard,
    Person,
    Location,
    ApiKey,
    NationalIdA,
    NationalIdB,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Email => "EMAIL",
            EntityKind::Phone => "PHONE",
            EntityKind::CreditCard => "CREDIT_CARD",
            EntityKind::Person => "PERSON",
            EntityKind::Location => "LOCATION",
            EntityKind::ApiKey => "API_KEY",
            EntityKind::NationalIdA => "NATIONAL_ID_A",
            EntityKind::NationalIdB => "NATIONAL_ID_B",
        }
    }

    /// Lower registration order wins merge ties. Mirrors the order the
    /// source registers its recognizers: API key patterns first, then
    /// credit card, then phone, then the NER-derived kinds.
    fn registration_order(&self) -> u8 {
        match self {
            EntityKind::ApiKey => 0,
            EntityKind::CreditCard => 1,
            EntityKind::Phone => 2,
            EntityKind::Email => 3,
            EntityKind::Person => 4,
            EntityKind::Location => 5,
            EntityKind::NationalIdA => 6,
            EntityKind::NationalIdB => 7,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub kind: EntityKind,
    pub start: usize,
    pub end: usize,
    pub score: f64,
}

impl Span {
    fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[derive(Debug, Clone)]
pub struct RedactionPolicy {
    pub confidence_threshold: f64,
    pub warn_threshold: f64,
    pub enable_national_ids: bool,
}

impl Default for RedactionPolicy {
    fn default() -> Self {
        Self { confidence_threshold: 0.5, warn_threshold: 0.7, enable_national_ids: false }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub spans: Vec<Span>,
    pub low_confidence: Vec<Span>,
    /// Set when the NER layer failed; pattern-bank spans are still present.
    pub ner_warning: Option<String>,
}

/// A compiled pattern with its base confidence score.
struct Pattern {
    kind: EntityKind,
    regex: Regex,
    score: f64,
}

fn pattern_bank() -> &'static Vec<Pattern> {
    static BANK: OnceLock<Vec<Pattern>> = OnceLock::new();
    BANK.get_or_init(|| {
        let p = |kind: EntityKind, re: &str, score: f64| Pattern {
            kind,
            regex: Regex::new(re).expect("pattern bank regex must compile"),
            score,
        };
        vec![
            // --- API_KEY class, ported from APIKeyRecognizer ---
            p(EntityKind::ApiKey, r"(?i)\bbearer\s+[A-Za-z0-9\-._~+/]+=*", 0.9),
            p(
                EntityKind::ApiKey,
                r"\beyJ[A-Za-z0-9\-._~+/]+=*\.eyJ[A-Za-z0-9\-._~+/]+=*\.[A-Za-z0-9\-._~+/]+=*\b",
                0.95,
            ),
            p(
                EntityKind::ApiKey,
                r#"(?i)(api[_-]?key|apikey|api[_-]?token)\s*[=:]\s*['"]?[A-Za-z0-9\-._~+/]{20,}['"]?"#,
                0.85,
            ),
            p(
                EntityKind::ApiKey,
                r"(?i)(authorization|x-api-key)\s*:\s*[A-Za-z0-9\-._~+/]{20,}",
                0.85,
            ),
            p(EntityKind::ApiKey, r"\b[A-Za-z0-9]{40,}\b", 0.6),
            p(EntityKind::ApiKey, r"\b[a-fA-F0-9]{32,}\b", 0.65),
            // --- CREDIT_CARD, ported from CreditCardRecognizer ---
            p(EntityKind::CreditCard, r"\b\d{4}-\d{4}-\d{4}-\d{4}\b", 0.85),
            p(EntityKind::CreditCard, r"\b\d{4}\s\d{4}\s\d{4}\s\d{4}\b", 0.85),
            p(
                EntityKind::CreditCard,
                r"(?i)(?:ending\s+in|last\s+\d+\s+digits?[:\s]+)(\d{4}(?:-\d{4})?)",
                0.9,
            ),
            // --- PHONE_NUMBER, ported from PhoneNumberRecognizer ---
            p(EntityKind::Phone, r"\+1-\d{3}-\d{3}-\d{4}\b", 0.9),
            p(EntityKind::Phone, r"\(\d{3}\)\s*\d{3}-\d{4}\b", 0.9),
            p(EntityKind::Phone, r"\b\d{3}\.\d{3}\.\d{4}\b", 0.85),
            p(EntityKind::Phone, r"\b\d{3}\s\d{3}\s\d{4}\b", 0.85),
            p(EntityKind::Phone, r"\+\d{1,3}\s?\d{2,4}\s?\d{4,5}\s?\d{4,5}\b", 0.85),
            p(EntityKind::Phone, r"\b\d{3}-\d{3}-\d{4}\b", 0.8),
            // --- EMAIL, RFC-5322 subset ---
            p(
                EntityKind::Email,
                r"\b[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}\b",
                0.9,
            ),
            // --- National IDs, feature-flagged at analyze() call site ---
            p(EntityKind::NationalIdA, r"\b[A-Z]{5}[0-9]{4}[A-Z]\b", 0.9),
            p(
                EntityKind::NationalIdB,
                r"\b[0-9]{2}[A-Z]{5}[0-9]{4}[A-Z][0-9]Z[0-9A-Z]\b",
                0.9,
            ),
        ]
    })
}

/// Statistical named-entity recognition over PERSON/LOCATION. The source
/// uses spaCy's `en_core_web_lg`; no equivalent ships in this stack, so a
/// deterministic heuristic recognizer implements the same trait boundary —
/// a real statistical tagger is a drop-in replacement.
pub trait NerEngine: Send + Sync {
    fn recognize(&self, text: &str) -> Result<Vec<Span>, NerError>;
}

#[derive(Debug, thiserror::Error)]
#[error("NER engine failure: {0}")]
pub struct NerError(pub String);

/// Flags runs of consecutive Capitalized words (not sentence-initial) as
/// PERSON candidates, deliberately scored below `warn_threshold` so every
/// heuristic guess surfaces for human review rather than being silently
/// trusted.
pub struct HeuristicNer {
    stoplist: Vec<&'static str>,
}

impl Default for HeuristicNer {
    fn default() -> Self {
        Self {
            stoplist: vec![
                "The", "A", "An", "I", "We", "You", "They", "It", "This", "That", "Please",
                "Hello", "Hi", "Thanks", "Regards", "Dear", "Best", "Sincerely",
            ],
        }
    }
}

impl NerEngine for HeuristicNer {
    fn recognize(&self, text: &str) -> Result<Vec<Span>, NerError> {
        let mut spans = Vec::new();
        let bytes = text.as_bytes();
        let mut i = 0;
        let mut at_sentence_start = true;

        let word_ranges: Vec<(usize, usize)> = {
            let mut ranges = Vec::new();
            let mut start = None;
            for (idx, ch) in text.char_indices() {
                if ch.is_alphabetic() {
                    if start.is_none() {
                        start = Some(idx);
                    }
                } else if let Some(s) = start.take() {
                    ranges.push((s, idx));
                }
            }
            if let Some(s) = start {
                ranges.push((s, text.len()));
            }
            ranges
        };

        let mut idx = 0;
        while idx < word_ranges.len() {
            let (start, end) = word_ranges[idx];
            let word = &text[start..end];
            let is_titlecase = word
                .chars()
                .next()
                .map(|c| c.is_uppercase())
                .unwrap_or(false)
                && word.chars().skip(1).all(|c| c.is_lowercase());

            if is_titlecase && !at_sentence_start && !self.stoplist.contains(&word) {
                let mut run_end = end;
                let mut run_idx = idx;
                while run_idx + 1 < word_ranges.len() {
                    let (ns, ne) = word_ranges[run_idx + 1];
                    let gap = &text[run_end..ns];
                    if gap == " " {
                        let next_word = &text[ns..ne];
                        let next_titlecase = next_word
                            .chars()
                            .next()
                            .map(|c| c.is_uppercase())
                            .unwrap_or(false);
                        if next_titlecase && !self.stoplist.contains(&next_word) {
                            run_end = ne;
                            run_idx += 1;
                            continue;
                        }
                    }
                    break;
                }
                spans.push(Span { kind: EntityKind::Person, start, end: run_end, score: 0.55 });
                idx = run_idx + 1;
            } else {
                idx += 1;
            }

            // crude sentence-boundary tracking for the next token
            at_sentence_start = false;
            while i < bytes.len() && i < end {
                i += 1;
            }
            if end < text.len() {
                let trailing = &text[end..(end + 1).min(text.len())];
                if trailing == "." || trailing == "!" || trailing == "?" {
                    at_sentence_start = true;
                }
            }
        }

        Ok(spans)
    }
}

pub struct Detector<N: NerEngine = HeuristicNer> {
    policy: RedactionPolicy,
    ner: N,
}

impl Detector<HeuristicNer> {
    pub fn new(policy: RedactionPolicy) -> Self {
        Self { policy, ner: HeuristicNer::default() }
    }
}

impl<N: NerEngine> Detector<N> {
    pub fn with_ner(policy: RedactionPolicy, ner: N) -> Self {
        Self { policy, ner }
    }

    pub fn analyze(&self, text: &str) -> AnalysisResult {
        if text.trim().is_empty() {
            return AnalysisResult::default();
        }

        let mut raw: Vec<(Span, u8)> = Vec::new();
        for pattern in pattern_bank() {
            if matches!(pattern.kind, EntityKind::NationalIdA | EntityKind::NationalIdB)
                && !self.policy.enable_national_ids
            {
                continue;
            }
            for m in pattern.regex.find_iter(text) {
                raw.push((
                    Span { kind: pattern.kind, start: m.start(), end: m.end(), score: pattern.score },
                    pattern.kind.registration_order(),
                ));
            }
        }

        let mut ner_warning = None;
        match self.ner.recognize(text) {
            Ok(ner_spans) => {
                for s in ner_spans {
                    let order = s.kind.registration_order();
                    raw.push((s, order));
                }
            }
            Err(e) => {
                ner_warning = Some(format!(
                    "NER layer failed ({e}); pattern-bank detections preserved"
                ));
            }
        }

        raw.retain(|(s, _)| s.score >= self.policy.confidence_threshold);
        raw.sort_by(|(a, ao), (b, bo)| {
            a.start.cmp(&b.start).then(b.score.partial_cmp(&a.score).unwrap()).then(ao.cmp(bo))
        });

        let mut merged: Vec<Span> = Vec::new();
        for (candidate, order) in raw {
            if let Some(last) = merged.last() {
                if last.overlaps(&candidate) {
                    let last_order = last.kind.registration_order();
                    let candidate_wins = candidate.score > last.score
                        || (candidate.score == last.score && order < last_order);
                    if candidate_wins {
                        merged.pop();
                        merged.push(candidate);
                    }
                    continue;
                }
            }
            merged.push(candidate);
        }
        merged.sort_by(|a, b| a.start.cmp(&b.start));

        let low_confidence: Vec<Span> =
            merged.iter().filter(|s| s.score < self.policy.warn_threshold).cloned().collect();

        AnalysisResult { spans: merged, low_confidence, ner_warning }
    }

    pub fn entity_counts(result: &AnalysisResult) -> std::collections::BTreeMap<String, u64> {
        let mut counts = std::collections::BTreeMap::new();
        for span in &result.spans {
            *counts.entry(span.kind.as_str().to_string()).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_email_phone_card_and_api_key() {
        let detector = Detector::new(RedactionPolicy::default());
        let text = "Contact John Doe at john.doe@example.com, phone +1-555-123-4567, card 4532-1234-5678-9012, bearer eyJabc.eyJdef.sigXYZ";
        let result = detector.analyze(text);

        let counts = Detector::<HeuristicNer>::entity_counts(&result);
        assert_eq!(counts.get("EMAIL").copied(), Some(1));
        assert_eq!(counts.get("PHONE").copied(), Some(1));
        assert_eq!(counts.get("CREDIT_CARD").copied(), Some(1));
        assert_eq!(counts.get("API_KEY").copied(), Some(1));
        assert!(counts.get("PERSON").copied().unwrap_or(0) >= 1);
    }

    #[test]
    fn spans_are_sorted_and_non_overlapping() {
        let detector = Detector::new(RedactionPolicy::default());
        let text = "email a@b.com and a@b.com again, phone 555-123-4567";
        let result = detector.analyze(text);
        for w in result.spans.windows(2) {
            assert!(w[0].end <= w[1].start, "spans must not overlap: {:?}", result.spans);
            assert!(w[0].start <= w[1].start);
        }
    }

    #[test]
    fn is_deterministic() {
        let detector = Detector::new(RedactionPolicy::default());
        let text = "reach me at jane@example.com or 555-123-4567";
        let r1 = detector.analyze(text);
        let r2 = detector.analyze(text);
        assert_eq!(r1.spans, r2.spans);
    }

    #[test]
    fn low_confidence_spans_are_flagged_not_dropped() {
        let detector = Detector::new(RedactionPolicy::default());
        // a bare 40+ char alnum string scores 0.6, above the 0.5 threshold
        // but below the 0.7 warn threshold.
        let text = "token abcdefghijklmnopqrstuvwxyz0123456789ABCDEFG";
        let result = detector.analyze(text);
        assert!(!result.spans.is_empty());
        assert!(!result.low_confidence.is_empty());
    }

    struct FailingNer;
    impl NerEngine for FailingNer {
        fn recognize(&self, _text: &str) -> Result<Vec<Span>, NerError> {
            Err(NerError("model unavailable".into()))
        }
    }

    #[test]
    fn ner_failure_preserves_pattern_detections() {
        let detector = Detector::with_ner(RedactionPolicy::default(), FailingNer);
        let text = "contact a@b.com please";
        let result = detector.analyze(text);
        assert!(result.ner_warning.is_some());
        assert_eq!(Detector::<FailingNer>::entity_counts(&result).get("EMAIL").copied(), Some(1));
    }

    #[test]
    fn national_ids_gated_by_policy() {
        let mut policy = RedactionPolicy::default();
        policy.enable_national_ids = false;
        let detector = Detector::new(policy);
        let text = "PAN ABCDE1234F on file";
        assert!(detector.analyze(text).spans.is_empty());

        let mut policy2 = RedactionPolicy::default();
        policy2.enable_national_ids = true;
        let detector2 = Detector::new(policy2);
        assert!(!detector2.analyze(text).spans.is_empty());
    }
}
