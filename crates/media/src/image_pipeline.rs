//! Image Pipeline (C3): OCR -> word-level boxes -> PII mapping -> pixel
//! masking. Grounded in `original_source/worker/tasks/ocr_image.py`'s
//! `process_image`, with one mandated divergence (SPEC_FULL §4.3): PII
//! spans are mapped to OCR boxes by intersecting byte ranges, not by the
//! original's case-insensitive substring search, which both over- and
//! under-matches when OCR splits or merges words differently than the
//! PII text.

use escalatesafe_detector::{Detector, EntityKind, NerEngine, RedactionPolicy, Span};
use image::{DynamicImage, ImageOutputFormat};
use imageproc::drawing::draw_filled_rect_mut;
use imageproc::rect::Rect;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Cursor;

use crate::ocr::{recognize_with_fallback, OcrEngine, OcrError, OcrWord};
use crate::verifier::{verify_text, VerifyOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskStyle {
    Blur,
    Solid,
}

#[derive(Debug, Clone)]
pub struct ImagePipelineConfig {
    pub mask_style: MaskStyle,
    pub min_confidence: i32,
    pub padding_px: i64,
    pub blur_sigma: f32,
    pub redaction_policy: RedactionPolicy,
}

impl Default for ImagePipelineConfig {
    fn default() -> Self {
        Self {
            mask_style: MaskStyle::Blur,
            min_confidence: 30,
            padding_px: 5,
            blur_sigma: 15.0,
            redaction_policy: RedactionPolicy::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ImagePipelineError {
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error(transparent)]
    Ocr(#[from] OcrError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImagePipelineOutput {
    pub png_bytes: Vec<u8>,
    pub ocr_engine: String,
    pub word_count: usize,
    pub pii_count: usize,
    pub masked_regions: usize,
    pub counts_by_kind: BTreeMap<String, u64>,
    /// Re-extracted text after masking, for callers that need to combine
    /// it with other pages before verifying (the PDF scanned path).
    pub verification_text: String,
    /// Leak Verifier outcome (§4.5) for this image alone — a second,
    /// independent OCR pass over the sanitized raster through the same
    /// detector.
    pub verification: VerifyOutcome,
}

/// A word's byte range within the space-joined OCR concatenation, paired
/// with its pixel box.
struct PlacedWord<'a> {
    range: std::ops::Range<usize>,
    word: &'a OcrWord,
}

/// Joins surviving words with single spaces, recording each word's byte
/// range in the result (§4.3 stage 4).
fn concatenate_with_ranges(words: &[OcrWord]) -> (String, Vec<std::ops::Range<usize>>) {
    let mut text = String::new();
    let mut ranges = Vec::with_capacity(words.len());
    for (i, w) in words.iter().enumerate() {
        if i > 0 {
            text.push(' ');
        }
        let start = text.len();
        text.push_str(&w.text);
        ranges.push(start..text.len());
    }
    (text, ranges)
}

/// Maps each PII span onto the OCR boxes whose byte range intersects it
/// (§4.3 stage 6 — range intersection, not substring containment).
fn boxes_for_span<'a>(span: &Span, placed: &[PlacedWord<'a>]) -> Vec<&'a OcrWord> {
    placed
        .iter()
        .filter(|p| p.range.start < span.end && span.start < p.range.end)
        .map(|p| p.word)
        .collect()
}

fn padded_rect(word: &OcrWord, padding: i64, img_width: u32, img_height: u32) -> Rect {
    let left = (word.left as i64 - padding).max(0) as u32;
    let top = (word.top as i64 - padding).max(0) as u32;
    let right = ((word.right() as i64 + padding) as u32).min(img_width);
    let bottom = ((word.bottom() as i64 + padding) as u32).min(img_height);
    let width = right.saturating_sub(left).max(1);
    let height = bottom.saturating_sub(top).max(1);
    Rect::at(left as i32, top as i32).of_size(width, height)
}

fn apply_solid_mask(image: &mut DynamicImage, rects: &[Rect]) {
    let mut rgb = image.to_rgb8();
    for rect in rects {
        draw_filled_rect_mut(&mut rgb, *rect, image::Rgb([0, 0, 0]));
    }
    *image = DynamicImage::ImageRgb8(rgb);
}

fn apply_blur_mask(image: &mut DynamicImage, rects: &[Rect], sigma: f32) {
    let mut rgb = image.to_rgb8();
    for rect in rects {
        let x = rect.left().max(0) as u32;
        let y = rect.top().max(0) as u32;
        let w = rect.width().min(rgb.width().saturating_sub(x));
        let h = rect.height().min(rgb.height().saturating_sub(y));
        if w == 0 || h == 0 {
            continue;
        }
        let region = image::imageops::crop_imm(&rgb, x, y, w, h).to_image();
        let blurred = imageproc::filter::gaussian_blur_f32(&region, sigma);
        image::imageops::replace(&mut rgb, &blurred, x as i64, y as i64);
    }
    *image = DynamicImage::ImageRgb8(rgb);
}

/// Runs the full image pipeline (§4.3, stages 1 omitted — bytes are
/// already fetched by the caller): decode, OCR with fallback, detect,
/// map spans to boxes, mask, re-encode, and re-OCR the sanitized raster
/// for the Leak Verifier.
pub async fn run_image_pipeline<N: NerEngine>(
    image_bytes: &[u8],
    local: &dyn OcrEngine,
    cloud: &dyn OcrEngine,
    detector: &Detector<N>,
    config: &ImagePipelineConfig,
) -> Result<ImagePipelineOutput, ImagePipelineError> {
    let mut image = image::load_from_memory(image_bytes)?;
    let (width, height) = (image.width(), image.height());

    let (raw_words, engine_name) = recognize_with_fallback(local, cloud, image_bytes).await?;
    let words: Vec<OcrWord> = raw_words.into_iter().filter(|w| w.conf >= config.min_confidence).collect();

    let (concatenated, ranges) = concatenate_with_ranges(&words);
    let placed: Vec<PlacedWord> =
        ranges.into_iter().zip(words.iter()).map(|(range, word)| PlacedWord { range, word }).collect();

    let analysis = detector.analyze(&concatenated);
    let counts_by_kind = Detector::<N>::entity_counts(&analysis);

    let mut rects = Vec::new();
    for span in &analysis.spans {
        for word in boxes_for_span(span, &placed) {
            rects.push(padded_rect(word, config.padding_px, width, height));
        }
    }

    match config.mask_style {
        MaskStyle::Blur => apply_blur_mask(&mut image, &rects, config.blur_sigma),
        MaskStyle::Solid => apply_solid_mask(&mut image, &rects),
    }

    let mut png_bytes = Vec::new();
    image.write_to(&mut Cursor::new(&mut png_bytes), ImageOutputFormat::Png)?;

    // Leak Verifier (§4.5): a second, independent OCR pass over the
    // sanitized raster, identical code path to ingress.
    let (verify_words, _) = recognize_with_fallback(local, cloud, &png_bytes).await?;
    let verify_words: Vec<OcrWord> =
        verify_words.into_iter().filter(|w| w.conf >= config.min_confidence).collect();
    let (verification_text, _) = concatenate_with_ranges(&verify_words);
    let verification = verify_text(&verification_text, detector);

    Ok(ImagePipelineOutput {
        png_bytes,
        ocr_engine: engine_name.to_string(),
        word_count: words.len(),
        pii_count: analysis.spans.len(),
        masked_regions: rects.len(),
        counts_by_kind,
        verification_text,
        verification,
    })
}

pub fn national_ids_enabled(kind: EntityKind, policy: &RedactionPolicy) -> bool {
    !matches!(kind, EntityKind::NationalIdA | EntityKind::NationalIdB) || policy.enable_national_ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocr::FixtureOcrEngine;
    use image::{ImageBuffer, Rgb};

    fn solid_png(width: u32, height: u32) -> Vec<u8> {
        let img: ImageBuffer<Rgb<u8>, Vec<u8>> = ImageBuffer::from_pixel(width, height, Rgb([200, 200, 200]));
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(img).write_to(&mut Cursor::new(&mut bytes), ImageOutputFormat::Png).unwrap();
        bytes
    }

    fn word(text: &str, left: u32, top: u32, w: u32, h: u32, conf: i32) -> OcrWord {
        OcrWord { text: text.to_string(), left, top, width: w, height: h, conf }
    }

    #[tokio::test]
    async fn masks_region_covering_detected_email() {
        let png = solid_png(200, 100);
        let words = vec![
            word("contact", 0, 0, 50, 20, 90),
            word("jane@example.com", 55, 0, 90, 20, 90),
            word("today", 150, 0, 40, 20, 90),
        ];
        let engine = FixtureOcrEngine::succeeding("tesseract", words);
        let failing_cloud = FixtureOcrEngine::failing("cloud_vision");
        let detector = Detector::new(RedactionPolicy::default());
        let config = ImagePipelineConfig::default();

        let out = run_image_pipeline(&png, &engine, &failing_cloud, &detector, &config).await.unwrap();
        assert_eq!(out.ocr_engine, "tesseract");
        assert_eq!(out.word_count, 3);
        assert_eq!(out.pii_count, 1);
        assert_eq!(out.masked_regions, 1);
        assert!(!out.png_bytes.is_empty());
    }

    #[tokio::test]
    async fn multi_word_span_masks_every_contributing_word() {
        // A PERSON span spanning two words must mask both boxes, which a
        // single-merged-box or substring-only approach could miss if OCR
        // and detector tokenize differently.
        let png = solid_png(300, 50);
        let words = vec![
            word("Hello", 0, 0, 40, 20, 90),
            word("Jane", 45, 0, 35, 20, 90),
            word("Smith", 85, 0, 40, 20, 90),
            word("writes.", 130, 0, 50, 20, 90),
        ];
        let engine = FixtureOcrEngine::succeeding("tesseract", words);
        let failing_cloud = FixtureOcrEngine::failing("cloud_vision");
        let detector = Detector::new(RedactionPolicy::default());
        let config = ImagePipelineConfig::default();

        let out = run_image_pipeline(&png, &engine, &failing_cloud, &detector, &config).await.unwrap();
        assert!(out.masked_regions >= 2, "expected both words of the name to be masked");
    }

    #[tokio::test]
    async fn no_pii_leaves_image_unmasked() {
        let png = solid_png(100, 50);
        let words = vec![word("hello", 0, 0, 30, 20, 90)];
        let engine = FixtureOcrEngine::succeeding("tesseract", words);
        let failing_cloud = FixtureOcrEngine::failing("cloud_vision");
        let detector = Detector::new(RedactionPolicy::default());
        let config = ImagePipelineConfig::default();

        let out = run_image_pipeline(&png, &engine, &failing_cloud, &detector, &config).await.unwrap();
        assert_eq!(out.masked_regions, 0);
    }

    #[test]
    fn concatenation_ranges_round_trip() {
        let words =
            vec![word("a", 0, 0, 1, 1, 90), word("bb", 0, 0, 1, 1, 90), word("ccc", 0, 0, 1, 1, 90)];
        let (text, ranges) = concatenate_with_ranges(&words);
        assert_eq!(text, "a bb ccc");
        assert_eq!(&text[ranges[0].clone()], "a");
        assert_eq!(&text[ranges[1].clone()], "bb");
        assert_eq!(&text[ranges[2].clone()], "ccc");
    }
}
