//! PDF Pipeline (C4). Grounded in
//! `original_source/worker/tasks/redact_pdf.py`: classification by
//! text-layer length, a native-annotation path for text-layer PDFs, and a
//! render-then-rebuild path for scanned PDFs that reuses the Image
//! Pipeline per page.
//!
//! `PdfDocument` mirrors the PyMuPDF (`fitz`) operations the original
//! calls — `get_text`, `search_for`, `add_redact_annot`,
//! `apply_redactions`, `set_metadata`, `get_pixmap`, `insert_pdf` — so a
//! real binding is a drop-in behind the trait. `LopdfDocument` backs it
//! with the `lopdf` crate, the PDF crate reachable from this pack's
//! ecosystem (noted in DESIGN.md as the PyMuPDF substitution); rendering a
//! page to a raster has no equivalent in `lopdf` (it has no rasterizer),
//! so that one method returns `PdfPipelineError::RasterizationUnavailable`
//! until a native renderer is wired in.

use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Object, Stream};
use serde::{Deserialize, Serialize};

use crate::image_pipeline::{run_image_pipeline, ImagePipelineConfig, ImagePipelineError};
use crate::ocr::OcrEngine;
use crate::verifier::verify_text;
use escalatesafe_detector::{Detector, NerEngine};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PdfRect {
    pub page: usize,
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
}

#[derive(Debug, thiserror::Error)]
pub enum PdfPipelineError {
    #[error("PDF has {pages} pages, exceeding the limit of {max}")]
    PageLimitExceeded { pages: usize, max: usize },
    #[error("PDF is {size_mb:.2}MB, exceeding the limit of {max_mb}MB")]
    AssetTooLarge { size_mb: f64, max_mb: u64 },
    #[error("failed to parse PDF: {0}")]
    Parse(String),
    #[error("failed to write PDF: {0}")]
    Io(String),
    #[error("page rasterization is not available in this backend")]
    RasterizationUnavailable,
    #[error(transparent)]
    Image(#[from] ImagePipelineError),
}

/// Mirrors the subset of PyMuPDF operations `redact_pdf.py` calls on a
/// `fitz.Document`. Sync, not async — these are in-memory CPU operations
/// over bytes already fetched by the caller.
pub trait PdfDocument: Send + Sync + Sized {
    fn load(bytes: &[u8]) -> Result<Self, PdfPipelineError>;
    fn page_count(&self) -> usize;
    /// Concatenated text of every page, used both for text/scanned
    /// classification and as the Leak Verifier's re-extraction source.
    fn extract_text(&self) -> String;
    /// All occurrences of `needle` across every page (`page.search_for`).
    fn find_occurrences(&self, needle: &str) -> Vec<PdfRect>;
    /// Registers and applies an opaque redaction annotation over each rect.
    fn redact(&mut self, rects: &[PdfRect]) -> Result<(), PdfPipelineError>;
    fn strip_metadata(&mut self) -> Result<(), PdfPipelineError>;
    fn render_page(&self, page: usize, dpi: u32) -> Result<Vec<u8>, PdfPipelineError>;
    fn save(&self) -> Result<Vec<u8>, PdfPipelineError>;
    /// Builds a new document from page-ordered PNG rasters (the scanned
    /// path's `insert_pdf` rebuild step).
    fn from_raster_pages(pages: &[Vec<u8>]) -> Result<Self, PdfPipelineError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PdfMethod {
    Native,
    RasterRebuild,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PdfPipelineOutput {
    pub pdf_bytes: Vec<u8>,
    pub pages: usize,
    pub method: PdfMethod,
    pub pii_count: usize,
    pub verification_passed: bool,
}

#[derive(Debug, Clone)]
pub struct PdfLimits {
    pub max_pages: usize,
    pub max_size_mb: u64,
}

impl Default for PdfLimits {
    fn default() -> Self {
        Self { max_pages: 10, max_size_mb: 10 }
    }
}

/// Classification threshold (§4.4): a text layer longer than this many
/// non-whitespace characters is treated as a genuine text-layer PDF.
const TEXT_LAYER_THRESHOLD: usize = 100;
const SCAN_DPI: u32 = 150;

/// Runs the full PDF pipeline. Size and page limits are asset-level
/// failures (`PdfPipelineError::{AssetTooLarge, PageLimitExceeded}`) that
/// the caller converts into a `failed` RunAsset without aborting the run
/// — diverging from the original's unhandled exception on both checks
/// (§4.4).
pub async fn run_pdf_pipeline<D, N>(
    pdf_bytes: &[u8],
    local: &dyn OcrEngine,
    cloud: &dyn OcrEngine,
    detector: &Detector<N>,
    image_config: &ImagePipelineConfig,
    limits: &PdfLimits,
) -> Result<PdfPipelineOutput, PdfPipelineError>
where
    D: PdfDocument,
    N: NerEngine,
{
    let size_mb = pdf_bytes.len() as f64 / (1024.0 * 1024.0);
    if size_mb > limits.max_size_mb as f64 {
        return Err(PdfPipelineError::AssetTooLarge { size_mb, max_mb: limits.max_size_mb });
    }

    let mut doc = D::load(pdf_bytes)?;
    let pages = doc.page_count();
    if pages > limits.max_pages {
        return Err(PdfPipelineError::PageLimitExceeded { pages, max: limits.max_pages });
    }

    let text = doc.extract_text();
    let non_whitespace = text.chars().filter(|c| !c.is_whitespace()).count();

    if non_whitespace > TEXT_LAYER_THRESHOLD {
        run_native_path(&mut doc, detector).await
    } else {
        run_raster_rebuild_path::<D, N>(&doc, local, cloud, detector, image_config).await
    }
}

async fn run_native_path<D: PdfDocument, N: NerEngine>(
    doc: &mut D,
    detector: &Detector<N>,
) -> Result<PdfPipelineOutput, PdfPipelineError> {
    let text = doc.extract_text();
    let analysis = detector.analyze(&text);

    let mut rects = Vec::new();
    for span in &analysis.spans {
        let needle = &text[span.start..span.end];
        rects.extend(doc.find_occurrences(needle));
    }

    doc.redact(&rects)?;
    doc.strip_metadata()?;
    let pdf_bytes = doc.save()?;

    // Leak Verifier (§4.5): re-extract from the saved document and run
    // the full detector again, identical code path to ingress.
    let verify_doc = D::load(&pdf_bytes)?;
    let outcome = verify_text(&verify_doc.extract_text(), detector);

    Ok(PdfPipelineOutput {
        pages: verify_doc.page_count(),
        method: PdfMethod::Native,
        pii_count: analysis.spans.len(),
        verification_passed: outcome.passed,
        pdf_bytes,
    })
}

async fn run_raster_rebuild_path<D, N>(
    doc: &D,
    local: &dyn OcrEngine,
    cloud: &dyn OcrEngine,
    detector: &Detector<N>,
    image_config: &ImagePipelineConfig,
) -> Result<PdfPipelineOutput, PdfPipelineError>
where
    D: PdfDocument,
    N: NerEngine,
{
    let mut sanitized_pages = Vec::with_capacity(doc.page_count());
    let mut pii_count = 0;
    let mut verification_text = String::new();

    for page in 0..doc.page_count() {
        let raster = doc.render_page(page, SCAN_DPI)?;
        let out = run_image_pipeline(&raster, local, cloud, detector, image_config).await?;
        pii_count += out.pii_count;
        verification_text.push(' ');
        verification_text.push_str(&out.verification_text);
        sanitized_pages.push(out.png_bytes);
    }

    let rebuilt = D::from_raster_pages(&sanitized_pages)?;
    let pdf_bytes = rebuilt.save()?;

    let outcome = verify_text(&verification_text, detector);

    Ok(PdfPipelineOutput {
        pages: sanitized_pages.len(),
        method: PdfMethod::RasterRebuild,
        pii_count,
        verification_passed: outcome.passed,
        pdf_bytes,
    })
}

/// `lopdf`-backed `PdfDocument`. Text extraction and occurrence search
/// walk each page's content stream directly (`Tj`/`TJ` show-text
/// operators against the current text position) since `lopdf` exposes no
/// glyph-geometry API the way PyMuPDF's `get_text("dict")` does — the
/// resulting boxes are an approximation of the glyph run's extent, not an
/// exact font metric.
pub struct LopdfDocument {
    doc: lopdf::Document,
}

fn pdf_err(e: impl std::fmt::Display) -> PdfPipelineError {
    PdfPipelineError::Parse(e.to_string())
}

impl LopdfDocument {
    fn page_ids(&self) -> Vec<(u32, lopdf::ObjectId)> {
        self.doc.get_pages().into_iter().collect()
    }

    fn media_box(&self, page_id: lopdf::ObjectId) -> (f32, f32) {
        self.doc
            .get_object(page_id)
            .ok()
            .and_then(|o| o.as_dict().ok())
            .and_then(|d| d.get(b"MediaBox").ok())
            .and_then(|o| o.as_array().ok())
            .and_then(|arr| {
                let w = arr.get(2)?.as_float().ok()?;
                let h = arr.get(3)?.as_float().ok()?;
                Some((w, h))
            })
            .unwrap_or((612.0, 792.0))
    }

    fn text_runs(&self, page_id: lopdf::ObjectId) -> Vec<(String, PdfRect, usize)> {
        let Ok(data) = self.doc.get_page_content(page_id) else { return Vec::new() };
        let Ok(content) = Content::decode(&data) else { return Vec::new() };
        let (page_w, page_h) = self.media_box(page_id);

        let mut runs = Vec::new();
        let mut x = 0.0_f32;
        let mut y = page_h;
        let mut font_size = 12.0_f32;

        for op in content.operations {
            match op.operator.as_str() {
                "Tf" => {
                    if let Some(size) = op.operands.get(1).and_then(|o| o.as_float().ok()) {
                        font_size = size;
                    }
                }
                "Td" | "TD" => {
                    let dx = op.operands.first().and_then(|o| o.as_float().ok()).unwrap_or(0.0);
                    let dy = op.operands.get(1).and_then(|o| o.as_float().ok()).unwrap_or(0.0);
                    x += dx;
                    y += dy;
                }
                "Tm" => {
                    if let (Some(e), Some(f)) = (
                        op.operands.get(4).and_then(|o| o.as_float().ok()),
                        op.operands.get(5).and_then(|o| o.as_float().ok()),
                    ) {
                        x = e;
                        y = f;
                    }
                }
                "Tj" => {
                    if let Some(bytes) = op.operands.first().and_then(|o| o.as_str().ok()) {
                        push_run(&mut runs, bytes, x, y, font_size, page_w, page_h);
                    }
                }
                "TJ" => {
                    if let Some(Ok(items)) = op.operands.first().map(|o| o.as_array()) {
                        let mut joined = Vec::new();
                        for item in items {
                            if let Ok(bytes) = item.as_str() {
                                joined.extend_from_slice(bytes);
                            }
                        }
                        push_run(&mut runs, &joined, x, y, font_size, page_w, page_h);
                    }
                }
                _ => {}
            }
        }
        runs.into_iter().map(|(text, rect)| {
            let width_chars = text.chars().count();
            (text, rect, width_chars)
        }).collect()
    }
}

fn push_run(
    runs: &mut Vec<(String, PdfRect)>,
    bytes: &[u8],
    x: f32,
    y: f32,
    font_size: f32,
    page_w: f32,
    page_h: f32,
) {
    let text = String::from_utf8_lossy(bytes).to_string();
    if text.trim().is_empty() {
        return;
    }
    let width = (text.chars().count() as f32 * font_size * 0.5).min(page_w);
    let top = (page_h - y - font_size).max(0.0);
    runs.push((text, PdfRect { page: 0, left: x, top, width, height: font_size }));
}

impl PdfDocument for LopdfDocument {
    fn load(bytes: &[u8]) -> Result<Self, PdfPipelineError> {
        let doc = lopdf::Document::load_mem(bytes).map_err(pdf_err)?;
        Ok(Self { doc })
    }

    fn page_count(&self) -> usize {
        self.doc.get_pages().len()
    }

    fn extract_text(&self) -> String {
        self.page_ids()
            .iter()
            .map(|(_, id)| {
                self.text_runs(*id).into_iter().map(|(t, _, _)| t).collect::<Vec<_>>().join(" ")
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn find_occurrences(&self, needle: &str) -> Vec<PdfRect> {
        let needle_lower = needle.to_lowercase();
        let mut rects = Vec::new();
        for (page_num, (_, page_id)) in self.page_ids().iter().enumerate() {
            for (text, mut rect, _) in self.text_runs(*page_id) {
                if text.to_lowercase().contains(&needle_lower) {
                    rect.page = page_num;
                    rects.push(rect);
                }
            }
        }
        rects
    }

    fn redact(&mut self, rects: &[PdfRect]) -> Result<(), PdfPipelineError> {
        let page_ids = self.page_ids();
        for rect in rects {
            let Some((_, page_id)) = page_ids.get(rect.page) else { continue };
            let (_, page_h) = self.media_box(*page_id);
            let y = page_h - rect.top - rect.height;
            let ops = vec![
                Operation::new("q", vec![]),
                Operation::new("rg", vec![Object::Integer(0), Object::Integer(0), Object::Integer(0)]),
                Operation::new(
                    "re",
                    vec![
                        Object::Real(rect.left),
                        Object::Real(y),
                        Object::Real(rect.width),
                        Object::Real(rect.height),
                    ],
                ),
                Operation::new("f", vec![]),
                Operation::new("Q", vec![]),
            ];
            let existing = self.doc.get_page_content(*page_id).map_err(pdf_err)?;
            let mut content = Content::decode(&existing).map_err(pdf_err)?;
            content.operations.extend(ops);
            let encoded = content.encode().map_err(pdf_err)?;
            self.doc.change_page_content(*page_id, encoded).map_err(pdf_err)?;
        }
        Ok(())
    }

    fn strip_metadata(&mut self) -> Result<(), PdfPipelineError> {
        self.doc.trailer.remove(b"Info");
        Ok(())
    }

    fn render_page(&self, _page: usize, _dpi: u32) -> Result<Vec<u8>, PdfPipelineError> {
        Err(PdfPipelineError::RasterizationUnavailable)
    }

    fn save(&self) -> Result<Vec<u8>, PdfPipelineError> {
        let mut buf = Vec::new();
        let mut doc = self.doc.clone();
        doc.save_to(&mut buf).map_err(pdf_err)?;
        Ok(buf)
    }

    fn from_raster_pages(pages: &[Vec<u8>]) -> Result<Self, PdfPipelineError> {
        let mut doc = lopdf::Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let mut page_refs = Vec::with_capacity(pages.len());

        for png in pages {
            let decoded = image::load_from_memory(png).map_err(|e| PdfPipelineError::Io(e.to_string()))?;
            let (w, h) = (decoded.width(), decoded.height());
            let mut jpeg_bytes = Vec::new();
            decoded
                .write_to(&mut std::io::Cursor::new(&mut jpeg_bytes), image::ImageOutputFormat::Jpeg(85))
                .map_err(|e| PdfPipelineError::Io(e.to_string()))?;

            let (pt_w, pt_h) = (w as f32 * 72.0 / SCAN_DPI as f32, h as f32 * 72.0 / SCAN_DPI as f32);

            let image_id = doc.add_object(Object::Stream(Stream::new(
                dictionary! {
                    "Type" => "XObject",
                    "Subtype" => "Image",
                    "Width" => w as i64,
                    "Height" => h as i64,
                    "ColorSpace" => "DeviceRGB",
                    "BitsPerComponent" => 8,
                    "Filter" => "DCTDecode",
                },
                jpeg_bytes,
            )));

            let content = Content {
                operations: vec![
                    Operation::new("q", vec![]),
                    Operation::new(
                        "cm",
                        vec![
                            Object::Real(pt_w),
                            Object::Integer(0),
                            Object::Integer(0),
                            Object::Real(pt_h),
                            Object::Integer(0),
                            Object::Integer(0),
                        ],
                    ),
                    Operation::new("Do", vec![Object::Name(b"Im0".to_vec())]),
                    Operation::new("Q", vec![]),
                ],
            };
            let content_id = doc.add_object(Object::Stream(Stream::new(
                dictionary! {},
                content.encode().map_err(pdf_err)?,
            )));
            let resources_id = doc.add_object(Object::Dictionary(
                dictionary! { "XObject" => dictionary! { "Im0" => image_id } },
            ));

            let page_id = doc.add_object(Object::Dictionary(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Resources" => resources_id,
                "MediaBox" => vec![Object::Integer(0), Object::Integer(0), Object::Real(pt_w), Object::Real(pt_h)],
                "Contents" => content_id,
            }));
            page_refs.push(Object::Reference(page_id));
        }

        let page_count = page_refs.len() as i64;
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => page_refs,
                "Count" => page_count,
            }),
        );

        let catalog_id =
            doc.add_object(Object::Dictionary(dictionary! { "Type" => "Catalog", "Pages" => pages_id }));
        doc.trailer.set("Root", catalog_id);

        Ok(Self { doc })
    }
}

/// In-memory test double: `load` deserializes the JSON produced by
/// `to_bytes`, so pipeline tests can exercise `run_pdf_pipeline` without a
/// real PDF byte stream.
#[derive(Serialize, Deserialize)]
struct FixtureDocData {
    pages_text: Vec<String>,
    rendered_pages: Vec<Vec<u8>>,
}

pub struct FixturePdfDocument {
    pages_text: Vec<String>,
    rendered_pages: Vec<Vec<u8>>,
    redacted: bool,
}

impl FixturePdfDocument {
    pub fn new(pages_text: Vec<String>, rendered_pages: Vec<Vec<u8>>) -> Self {
        Self { pages_text, rendered_pages, redacted: false }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(&FixtureDocData {
            pages_text: self.pages_text.clone(),
            rendered_pages: self.rendered_pages.clone(),
        })
        .expect("fixture data is always serializable")
    }
}

impl PdfDocument for FixturePdfDocument {
    fn load(bytes: &[u8]) -> Result<Self, PdfPipelineError> {
        let data: FixtureDocData = serde_json::from_slice(bytes).map_err(pdf_err)?;
        Ok(Self { pages_text: data.pages_text, rendered_pages: data.rendered_pages, redacted: false })
    }

    fn page_count(&self) -> usize {
        self.pages_text.len()
    }

    fn extract_text(&self) -> String {
        if self.redacted {
            self.pages_text.iter().map(|_| "REDACTED".to_string()).collect::<Vec<_>>().join(" ")
        } else {
            self.pages_text.join(" ")
        }
    }

    fn find_occurrences(&self, needle: &str) -> Vec<PdfRect> {
        let needle_lower = needle.to_lowercase();
        self.pages_text
            .iter()
            .enumerate()
            .filter(|(_, text)| text.to_lowercase().contains(&needle_lower))
            .map(|(i, _)| PdfRect { page: i, left: 0.0, top: 0.0, width: 100.0, height: 20.0 })
            .collect()
    }

    fn redact(&mut self, rects: &[PdfRect]) -> Result<(), PdfPipelineError> {
        if !rects.is_empty() {
            self.redacted = true;
        }
        Ok(())
    }

    fn strip_metadata(&mut self) -> Result<(), PdfPipelineError> {
        Ok(())
    }

    fn render_page(&self, page: usize, _dpi: u32) -> Result<Vec<u8>, PdfPipelineError> {
        self.rendered_pages.get(page).cloned().ok_or_else(|| PdfPipelineError::Parse(format!("no page {page}")))
    }

    fn save(&self) -> Result<Vec<u8>, PdfPipelineError> {
        Ok(self.to_bytes())
    }

    fn from_raster_pages(pages: &[Vec<u8>]) -> Result<Self, PdfPipelineError> {
        Ok(Self {
            pages_text: pages.iter().map(|_| "RASTER_PAGE".to_string()).collect(),
            rendered_pages: pages.to_vec(),
            redacted: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocr::FixtureOcrEngine;
    use escalatesafe_detector::{Detector, RedactionPolicy};

    #[tokio::test]
    async fn text_layer_pdf_takes_native_path_and_verifies_clean() {
        let doc = FixturePdfDocument::new(
            vec![format!(
                "This ticket was filed by jane@example.com and needs follow up. {}",
                "padding ".repeat(20)
            )],
            vec![],
        );
        let bytes = doc.to_bytes();
        let local = FixtureOcrEngine::failing("tesseract");
        let cloud = FixtureOcrEngine::failing("cloud_vision");
        let detector = Detector::new(RedactionPolicy::default());
        let config = ImagePipelineConfig::default();
        let limits = PdfLimits::default();

        let out = run_pdf_pipeline::<FixturePdfDocument, _>(
            &bytes, &local, &cloud, &detector, &config, &limits,
        )
        .await
        .unwrap();

        assert_eq!(out.method, PdfMethod::Native);
        assert!(out.pii_count >= 1);
        assert!(out.verification_passed);
    }

    #[tokio::test]
    async fn scanned_pdf_with_short_text_layer_takes_raster_path() {
        let png = {
            let img: image::ImageBuffer<image::Rgb<u8>, Vec<u8>> =
                image::ImageBuffer::from_pixel(50, 50, image::Rgb([255, 255, 255]));
            let mut bytes = Vec::new();
            image::DynamicImage::ImageRgb8(img)
                .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageOutputFormat::Png)
                .unwrap();
            bytes
        };
        let doc = FixturePdfDocument::new(vec!["short".to_string()], vec![png]);
        let bytes = doc.to_bytes();
        let local = FixtureOcrEngine::succeeding("tesseract", vec![]);
        let cloud = FixtureOcrEngine::failing("cloud_vision");
        let detector = Detector::new(RedactionPolicy::default());
        let config = ImagePipelineConfig::default();
        let limits = PdfLimits::default();

        let out = run_pdf_pipeline::<FixturePdfDocument, _>(
            &bytes, &local, &cloud, &detector, &config, &limits,
        )
        .await
        .unwrap();

        assert_eq!(out.method, PdfMethod::RasterRebuild);
        assert_eq!(out.pages, 1);
    }

    #[tokio::test]
    async fn page_limit_is_a_typed_error_not_a_panic() {
        let doc = FixturePdfDocument::new(vec!["p".to_string(); 11], vec![]);
        let bytes = doc.to_bytes();
        let local = FixtureOcrEngine::failing("tesseract");
        let cloud = FixtureOcrEngine::failing("cloud_vision");
        let detector = Detector::new(RedactionPolicy::default());
        let config = ImagePipelineConfig::default();
        let limits = PdfLimits::default();

        let err = run_pdf_pipeline::<FixturePdfDocument, _>(
            &bytes, &local, &cloud, &detector, &config, &limits,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PdfPipelineError::PageLimitExceeded { pages: 11, max: 10 }));
    }

    #[tokio::test]
    async fn oversized_asset_is_rejected_before_parsing() {
        let local = FixtureOcrEngine::failing("tesseract");
        let cloud = FixtureOcrEngine::failing("cloud_vision");
        let detector = Detector::new(RedactionPolicy::default());
        let config = ImagePipelineConfig::default();
        let limits = PdfLimits { max_pages: 10, max_size_mb: 1 };
        let oversized = vec![0u8; 2 * 1024 * 1024];

        let err = run_pdf_pipeline::<FixturePdfDocument, _>(
            &oversized, &local, &cloud, &detector, &config, &limits,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PdfPipelineError::AssetTooLarge { .. }));
    }
}
