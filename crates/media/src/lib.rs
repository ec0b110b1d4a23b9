//! escalatesafe_media
//!
//! C3 (Image Pipeline), C4 (PDF Pipeline), and C5 (Leak Verifier) live in
//! one crate: the verifier re-applies the detector across both media
//! kinds and the text path, and the PDF scanned path reuses the image
//! pipeline per page (§4.3, §4.4, §4.5).

pub mod image_pipeline;
pub mod ocr;
pub mod pdf;
pub mod verifier;

pub use image_pipeline::{run_image_pipeline, ImagePipelineConfig, ImagePipelineError, ImagePipelineOutput, MaskStyle};
pub use ocr::{recognize_with_fallback, FixtureOcrEngine, OcrEngine, OcrError, OcrWord};
pub use pdf::{run_pdf_pipeline, FixturePdfDocument, LopdfDocument, PdfDocument, PdfLimits, PdfMethod, PdfPipelineError, PdfPipelineOutput, PdfRect};
pub use verifier::{verify_text, VerifyOutcome};
