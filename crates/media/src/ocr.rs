//! OCR engine abstraction (C3 stage 3). Grounded in
//! `original_source/worker/tasks/ocr_image.py`'s `ocr_with_tesseract` /
//! `ocr_with_cloud_vision` pair and in the teacher's `providers::Provider`
//! async-trait-at-the-seam idiom: a local engine is tried first, a cloud
//! engine is the fallback, and neither concrete backend is bound in this
//! workspace — only the trait and a deterministic fixture double.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrWord {
    pub text: String,
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
    /// 0-100. Words below the pipeline's confidence floor are discarded
    /// before concatenation.
    pub conf: i32,
}

impl OcrWord {
    pub fn right(&self) -> u32 {
        self.left + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.top + self.height
    }
}

#[derive(Debug, thiserror::Error)]
#[error("OCR engine failure: {0}")]
pub struct OcrError(pub String);

#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// Engine name recorded into `RunAsset.meta.ocr_engine`.
    fn name(&self) -> &'static str;

    async fn recognize(&self, image_bytes: &[u8]) -> Result<Vec<OcrWord>, OcrError>;
}

/// Tries `local` first; on failure falls back to `cloud`. Returns the
/// surviving words and the name of whichever engine produced them.
pub async fn recognize_with_fallback(
    local: &dyn OcrEngine,
    cloud: &dyn OcrEngine,
    image_bytes: &[u8],
) -> Result<(Vec<OcrWord>, &'static str), OcrError> {
    match local.recognize(image_bytes).await {
        Ok(words) => Ok((words, local.name())),
        Err(local_err) => {
            tracing::warn!(error = %local_err, "local OCR engine failed, falling back to cloud");
            let words = cloud.recognize(image_bytes).await.map_err(|cloud_err| {
                OcrError(format!(
                    "both OCR engines failed: local={local_err}, cloud={cloud_err}"
                ))
            })?;
            Ok((words, cloud.name()))
        }
    }
}

/// Returns a fixed set of words regardless of input, or an error if
/// `fail` is set. Used in tests in place of a real tesseract/Cloud Vision
/// binding.
pub struct FixtureOcrEngine {
    name: &'static str,
    words: Vec<OcrWord>,
    fail: bool,
}

impl FixtureOcrEngine {
    pub fn succeeding(name: &'static str, words: Vec<OcrWord>) -> Self {
        Self { name, words, fail: false }
    }

    pub fn failing(name: &'static str) -> Self {
        Self { name, words: Vec::new(), fail: true }
    }
}

#[async_trait]
impl OcrEngine for FixtureOcrEngine {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn recognize(&self, _image_bytes: &[u8]) -> Result<Vec<OcrWord>, OcrError> {
        if self.fail {
            return Err(OcrError(format!("{} fixture configured to fail", self.name)));
        }
        Ok(self.words.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(text: &str, left: u32, conf: i32) -> OcrWord {
        OcrWord { text: text.to_string(), left, top: 0, width: 10, height: 10, conf }
    }

    #[tokio::test]
    async fn falls_back_to_cloud_when_local_fails() {
        let local = FixtureOcrEngine::failing("tesseract");
        let cloud = FixtureOcrEngine::succeeding("cloud_vision", vec![word("hi", 0, 90)]);
        let (words, engine) = recognize_with_fallback(&local, &cloud, b"").await.unwrap();
        assert_eq!(engine, "cloud_vision");
        assert_eq!(words.len(), 1);
    }

    #[tokio::test]
    async fn errors_when_both_engines_fail() {
        let local = FixtureOcrEngine::failing("tesseract");
        let cloud = FixtureOcrEngine::failing("cloud_vision");
        assert!(recognize_with_fallback(&local, &cloud, b"").await.is_err());
    }

    #[tokio::test]
    async fn prefers_local_when_it_succeeds() {
        let local = FixtureOcrEngine::succeeding("tesseract", vec![word("hi", 0, 90)]);
        let cloud = FixtureOcrEngine::failing("cloud_vision");
        let (_, engine) = recognize_with_fallback(&local, &cloud, b"").await.unwrap();
        assert_eq!(engine, "tesseract");
    }
}
