//! OCR engine interface.

use crate::prelude::*;

pub mod tesseract;

/// Interface to an OCR engine.
///
/// Engines may fail. The scheduler turns any failure into an empty page, so
/// engines should just report what went wrong.
#[async_trait]
pub trait OcrEngine: Send + Sync + 'static {
    /// Recognize the text in a single page image, returning it unmodified.
    async fn ocr_image(&self, image_path: &Path) -> Result<String>;
}
