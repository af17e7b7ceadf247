//! Tesseract OCR engine.

use tokio::process::Command;

use crate::{async_utils::check_for_command_failure, prelude::*};

use super::OcrEngine;

/// The language we ask `tesseract` to recognize if none is specified.
pub const DEFAULT_LANGUAGE: &str = "eng";

/// OCR engine wrapping the `tesseract` CLI tool.
pub struct TesseractOcrEngine {
    /// The `tesseract` language code, like `eng` or `eng+fra`.
    language: String,
}

impl TesseractOcrEngine {
    /// Create a new `tesseract` engine for `language`.
    pub fn new(language: impl Into<String>) -> Self {
        Self {
            language: language.into(),
        }
    }
}

impl Default for TesseractOcrEngine {
    fn default() -> Self {
        Self::new(DEFAULT_LANGUAGE)
    }
}

#[async_trait]
impl OcrEngine for TesseractOcrEngine {
    #[instrument(level = "debug", skip_all, fields(image = %image_path.display()))]
    async fn ocr_image(&self, image_path: &Path) -> Result<String> {
        // Write recognized text to standard output instead of a file. If
        // we're cancelled by a timeout, kill the process.
        let output = Command::new("tesseract")
            .arg(image_path)
            .arg("stdout")
            .arg("-l")
            .arg(&self.language)
            .kill_on_drop(true)
            .output()
            .await
            .context("cannot run tesseract")?;
        check_for_command_failure("tesseract", &output, None)?;

        let text = String::from_utf8_lossy(&output.stdout).into_owned();
        if text.trim().is_empty() {
            warn!(image = %image_path.display(), "tesseract found no text");
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_images_are_errors() {
        let engine = TesseractOcrEngine::default();
        let result = engine.ocr_image(Path::new("does/not/exist.jpg")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    #[ignore = "Requires tesseract and ImageMagick to be installed"]
    async fn recognizes_rendered_text() -> Result<()> {
        let tmpdir = tempfile::TempDir::with_prefix("tesseract-test")?;
        let image_path = tmpdir.path().join("hello.png");
        let output = Command::new("convert")
            .args(["-size", "800x200", "xc:white", "-pointsize", "72"])
            .args(["-fill", "black", "-annotate", "+40+130", "Hello world"])
            .arg(&image_path)
            .output()
            .await?;
        check_for_command_failure("convert", &output, None)?;

        let text = TesseractOcrEngine::default().ocr_image(&image_path).await?;
        assert!(text.contains("Hello"), "unexpected OCR output: {text:?}");
        Ok(())
    }
}
