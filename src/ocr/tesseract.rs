//! Tesseract OCR engine.

use std::{fs, io::Cursor};

use image::{DynamicImage, ImageFormat};
use tokio::process::Command;

use crate::{
    async_utils::{run_command, spawn_blocking_propagating_panics},
    prelude::*,
};

use super::OcrEngine;

/// OCR engine wrapping the `tesseract` CLI tool.
#[derive(Clone, Debug, Default)]
pub struct TesseractOcrEngine {
    /// Language to pass to `tesseract -l`, such as `eng` or `deu+eng`.
    language: Option<String>,
}

impl TesseractOcrEngine {
    /// Create a new `tesseract` engine.
    pub fn new(language: Option<String>) -> Self {
        Self { language }
    }
}

#[async_trait]
impl OcrEngine for TesseractOcrEngine {
    #[instrument(level = "debug", skip(self, image))]
    async fn recognize(&self, page_idx: usize, image: DynamicImage) -> Result<String> {
        // Re-encode the page for tesseract.
        let png = spawn_blocking_propagating_panics(move || -> Result<Vec<u8>> {
            let mut png = Vec::new();
            image
                .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
                .context("failed to encode page image for tesseract")?;
            Ok(png)
        })
        .await?;

        // Write our input to a temporary file.
        let tmpdir = tempfile::TempDir::with_prefix("tesseract")?;
        let input_path = tmpdir.path().join("input.png");
        let output_path = tmpdir.path().join("output.txt");
        fs::write(&input_path, &png).context("cannot write tesseract input file")?;

        // Run tesseract on the input file. It adds `.txt` to the output name.
        let mut cmd = Command::new("tesseract");
        cmd.arg(&input_path).arg(output_path.with_extension(""));
        if let Some(language) = &self.language {
            cmd.arg("-l").arg(language);
        }
        run_command("tesseract", &mut cmd).await?;

        // Read the output file.
        let text =
            fs::read_to_string(&output_path).context("cannot read tesseract output file")?;
        debug!(page = page_idx + 1, chars = text.chars().count(), "OCR complete");
        Ok(text)
    }
}
