//! OCR engine interface.

use image::{DynamicImage, ImageFormat};

use crate::{async_utils::spawn_blocking_propagating_panics, prelude::*};

pub mod tesseract;

/// Interface to an OCR engine.
#[async_trait]
pub trait OcrEngine: Send + Sync + 'static {
    /// Recognize the text in a rendered page. `page_idx` is only used for
    /// logging.
    async fn recognize(&self, page_idx: usize, image: DynamicImage) -> Result<String>;
}

/// Decode a rendered PNG page into an image, off the async executor.
#[instrument(level = "debug", skip_all, fields(bytes = png.len()))]
pub async fn decode_png(png: Vec<u8>) -> Result<DynamicImage> {
    spawn_blocking_propagating_panics(move || {
        image::load_from_memory_with_format(&png, ImageFormat::Png)
            .context("failed to decode rendered page image")
    })
    .await
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use image::{GrayImage, Luma};

    use super::*;

    #[tokio::test]
    async fn decode_png_reads_valid_images() -> Result<()> {
        let mut png = Vec::new();
        DynamicImage::ImageLuma8(GrayImage::from_pixel(3, 2, Luma([255])))
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)?;
        let image = decode_png(png).await?;
        assert_eq!((image.width(), image.height()), (3, 2));
        Ok(())
    }

    #[tokio::test]
    async fn decode_png_rejects_garbage() {
        let err = decode_png(b"not a png".to_vec()).await.unwrap_err();
        assert!(err.to_string().contains("failed to decode rendered page image"));
    }
}
