//! Access to PDF documents.
//!
//! The extractor only needs a handful of operations from a PDF library, so we
//! describe those as traits. This keeps the page loop testable without any
//! external tools installed.

use std::collections::BTreeMap;

use crate::prelude::*;

pub mod poppler;

/// Document properties such as title and author.
pub type DocumentMetadata = BTreeMap<String, String>;

/// Something which can open PDF documents.
#[async_trait]
pub trait PdfBackend: Send + Sync {
    /// Open the PDF at `path`. Fails if the file is missing, unreadable, or
    /// not a PDF.
    async fn open(&self, path: &Path) -> Result<Box<dyn PdfDocument>>;
}

/// An open PDF document.
///
/// Dropping the document releases any resources it holds. [`close`] does the
/// same thing, but reports errors.
///
/// [`close`]: PdfDocument::close
#[async_trait]
pub trait PdfDocument: Send + Sync {
    /// The number of pages in the document.
    fn page_count(&self) -> usize;

    /// Extract the embedded text of a page. `page_idx` is zero-based.
    async fn page_text(&self, page_idx: usize) -> Result<String>;

    /// Render a page as a PNG image, at `scale` times the page's native
    /// resolution of 72 DPI.
    async fn render_page_png(&self, page_idx: usize, scale: f32) -> Result<Vec<u8>>;

    /// Document-level metadata.
    async fn metadata(&self) -> Result<DocumentMetadata>;

    /// Release the document.
    fn close(self: Box<Self>) -> Result<()>;
}
