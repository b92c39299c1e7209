//! Extract text from a PDF, one page at a time, using OCR for pages that
//! appear to be scanned images.

use std::sync::Arc;

use crate::{
    diagnostics::Diagnostics,
    ocr::{OcrEngine, decode_png},
    pdf::{PdfBackend, PdfDocument},
    prelude::*,
    report::{ExtractedDocument, ExtractionReport},
};

/// Pages with fewer than this many characters of embedded text (ignoring
/// surrounding whitespace) are sent to OCR.
pub const OCR_TEXT_THRESHOLD: usize = 50;

/// Scale factor for rendering pages before OCR, on both axes.
pub const OCR_RENDER_SCALE: f32 = 2.0;

/// Report progress on the first page and every this many pages.
const PAGE_NOTICE_INTERVAL: usize = 10;

/// Report OCR activity on the first OCR page and every this many OCR pages.
const OCR_NOTICE_INTERVAL: usize = 5;

/// The text we settled on for a single page.
#[derive(Debug)]
struct PageText {
    /// Zero-based page index.
    page_idx: usize,
    /// The final text of the page.
    text: String,
    /// Did we run OCR on this page?
    used_ocr: bool,
}

/// Extracts text from PDFs.
#[derive(Clone)]
pub struct Extractor {
    backend: Arc<dyn PdfBackend>,
    ocr_engine: Arc<dyn OcrEngine>,
    diagnostics: Arc<dyn Diagnostics>,
}

impl Extractor {
    /// Create a new extractor.
    pub fn new(
        backend: Arc<dyn PdfBackend>,
        ocr_engine: Arc<dyn OcrEngine>,
        diagnostics: Arc<dyn Diagnostics>,
    ) -> Self {
        Self {
            backend,
            ocr_engine,
            diagnostics,
        }
    }

    /// Extract the text of the PDF at `path`, running OCR on sparse pages if
    /// `use_ocr` is set.
    ///
    /// This never fails. If anything goes wrong, we return a failure report
    /// and no partial text.
    #[instrument(level = "debug", skip(self, path), fields(path = %path.display()))]
    pub async fn extract(&self, path: &Path, use_ocr: bool) -> ExtractionReport {
        match self.extract_document(path, use_ocr).await {
            Ok(document) => ExtractionReport::success(document),
            Err(err) => {
                let message = format!("{:#}", err);
                self.notice(&format!("ERROR: {}", message));
                ExtractionReport::failure(message)
            }
        }
    }

    /// Perform actual work for [`Extractor::extract`].
    async fn extract_document(
        &self,
        path: &Path,
        use_ocr: bool,
    ) -> Result<ExtractedDocument> {
        self.notice(&format!("Opening PDF: {}", path.display()));
        let document = self.backend.open(path).await?;
        let num_pages = document.page_count();
        self.notice(&format!("PDF has {} pages", num_pages));

        let mut ocr_pages = 0;
        let mut pages = Vec::with_capacity(num_pages);
        for page_idx in 0..num_pages {
            let page = self
                .extract_page(document.as_ref(), page_idx, use_ocr, &mut ocr_pages)
                .await?;
            trace!(page = page.page_idx + 1, used_ocr = page.used_ocr, "page done");
            pages.push(page);
        }
        self.notice(&format!(
            "Completed processing all {} pages ({} required OCR)",
            num_pages, ocr_pages
        ));

        let text = pages
            .into_iter()
            .map(|page| page.text)
            .collect::<Vec<_>>()
            .join("\n");
        let metadata = document.metadata().await?;
        document.close()?;

        let text_length = text.chars().count();
        self.notice(&format!("Extracted {} characters total", text_length));

        Ok(ExtractedDocument {
            text,
            num_pages,
            ocr_pages,
            text_length,
            metadata,
        })
    }

    /// Get the text for a single page, falling back to OCR if the page has
    /// very little embedded text.
    #[instrument(level = "debug", skip(self, document, ocr_pages))]
    async fn extract_page(
        &self,
        document: &dyn PdfDocument,
        page_idx: usize,
        use_ocr: bool,
        ocr_pages: &mut usize,
    ) -> Result<PageText> {
        let num_pages = document.page_count();
        let page_number = page_idx + 1;
        let text = document.page_text(page_idx).await?;

        if page_number % PAGE_NOTICE_INTERVAL == 0 || page_idx == 0 {
            self.notice(&format!(
                "Processing page {}/{} (OCR pages so far: {})",
                page_number, num_pages, ocr_pages
            ));
        }

        if !use_ocr || trimmed_len(&text) >= OCR_TEXT_THRESHOLD {
            return Ok(PageText {
                page_idx,
                text,
                used_ocr: false,
            });
        }

        *ocr_pages += 1;
        if *ocr_pages % OCR_NOTICE_INTERVAL == 1 {
            self.notice(&format!(
                "Running OCR on page {} (total OCR pages: {})",
                page_number, ocr_pages
            ));
        }

        let png = document
            .render_page_png(page_idx, OCR_RENDER_SCALE)
            .await
            .with_context(|| format!("failed to render page {}", page_number))?;
        let image = decode_png(png).await?;
        let ocr_text = self
            .ocr_engine
            .recognize(page_idx, image)
            .await
            .with_context(|| format!("failed to OCR page {}", page_number))?;

        Ok(PageText {
            page_idx,
            text: choose_page_text(text, ocr_text),
            used_ocr: true,
        })
    }

    /// Send a progress notice.
    fn notice(&self, message: &str) {
        self.diagnostics.notice(message);
    }
}

/// The length of `text` in characters, ignoring leading and trailing
/// whitespace.
fn trimmed_len(text: &str) -> usize {
    text.trim().chars().count()
}

/// Keep the OCR text only if it is strictly longer than the embedded text.
fn choose_page_text(embedded: String, ocr: String) -> String {
    if trimmed_len(&ocr) > trimmed_len(&embedded) {
        ocr
    } else {
        embedded
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        io::Cursor,
        sync::{
            Mutex,
            atomic::{AtomicBool, AtomicUsize, Ordering},
        },
    };

    use anyhow::anyhow;
    use image::{DynamicImage, GrayImage, ImageFormat, Luma};

    use super::*;
    use crate::{
        diagnostics::{CapturedDiagnostics, NullDiagnostics},
        pdf::DocumentMetadata,
        report::ExtractionOutcome,
    };

    const DENSE: &str = "This page has plenty of embedded text, easily more than fifty characters.";

    /// A tiny PNG that our fake documents render for every page.
    fn blank_png() -> Vec<u8> {
        let mut png = Vec::new();
        DynamicImage::ImageLuma8(GrayImage::from_pixel(2, 2, Luma([255])))
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .expect("failed to encode test PNG");
        png
    }

    /// An in-memory PDF.
    #[derive(Clone, Default)]
    struct FakeBackend {
        pages: Vec<String>,
        render_garbage: bool,
        closed: Arc<AtomicBool>,
        renders: Arc<Mutex<Vec<(usize, f32)>>>,
    }

    impl FakeBackend {
        fn new(pages: &[&str]) -> Self {
            Self {
                pages: pages.iter().map(|p| p.to_string()).collect(),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl PdfBackend for FakeBackend {
        async fn open(&self, path: &Path) -> Result<Box<dyn PdfDocument>> {
            if path == Path::new("missing.pdf") {
                return Err(anyhow!("no such file: {:?}", path.display()));
            }
            Ok(Box::new(FakeDocument {
                backend: self.clone(),
            }))
        }
    }

    struct FakeDocument {
        backend: FakeBackend,
    }

    #[async_trait]
    impl PdfDocument for FakeDocument {
        fn page_count(&self) -> usize {
            self.backend.pages.len()
        }

        async fn page_text(&self, page_idx: usize) -> Result<String> {
            Ok(self.backend.pages[page_idx].clone())
        }

        async fn render_page_png(&self, page_idx: usize, scale: f32) -> Result<Vec<u8>> {
            self.backend
                .renders
                .lock()
                .expect("lock poisoned")
                .push((page_idx, scale));
            if self.backend.render_garbage {
                Ok(b"not a png".to_vec())
            } else {
                Ok(blank_png())
            }
        }

        async fn metadata(&self) -> Result<DocumentMetadata> {
            let mut metadata = DocumentMetadata::new();
            metadata.insert("title".to_owned(), "Fake".to_owned());
            Ok(metadata)
        }

        fn close(self: Box<Self>) -> Result<()> {
            self.backend.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    /// OCR engine returning canned answers in order.
    #[derive(Default)]
    struct FakeOcr {
        answers: Mutex<VecDeque<Result<String>>>,
        calls: AtomicUsize,
    }

    impl FakeOcr {
        fn new(answers: impl IntoIterator<Item = Result<String>>) -> Self {
            Self {
                answers: Mutex::new(answers.into_iter().collect()),
                calls: AtomicUsize::new(0),
            }
        }

        fn always(text: &str) -> Self {
            Self::new((0..100).map(|_| Ok(text.to_owned())))
        }
    }

    #[async_trait]
    impl OcrEngine for FakeOcr {
        async fn recognize(&self, _page_idx: usize, _image: DynamicImage) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answers
                .lock()
                .expect("lock poisoned")
                .pop_front()
                .unwrap_or_else(|| Ok(String::new()))
        }
    }

    fn extractor(backend: &FakeBackend, ocr: Arc<FakeOcr>) -> Extractor {
        Extractor::new(Arc::new(backend.clone()), ocr, Arc::new(NullDiagnostics))
    }

    fn extracted(report: ExtractionReport) -> ExtractedDocument {
        assert!(report.success, "{:?}", report);
        match report.outcome {
            ExtractionOutcome::Extracted(document) => document,
            ExtractionOutcome::Failed { error } => panic!("unexpected failure: {}", error),
        }
    }

    fn failed(report: ExtractionReport) -> String {
        assert!(!report.success, "{:?}", report);
        match report.outcome {
            ExtractionOutcome::Failed { error } => error,
            ExtractionOutcome::Extracted(document) => {
                panic!("unexpected success: {:?}", document)
            }
        }
    }

    #[tokio::test]
    async fn without_ocr_pages_are_joined_unchanged() {
        let backend = FakeBackend::new(&["  first\n", "", "third page"]);
        let ocr = Arc::new(FakeOcr::always("should never be used"));
        let document = extracted(
            extractor(&backend, ocr.clone())
                .extract(Path::new("doc.pdf"), false)
                .await,
        );
        assert_eq!(document.text, "  first\n\n\nthird page");
        assert_eq!(document.ocr_pages, 0);
        assert_eq!(document.num_pages, 3);
        assert_eq!(document.metadata["title"], "Fake");
        assert_eq!(ocr.calls.load(Ordering::SeqCst), 0);
        assert!(backend.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn dense_pages_are_unaffected_by_ocr() {
        let backend = FakeBackend::new(&[DENSE, DENSE]);
        let with_ocr = extracted(
            extractor(&backend, Arc::new(FakeOcr::always(&DENSE.repeat(3))))
                .extract(Path::new("doc.pdf"), true)
                .await,
        );
        let without_ocr = extracted(
            extractor(&backend, Arc::new(FakeOcr::always("")))
                .extract(Path::new("doc.pdf"), false)
                .await,
        );
        assert_eq!(with_ocr, without_ocr);
        assert_eq!(with_ocr.ocr_pages, 0);
        assert!(backend.renders.lock().expect("lock poisoned").is_empty());
    }

    #[tokio::test]
    async fn sparse_page_uses_longer_ocr_text() {
        let backend = FakeBackend::new(&[DENSE, "Fig. 1", DENSE]);
        let ocr = Arc::new(FakeOcr::always("A scanned paragraph of text."));
        let document = extracted(
            extractor(&backend, ocr.clone())
                .extract(Path::new("doc.pdf"), true)
                .await,
        );
        assert_eq!(document.ocr_pages, 1);
        assert_eq!(
            document.text,
            format!("{}\nA scanned paragraph of text.\n{}", DENSE, DENSE)
        );
        assert_eq!(ocr.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            *backend.renders.lock().expect("lock poisoned"),
            vec![(1, OCR_RENDER_SCALE)]
        );
    }

    #[tokio::test]
    async fn sparse_page_keeps_embedded_text_on_ties_and_shorter_ocr() {
        let backend = FakeBackend::new(&["abcd", "  wxyz  ", "longer text"]);
        let ocr = Arc::new(FakeOcr::new([
            Ok("ab".to_owned()),
            Ok("\n1234\n".to_owned()),
            Ok("".to_owned()),
        ]));
        let document = extracted(
            extractor(&backend, ocr)
                .extract(Path::new("doc.pdf"), true)
                .await,
        );
        // Every sparse page counts as an OCR page, even when OCR loses.
        assert_eq!(document.ocr_pages, 3);
        assert_eq!(document.text, "abcd\n  wxyz  \nlonger text");
    }

    #[tokio::test]
    async fn threshold_is_exactly_fifty_characters() {
        let just_enough = "x".repeat(OCR_TEXT_THRESHOLD);
        let not_enough = format!("  {}  ", "y".repeat(OCR_TEXT_THRESHOLD - 1));
        let backend = FakeBackend::new(&[just_enough.as_str(), not_enough.as_str()]);
        let document = extracted(
            extractor(&backend, Arc::new(FakeOcr::always("z")))
                .extract(Path::new("doc.pdf"), true)
                .await,
        );
        assert_eq!(document.ocr_pages, 1);
        assert_eq!(*backend.renders.lock().expect("lock poisoned"), vec![(1, 2.0)]);
    }

    #[tokio::test]
    async fn text_length_counts_characters() {
        let backend = FakeBackend::new(&["naïve café ü", "日本語"]);
        let document = extracted(
            extractor(&backend, Arc::new(FakeOcr::default()))
                .extract(Path::new("doc.pdf"), false)
                .await,
        );
        assert_eq!(document.text_length, document.text.chars().count());
        assert_eq!(document.text_length, 16);
        assert!(document.text.len() > document.text_length);
    }

    #[tokio::test]
    async fn empty_document_has_empty_text() {
        let backend = FakeBackend::new(&[]);
        let document = extracted(
            extractor(&backend, Arc::new(FakeOcr::default()))
                .extract(Path::new("doc.pdf"), true)
                .await,
        );
        assert_eq!(document.num_pages, 0);
        assert_eq!(document.text, "");
        assert_eq!(document.text_length, 0);
    }

    #[tokio::test]
    async fn open_failure_becomes_failure_report() {
        let backend = FakeBackend::new(&[DENSE]);
        let error = failed(
            extractor(&backend, Arc::new(FakeOcr::default()))
                .extract(Path::new("missing.pdf"), true)
                .await,
        );
        assert!(error.contains("no such file"), "{}", error);
    }

    #[tokio::test]
    async fn ocr_failure_aborts_whole_document() {
        let backend = FakeBackend::new(&[DENSE, "", "", DENSE]);
        let ocr = Arc::new(FakeOcr::new([
            Ok("recognized".to_owned()),
            Err(anyhow!("tesseract exploded")),
        ]));
        let error = failed(
            extractor(&backend, ocr)
                .extract(Path::new("doc.pdf"), true)
                .await,
        );
        assert!(error.contains("failed to OCR page 3"), "{}", error);
        assert!(error.contains("tesseract exploded"), "{}", error);
        // The document was dropped without reaching `close`.
        assert!(!backend.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn undecodable_render_aborts_extraction() {
        let backend = FakeBackend {
            render_garbage: true,
            ..FakeBackend::new(&["short"])
        };
        let error = failed(
            extractor(&backend, Arc::new(FakeOcr::always("text")))
                .extract(Path::new("doc.pdf"), true)
                .await,
        );
        assert!(error.contains("failed to decode rendered page image"), "{}", error);
    }

    #[tokio::test]
    async fn extraction_is_idempotent() {
        let backend = FakeBackend::new(&[DENSE, "", "tiny"]);
        let extractor = extractor(&backend, Arc::new(FakeOcr::always("same OCR text")));
        let first = extracted(extractor.extract(Path::new("doc.pdf"), true).await);
        let second = extracted(extractor.extract(Path::new("doc.pdf"), true).await);
        assert_eq!(first.text, second.text);
    }

    #[tokio::test]
    async fn notices_follow_page_and_ocr_schedule() {
        // 12 sparse pages: progress on pages 1 and 10, OCR on OCR pages 1, 6, 11.
        let pages = vec![""; 12];
        let backend = FakeBackend::new(&pages);
        let diagnostics = Arc::new(CapturedDiagnostics::new());
        let extractor = Extractor::new(
            Arc::new(backend),
            Arc::new(FakeOcr::default()),
            diagnostics.clone(),
        );
        let document = extracted(extractor.extract(Path::new("scan.pdf"), true).await);
        assert_eq!(document.ocr_pages, 12);
        assert_eq!(
            diagnostics.notices(),
            vec![
                "Opening PDF: scan.pdf",
                "PDF has 12 pages",
                "Processing page 1/12 (OCR pages so far: 0)",
                "Running OCR on page 1 (total OCR pages: 1)",
                "Running OCR on page 6 (total OCR pages: 6)",
                "Processing page 10/12 (OCR pages so far: 9)",
                "Running OCR on page 11 (total OCR pages: 11)",
                "Completed processing all 12 pages (12 required OCR)",
                "Extracted 11 characters total",
            ]
        );
    }

    #[tokio::test]
    async fn failure_emits_error_notice() {
        let diagnostics = Arc::new(CapturedDiagnostics::new());
        let extractor = Extractor::new(
            Arc::new(FakeBackend::default()),
            Arc::new(FakeOcr::default()),
            diagnostics.clone(),
        );
        failed(extractor.extract(Path::new("missing.pdf"), true).await);
        assert_eq!(
            diagnostics.notices(),
            vec![
                "Opening PDF: missing.pdf",
                "ERROR: no such file: \"missing.pdf\"",
            ]
        );
    }
}
