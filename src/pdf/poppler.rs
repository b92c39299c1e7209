//! PDF access using the `poppler-utils` command-line tools.

use std::collections::BTreeMap;

use anyhow::anyhow;
use tokio::{fs, process::Command, sync::OnceCell};

use crate::{async_utils::run_command, prelude::*};

use super::{DocumentMetadata, PdfBackend, PdfDocument};

/// The MIME type we require for input files.
const PDF_MIME_TYPE: &str = "application/pdf";

/// The resolution of PDF user space, in dots per inch.
const NATIVE_DPI: f32 = 72.0;

/// Metadata keys we always report, in the naming used by most PDF libraries,
/// along with the `pdfinfo` property that supplies each one.
const METADATA_KEYS: &[(&str, Option<&str>)] = &[
    ("format", None),
    ("title", Some("Title")),
    ("author", Some("Author")),
    ("subject", Some("Subject")),
    ("keywords", Some("Keywords")),
    ("creator", Some("Creator")),
    ("producer", Some("Producer")),
    ("creationDate", Some("CreationDate")),
    ("modDate", Some("ModDate")),
    ("trapped", None),
    ("encryption", None),
];

/// Opens PDFs using `pdfinfo`, `pdftotext` and `pdftocairo`.
#[derive(Clone, Debug, Default)]
pub struct PopplerBackend {
    /// The user password for encrypted PDFs, if any.
    password: Option<String>,
}

impl PopplerBackend {
    /// Create a new backend. `password` is passed to every poppler tool.
    pub fn new(password: Option<String>) -> Self {
        Self { password }
    }
}

#[async_trait]
impl PdfBackend for PopplerBackend {
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    async fn open(&self, path: &Path) -> Result<Box<dyn PdfDocument>> {
        // Make sure we can actually read the file before we try anything else,
        // so that a missing file gets a clear error.
        fs::File::open(path)
            .await
            .with_context(|| format!("cannot open {:?}", path.display()))?;

        let mime_type = get_mime_type(path)?;
        if mime_type != PDF_MIME_TYPE {
            return Err(anyhow!(
                "{:?} is not a PDF file (detected {})",
                path.display(),
                mime_type
            ));
        }

        let properties = read_pdfinfo(path, self.password.as_deref()).await?;
        let page_count = page_count_from_properties(&properties).with_context(|| {
            format!("failed to get page count for {:?}", path.display())
        })?;

        // Scratch space for rasterized pages.
        let tmpdir = tempfile::TempDir::with_prefix("pdf-parser")
            .context("cannot create temporary directory")?;

        Ok(Box::new(PopplerDocument {
            path: path.to_owned(),
            password: self.password.clone(),
            page_count,
            properties,
            page_texts: OnceCell::new(),
            tmpdir: Some(tmpdir),
        }))
    }
}

/// A PDF opened by [`PopplerBackend`].
struct PopplerDocument {
    /// The path to the PDF.
    path: PathBuf,
    /// The user password, if any.
    password: Option<String>,
    /// The number of pages reported by `pdfinfo`.
    page_count: usize,
    /// Raw `pdfinfo` properties.
    properties: BTreeMap<String, String>,
    /// The text of every page, read by a single `pdftotext` run the first
    /// time any page is requested.
    page_texts: OnceCell<Vec<String>>,
    /// Temporary directory for rendered pages. Released by [`Drop`] or
    /// [`PdfDocument::close`].
    tmpdir: Option<tempfile::TempDir>,
}

impl PopplerDocument {
    /// Make sure `page_idx` is a page of this document.
    fn check_page(&self, page_idx: usize) -> Result<()> {
        if page_idx >= self.page_count {
            return Err(anyhow!(
                "page {} out of range (document has {} pages)",
                page_idx + 1,
                self.page_count
            ));
        }
        Ok(())
    }

    /// Build a poppler command, passing along our password.
    fn command(&self, program: &str) -> Command {
        let mut cmd = Command::new(program);
        if let Some(password) = &self.password {
            cmd.arg("-upw").arg(password);
        }
        cmd
    }

    /// Build a poppler command restricted to a single page.
    fn page_command(&self, program: &str, page_idx: usize) -> Result<Command> {
        self.check_page(page_idx)?;
        // The poppler tools use 1-based, inclusive page ranges.
        let page_number = (page_idx + 1).to_string();
        let mut cmd = self.command(program);
        cmd.arg("-f").arg(&page_number).arg("-l").arg(&page_number);
        Ok(cmd)
    }

    /// Extract the text of the whole document in one pass.
    #[instrument(level = "debug", skip_all, fields(path = %self.path.display()))]
    async fn read_page_texts(&self) -> Result<Vec<String>> {
        let mut cmd = self.command("pdftotext");
        cmd.arg("-enc").arg("UTF-8").arg(&self.path).arg("-");
        let output = run_command("pdftotext", &mut cmd).await?;
        let text = String::from_utf8(output.stdout)
            .context("pdftotext output was not valid UTF-8")?;
        split_page_texts(&text, self.page_count)
    }
}

#[async_trait]
impl PdfDocument for PopplerDocument {
    fn page_count(&self) -> usize {
        self.page_count
    }

    #[instrument(level = "debug", skip(self), fields(path = %self.path.display()))]
    async fn page_text(&self, page_idx: usize) -> Result<String> {
        self.check_page(page_idx)?;
        let page_texts = self
            .page_texts
            .get_or_try_init(|| self.read_page_texts())
            .await?;
        Ok(page_texts[page_idx].clone())
    }

    #[instrument(level = "debug", skip(self), fields(path = %self.path.display()))]
    async fn render_page_png(&self, page_idx: usize, scale: f32) -> Result<Vec<u8>> {
        let tmpdir = self
            .tmpdir
            .as_ref()
            .ok_or_else(|| anyhow!("document has already been closed"))?;

        // pdftocairo adds the `.png` extension itself.
        let out_prefix = tmpdir.path().join(format!("page-{:05}", page_idx + 1));
        let out_path = out_prefix.with_extension("png");

        let mut cmd = self.page_command("pdftocairo", page_idx)?;
        cmd.arg("-png")
            .arg("-singlefile")
            .arg("-r")
            .arg((NATIVE_DPI * scale).to_string())
            .arg(&self.path)
            .arg(&out_prefix);
        run_command("pdftocairo", &mut cmd).await?;

        let bytes = fs::read(&out_path)
            .await
            .with_context(|| format!("failed to read file {:?}", out_path.display()))?;
        // Delete the file to recover space a bit early.
        fs::remove_file(&out_path)
            .await
            .with_context(|| format!("failed to delete file {:?}", out_path.display()))?;
        Ok(bytes)
    }

    async fn metadata(&self) -> Result<DocumentMetadata> {
        Ok(metadata_from_properties(&self.properties))
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        if let Some(tmpdir) = self.tmpdir.take() {
            let tmpdir_path = tmpdir.path().to_owned();
            tmpdir.close().with_context(|| {
                format!(
                    "failed to delete temporary directory {:?}",
                    tmpdir_path.display()
                )
            })?;
        }
        Ok(())
    }
}

impl Drop for PopplerDocument {
    fn drop(&mut self) {
        // Delete our temporary directory, if we still have one.
        if let Some(tmpdir) = self.tmpdir.take() {
            let tmpdir_path = tmpdir.path().to_owned();
            if let Err(err) = tmpdir.close() {
                error!(
                    directory = ?tmpdir_path.display(),
                    "failed to delete temporary directory: {}",
                    err
                );
            }
        }
    }
}

/// Get the MIME type of a file.
pub fn get_mime_type(path: &Path) -> Result<String> {
    Ok(infer::get_from_path(path)
        .with_context(|| format!("failed to get MIME type for {:?}", path.display()))?
        .ok_or_else(|| anyhow!("unknown MIME type for {:?}", path.display()))?
        .mime_type()
        .to_string())
}

/// Split `pdftotext` output into pages. Every page ends with a form feed.
fn split_page_texts(text: &str, page_count: usize) -> Result<Vec<String>> {
    let mut pages = text.split('\x0c').map(str::to_owned).collect::<Vec<_>>();
    if pages.last().is_some_and(|last| last.is_empty()) {
        pages.pop();
    }
    if pages.len() != page_count {
        return Err(anyhow!(
            "pdftotext returned {} pages, but pdfinfo reported {}",
            pages.len(),
            page_count
        ));
    }
    Ok(pages)
}

/// Run `pdfinfo` and collect its `Key: value` properties.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
async fn read_pdfinfo(
    path: &Path,
    password: Option<&str>,
) -> Result<BTreeMap<String, String>> {
    let mut cmd = Command::new("pdfinfo");
    cmd.arg("-rawdates").arg("-enc").arg("UTF-8");
    if let Some(password) = password {
        cmd.arg("-upw").arg(password);
    }
    cmd.arg(path);
    let output = run_command("pdfinfo", &mut cmd).await?;
    let output =
        String::from_utf8(output.stdout).context("pdfinfo output was not valid UTF-8")?;
    Ok(parse_pdfinfo_output(&output))
}

/// Parse the output of `pdfinfo` into properties.
fn parse_pdfinfo_output(output: &str) -> BTreeMap<String, String> {
    let mut properties = BTreeMap::new();
    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        properties.insert(key.trim().to_string(), value.trim().to_string());
    }
    properties
}

/// Get the number of pages from `pdfinfo` properties.
fn page_count_from_properties(properties: &BTreeMap<String, String>) -> Result<usize> {
    let page_count_str = properties
        .get("Pages")
        .ok_or_else(|| anyhow!("failed to find page count in pdfinfo output"))?;
    page_count_str
        .parse::<usize>()
        .with_context(|| format!("failed to parse page count {:?}", page_count_str))
}

/// Map `pdfinfo` properties onto our standard metadata keys.
fn metadata_from_properties(properties: &BTreeMap<String, String>) -> DocumentMetadata {
    let mut metadata = DocumentMetadata::new();
    for &(key, property) in METADATA_KEYS {
        let value = match (key, property) {
            (_, Some(property)) => properties.get(property).cloned(),
            ("format", None) => properties
                .get("PDF version")
                .map(|version| format!("PDF {}", version)),
            ("encryption", None) => properties
                .get("Encrypted")
                .filter(|encrypted| encrypted.starts_with("yes"))
                .map(|encrypted| {
                    encrypted
                        .trim_start_matches("yes")
                        .trim()
                        .trim_start_matches('(')
                        .trim_end_matches(')')
                        .to_owned()
                }),
            _ => None,
        };
        metadata.insert(key.to_owned(), value.unwrap_or_default());
    }
    metadata
}
