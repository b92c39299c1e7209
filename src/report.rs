//! The JSON record we print when we're done.

use std::io;

use serde::Serialize;
use serde_json::ser::Formatter;

use crate::{pdf::DocumentMetadata, prelude::*};

/// Error message printed when we're called with the wrong arguments.
pub const USAGE_MESSAGE: &str = "Usage: pdf_parser.py <pdf_path>";

/// The result of extracting a document, as printed on standard output.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ExtractionReport {
    /// Did the extraction succeed?
    pub success: bool,

    /// Either the extracted document or an error.
    #[serde(flatten)]
    pub outcome: ExtractionOutcome,
}

impl ExtractionReport {
    /// A successful extraction.
    pub fn success(document: ExtractedDocument) -> Self {
        Self {
            success: true,
            outcome: ExtractionOutcome::Extracted(document),
        }
    }

    /// A failed extraction.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            outcome: ExtractionOutcome::Failed {
                error: error.into(),
            },
        }
    }

    /// The report for a command line we can't understand.
    pub fn usage() -> Self {
        Self::failure(USAGE_MESSAGE)
    }

    /// Serialize as a single line of JSON.
    pub fn to_json_line(&self) -> Result<String> {
        let mut out = Vec::new();
        let mut ser = serde_json::Serializer::with_formatter(&mut out, SpacedFormatter);
        self.serialize(&mut ser)
            .context("failed to serialize extraction report")?;
        String::from_utf8(out).context("serialized report was not valid UTF-8")
    }
}

/// What happened to the document.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ExtractionOutcome {
    /// We extracted the text.
    Extracted(ExtractedDocument),
    /// Something went wrong. No partial text is reported.
    Failed {
        /// The error message, including its causes.
        error: String,
    },
}

/// Text and statistics for a successfully extracted document.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ExtractedDocument {
    /// The text of every page, joined with newlines.
    pub text: String,

    /// The number of pages in the document.
    pub num_pages: usize,

    /// The number of pages we ran OCR on, whether or not we kept the OCR text.
    pub ocr_pages: usize,

    /// The length of `text` in characters.
    pub text_length: usize,

    /// Document properties such as title and author.
    pub metadata: DocumentMetadata,
}

/// A compact JSON formatter which puts a space after `,` and `:` and escapes
/// all non-ASCII characters as `\uXXXX`, so that our output matches what most
/// JSON tools print by default.
struct SpacedFormatter;

impl Formatter for SpacedFormatter {
    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first { Ok(()) } else { writer.write_all(b", ") }
    }

    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first { Ok(()) } else { writer.write_all(b", ") }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(b": ")
    }

    fn write_string_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        let mut start = 0;
        for (idx, ch) in fragment.char_indices() {
            if ch.is_ascii() {
                continue;
            }
            writer.write_all(fragment[start..idx].as_bytes())?;
            // Characters outside the BMP become UTF-16 surrogate pairs.
            let mut units = [0; 2];
            for unit in ch.encode_utf16(&mut units) {
                write!(writer, "\\u{:04x}", unit)?;
            }
            start = idx + ch.len_utf8();
        }
        writer.write_all(fragment[start..].as_bytes())
    }
}
