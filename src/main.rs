use std::{
    env,
    ffi::OsString,
    io::{self, Write as _},
    process::ExitCode,
    str::FromStr,
    sync::Arc,
};

use clap::{
    Parser,
    builder::{OsStringValueParser, TypedValueParser as _},
    error::ErrorKind,
};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{
    diagnostics::{Diagnostics, NullDiagnostics, StderrDiagnostics},
    extractor::Extractor,
    ocr::tesseract::TesseractOcrEngine,
    pdf::poppler::PopplerBackend,
    prelude::*,
    report::ExtractionReport,
};

mod async_utils;
mod diagnostics;
mod extractor;
mod ocr;
mod pdf;
mod prelude;
mod report;

/// Extract the text of a PDF as JSON, using OCR for scanned pages.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
External Tools:
  - pdfinfo, pdftotext, pdftocairo (from poppler-utils)
  - tesseract (only needed when OCR is enabled)

Environment Variables:
  - RUST_LOG (optional): Log filter, e.g. `debug`. Defaults to `warn`.

  These variables may be set in a standard `.env` file.

Exactly one PDF path is required. A single argument is always treated as
the path, except for `--help` and `--version`.
"#
)]
struct Opts {
    /// The PDF file to extract text from.
    #[clap(
        allow_hyphen_values = true,
        value_parser = OsStringValueParser::new().map(PathBuf::from)
    )]
    pdf_path: PathBuf,

    /// Never OCR pages, even if they have little or no embedded text.
    #[clap(long)]
    no_ocr: bool,

    /// The tesseract language(s) to use for OCR, such as `eng` or `deu+eng`.
    #[clap(long, value_name = "LANG")]
    ocr_lang: Option<String>,

    /// The user password for an encrypted PDF.
    #[clap(long)]
    password: Option<String>,

    /// Don't print progress notices on standard error.
    #[clap(long)]
    quiet: bool,
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Initialize tracing.
    let directive =
        Directive::from_str("warn").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(io::stderr)
        .with_filter(env_filter);

    // We can stack multiple layers here if we need to.
    tracing_subscriber::registry().with(subscriber).init();

    // Call our real `main` function now that logging is set up.
    real_main().await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main() -> Result<ExitCode> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    // Parse command-line arguments. Callers parse our standard output as
    // JSON, so argument errors are reported there too.
    let args = env::args_os().collect::<Vec<_>>();
    let opts = match parse_opts(&args) {
        Ok(Some(opts)) => opts,
        Ok(None) => {
            print_report(&ExtractionReport::usage())?;
            return Ok(ExitCode::FAILURE);
        }
        Err(err) => err.exit(),
    };
    debug!("Parsed options: {:?}", opts);

    let diagnostics: Arc<dyn Diagnostics> = if opts.quiet {
        Arc::new(NullDiagnostics)
    } else {
        Arc::new(StderrDiagnostics)
    };
    diagnostics.notice(&format!(
        "Starting PDF extraction for: {}",
        opts.pdf_path.display()
    ));

    let extractor = Extractor::new(
        Arc::new(PopplerBackend::new(opts.password.clone())),
        Arc::new(TesseractOcrEngine::new(opts.ocr_lang.clone())),
        diagnostics,
    );
    let report = extractor.extract(&opts.pdf_path, !opts.no_ocr).await;

    // Extraction failures are reported in the JSON, not the exit code.
    print_report(&report)?;
    Ok(ExitCode::SUCCESS)
}

/// Parse our command line, including the program name.
///
/// Returns `Ok(None)` if the arguments can't be used, and `Err` for `--help`
/// and `--version`, which clap should print itself. A lone argument is always
/// a path, even if it looks like an option.
fn parse_opts(args: &[OsString]) -> Result<Option<Opts>, clap::Error> {
    match Opts::try_parse_from(args) {
        Ok(opts) => Ok(Some(opts)),
        Err(err)
            if matches!(
                err.kind(),
                ErrorKind::DisplayHelp
                    | ErrorKind::DisplayVersion
                    | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
            ) =>
        {
            Err(err)
        }
        Err(err) => {
            debug!("Invalid arguments: {}", err);
            match args {
                [_, path] => Ok(Some(Opts::for_path(PathBuf::from(path)))),
                _ => Ok(None),
            }
        }
    }
}

impl Opts {
    /// Default options for extracting `pdf_path`.
    fn for_path(pdf_path: PathBuf) -> Self {
        Self {
            pdf_path,
            no_ocr: false,
            ocr_lang: None,
            password: None,
            quiet: false,
        }
    }
}

/// Print a report to standard output as a single line of JSON.
fn print_report(report: &ExtractionReport) -> Result<()> {
    let line = report.to_json_line()?;
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{}", line).context("cannot write to standard output")?;
    stdout.flush().context("cannot flush standard output")
}
