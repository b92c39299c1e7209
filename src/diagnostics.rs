//! Human-readable progress notices.
//!
//! These go to standard error, one line at a time, so that whoever launched us
//! can watch a long OCR job. Standard output is reserved for the JSON result.

use std::io::{self, Write as _};
#[cfg(test)]
use std::sync::Mutex;

/// Tag at the start of every notice written to standard error.
pub const NOTICE_TAG: &str = "[pdf_parser]";

/// A sink for progress notices.
pub trait Diagnostics: Send + Sync {
    /// Record a single notice.
    fn notice(&self, message: &str);
}

/// Write notices to standard error, flushing after each one.
#[derive(Clone, Copy, Debug, Default)]
pub struct StderrDiagnostics;

impl Diagnostics for StderrDiagnostics {
    fn notice(&self, message: &str) {
        let mut stderr = io::stderr().lock();
        // If stderr is gone there is nobody left to tell.
        let _ = writeln!(stderr, "{} {}", NOTICE_TAG, message);
        let _ = stderr.flush();
    }
}

/// Discard all notices.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullDiagnostics;

impl Diagnostics for NullDiagnostics {
    fn notice(&self, _message: &str) {}
}

/// Keep notices in memory, for tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct CapturedDiagnostics {
    notices: Mutex<Vec<String>>,
}

#[cfg(test)]
impl CapturedDiagnostics {
    /// Create an empty capture buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a copy of all the notices recorded so far.
    pub fn notices(&self) -> Vec<String> {
        match self.notices.lock() {
            Ok(notices) => notices.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[cfg(test)]
impl Diagnostics for CapturedDiagnostics {
    fn notice(&self, message: &str) {
        match self.notices.lock() {
            Ok(mut notices) => notices.push(message.to_owned()),
            Err(poisoned) => poisoned.into_inner().push(message.to_owned()),
        }
    }
}
