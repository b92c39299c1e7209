//! Asynchronous utilities for use with Tokio.
//!
//! Everything slow we do happens in external processes (`poppler-utils` and
//! `tesseract`) or in CPU-bound image code. This module keeps the plumbing for
//! both in one place.

use std::{process::Output, sync::LazyLock};

use anyhow::anyhow;
use regex::Regex;
use tokio::process::Command;

use crate::prelude::*;

/// A default error regex for checking command output.
pub static DEFAULT_ERROR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)error").expect("failed to compile regex"));

/// Run `cmd` to completion, capturing its output, and fail if it exits with
/// a non-zero status.
#[instrument(level = "debug", skip(cmd))]
pub async fn run_command(command_name: &str, cmd: &mut Command) -> Result<Output> {
    let output = cmd
        .output()
        .await
        .with_context(|| format!("failed to run {}", command_name))?;
    check_for_command_failure(command_name, &output)?;
    Ok(output)
}

/// Report any command failures, and include any error output.
///
/// The output of standard error and standard output will be logged at
/// appropriate levels. Lines of standard error matching
/// [`DEFAULT_ERROR_REGEX`] are logged as warnings, but only the exit status
/// decides whether the command failed. Poppler in particular prints "Syntax
/// Error" for damaged files that it then repairs just fine.
pub fn check_for_command_failure(command_name: &str, output: &Output) -> Result<()> {
    let stderr = String::from_utf8_lossy(&output.stderr);
    trace!(
        command_name = command_name,
        bytes = output.stdout.len(),
        "Standard output from command"
    );
    for line in stderr.lines() {
        if DEFAULT_ERROR_REGEX.is_match(line) {
            warn!(command_name = command_name, "{}", line.trim());
        } else if !line.trim().is_empty() {
            debug!(command_name = command_name, "{}", line.trim());
        }
    }

    if output.status.success() {
        Ok(())
    } else if let Some(exit_code) = output.status.code() {
        Err(anyhow!(
            "{} failed with exit code {} and error output:\n{}",
            command_name,
            exit_code,
            stderr.trim_end(),
        ))
    } else {
        Err(anyhow!(
            "{} failed with error output:\n{}",
            command_name,
            stderr.trim_end(),
        ))
    }
}

/// Wrapper around [`tokio::task::spawn_blocking`] that propagates panics from
/// the background task.
pub async fn spawn_blocking_propagating_panics<F, T>(f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(value) => value,
        Err(err) => std::panic::resume_unwind(err.into_panic()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_command_reports_exit_code() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo 'broken pipe' >&2; exit 3");
        let err = run_command("sh", &mut cmd).await.unwrap_err();
        let msg = format!("{:#}", err);
        assert!(msg.contains("sh failed with exit code 3"), "{}", msg);
        assert!(msg.contains("broken pipe"), "{}", msg);
    }

    #[tokio::test]
    async fn run_command_ignores_error_text_on_success() -> Result<()> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo 'Syntax Error: bad xref' >&2; echo ok");
        let output = run_command("sh", &mut cmd).await?;
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "ok");
        Ok(())
    }

    #[tokio::test]
    async fn run_command_reports_missing_binary() {
        let mut cmd = Command::new("definitely-not-a-real-command-1234");
        let err = run_command("definitely-not-a-real-command-1234", &mut cmd)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to run"));
    }
}
