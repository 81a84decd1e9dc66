//! Shared CLI utilities for the strata-chat binary.

pub mod history;

use std::io::Write;
use std::path::Path;

use crate::engine::TokenSink;
use crate::error::InferenceError;

pub use history::{load_history, save_history};

/// Initialize tracing/logging to stderr.
///
/// If `disable` is true, no output is produced.
/// Otherwise respects `RUST_LOG` env var, defaulting to WARN.
pub fn init_logging(disable: bool) {
    use tracing_subscriber::EnvFilter;

    if disable {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Read a single-shot prompt from `--prompt` or `--file`.
///
/// Returns `None` when neither is given, which selects interactive mode.
pub fn read_prompt(
    prompt: Option<&str>,
    file: Option<&Path>,
) -> Result<Option<String>, InferenceError> {
    if let Some(text) = prompt {
        return Ok(Some(text.to_string()));
    }

    if let Some(path) = file {
        let text = std::fs::read_to_string(path).map_err(|e| {
            InferenceError::Config(format!("Failed to read file '{}': {}", path.display(), e))
        })?;
        return Ok(Some(text.trim_end_matches(['\r', '\n']).to_string()));
    }

    Ok(None)
}

/// Writes streamed fragments to a terminal or file as they arrive.
///
/// The first write error is kept and later fragments are dropped; the
/// turn itself is not interrupted.
pub struct StreamSink<W: Write> {
    out: W,
    error: Option<std::io::Error>,
}

impl<W: Write> StreamSink<W> {
    pub fn new(out: W) -> Self {
        Self { out, error: None }
    }

    pub fn take_error(&mut self) -> Option<std::io::Error> {
        self.error.take()
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> TokenSink for StreamSink<W> {
    fn on_token(&mut self, fragment: &str) {
        if self.error.is_some() {
            return;
        }
        let result = self
            .out
            .write_all(fragment.as_bytes())
            .and_then(|_| self.out.flush());
        if let Err(e) = result {
            self.error = Some(e);
        }
    }

    fn on_complete(&mut self, _tokens_per_second: f64, _elapsed_seconds: f64) {
        if self.error.is_none() {
            if let Err(e) = writeln!(self.out).and_then(|_| self.out.flush()) {
                self.error = Some(e);
            }
        }
    }
}
