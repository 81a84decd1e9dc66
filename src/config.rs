//! Session configuration.
//!
//! Values come from (lowest to highest precedence): built-in defaults, a JSON
//! file, `STRATA_*` environment variables, and finally whatever the caller
//! sets explicitly (CLI flags, host parameters).

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::InferenceError;

/// Default context window, in tokens.
pub const DEFAULT_CONTEXT_SIZE: usize = 2048;
/// Default number of CPU threads used by the engine.
pub const DEFAULT_THREADS: usize = 4;
/// Default cap on generated tokens per turn.
pub const DEFAULT_MAX_NEW_TOKENS: usize = 256;

/// Sampling parameters for one generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    /// Temperature for logit scaling. 0.0 = greedy (argmax).
    pub temperature: f32,
    /// Top-K: keep only the top-k highest probability tokens. 0 = disabled.
    pub top_k: usize,
    /// Top-P (nucleus): cumulative probability cutoff. 1.0 = disabled.
    pub top_p: f32,
    /// Min-P: drop tokens less likely than `min_p` times the best one. 0.0 = disabled.
    pub min_p: f32,
    /// Repetition penalty over recent tokens. 1.0 = disabled.
    pub repeat_penalty: f32,
    /// How many recent tokens the penalties look at.
    pub penalty_last_n: usize,
    /// Subtracted once per previous occurrence. 0.0 = disabled.
    pub frequency_penalty: f32,
    /// Subtracted once if the token occurred at all. 0.0 = disabled.
    pub presence_penalty: f32,
    /// Random seed for reproducibility. `None` picks a fresh seed per turn.
    pub seed: Option<u64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            top_k: 40,
            top_p: 0.95,
            min_p: 0.05,
            repeat_penalty: 1.0,
            penalty_last_n: 64,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            seed: None,
        }
    }
}

impl SamplingParams {
    /// Greedy decoding: always pick the most likely token.
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), InferenceError> {
        let bad = |what: String| Err(InferenceError::SamplerInit(what));
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return bad(format!("temperature must be >= 0, got {}", self.temperature));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return bad(format!("top_p must be in (0, 1], got {}", self.top_p));
        }
        if !(0.0..=1.0).contains(&self.min_p) {
            return bad(format!("min_p must be in [0, 1], got {}", self.min_p));
        }
        if !self.repeat_penalty.is_finite() || self.repeat_penalty <= 0.0 {
            return bad(format!("repeat_penalty must be > 0, got {}", self.repeat_penalty));
        }
        if !self.frequency_penalty.is_finite() || !self.presence_penalty.is_finite() {
            return bad("frequency/presence penalties must be finite".to_string());
        }
        Ok(())
    }
}

/// What to do when the formatted conversation no longer fits the window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Fail the turn with [`InferenceError::ContextOverflow`].
    #[default]
    Fail,
    /// Leave the oldest turns out of the prompt until it fits. The stored
    /// history is not modified.
    DropOldestTurns,
}

/// Configuration for one chat session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Context window in tokens.
    pub context_size: usize,
    /// CPU threads for evaluation.
    pub threads: usize,
    /// Largest prefill chunk. `None` = the context size.
    pub batch_size: Option<usize>,
    /// Maximum tokens generated per turn.
    pub max_new_tokens: usize,
    /// Optional system prompt rendered ahead of the conversation.
    pub system_prompt: Option<String>,
    /// Chat template override: a template string or a family name.
    pub chat_template: Option<String>,
    pub overflow: OverflowPolicy,
    /// Default sampling parameters for blocking predictions.
    pub sampling: SamplingParams,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            context_size: DEFAULT_CONTEXT_SIZE,
            threads: DEFAULT_THREADS,
            batch_size: None,
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
            system_prompt: None,
            chat_template: None,
            overflow: OverflowPolicy::Fail,
            sampling: SamplingParams::default(),
        }
    }
}

impl SessionConfig {
    /// Parse a JSON configuration. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, InferenceError> {
        let config: SessionConfig = serde_json::from_str(json)?;
        Ok(config)
    }

    /// Load a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, InferenceError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            InferenceError::Config(format!("failed to read '{}': {}", path.display(), e))
        })?;
        debug!(path = %path.display(), "Loaded session config");
        Self::from_json_str(&text)
    }

    /// Apply `STRATA_CTX_SIZE`, `STRATA_THREADS` and `STRATA_MAX_TOKENS`.
    pub fn apply_env_overrides(&mut self) -> Result<(), InferenceError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), InferenceError> {
        let parse = |key: &str| -> Result<Option<usize>, InferenceError> {
            match lookup(key) {
                Some(raw) => raw.trim().parse::<usize>().map(Some).map_err(|_| {
                    InferenceError::Config(format!("{} must be a positive integer, got '{}'", key, raw))
                }),
                None => Ok(None),
            }
        };

        if let Some(v) = parse("STRATA_CTX_SIZE")? {
            self.context_size = v;
        }
        if let Some(v) = parse("STRATA_THREADS")? {
            self.threads = v;
        }
        if let Some(v) = parse("STRATA_MAX_TOKENS")? {
            self.max_new_tokens = v;
        }
        Ok(())
    }

    /// Effective prefill chunk size.
    pub fn effective_batch_size(&self) -> usize {
        self.batch_size
            .unwrap_or(self.context_size)
            .min(self.context_size)
    }

    pub fn validate(&self) -> Result<(), InferenceError> {
        if self.context_size == 0 {
            return Err(InferenceError::Config("context_size must be positive".to_string()));
        }
        if self.threads == 0 {
            return Err(InferenceError::Config("threads must be positive".to_string()));
        }
        if self.batch_size == Some(0) {
            return Err(InferenceError::Config("batch_size must be positive".to_string()));
        }
        self.sampling.validate()
    }
}
