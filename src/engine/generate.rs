//! Generation loop: prefilled context → assistant reply, one token at a time.
//!
//! Each iteration samples from the logits of the last processed position,
//! stops on an end-of-generation token, streams the decoded text to a
//! [`TokenSink`] and feeds the token back through the engine. Every token
//! fed back is committed to the [`ContextState`], so the reply becomes part
//! of the cached prefix for the next turn.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::backend::{Batch, ComputeContext};
use crate::error::InferenceError;
use crate::tokenizer::{PieceDecoder, Tokenizer};

use super::context::ContextState;
use super::prefill::Prefilled;
use super::sampler::Sampler;

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Sampled an end-of-sequence or end-of-turn token.
    EndOfSequence,
    /// Reached the `max_new_tokens` limit.
    MaxTokens,
    /// Filled the context window.
    ContextFull,
    /// The engine failed to evaluate a generated token.
    EngineError,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::EndOfSequence => write!(f, "eos"),
            StopReason::MaxTokens => write!(f, "max_tokens"),
            StopReason::ContextFull => write!(f, "context_full"),
            StopReason::EngineError => write!(f, "engine_error"),
        }
    }
}

/// Receives generated text as it is produced.
///
/// `on_token` is called once per non-empty text fragment, in order, on the
/// thread running the turn. A streaming turn ends with exactly one call to
/// either `on_complete` or `on_error`.
pub trait TokenSink {
    fn on_token(&mut self, fragment: &str);

    fn on_complete(&mut self, _tokens_per_second: f64, _elapsed_seconds: f64) {}

    fn on_error(&mut self, _message: &str) {}
}

impl<F: FnMut(&str)> TokenSink for F {
    fn on_token(&mut self, fragment: &str) {
        self(fragment)
    }
}

/// A sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl TokenSink for NullSink {
    fn on_token(&mut self, _fragment: &str) {}
}

/// Output from one generation turn, including metadata.
#[derive(Debug, Clone)]
pub struct GenerationOutput {
    /// The reply text. Identical to the concatenation of streamed fragments.
    pub text: String,
    /// Generated token IDs, excluding the end-of-generation token.
    pub token_ids: Vec<u32>,
    /// Why generation stopped.
    pub stop_reason: StopReason,
    /// Length of the full prompt token sequence.
    pub prompt_tokens: usize,
    /// Prompt tokens actually evaluated this turn.
    pub prefill_tokens: usize,
    /// Wall time spent in the generation loop.
    pub elapsed: Duration,
}

impl GenerationOutput {
    pub fn tokens_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.token_ids.len() as f64 / secs
        } else {
            0.0
        }
    }
}

/// Limits for one generation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationLimits {
    /// Maximum number of tokens to generate.
    pub max_new_tokens: usize,
}

/// Run the decode loop after a successful prefill.
///
/// A failed engine step returns [`InferenceError::Evaluation`] carrying the
/// text produced so far. Tokens decoded before the failure stay committed;
/// the failed step itself is truncated from the engine.
pub fn run_generation<M, C, S>(
    model: &M,
    ctx: &mut C,
    state: &mut ContextState,
    sampler: &mut Sampler,
    prefilled: Prefilled,
    limits: GenerationLimits,
    sink: &mut S,
) -> Result<GenerationOutput, InferenceError>
where
    M: Tokenizer + ?Sized,
    C: ComputeContext + ?Sized,
    S: TokenSink + ?Sized,
{
    let started = Instant::now();
    let prompt_tokens = state.committed();
    let mut logits_index = prefilled.logits_index;
    let mut decoder = PieceDecoder::new();
    let mut batch = Batch::with_capacity(1);
    let mut text = String::new();
    let mut token_ids: Vec<u32> = Vec::new();
    let mut failure: Option<String> = None;

    let stop_reason = if limits.max_new_tokens == 0 {
        StopReason::MaxTokens
    } else if state.is_full() {
        StopReason::ContextFull
    } else {
        loop {
            let logits = match ctx.logits(logits_index) {
                Ok(logits) => logits,
                Err(e) => {
                    failure = Some(e.to_string());
                    break StopReason::EngineError;
                }
            };
            let token = sampler.sample(logits);

            if model.is_end_of_generation(token) {
                debug!(step = token_ids.len(), token, "Stop token encountered");
                break StopReason::EndOfSequence;
            }

            sampler.accept(token);
            token_ids.push(token);

            let piece = match model.token_piece(token) {
                Ok(piece) => piece,
                Err(e) => {
                    failure = Some(e.to_string());
                    break StopReason::EngineError;
                }
            };
            let fragment = decoder.push(&piece);
            if !fragment.is_empty() {
                sink.on_token(&fragment);
                text.push_str(&fragment);
            }

            batch.clear();
            batch.push(token, state.committed(), true);
            if let Err(e) = ctx.decode(&batch) {
                if let Err(rollback) = ctx.truncate(state.committed()) {
                    warn!(error = %rollback, "Failed to roll back failed decode step");
                }
                failure = Some(format!(
                    "decode failed at position {}: {}",
                    state.committed(),
                    e
                ));
                break StopReason::EngineError;
            }
            state.commit_one(token);
            logits_index = 0;

            if token_ids.len() >= limits.max_new_tokens {
                break StopReason::MaxTokens;
            }
            if state.is_full() {
                debug!(step = token_ids.len(), "Context window full");
                break StopReason::ContextFull;
            }
        }
    };

    let tail = decoder.finish();
    if !tail.is_empty() {
        sink.on_token(&tail);
        text.push_str(&tail);
    }

    let elapsed = started.elapsed();

    if let Some(message) = failure {
        warn!(
            stop_reason = %stop_reason,
            generated = token_ids.len(),
            error = %message,
            "Generation aborted"
        );
        return Err(InferenceError::Evaluation {
            message,
            partial: text,
        });
    }

    let output = GenerationOutput {
        text,
        token_ids,
        stop_reason,
        prompt_tokens,
        prefill_tokens: prefilled.pushed,
        elapsed,
    };

    info!(
        prompt_tokens = output.prompt_tokens,
        prefill_tokens = output.prefill_tokens,
        generated = output.token_ids.len(),
        stop_reason = %output.stop_reason,
        tokens_per_second = format!("{:.2}", output.tokens_per_second()),
        "Generation complete"
    );

    Ok(output)
}
