//! Engine boundary: loaded model, compute context and the loader that
//! creates them.
//!
//! The session never touches tensors. It sees a [`Model`] (tokenizer plus
//! metadata, shareable between sessions) and a [`ComputeContext`] (the
//! engine's running state for one sequence, owned by exactly one session).
//! With the `llama-cpp` feature, [`llama_cpp::LlamaCppLoader`] provides both on
//! top of llama.cpp.

#[cfg(feature = "llama-cpp")]
pub mod llama_cpp;
#[cfg(test)]
pub(crate) mod mock;
pub mod shared;

use std::path::Path;
use std::sync::Arc;

use crate::chat::Message;
use crate::error::InferenceError;
use crate::tokenizer::Tokenizer;

pub use shared::SharedResource;

/// Metadata key holding the model's Jinja chat template.
pub const CHAT_TEMPLATE_KEY: &str = "tokenizer.chat_template";

/// A loaded model: tokenizer plus the metadata the session needs.
pub trait Model: Tokenizer {
    /// The chat template stored in the model file, if any.
    fn chat_template(&self) -> Option<String>;

    /// Render `messages` with `template`, the model's own template or a
    /// configured override (full template text or a built-in family name).
    ///
    /// With `add_assistant`, the output ends with the prefix that opens the
    /// next assistant turn. A template the engine cannot apply is an
    /// [`InferenceError::Template`].
    fn apply_chat_template(
        &self,
        template: &str,
        messages: &[Message],
        add_assistant: bool,
    ) -> Result<String, InferenceError>;
}

/// One token queued for evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchEntry {
    pub token: u32,
    /// Absolute position in the sequence.
    pub pos: usize,
    /// Whether the engine must keep output logits for this token.
    pub logits: bool,
}

/// A run of tokens submitted to the engine in one call.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    entries: Vec<BatchEntry>,
}

impl Batch {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, token: u32, pos: usize, logits: bool) {
        self.entries.push(BatchEntry { token, pos, logits });
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }
}

/// The engine's running computational state for a single sequence.
///
/// Everything decoded stays resident until [`truncate`](Self::truncate)
/// drops it, so callers must submit each position exactly once.
pub trait ComputeContext: Send {
    /// Maximum number of resident tokens.
    fn context_size(&self) -> usize;

    /// Maximum number of tokens accepted by one [`decode`](Self::decode) call.
    fn batch_size(&self) -> usize;

    /// Evaluate a batch, appending its tokens to the resident state.
    fn decode(&mut self, batch: &Batch) -> Result<(), InferenceError>;

    /// Logits produced for entry `index` of the most recently decoded batch.
    ///
    /// Only entries pushed with `logits = true` have logits.
    fn logits(&self, index: usize) -> Result<&[f32], InferenceError>;

    /// Drop every resident token at position `len` and beyond.
    fn truncate(&mut self, len: usize) -> Result<(), InferenceError>;
}

/// Sizing for a new compute context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextParams {
    pub context_size: usize,
    pub batch_size: usize,
    pub threads: usize,
}

/// Creates models and contexts for the session registry.
pub trait EngineLoader: Send + Sync {
    type Model: Model + 'static;
    type Context: ComputeContext + 'static;

    /// Load model weights and vocabulary from `path`.
    fn load_model(&self, path: &Path) -> Result<Self::Model, InferenceError>;

    /// Allocate a fresh compute context for `model`.
    fn new_context(
        &self,
        model: &Arc<Self::Model>,
        params: &ContextParams,
    ) -> Result<Self::Context, InferenceError>;
}
