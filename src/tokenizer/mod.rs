//! Tokenizer trait and helpers for turning prompts into token IDs and
//! generated token IDs back into text.
//!
//! Tokenization itself is provided by the loaded engine (see
//! [`crate::backend`]); this module defines the capability the session needs
//! and the bits of bookkeeping that must behave identically across engines.

use crate::error::InferenceError;

/// Special-token setting used for every prompt encode.
///
/// The whole formatted conversation is re-encoded each turn and compared
/// against what is already resident in the engine, so the same logical prefix
/// must always be encoded with the same setting.
pub const ADD_SPECIAL_TOKENS: bool = true;

/// A tokenizer that converts text to token IDs and back.
///
/// All implementations must be thread-safe (`Send + Sync`) since a loaded
/// model may be shared by several sessions.
pub trait Tokenizer: Send + Sync {
    /// Encode text into a sequence of token IDs.
    ///
    /// When `add_special_tokens` is true the model's beginning-of-sequence
    /// marker is prepended (if the vocabulary asks for one) and special
    /// markers written in the text, such as `<|im_start|>`, are parsed as
    /// single tokens.
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>, InferenceError>;

    /// Raw bytes of a single token. May be an incomplete UTF-8 sequence.
    fn token_piece(&self, id: u32) -> Result<Vec<u8>, InferenceError>;

    /// Return the total vocabulary size.
    fn vocab_size(&self) -> usize;

    /// Whether `id` ends a generation (EOS, end-of-turn, ...).
    fn is_end_of_generation(&self, id: u32) -> bool;
}

/// Encode a formatted prompt, treating an empty result as a failure.
pub fn tokenize_prompt<T: Tokenizer + ?Sized>(
    tokenizer: &T,
    text: &str,
) -> Result<Vec<u32>, InferenceError> {
    let ids = tokenizer.encode(text, ADD_SPECIAL_TOKENS)?;
    if ids.is_empty() {
        return Err(InferenceError::Tokenization(
            "prompt tokenized to empty sequence".to_string(),
        ));
    }
    Ok(ids)
}

/// Reassembles token pieces into valid UTF-8 text.
///
/// A glyph split across several tokens produces empty fragments until its
/// last byte arrives. Invalid byte sequences become U+FFFD.
#[derive(Debug, Default)]
pub struct PieceDecoder {
    pending: Vec<u8>,
}

impl PieceDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the bytes of one token and return the text that became complete.
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            // Incomplete sequence at the end; wait for more bytes.
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }

        out
    }

    /// Flush whatever is still buffered, replacing incomplete sequences.
    pub fn finish(&mut self) -> String {
        let out = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        out
    }

    /// Number of bytes waiting for the rest of their glyph.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
