//! Incremental prompt evaluation.
//!
//! Only the part of the token sequence that is not yet resident is pushed to
//! the engine, in chunks no larger than the engine's batch size. Earlier
//! turns stay cached, so each turn costs roughly the length of the new
//! message plus the generation prefix.

use tracing::{debug, warn};

use crate::backend::{Batch, ComputeContext};
use crate::error::InferenceError;

use super::context::ContextState;

/// Result of a successful prefill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prefilled {
    /// Index, within the last decoded batch, of the entry that carries logits.
    pub logits_index: usize,
    /// Tokens pushed to the engine by this call.
    pub pushed: usize,
}

/// Make `tokens` fully resident and leave logits for its last position.
///
/// On failure the engine state is rolled back to the last fully committed
/// chunk, so the session can simply retry the turn.
pub fn prefill<C: ComputeContext + ?Sized>(
    ctx: &mut C,
    state: &mut ContextState,
    tokens: &[u32],
) -> Result<Prefilled, InferenceError> {
    if tokens.is_empty() {
        return Err(InferenceError::Tokenization(
            "prompt tokenized to empty sequence".to_string(),
        ));
    }
    if tokens.len() > state.capacity() {
        return Err(InferenceError::ContextOverflow {
            required: tokens.len(),
            capacity: state.capacity(),
        });
    }

    let mut start = state.reconcile(ctx, tokens)?;

    // Everything already resident: re-evaluate the last token so fresh
    // logits exist for it.
    if start == tokens.len() {
        start -= 1;
        ctx.truncate(start)?;
        state.rollback(start);
    }

    let chunk_size = ctx.batch_size().min(ctx.context_size()).max(1);
    let suffix = &tokens[start..];
    let mut batch = Batch::with_capacity(chunk_size.min(suffix.len()));
    let mut logits_index = 0;

    debug!(
        committed = start,
        suffix = suffix.len(),
        chunk_size,
        "Prefilling prompt suffix"
    );

    for chunk in suffix.chunks(chunk_size) {
        let chunk_start = state.committed();
        batch.clear();
        for (i, &token) in chunk.iter().enumerate() {
            let pos = chunk_start + i;
            batch.push(token, pos, pos == tokens.len() - 1);
        }

        if let Err(e) = ctx.decode(&batch) {
            if let Err(rollback) = ctx.truncate(chunk_start) {
                warn!(error = %rollback, "Failed to roll back partial prefill chunk");
            }
            return Err(InferenceError::Evaluation {
                message: format!("prefill failed at position {}: {}", chunk_start, e),
                partial: String::new(),
            });
        }

        state.commit(chunk);
        logits_index = chunk.len() - 1;
    }

    Ok(Prefilled {
        logits_index,
        pushed: suffix.len(),
    })
}
