//! Bookkeeping for what is resident in the engine's compute context.

use tracing::debug;

use crate::backend::ComputeContext;
use crate::error::InferenceError;

/// The committed prefix of the conversation's token sequence.
///
/// Tokens are committed only after the engine has accepted them, so
/// `committed()` never exceeds what is really resident. The ids are kept to
/// detect a new token sequence that no longer starts with the resident one.
#[derive(Debug, Clone)]
pub struct ContextState {
    tokens: Vec<u32>,
    capacity: usize,
}

impl ContextState {
    pub fn new(capacity: usize) -> Self {
        Self {
            tokens: Vec::new(),
            capacity,
        }
    }

    /// Number of leading tokens resident in engine memory.
    pub fn committed(&self) -> usize {
        self.tokens.len()
    }

    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.tokens.len())
    }

    pub fn is_full(&self) -> bool {
        self.tokens.len() >= self.capacity
    }

    /// Length of the longest common prefix of the resident tokens and `sequence`.
    pub fn common_prefix(&self, sequence: &[u32]) -> usize {
        self.tokens
            .iter()
            .zip(sequence)
            .take_while(|(a, b)| a == b)
            .count()
    }

    /// Record tokens the engine has just accepted.
    pub fn commit(&mut self, tokens: &[u32]) {
        debug_assert!(self.tokens.len() + tokens.len() <= self.capacity);
        self.tokens.extend_from_slice(tokens);
    }

    pub fn commit_one(&mut self, token: u32) {
        self.commit(&[token]);
    }

    /// Forget everything after the first `len` committed tokens.
    pub fn rollback(&mut self, len: usize) {
        self.tokens.truncate(len);
    }

    /// Drop resident tokens that `sequence` does not start with, from both
    /// the engine and this record. Returns the new committed count.
    pub fn reconcile<C: ComputeContext + ?Sized>(
        &mut self,
        ctx: &mut C,
        sequence: &[u32],
    ) -> Result<usize, InferenceError> {
        let keep = self.common_prefix(sequence);
        if keep < self.committed() {
            debug!(
                committed = self.committed(),
                keep,
                "Resident tokens diverge from prompt, rolling back"
            );
            ctx.truncate(keep)?;
            self.rollback(keep);
        }
        Ok(keep)
    }
}
