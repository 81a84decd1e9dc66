//! Chat session: one conversation bound to one compute context.
//!
//! A [`Session`] owns its history and engine state. Each turn renders the
//! whole conversation, tokenizes it, evaluates only the part that is not
//! already resident, and generates the assistant reply. The history only
//! grows when a turn succeeds.

pub mod registry;

use std::sync::Arc;

use tracing::{debug, info};

use crate::backend::{ComputeContext, Model};
use crate::chat::{ChatHistory, HistoryEntry, Message, PromptFormatter, Role};
use crate::config::{OverflowPolicy, SamplingParams, SessionConfig};
use crate::engine::{
    prefill, run_generation, ContextState, GenerationLimits, GenerationOutput, NullSink, Sampler,
    TokenSink,
};
use crate::error::InferenceError;
use crate::tokenizer::tokenize_prompt;

pub use registry::{SessionHandle, SessionRegistry};

pub struct Session<M: Model, C: ComputeContext> {
    model: Arc<M>,
    ctx: C,
    config: SessionConfig,
    history: ChatHistory,
    state: ContextState,
}

impl<M: Model, C: ComputeContext> Session<M, C> {
    pub fn new(model: Arc<M>, ctx: C, config: SessionConfig) -> Self {
        let state = ContextState::new(ctx.context_size());
        Self {
            model,
            ctx,
            config,
            history: ChatHistory::new(),
            state,
        }
    }

    pub fn model(&self) -> &Arc<M> {
        &self.model
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn history(&self) -> &ChatHistory {
        &self.history
    }

    /// Number of conversation tokens resident in the compute context.
    pub fn committed(&self) -> usize {
        self.state.committed()
    }

    pub fn context_size(&self) -> usize {
        self.state.capacity()
    }

    /// Run one turn with the session's default sampling parameters and
    /// return the reply.
    pub fn predict(&mut self, prompt: &str) -> Result<GenerationOutput, InferenceError> {
        let params = self.config.sampling.clone();
        self.predict_with(prompt, &params, &mut NullSink)
    }

    /// Run one turn, streaming reply fragments to `sink`.
    ///
    /// Only `on_token` is called; see [`predict_streaming`](Self::predict_streaming)
    /// for the completion callbacks. On failure the history is left exactly
    /// as it was before the call.
    pub fn predict_with<S: TokenSink + ?Sized>(
        &mut self,
        prompt: &str,
        params: &SamplingParams,
        sink: &mut S,
    ) -> Result<GenerationOutput, InferenceError> {
        let mut sampler = Sampler::new(params, self.model.vocab_size())?;

        let rollback_len = self.history.len();
        self.history.push(Role::User, prompt);
        debug!(
            turn = rollback_len / 2 + 1,
            prompt_len = prompt.len(),
            "Starting turn"
        );

        match self.run_turn(&mut sampler, sink) {
            Ok(output) => {
                self.history.push(Role::Assistant, output.text.clone());
                Ok(output)
            }
            Err(e) => {
                self.history.truncate(rollback_len);
                Err(e)
            }
        }
    }

    /// Run one turn and finish with exactly one of `on_complete` or
    /// `on_error` on the sink.
    pub fn predict_streaming<S: TokenSink + ?Sized>(
        &mut self,
        prompt: &str,
        params: &SamplingParams,
        sink: &mut S,
    ) -> Result<GenerationOutput, InferenceError> {
        match self.predict_with(prompt, params, sink) {
            Ok(output) => {
                sink.on_complete(output.tokens_per_second(), output.elapsed.as_secs_f64());
                Ok(output)
            }
            Err(e) => {
                sink.on_error(&e.to_string());
                Err(e)
            }
        }
    }

    /// Replace the conversation with previously saved messages.
    ///
    /// A sender of exactly `USER` maps to the user; every other sender to
    /// the assistant. The compute context is not touched here: the next turn
    /// keeps whatever resident prefix still matches.
    pub fn restore_history(&mut self, entries: &[HistoryEntry]) {
        let messages: Vec<Message> = entries.iter().map(Message::from).collect();
        info!(messages = messages.len(), "Restoring chat history");
        self.history.replace(messages);
    }

    fn run_turn<S: TokenSink + ?Sized>(
        &mut self,
        sampler: &mut Sampler,
        sink: &mut S,
    ) -> Result<GenerationOutput, InferenceError> {
        let model_template = self.model.chat_template();
        let formatter = PromptFormatter::resolve(
            model_template.as_deref(),
            self.config.chat_template.as_deref(),
            self.config.system_prompt.clone(),
        )?;

        let tokens = self.prompt_tokens(&formatter)?;
        let prefilled = prefill(&mut self.ctx, &mut self.state, &tokens)?;

        run_generation(
            self.model.as_ref(),
            &mut self.ctx,
            &mut self.state,
            sampler,
            prefilled,
            GenerationLimits {
                max_new_tokens: self.config.max_new_tokens,
            },
            sink,
        )
    }

    /// Tokenize the rendered conversation, applying the overflow policy.
    fn prompt_tokens(&self, formatter: &PromptFormatter) -> Result<Vec<u32>, InferenceError> {
        let messages = self.history.messages();
        let capacity = self.state.capacity();
        let model = self.model.as_ref();
        let tokens = tokenize_prompt(model, &formatter.render(model, messages)?)?;

        if tokens.len() <= capacity || self.config.overflow == OverflowPolicy::Fail {
            return Ok(tokens);
        }

        // The rendered window must open on a user turn.
        for start in 1..messages.len() {
            if messages[start].role() != Role::User {
                continue;
            }
            let window = tokenize_prompt(model, &formatter.render(model, &messages[start..])?)?;
            if window.len() <= capacity {
                info!(
                    dropped = start,
                    tokens = window.len(),
                    capacity,
                    "Dropped oldest turns to fit the context window"
                );
                return Ok(window);
            }
        }

        Err(InferenceError::ContextOverflow {
            required: tokens.len(),
            capacity,
        })
    }

    #[cfg(test)]
    pub(crate) fn context_mut(&mut self) -> &mut C {
        &mut self.ctx
    }
}
