//! llama.cpp engine via the `llama-cpp-2` bindings.
//!
//! The llama.cpp backend is process-wide. It is held in a [`SharedResource`]
//! and every loaded model keeps an `Arc` to it, so it is initialised by the
//! first model load and freed after the last model is dropped.

use std::num::NonZeroU32;
use std::path::Path;
use std::sync::Arc;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaChatTemplate, LlamaModel};
use llama_cpp_2::token::LlamaToken;
use llama_cpp_2::{send_logs_to_tracing, LogOptions, TokenToStringError};
use tracing::{debug, info};

use super::{
    Batch, ComputeContext, ContextParams, EngineLoader, Model, SharedResource, CHAT_TEMPLATE_KEY,
};
use crate::chat::Message;
use crate::error::InferenceError;
use crate::tokenizer::Tokenizer;

static BACKEND: SharedResource<LlamaBackend> = SharedResource::new();

/// Initial buffer for a token's text; grown on demand.
const PIECE_BUFFER: usize = 32;

fn acquire_backend() -> Result<Arc<LlamaBackend>, InferenceError> {
    BACKEND.acquire(|| {
        let backend = LlamaBackend::init().map_err(|e| {
            InferenceError::Initialization(format!("failed to initialize llama.cpp backend: {}", e))
        })?;
        send_logs_to_tracing(LogOptions::default());
        info!("llama.cpp backend initialized");
        Ok(backend)
    })
}

/// A GGUF model loaded by llama.cpp.
pub struct LlamaCppModel {
    // Dropped before `backend`.
    model: LlamaModel,
    backend: Arc<LlamaBackend>,
    chat_template: Option<String>,
}

impl LlamaCppModel {
    pub fn load(path: &Path) -> Result<Self, InferenceError> {
        let backend = acquire_backend()?;
        let model = LlamaModel::load_from_file(&backend, path, &LlamaModelParams::default())
            .map_err(|e| {
                InferenceError::Initialization(format!(
                    "failed to load model from {}: {}",
                    path.display(),
                    e
                ))
            })?;

        // meta_val_str retries with the exact length, so long templates are
        // returned whole. llama.cpp applies them in apply_chat_template.
        let chat_template = model.meta_val_str(CHAT_TEMPLATE_KEY).ok();
        info!(
            path = %path.display(),
            vocab_size = model.n_vocab(),
            train_context = model.n_ctx_train(),
            has_chat_template = chat_template.is_some(),
            "Model loaded"
        );

        Ok(Self {
            model,
            backend,
            chat_template,
        })
    }

    pub fn inner(&self) -> &LlamaModel {
        &self.model
    }
}

impl Tokenizer for LlamaCppModel {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>, InferenceError> {
        let add_bos = if add_special_tokens {
            AddBos::Always
        } else {
            AddBos::Never
        };
        let tokens = self
            .model
            .str_to_token(text, add_bos)
            .map_err(|e| InferenceError::Tokenization(e.to_string()))?;
        Ok(tokens.into_iter().map(|t| t.0 as u32).collect())
    }

    fn token_piece(&self, id: u32) -> Result<Vec<u8>, InferenceError> {
        let token = LlamaToken::new(id as i32);
        match self.model.token_to_piece_bytes(token, PIECE_BUFFER, true, None) {
            Ok(bytes) => Ok(bytes),
            Err(TokenToStringError::InsufficientBufferSpace(needed)) => self
                .model
                .token_to_piece_bytes(token, needed.unsigned_abs() as usize, true, None)
                .map_err(|e| InferenceError::Backend(format!("token {}: {}", id, e))),
            Err(e) => Err(InferenceError::Backend(format!("token {}: {}", id, e))),
        }
    }

    fn vocab_size(&self) -> usize {
        self.model.n_vocab().max(0) as usize
    }

    fn is_end_of_generation(&self, id: u32) -> bool {
        self.model.is_eog_token(LlamaToken::new(id as i32))
    }
}

impl Model for LlamaCppModel {
    fn chat_template(&self) -> Option<String> {
        self.chat_template.clone()
    }

    fn apply_chat_template(
        &self,
        template: &str,
        messages: &[Message],
        add_assistant: bool,
    ) -> Result<String, InferenceError> {
        let template = LlamaChatTemplate::new(template)
            .map_err(|e| InferenceError::Template(format!("invalid chat template: {}", e)))?;
        let chat = messages
            .iter()
            .map(|m| LlamaChatMessage::new(m.role().as_str().to_string(), m.content().to_string()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| InferenceError::Template(format!("invalid chat message: {}", e)))?;
        self.model
            .apply_chat_template(&template, &chat, add_assistant)
            .map_err(|e| InferenceError::Template(format!("failed to apply chat template: {}", e)))
    }
}

/// A llama.cpp context evaluating a single sequence (id 0).
pub struct LlamaCppContext {
    // Borrows from `model`, so it must be dropped first.
    ctx: LlamaContext<'static>,
    /// Which entries of the last decoded batch requested logits.
    logit_rows: Vec<bool>,
    model: Arc<LlamaCppModel>,
}

// SAFETY: a llama_context is only used by one thread at a time; the session
// owning this value is behind a mutex. The model it points into is kept alive
// by the `model` field.
unsafe impl Send for LlamaCppContext {}

impl LlamaCppContext {
    pub fn new(model: Arc<LlamaCppModel>, params: &ContextParams) -> Result<Self, InferenceError> {
        let n_ctx = u32::try_from(params.context_size)
            .ok()
            .and_then(NonZeroU32::new)
            .ok_or_else(|| {
                InferenceError::Initialization(format!(
                    "invalid context size {}",
                    params.context_size
                ))
            })?;
        let n_batch = u32::try_from(params.batch_size.clamp(1, params.context_size))
            .map_err(|_| InferenceError::Initialization("batch size too large".to_string()))?;
        let threads = i32::try_from(params.threads).unwrap_or(i32::MAX);

        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(Some(n_ctx))
            .with_n_batch(n_batch)
            .with_n_threads(threads)
            .with_n_threads_batch(threads);

        let ctx = model
            .model
            .new_context(&model.backend, ctx_params)
            .map_err(|e| {
                InferenceError::Initialization(format!("failed to create context: {}", e))
            })?;

        // SAFETY: the context borrows `model.model`. The `Arc` stored beside it
        // keeps that model at a stable heap address for as long as the context
        // exists, and field order drops the context first.
        let ctx = unsafe { std::mem::transmute::<LlamaContext<'_>, LlamaContext<'static>>(ctx) };

        debug!(
            n_ctx = ctx.n_ctx(),
            n_batch = ctx.n_batch(),
            threads,
            "llama.cpp context created"
        );

        Ok(Self {
            ctx,
            logit_rows: Vec::new(),
            model,
        })
    }

    pub fn model(&self) -> &Arc<LlamaCppModel> {
        &self.model
    }
}

impl ComputeContext for LlamaCppContext {
    fn context_size(&self) -> usize {
        self.ctx.n_ctx() as usize
    }

    fn batch_size(&self) -> usize {
        self.ctx.n_batch() as usize
    }

    fn decode(&mut self, batch: &Batch) -> Result<(), InferenceError> {
        let mut llama_batch = LlamaBatch::new(batch.len().max(1), 1);
        for entry in batch.entries() {
            llama_batch
                .add(
                    LlamaToken::new(entry.token as i32),
                    entry.pos as i32,
                    &[0],
                    entry.logits,
                )
                .map_err(|e| InferenceError::Backend(e.to_string()))?;
        }

        self.logit_rows.clear();
        self.ctx
            .decode(&mut llama_batch)
            .map_err(|e| InferenceError::Backend(format!("llama_decode failed: {}", e)))?;
        self.logit_rows
            .extend(batch.entries().iter().map(|entry| entry.logits));
        Ok(())
    }

    fn logits(&self, index: usize) -> Result<&[f32], InferenceError> {
        if !self.logit_rows.get(index).copied().unwrap_or(false) {
            return Err(InferenceError::Backend(format!(
                "no logits for batch index {}",
                index
            )));
        }
        Ok(self.ctx.get_logits_ith(index as i32))
    }

    fn truncate(&mut self, len: usize) -> Result<(), InferenceError> {
        let p0 = u32::try_from(len)
            .map_err(|_| InferenceError::Backend(format!("position {} out of range", len)))?;
        self.logit_rows.clear();
        let removed = self
            .ctx
            .clear_kv_cache_seq(Some(0), Some(p0), None)
            .map_err(|e| InferenceError::Backend(e.to_string()))?;
        if !removed {
            return Err(InferenceError::Backend(format!(
                "failed to drop cached positions from {}",
                len
            )));
        }
        Ok(())
    }
}

/// Loads models and contexts through llama.cpp.
#[derive(Debug, Default, Clone, Copy)]
pub struct LlamaCppLoader;

impl EngineLoader for LlamaCppLoader {
    type Model = LlamaCppModel;
    type Context = LlamaCppContext;

    fn load_model(&self, path: &Path) -> Result<LlamaCppModel, InferenceError> {
        if !path.exists() {
            return Err(InferenceError::Initialization(format!(
                "model file not found: {}",
                path.display()
            )));
        }
        LlamaCppModel::load(path)
    }

    fn new_context(
        &self,
        model: &Arc<LlamaCppModel>,
        params: &ContextParams,
    ) -> Result<LlamaCppContext, InferenceError> {
        LlamaCppContext::new(Arc::clone(model), params)
    }
}
