//! Deterministic in-memory engine used by unit tests.
//!
//! The vocabulary is byte-level (ids 0..=255) plus four specials, so any text
//! round-trips through encode/decode exactly. Logits are a hash of every
//! resident token, which makes two contexts agree only if their resident
//! state is identical. Replies use lowercase letters and spaces and end with
//! `<|im_end|>` after `reply_len` tokens, unless a scripted reply fixes the
//! exact bytes to produce.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::{Batch, ComputeContext, ContextParams, EngineLoader, Model};
use crate::chat::{apply_native, Message};
use crate::error::InferenceError;
use crate::tokenizer::Tokenizer;

pub const BOS: u32 = 256;
pub const EOS: u32 = 257;
pub const IM_START: u32 = 258;
pub const IM_END: u32 = 259;
pub const VOCAB_SIZE: usize = 260;

const SPECIALS: [(&str, u32); 4] = [
    ("<s>", BOS),
    ("</s>", EOS),
    ("<|im_start|>", IM_START),
    ("<|im_end|>", IM_END),
];

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz ";

/// Length of `assistant\n` in byte tokens.
const ASSISTANT_HEADER_LEN: usize = 10;

pub const CHATML_TEMPLATE: &str = "{% for message in messages %}{{'<|im_start|>' + message['role'] + '\\n' + message['content'] + '<|im_end|>' + '\\n'}}{% endfor %}{% if add_generation_prompt %}{{ '<|im_start|>assistant\\n' }}{% endif %}";

pub struct MockModel {
    template: Option<String>,
    reply_len: usize,
    eos_enabled: bool,
    script: Option<Vec<u8>>,
    fail_tokenize: AtomicBool,
    renders: AtomicUsize,
    last_render: Mutex<Option<(String, Vec<Message>)>>,
}

impl MockModel {
    pub fn chatml() -> Self {
        Self {
            template: Some(CHATML_TEMPLATE.to_string()),
            reply_len: 6,
            eos_enabled: true,
            script: None,
            fail_tokenize: AtomicBool::new(false),
            renders: AtomicUsize::new(0),
            last_render: Mutex::new(None),
        }
    }

    pub fn with_template(mut self, template: Option<&str>) -> Self {
        self.template = template.map(str::to_string);
        self
    }

    pub fn with_reply_len(mut self, reply_len: usize) -> Self {
        self.reply_len = reply_len;
        self
    }

    pub fn without_eos(mut self) -> Self {
        self.eos_enabled = false;
        self
    }

    /// Reply with exactly these bytes, one token each, then `<|im_end|>`.
    pub fn with_scripted_reply(mut self, bytes: &[u8]) -> Self {
        self.script = Some(bytes.to_vec());
        self
    }

    /// Number of `apply_chat_template` calls so far.
    pub fn renders(&self) -> usize {
        self.renders.load(Ordering::SeqCst)
    }

    /// Template and messages of the most recent `apply_chat_template` call.
    pub fn last_render(&self) -> Option<(String, Vec<Message>)> {
        self.last_render.lock().unwrap().clone()
    }

    /// Make every subsequent encode return an empty sequence.
    pub fn set_fail_tokenize(&self, fail: bool) {
        self.fail_tokenize.store(fail, Ordering::SeqCst);
    }

    fn next_logits(&self, prefix: &[u32]) -> Vec<f32> {
        let mut logits = vec![-10.0f32; VOCAB_SIZE];

        let run = prefix.iter().rev().take_while(|&&t| t != IM_START).count();
        if let Some(script) = &self.script {
            let next = run
                .checked_sub(ASSISTANT_HEADER_LEN)
                .and_then(|i| script.get(i).map(|&b| b as u32))
                .unwrap_or(IM_END);
            logits[next as usize] = 10.0;
            return logits;
        }
        if self.eos_enabled && run >= ASSISTANT_HEADER_LEN + self.reply_len {
            logits[IM_END as usize] = 10.0;
            return logits;
        }

        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for (pos, &tok) in prefix.iter().enumerate() {
            hash ^= (tok as u64) ^ ((pos as u64) << 20);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        for (i, &byte) in ALPHABET.iter().enumerate() {
            let mixed = (hash ^ (i as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15))
                .wrapping_mul(0xbf58_476d_1ce4_e5b9);
            logits[byte as usize] = ((mixed >> 40) % 1000) as f32 / 1000.0;
        }
        logits
    }
}

impl Tokenizer for MockModel {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>, InferenceError> {
        if self.fail_tokenize.load(Ordering::SeqCst) {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        if add_special_tokens {
            ids.push(BOS);
        }
        let mut rest = text;
        'outer: while !rest.is_empty() {
            if add_special_tokens {
                for (marker, id) in SPECIALS {
                    if let Some(tail) = rest.strip_prefix(marker) {
                        ids.push(id);
                        rest = tail;
                        continue 'outer;
                    }
                }
            }
            let ch = rest.chars().next().unwrap_or_default();
            let len = ch.len_utf8();
            ids.extend(rest.as_bytes()[..len].iter().map(|&b| b as u32));
            rest = &rest[len..];
        }
        Ok(ids)
    }

    fn token_piece(&self, id: u32) -> Result<Vec<u8>, InferenceError> {
        if id < 256 {
            return Ok(vec![id as u8]);
        }
        SPECIALS
            .iter()
            .find(|(_, special)| *special == id)
            .map(|(marker, _)| marker.as_bytes().to_vec())
            .ok_or_else(|| InferenceError::Backend(format!("unknown token {}", id)))
    }

    fn vocab_size(&self) -> usize {
        VOCAB_SIZE
    }

    fn is_end_of_generation(&self, id: u32) -> bool {
        id == EOS || id == IM_END
    }
}

impl Model for MockModel {
    fn chat_template(&self) -> Option<String> {
        self.template.clone()
    }

    fn apply_chat_template(
        &self,
        template: &str,
        messages: &[Message],
        add_assistant: bool,
    ) -> Result<String, InferenceError> {
        self.renders.fetch_add(1, Ordering::SeqCst);
        *self.last_render.lock().unwrap() = Some((template.to_string(), messages.to_vec()));
        apply_native(template, messages, add_assistant)
    }
}

pub struct MockContext {
    model: Arc<MockModel>,
    context_size: usize,
    batch_size: usize,
    resident: Vec<u32>,
    last_logits: Vec<(usize, Vec<f32>)>,
    decode_calls: usize,
    tokens_decoded: usize,
    fail_after: Option<usize>,
    leave_partial: bool,
}

impl MockContext {
    pub fn new(model: Arc<MockModel>, context_size: usize, batch_size: usize) -> Self {
        Self {
            model,
            context_size,
            batch_size,
            resident: Vec::new(),
            last_logits: Vec::new(),
            decode_calls: 0,
            tokens_decoded: 0,
            fail_after: None,
            leave_partial: false,
        }
    }

    pub fn resident(&self) -> &[u32] {
        &self.resident
    }

    pub fn decode_calls(&self) -> usize {
        self.decode_calls
    }

    /// Total tokens accepted across all successful decode calls.
    pub fn tokens_decoded(&self) -> usize {
        self.tokens_decoded
    }

    /// Let `successes` more decode calls through, then fail exactly one.
    pub fn fail_after(&mut self, successes: usize) {
        self.fail_after = Some(successes);
    }

    /// Make the injected failure leave the batch's tokens resident, like an
    /// engine that wrote cache cells before erroring.
    pub fn leave_partial_on_failure(&mut self) {
        self.leave_partial = true;
    }
}

impl ComputeContext for MockContext {
    fn context_size(&self) -> usize {
        self.context_size
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn decode(&mut self, batch: &Batch) -> Result<(), InferenceError> {
        self.decode_calls += 1;

        match self.fail_after {
            Some(0) => {
                self.fail_after = None;
                if self.leave_partial {
                    self.resident
                        .extend(batch.entries().iter().map(|entry| entry.token));
                }
                return Err(InferenceError::Backend("injected decode failure".to_string()));
            }
            Some(n) => self.fail_after = Some(n - 1),
            None => {}
        }

        if batch.is_empty() {
            return Err(InferenceError::Backend("empty batch".to_string()));
        }
        if batch.len() > self.batch_size {
            return Err(InferenceError::Backend(format!(
                "batch of {} exceeds batch size {}",
                batch.len(),
                self.batch_size
            )));
        }
        if self.resident.len() + batch.len() > self.context_size {
            return Err(InferenceError::Backend("context full".to_string()));
        }
        for (i, entry) in batch.entries().iter().enumerate() {
            if entry.pos != self.resident.len() + i {
                return Err(InferenceError::Backend(format!(
                    "position {} submitted but next free position is {}",
                    entry.pos,
                    self.resident.len() + i
                )));
            }
        }

        self.last_logits.clear();
        for (i, entry) in batch.entries().iter().enumerate() {
            self.resident.push(entry.token);
            if entry.logits {
                let logits = self.model.next_logits(&self.resident);
                self.last_logits.push((i, logits));
            }
        }
        self.tokens_decoded += batch.len();
        Ok(())
    }

    fn logits(&self, index: usize) -> Result<&[f32], InferenceError> {
        self.last_logits
            .iter()
            .find(|(i, _)| *i == index)
            .map(|(_, logits)| logits.as_slice())
            .ok_or_else(|| InferenceError::Backend(format!("no logits for batch index {}", index)))
    }

    fn truncate(&mut self, len: usize) -> Result<(), InferenceError> {
        self.resident.truncate(len);
        self.last_logits.clear();
        Ok(())
    }
}

/// Loader that "loads" any path not containing `missing`.
#[derive(Default)]
pub struct MockLoader {
    pub loads: AtomicUsize,
    pub reply_len: Option<usize>,
}

impl EngineLoader for MockLoader {
    type Model = MockModel;
    type Context = MockContext;

    fn load_model(&self, path: &Path) -> Result<MockModel, InferenceError> {
        if path.to_string_lossy().contains("missing") {
            return Err(InferenceError::Initialization(format!(
                "failed to load model from {}",
                path.display()
            )));
        }
        self.loads.fetch_add(1, Ordering::SeqCst);
        let model = MockModel::chatml();
        Ok(match self.reply_len {
            Some(n) => model.with_reply_len(n),
            None => model,
        })
    }

    fn new_context(
        &self,
        model: &Arc<MockModel>,
        params: &ContextParams,
    ) -> Result<MockContext, InferenceError> {
        if params.context_size == 0 {
            return Err(InferenceError::Initialization(
                "context size must be positive".to_string(),
            ));
        }
        Ok(MockContext::new(
            Arc::clone(model),
            params.context_size,
            params.batch_size,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_roundtrip_with_specials() {
        let model = MockModel::chatml();
        let ids = model.encode("<|im_start|>user\nhé<|im_end|>", true).unwrap();
        assert_eq!(ids[0], BOS);
        assert_eq!(ids[1], IM_START);
        assert_eq!(*ids.last().unwrap(), IM_END);

        let bytes: Vec<u8> = ids[1..]
            .iter()
            .flat_map(|&id| model.token_piece(id).unwrap())
            .collect();
        assert_eq!(String::from_utf8(bytes).unwrap(), "<|im_start|>user\nhé<|im_end|>");
    }

    #[test]
    fn test_decode_rejects_position_gap() {
        let model = Arc::new(MockModel::chatml());
        let mut ctx = MockContext::new(model, 16, 16);
        let mut batch = Batch::default();
        batch.push(1, 1, true);
        assert!(ctx.decode(&batch).is_err());
        assert!(ctx.resident().is_empty());
    }

    #[test]
    fn test_logits_depend_on_full_state() {
        let model = MockModel::chatml();
        let a = model.next_logits(&[BOS, 1, 2]);
        let b = model.next_logits(&[BOS, 3, 2]);
        assert_ne!(a, b);
        assert_eq!(a, model.next_logits(&[BOS, 1, 2]));
    }
}
