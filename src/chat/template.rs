//! Chat templates: serialise a conversation into the exact text format a
//! model was trained on.
//!
//! Models ship a Jinja template under `tokenizer.chat_template`. The session
//! picks the template and hands it to the engine's own applier through
//! [`Model::apply_chat_template`]. [`ChatTemplate`] is a small native
//! renderer for the common families, for engines that have no applier.

use tracing::debug;

use crate::backend::Model;
use crate::error::InferenceError;

use super::history::{Message, Role};

/// Known chat template families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatTemplate {
    /// `<|im_start|>role\n...<|im_end|>\n`
    ChatMl,
    /// `[INST] ... [/INST]`
    Llama2,
    /// `<|start_header_id|>role<|end_header_id|>\n\n...<|eot_id|>`
    Llama3,
    /// `<start_of_turn>user\n...<end_of_turn>\n`
    Gemma,
    /// `<|user|>\n...<|end|>\n`
    Phi3,
    /// `<|user|>\n...<|endoftext|>\n`
    Zephyr,
}

impl ChatTemplate {
    /// Classify a template string or family name.
    pub fn detect(template: &str) -> Option<Self> {
        let by_name = match template.trim().to_ascii_lowercase().as_str() {
            "chatml" => Some(ChatTemplate::ChatMl),
            "llama2" | "mistral" => Some(ChatTemplate::Llama2),
            "llama3" => Some(ChatTemplate::Llama3),
            "gemma" => Some(ChatTemplate::Gemma),
            "phi3" => Some(ChatTemplate::Phi3),
            "zephyr" => Some(ChatTemplate::Zephyr),
            _ => None,
        };
        if by_name.is_some() {
            return by_name;
        }

        let has = |marker: &str| template.contains(marker);
        if has("<|im_start|>") {
            Some(ChatTemplate::ChatMl)
        } else if has("<|start_header_id|>") && has("<|end_header_id|>") {
            Some(ChatTemplate::Llama3)
        } else if has("<start_of_turn>") {
            Some(ChatTemplate::Gemma)
        } else if has("<|assistant|>") && has("<|end|>") {
            Some(ChatTemplate::Phi3)
        } else if has("<|user|>") {
            Some(ChatTemplate::Zephyr)
        } else if has("[INST]") {
            Some(ChatTemplate::Llama2)
        } else {
            None
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ChatTemplate::ChatMl => "chatml",
            ChatTemplate::Llama2 => "llama2",
            ChatTemplate::Llama3 => "llama3",
            ChatTemplate::Gemma => "gemma",
            ChatTemplate::Phi3 => "phi3",
            ChatTemplate::Zephyr => "zephyr",
        }
    }

    /// Render `messages`, optionally preceded by a system prompt.
    ///
    /// With `add_assistant`, the output ends with the prefix that opens the
    /// next assistant turn.
    pub fn render(&self, system: Option<&str>, messages: &[Message], add_assistant: bool) -> String {
        let mut out = String::new();
        match self {
            ChatTemplate::ChatMl => {
                if let Some(sys) = system {
                    push_chatml(&mut out, "system", sys);
                }
                for msg in messages {
                    push_chatml(&mut out, msg.role().as_str(), msg.content());
                }
                if add_assistant {
                    out.push_str("<|im_start|>assistant\n");
                }
            }
            ChatTemplate::Llama3 => {
                if let Some(sys) = system {
                    push_llama3(&mut out, "system", sys);
                }
                for msg in messages {
                    push_llama3(&mut out, msg.role().as_str(), msg.content());
                }
                if add_assistant {
                    out.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n");
                }
            }
            ChatTemplate::Gemma => {
                // No system role; the system prompt opens the first user turn.
                let mut pending_system = system;
                for msg in messages {
                    let role = match msg.role() {
                        Role::Assistant => "model",
                        _ => "user",
                    };
                    out.push_str("<start_of_turn>");
                    out.push_str(role);
                    out.push('\n');
                    if msg.role() == Role::User {
                        if let Some(sys) = pending_system.take() {
                            out.push_str(sys.trim());
                            out.push_str("\n\n");
                        }
                    }
                    out.push_str(msg.content().trim());
                    out.push_str("<end_of_turn>\n");
                }
                if add_assistant {
                    out.push_str("<start_of_turn>model\n");
                }
            }
            ChatTemplate::Phi3 | ChatTemplate::Zephyr => {
                let end = if *self == ChatTemplate::Phi3 {
                    "<|end|>"
                } else {
                    "<|endoftext|>"
                };
                if let Some(sys) = system {
                    push_tagged(&mut out, "system", sys, end);
                }
                for msg in messages {
                    push_tagged(&mut out, msg.role().as_str(), msg.content(), end);
                }
                if add_assistant {
                    out.push_str("<|assistant|>\n");
                }
            }
            ChatTemplate::Llama2 => {
                let mut pending_system = system;
                for msg in messages {
                    match msg.role() {
                        Role::Assistant => {
                            out.push(' ');
                            out.push_str(msg.content().trim());
                            out.push_str("</s>");
                        }
                        _ => {
                            out.push_str("[INST] ");
                            if let Some(sys) = pending_system.take() {
                                out.push_str("<<SYS>>\n");
                                out.push_str(sys.trim());
                                out.push_str("\n<</SYS>>\n\n");
                            }
                            out.push_str(msg.content().trim());
                            out.push_str(" [/INST]");
                        }
                    }
                }
                // The model continues directly after [/INST]; no prefix to add.
            }
        }
        out
    }
}

fn push_chatml(out: &mut String, role: &str, content: &str) {
    out.push_str("<|im_start|>");
    out.push_str(role);
    out.push('\n');
    out.push_str(content);
    out.push_str("<|im_end|>\n");
}

fn push_llama3(out: &mut String, role: &str, content: &str) {
    out.push_str("<|start_header_id|>");
    out.push_str(role);
    out.push_str("<|end_header_id|>\n\n");
    out.push_str(content.trim());
    out.push_str("<|eot_id|>");
}

fn push_tagged(out: &mut String, role: &str, content: &str, end: &str) {
    out.push_str("<|");
    out.push_str(role);
    out.push_str("|>\n");
    out.push_str(content);
    out.push_str(end);
    out.push('\n');
}

/// Render with a native [`ChatTemplate`] detected from `template`.
///
/// For engines without a template applier of their own. A leading system
/// message becomes the template's system prompt.
pub fn apply_native(
    template: &str,
    messages: &[Message],
    add_assistant: bool,
) -> Result<String, InferenceError> {
    let family = ChatTemplate::detect(template).ok_or_else(|| {
        InferenceError::Template(format!(
            "unsupported chat template ({} bytes); use one of \
             chatml, llama2, llama3, gemma, phi3, zephyr",
            template.len()
        ))
    })?;
    let (system, rest) = match messages.split_first() {
        Some((first, rest)) if first.role() == Role::System => (Some(first.content()), rest),
        _ => (None, messages),
    };
    Ok(family.render(system, rest, add_assistant))
}

/// Renders a conversation through the model's chat template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptFormatter {
    template: String,
    system_prompt: Option<String>,
}

impl PromptFormatter {
    pub fn new(template: impl Into<String>, system_prompt: Option<String>) -> Self {
        Self {
            template: template.into(),
            system_prompt,
        }
    }

    /// Pick the template for a session.
    ///
    /// `override_template` (from configuration) wins over the model's own
    /// template. Having neither is a configuration error.
    pub fn resolve(
        model_template: Option<&str>,
        override_template: Option<&str>,
        system_prompt: Option<String>,
    ) -> Result<Self, InferenceError> {
        let template = match (override_template, model_template) {
            (Some(t), _) => {
                debug!(template_len = t.len(), "Using configured chat template");
                t
            }
            (None, Some(t)) => t,
            (None, None) => {
                return Err(InferenceError::Template(
                    "model has no chat template and none was configured".to_string(),
                ))
            }
        };
        Ok(Self::new(template, system_prompt))
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// Render the full conversation followed by the assistant-turn prefix.
    ///
    /// The configured system prompt is passed as a leading system message.
    pub fn render<M: Model + ?Sized>(
        &self,
        model: &M,
        messages: &[Message],
    ) -> Result<String, InferenceError> {
        match &self.system_prompt {
            Some(system) => {
                let mut all = Vec::with_capacity(messages.len() + 1);
                all.push(Message::new(Role::System, system.clone()));
                all.extend_from_slice(messages);
                model.apply_chat_template(&self.template, &all, true)
            }
            None => model.apply_chat_template(&self.template, messages, true),
        }
    }
}
