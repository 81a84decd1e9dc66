//! Conversation state and prompt formatting.

pub mod history;
pub mod template;

pub use history::{ChatHistory, HistoryEntry, Message, Role};
pub use template::{apply_native, ChatTemplate, PromptFormatter};
