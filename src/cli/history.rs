//! Saved conversations on disk: a JSON array of `{"sender", "text"}`
//! objects, oldest first.

use std::path::Path;

use tracing::debug;

use crate::chat::{HistoryEntry, Message, Role};
use crate::error::InferenceError;

pub fn load_history(path: &Path) -> Result<Vec<HistoryEntry>, InferenceError> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        InferenceError::Config(format!("Failed to read history '{}': {}", path.display(), e))
    })?;
    let entries: Vec<HistoryEntry> = serde_json::from_str(&text)?;
    debug!(path = %path.display(), messages = entries.len(), "Loaded chat history");
    Ok(entries)
}

/// Write `messages` in the same format [`load_history`] reads. User turns
/// are saved with sender `USER`, assistant turns with `BOT`.
pub fn save_history(path: &Path, messages: &[Message]) -> Result<(), InferenceError> {
    let entries: Vec<HistoryEntry> = messages
        .iter()
        .map(|m| {
            let sender = match m.role() {
                Role::User => "USER",
                _ => "BOT",
            };
            HistoryEntry::new(sender, m.content())
        })
        .collect();
    let json = serde_json::to_string_pretty(&entries)?;
    std::fs::write(path, json)?;
    Ok(())
}
