pub mod backend;
pub mod chat;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod session;
pub mod tokenizer;

pub use chat::{ChatHistory, HistoryEntry, Message, Role};
pub use config::{OverflowPolicy, SamplingParams, SessionConfig};
pub use engine::{GenerationOutput, NullSink, StopReason, TokenSink};
pub use error::InferenceError;
pub use session::{Session, SessionHandle, SessionRegistry};
