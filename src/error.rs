use thiserror::Error;

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Initialization failed: {0}")]
    Initialization(String),

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    /// The engine rejected a prefill chunk or a generation step.
    ///
    /// `partial` holds whatever reply text had been produced before the
    /// failure. It is a best-effort report, never a successful result.
    #[error("Evaluation failed: {message}")]
    Evaluation { message: String, partial: String },

    #[error("Sampler initialization failed: {0}")]
    SamplerInit(String),

    #[error("Invalid session handle")]
    InvalidSession,

    #[error("Session is busy with another turn")]
    SessionBusy,

    #[error("Chat template error: {0}")]
    Template(String),

    #[error("Prompt needs {required} tokens but the context window holds {capacity}")]
    ContextOverflow { required: usize, capacity: usize },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

impl InferenceError {
    /// Reply text produced before an evaluation failure, if any.
    pub fn partial_text(&self) -> Option<&str> {
        match self {
            InferenceError::Evaluation { partial, .. } if !partial.is_empty() => Some(partial),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, InferenceError>;
