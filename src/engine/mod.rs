//! Turn execution on top of a [`ComputeContext`](crate::backend::ComputeContext).
//!
//! - [`ContextState`]: which prefix of the conversation is resident
//! - [`prefill`](prefill::prefill): evaluate only the uncommitted suffix
//! - [`Sampler`]: per-turn token selection
//! - [`run_generation`]: sample, stream and feed back until a stop condition

pub mod context;
pub mod generate;
pub mod prefill;
pub mod sampler;

pub use context::ContextState;
pub use generate::{
    run_generation, GenerationLimits, GenerationOutput, NullSink, StopReason, TokenSink,
};
pub use prefill::{prefill, Prefilled};
pub use sampler::Sampler;
