mod generator;
mod orchestrator;
pub mod prompt;

pub use generator::{GenerationError, GenerationRequest, Generator, HttpGenerator};
pub use orchestrator::{FALLBACK_REPLY, Orchestrator, Outcome};
