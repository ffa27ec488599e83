//! Built-in processors.

pub mod llm;

pub use llm::{render_template, ChatMessage, ChatRequest, LlmProcessor};
