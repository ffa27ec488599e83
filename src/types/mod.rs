//! Conversation records processed by the task engine.
//!
//! - **Message**: a single `(role, content)` turn with optional metadata
//! - **Conversation**: an ordered list of messages plus record metadata
//! - **Identifiable**: the stable item identity used for checkpointing

mod conversation;

pub use conversation::{is_line_safe, Conversation, Identifiable, Message, ID_METADATA_KEY};
