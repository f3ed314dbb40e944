//! Chat-platform seams.
//!
//! The orchestrator talks to a platform through [`ChannelOutbound`] for
//! replies and [`ConversationHistory`] for earlier turns. `console` is a
//! JSON-lines implementation over stdin/stdout.

pub mod console;
pub mod plugin;

pub use plugin::{ChannelOutbound, ConversationHistory, HistoryPage, InboundMessage, NoHistory};
