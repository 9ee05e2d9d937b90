//! SPICE guest agent protocol over a virtual serial channel.
//!
//! Three layers, bottom up:
//!
//! - [`Chunked`] imposes the 8-byte chunk framing on the raw serial stream.
//! - [`MessageCodec`] splits the resulting byte stream into [`Message`]
//!   envelopes, and [`AgentMessage`] decodes their payloads.
//! - [`Agent`] runs the capability negotiation and keeps the guest and host
//!   clipboards in sync through a [`Clipboard`] implementation.

mod chunk;
mod clipboard;
mod engine;
mod error;
mod message;

pub use chunk::{CHUNK_HEADER_LEN, Chunked, VDP_CLIENT_PORT};
pub use clipboard::Clipboard;
pub use engine::Agent;
pub use error::{Error, Result};
pub use message::{
    AgentMessage, Caps, Capabilities, ClipboardData, ClipboardGrab, ClipboardRequest,
    ENVELOPE_LEN, MAX_MESSAGE, Message, MessageCodec, VD_AGENT_PROTOCOL, kind, selection,
    clipboard_type,
};
