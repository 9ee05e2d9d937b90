//! Wire protocol for the guest agent RPC service.
//!
//! Messages are serialized with [`postcard`] and framed with a 4-byte
//! big-endian length prefix. Each connection carries a single call: the
//! client opens with a [`Call`] frame, then the call-specific messages follow.

mod codec;
mod message;

pub use codec::{MAX_FRAME, recv, send, try_recv};
pub use message::{
    AGENT_PORT, Call, Command, ErrorCode, ErrorInfo, ExecRequest, ExecResponse,
    ResolveIpResponse, TerminalSize,
};
