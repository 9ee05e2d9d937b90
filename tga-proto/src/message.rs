//! Protocol message types for host→guest RPC calls.

use serde::{Deserialize, Serialize};

/// Default vsock port of the guest agent RPC service.
pub const AGENT_PORT: u32 = 8080;

/// First frame of every connection; selects the method being called.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Call {
    /// Bidirectional streaming command execution.
    ///
    /// The client follows up with [`ExecRequest`] frames and receives
    /// [`ExecResponse`] frames until [`ExecResponse::Exit`] or
    /// [`ExecResponse::Error`].
    Exec,
    /// Unary lookup of the guest's IPv4 address.
    ///
    /// The guest replies with one `Result<ResolveIpResponse, ErrorInfo>` frame.
    ResolveIp,
}

/// Message streamed from the client during an [`Call::Exec`] call.
///
/// The first message must be [`ExecRequest::Command`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ExecRequest {
    /// Describes the command to run.
    Command(Command),
    /// Bytes for the process's standard input. Empty data signals EOF.
    StandardInput(Vec<u8>),
    /// New pseudo-terminal dimensions.
    TerminalResize(TerminalSize),
}

/// Command to execute inside the guest.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Command {
    /// Executable path or name.
    pub name: String,
    /// Command-line arguments (excluding argv\[0\]).
    pub args: Vec<String>,
    /// Whether standard input is forwarded to the process.
    pub interactive: bool,
    /// Whether the process runs attached to a pseudo-terminal.
    pub tty: bool,
    /// Initial pseudo-terminal size; only used when `tty` is set.
    pub terminal_size: Option<TerminalSize>,
}

/// Pseudo-terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TerminalSize {
    /// Number of rows.
    pub rows: u32,
    /// Number of columns.
    pub cols: u32,
}

/// Message streamed from the guest during an [`Call::Exec`] call.
///
/// Zero or more [`ExecResponse::StandardOutput`] / [`ExecResponse::StandardError`]
/// chunks are followed by exactly one [`ExecResponse::Exit`], or by one
/// [`ExecResponse::Error`] when the call fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ExecResponse {
    /// A chunk of standard output (or PTY output in TTY mode).
    StandardOutput(Vec<u8>),
    /// A chunk of standard error; never sent in TTY mode.
    StandardError(Vec<u8>),
    /// The process terminated with the given code.
    Exit {
        /// Exit code reported by the process.
        code: i32,
    },
    /// The call failed; no further messages follow.
    Error(ErrorInfo),
}

/// Reply to [`Call::ResolveIp`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveIpResponse {
    /// Dotted-quad IPv4 address.
    pub ip: String,
}

/// Error category carried by [`ErrorInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ErrorCode {
    /// The client violated the call protocol.
    InvalidArgument,
    /// The requested resource is not available in the guest.
    Unavailable,
    /// The guest failed while serving the call.
    Internal,
}

/// Structured error returned to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Error category.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
}

impl ErrorInfo {
    /// Creates an error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for ErrorInfo {}
