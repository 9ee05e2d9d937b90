//! Async `AF_VSOCK` stream sockets for a guest agent.
//!
//! A [`Listener`] binds a port on the wildcard CID and hands out
//! [`Connection`]s that implement tokio's `AsyncRead`/`AsyncWrite` with
//! independent read and write deadlines. No operation is retried here;
//! retry policy belongs to the caller.

mod addr;
#[cfg(target_os = "linux")]
mod conn;
#[cfg(target_os = "linux")]
mod listener;

use std::io;

pub use addr::VsockAddr;
#[cfg(target_os = "linux")]
pub use conn::Connection;
#[cfg(target_os = "linux")]
pub use listener::Listener;

/// Alias for `Result<T, tga_vsock::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// A failed vsock system call.
#[derive(Debug, thiserror::Error)]
#[error("vsock {op}: {source}")]
pub struct Error {
    /// The operation that failed (`socket`, `bind`, `accept`, ...).
    pub op: &'static str,
    /// The underlying system error.
    #[source]
    pub source: io::Error,
}

impl Error {
    /// Wraps `source` as the failure of `op`.
    pub const fn new(op: &'static str, source: io::Error) -> Self {
        Self { op, source }
    }

    /// Captures `errno` as the failure of `op`.
    #[cfg(target_os = "linux")]
    pub(crate) fn last_os_error(op: &'static str) -> Self {
        Self::new(op, io::Error::last_os_error())
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        Self::new(e.source.kind(), e)
    }
}
