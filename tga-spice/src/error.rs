//! Error types for the SPICE agent.

use std::io;

/// Alias for `Result<T, tga_spice::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that end an [`Agent`](crate::Agent) run.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The very first read from the serial channel failed: the host side
    /// of the channel is not connected.
    #[error("SPICE clipboard channel not connected: {0}")]
    NotConnected(#[source] io::Error),

    /// A malformed envelope or payload.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The guest clipboard failed.
    #[error("clipboard: {0}")]
    Clipboard(#[source] io::Error),

    /// The clipboard watch stopped producing snapshots.
    #[error("clipboard watch ended")]
    WatchClosed,

    /// An I/O error on the serial channel.
    #[error(transparent)]
    Io(#[from] io::Error),
}
