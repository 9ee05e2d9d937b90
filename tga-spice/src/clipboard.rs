//! Guest clipboard access used by the agent.

use std::future::Future;
use std::io;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// The guest OS clipboard, text format only.
///
/// [`Agent`](crate::Agent) calls [`init`](Clipboard::init) once, after the
/// first successful read from the serial channel, and only then starts
/// [`watch`](Clipboard::watch).
pub trait Clipboard: Send {
    /// Prepares the clipboard for use.
    fn init(&mut self) -> impl Future<Output = io::Result<()>> + Send;

    /// Returns the current clipboard contents.
    fn read(&mut self) -> impl Future<Output = io::Result<Vec<u8>>> + Send;

    /// Replaces the clipboard contents.
    fn write(&mut self, data: &[u8]) -> impl Future<Output = io::Result<()>> + Send;

    /// Starts watching for changes.
    ///
    /// Each change yields a snapshot of the new contents. The watch stops when
    /// `cancel` fires or the receiver is dropped.
    fn watch(&mut self, cancel: CancellationToken) -> mpsc::Receiver<Vec<u8>>;
}
