//! Chunk framing of the virtual serial channel.
//!
//! Every write is prefixed by an 8-byte header `{port: u32, size: u32}`
//! (little-endian). Reads strip the headers again and present the payloads as
//! one contiguous byte stream, so chunk boundaries never leak upwards.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Length of a chunk header in bytes.
pub const CHUNK_HEADER_LEN: usize = 8;

/// Port stamped on every outbound chunk.
pub const VDP_CLIENT_PORT: u32 = 1;

/// Byte stream adapter that adds and removes chunk headers.
///
/// Both directions keep their progress in `self`, so a pending read or write
/// can be dropped and polled again without losing bytes.
#[derive(Debug)]
pub struct Chunked<S> {
    /// The raw serial stream.
    inner: S,
    /// Unread payload bytes of the current inbound chunk.
    remaining: u32,
    /// Inbound header being assembled.
    header: [u8; CHUNK_HEADER_LEN],
    /// Number of valid bytes in `header`.
    header_filled: usize,
    /// Outbound chunk (header + payload) not yet fully written.
    pending: Vec<u8>,
    /// Bytes of `pending` already written.
    written: usize,
    /// Payload length of the chunk in `pending`.
    payload_len: usize,
}

impl<S> Chunked<S> {
    /// Wraps a raw duplex stream.
    pub const fn new(inner: S) -> Self {
        Self {
            inner,
            remaining: 0,
            header: [0; CHUNK_HEADER_LEN],
            header_filled: 0,
            pending: Vec::new(),
            written: 0,
            payload_len: 0,
        }
    }

    /// Returns a reference to the wrapped stream.
    pub const fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Unwraps the raw stream, discarding any partial chunk state.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Chunked<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        loop {
            if this.remaining > 0 {
                let want = buf.remaining().min(this.remaining as usize);
                let dst = &mut buf.initialize_unfilled_to(want)[..want];
                let mut sub = ReadBuf::new(dst);
                ready!(Pin::new(&mut this.inner).poll_read(cx, &mut sub))?;
                let n = sub.filled().len();
                if n == 0 {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "serial channel closed inside a chunk",
                    )));
                }
                buf.advance(n);
                // n <= want <= remaining
                this.remaining -= n as u32;
                return Poll::Ready(Ok(()));
            }

            let mut hdr = ReadBuf::new(&mut this.header[this.header_filled..]);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut hdr))?;
            let n = hdr.filled().len();
            if n == 0 {
                if this.header_filled == 0 {
                    return Poll::Ready(Ok(()));
                }
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "serial channel closed inside a chunk header",
                )));
            }
            this.header_filled += n;

            if this.header_filled == CHUNK_HEADER_LEN {
                let size = [
                    this.header[4],
                    this.header[5],
                    this.header[6],
                    this.header[7],
                ];
                this.remaining = u32::from_le_bytes(size);
                this.header_filled = 0;
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Chunked<S> {
    /// Writes `buf` as exactly one chunk.
    ///
    /// Header and payload go out as one buffer. The call only completes once
    /// the whole chunk is written, and always reports `buf.len()`. An empty
    /// `buf` produces an empty chunk and reports 0.
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.pending.is_empty() {
            let size = u32::try_from(buf.len()).map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidInput, "chunk exceeds u32::MAX bytes")
            })?;
            this.pending.reserve(CHUNK_HEADER_LEN + buf.len());
            this.pending.extend_from_slice(&VDP_CLIENT_PORT.to_le_bytes());
            this.pending.extend_from_slice(&size.to_le_bytes());
            this.pending.extend_from_slice(buf);
            this.written = 0;
            this.payload_len = buf.len();
        }

        while this.written < this.pending.len() {
            let n = ready!(Pin::new(&mut this.inner).poll_write(cx, &this.pending[this.written..]))?;
            if n == 0 {
                this.pending.clear();
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            this.written += n;
        }

        this.pending.clear();
        Poll::Ready(Ok(this.payload_len))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
