//! Accepted vsock connection with read/write deadlines.

#![allow(unsafe_code)]

use std::future::Future;
use std::io;
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd};
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Instant, Sleep};

use crate::{Error, Result, VsockAddr};

/// A connected `AF_VSOCK` stream.
///
/// Reads and writes fail with [`io::ErrorKind::TimedOut`] once their
/// respective deadline has passed. Deadlines apply to every subsequent
/// operation until changed or cleared.
#[derive(Debug)]
pub struct Connection {
    /// Non-blocking socket registered with the reactor.
    fd: AsyncFd<OwnedFd>,
    /// Port the connection was accepted on.
    local_port: u32,
    /// Peer port, `0` when unknown.
    remote_port: u32,
    /// Armed read deadline, if any.
    read_deadline: Option<Pin<Box<Sleep>>>,
    /// Armed write deadline, if any.
    write_deadline: Option<Pin<Box<Sleep>>>,
}

impl Connection {
    /// Wraps a connected, non-blocking stream socket.
    pub(crate) fn from_owned_fd(fd: OwnedFd, local_port: u32, remote_port: u32) -> io::Result<Self> {
        Ok(Self {
            fd: AsyncFd::new(fd)?,
            local_port,
            remote_port,
            read_deadline: None,
            write_deadline: None,
        })
    }

    /// Sets (or clears, with `None`) the deadline for reads.
    pub fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.read_deadline = deadline.map(|at| Box::pin(tokio::time::sleep_until(at)));
    }

    /// Sets (or clears, with `None`) the deadline for writes.
    pub fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.write_deadline = deadline.map(|at| Box::pin(tokio::time::sleep_until(at)));
    }

    /// Sets both deadlines at once.
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    /// Local address (the listening port).
    pub const fn local_addr(&self) -> VsockAddr {
        VsockAddr::new(self.local_port)
    }

    /// Remote address; port `0` when the peer could not be resolved.
    pub const fn remote_addr(&self) -> VsockAddr {
        VsockAddr::new(self.remote_port)
    }

    /// Closes the socket, reporting any error from `close(2)`.
    pub fn close(self) -> Result<()> {
        let raw = self.fd.into_inner().into_raw_fd();
        // SAFETY: `raw` was released from its OwnedFd and is closed exactly once.
        if unsafe { libc::close(raw) } < 0 {
            return Err(Error::last_os_error("close"));
        }
        Ok(())
    }
}

/// Polls an optional deadline, failing once it has elapsed.
fn poll_deadline(deadline: Option<&mut Pin<Box<Sleep>>>, cx: &mut Context<'_>) -> io::Result<()> {
    if let Some(sleep) = deadline {
        if sleep.as_mut().poll(cx).is_ready() {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "vsock deadline exceeded",
            ));
        }
    }
    Ok(())
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            poll_deadline(this.read_deadline.as_mut(), cx)?;

            let mut guard = ready!(this.fd.poll_read_ready(cx))?;
            let unfilled = buf.initialize_unfilled();
            let result = guard.try_io(|inner| {
                // SAFETY: `unfilled` is a writable, initialized buffer of the given length.
                let n = unsafe {
                    libc::read(
                        inner.as_raw_fd(),
                        unfilled.as_mut_ptr().cast(),
                        unfilled.len(),
                    )
                };
                usize::try_from(n).map_err(|_| io::Error::last_os_error())
            });

            match result {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => {}
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => {}
            }
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        loop {
            poll_deadline(this.write_deadline.as_mut(), cx)?;

            let mut guard = ready!(this.fd.poll_write_ready(cx))?;
            let result = guard.try_io(|inner| {
                // SAFETY: `buf` is a readable buffer of the given length.
                let n = unsafe {
                    libc::send(
                        inner.as_raw_fd(),
                        buf.as_ptr().cast(),
                        buf.len(),
                        libc::MSG_NOSIGNAL,
                    )
                };
                usize::try_from(n).map_err(|_| io::Error::last_os_error())
            });

            match result {
                Ok(Ok(n)) => return Poll::Ready(Ok(n)),
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => {}
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => {}
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // SAFETY: shutdown(2) on a socket we own.
        if unsafe { libc::shutdown(self.fd.as_raw_fd(), libc::SHUT_WR) } < 0 {
            return Poll::Ready(Err(io::Error::last_os_error()));
        }
        Poll::Ready(Ok(()))
    }
}
