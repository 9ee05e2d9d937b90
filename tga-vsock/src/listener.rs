//! Vsock listener bound to the wildcard CID.

#![allow(unsafe_code)]

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use tokio::io::unix::AsyncFd;

use crate::{Connection, Error, Result, VsockAddr};

/// A listening `AF_VSOCK` stream socket.
#[derive(Debug)]
pub struct Listener {
    /// Non-blocking listening socket registered with the reactor.
    fd: AsyncFd<OwnedFd>,
    /// Port the listener is bound to.
    port: u32,
}

impl Listener {
    /// Binds `port` on `VMADDR_CID_ANY` and starts listening with the
    /// system's maximum backlog.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(port: u32) -> Result<Self> {
        // SAFETY: plain socket(2) call; the result is checked before use.
        let raw = unsafe {
            libc::socket(
                libc::AF_VSOCK,
                libc::SOCK_STREAM | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
                0,
            )
        };
        if raw < 0 {
            return Err(Error::last_os_error("socket"));
        }
        // SAFETY: `raw` is a freshly created, owned descriptor.
        let sock = unsafe { OwnedFd::from_raw_fd(raw) };

        // SAFETY: sockaddr_vm is plain old data; all-zero is a valid value.
        let mut addr: libc::sockaddr_vm = unsafe { std::mem::zeroed() };
        addr.svm_family = libc::AF_VSOCK as libc::sa_family_t;
        addr.svm_cid = libc::VMADDR_CID_ANY;
        addr.svm_port = port;

        // SAFETY: `addr` is a valid sockaddr_vm and the length matches it.
        let rc = unsafe {
            libc::bind(
                sock.as_raw_fd(),
                std::ptr::from_ref(&addr).cast(),
                size_of::<libc::sockaddr_vm>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(Error::last_os_error("bind"));
        }

        // SAFETY: listen(2) on a bound socket we own.
        if unsafe { libc::listen(sock.as_raw_fd(), libc::SOMAXCONN) } < 0 {
            return Err(Error::last_os_error("listen"));
        }

        let fd = AsyncFd::new(sock).map_err(|e| Error::new("register", e))?;
        tracing::debug!(port, "vsock listener bound");
        Ok(Self { fd, port })
    }

    /// Waits for the next incoming connection.
    ///
    /// The peer's port is resolved with `getpeername(2)`; when that fails the
    /// remote address degrades to port `0` and the connection is still
    /// returned.
    pub async fn accept(&self) -> Result<Connection> {
        loop {
            let mut guard = self
                .fd
                .readable()
                .await
                .map_err(|e| Error::new("accept", e))?;

            let accepted = guard.try_io(|inner| {
                // SAFETY: accept4(2) without peer address output buffers.
                let raw = unsafe {
                    libc::accept4(
                        inner.as_raw_fd(),
                        std::ptr::null_mut(),
                        std::ptr::null_mut(),
                        libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
                    )
                };
                if raw < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    // SAFETY: accept4 returned a new descriptor we now own.
                    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
                }
            });

            match accepted {
                Ok(Ok(fd)) => {
                    let remote_port = remote_port_or_zero(&fd);
                    return Connection::from_owned_fd(fd, self.port, remote_port)
                        .map_err(|e| Error::new("register", e));
                }
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => {}
                Ok(Err(e)) => return Err(Error::new("accept", e)),
                Err(_would_block) => {}
            }
        }
    }

    /// Local address of the listener.
    pub const fn local_addr(&self) -> VsockAddr {
        VsockAddr::new(self.port)
    }
}

/// Peer port of `fd`, or `0` when it cannot be resolved.
fn remote_port_or_zero(fd: &OwnedFd) -> u32 {
    peer_port(fd).unwrap_or_else(|e| {
        tracing::debug!(error = %e, "cannot resolve vsock peer, using port 0");
        0
    })
}

/// Port of the connected peer of `fd`.
fn peer_port(fd: &OwnedFd) -> io::Result<u32> {
    // SAFETY: sockaddr_vm is plain old data; all-zero is a valid value.
    let mut addr: libc::sockaddr_vm = unsafe { std::mem::zeroed() };
    let mut len = size_of::<libc::sockaddr_vm>() as libc::socklen_t;

    // SAFETY: `addr` and `len` describe a writable buffer of the right size.
    let rc = unsafe {
        libc::getpeername(
            fd.as_raw_fd(),
            std::ptr::from_mut(&mut addr).cast(),
            &raw mut len,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    if i32::from(addr.svm_family) != libc::AF_VSOCK {
        return Err(io::Error::other("peer is not an AF_VSOCK address"));
    }
    Ok(addr.svm_port)
}
