//! Vsock address: a bare port number.

use std::fmt;

/// Address of a vsock endpoint.
///
/// The hypervisor routes by VM identity, so only the port is meaningful to
/// the guest. A port of `0` means the peer address could not be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct VsockAddr {
    /// Port number.
    pub port: u32,
}

impl VsockAddr {
    /// Creates an address for `port`.
    pub const fn new(port: u32) -> Self {
        Self { port }
    }

    /// Network name, for symmetry with other socket address kinds.
    pub const fn network(&self) -> &'static str {
        "vsock"
    }
}

impl fmt::Display for VsockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.port)
    }
}
