//! Discovery of the guest's routable IPv4 address.

use std::io;
use std::net::{IpAddr, Ipv4Addr};

use nix::ifaddrs::getifaddrs;
use nix::sys::socket::SockaddrStorage;

/// Returns the first global-unicast IPv4 address assigned to any interface.
pub fn resolve_ip() -> io::Result<Ipv4Addr> {
    let addrs = getifaddrs().map_err(io::Error::from)?;
    let candidates = addrs
        .filter_map(|ifaddr| ifaddr.address)
        .filter_map(|addr| ip_of(&addr));

    first_global_unicast_v4(candidates).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            "no interface has a global unicast IPv4 address",
        )
    })
}

fn ip_of(addr: &SockaddrStorage) -> Option<IpAddr> {
    if let Some(sin) = addr.as_sockaddr_in() {
        return Some(IpAddr::V4(sin.ip()));
    }
    addr.as_sockaddr_in6().map(|sin6| IpAddr::V6(sin6.ip()))
}

/// Picks the first IPv4 address that is global unicast, in input order.
///
/// Private ranges count as global unicast; loopback, link-local, multicast,
/// broadcast and the unspecified address do not.
pub fn first_global_unicast_v4(addrs: impl IntoIterator<Item = IpAddr>) -> Option<Ipv4Addr> {
    addrs.into_iter().find_map(|addr| match addr {
        IpAddr::V4(v4) if is_global_unicast(v4) => Some(v4),
        _ => None,
    })
}

const fn is_global_unicast(ip: Ipv4Addr) -> bool {
    !(ip.is_unspecified()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_multicast()
        || ip.is_broadcast())
}
