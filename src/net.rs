//! Local-address helpers shared by Discovery and PairingCore.
use std::net::{IpAddr, Ipv4Addr};

/// All non-loopback IPv4 addresses bound to local interfaces.
pub fn local_ipv4_addresses() -> Vec<Ipv4Addr> {
    let Ok(ifaces) = if_addrs::get_if_addrs() else {
        return Vec::new();
    };
    ifaces
        .into_iter()
        .filter_map(|iface| match iface.ip() {
            IpAddr::V4(v4) if !iface.is_loopback() && !v4.is_loopback() => Some(v4),
            _ => None,
        })
        .collect()
}

/// `true` for the three RFC 1918 private ranges. `172.16/12` is checked as an
/// exact CIDR (octet 2 in `16..=31`), not the wider and wrong `172/8`.
pub fn is_rfc1918(addr: &Ipv4Addr) -> bool {
    let o = addr.octets();
    match o[0] {
        10 => true,
        172 => (16..=31).contains(&o[1]),
        192 => o[1] == 168,
        _ => false,
    }
}

/// The address PairingCore advertises in its QR payload: prefer an RFC 1918
/// address, then any other non-loopback address, then loopback.
pub fn preferred_advertise_host() -> Ipv4Addr {
    let addrs = local_ipv4_addresses();
    addrs
        .iter()
        .find(|a| is_rfc1918(a))
        .or_else(|| addrs.first())
        .copied()
        .unwrap_or(Ipv4Addr::LOCALHOST)
}
