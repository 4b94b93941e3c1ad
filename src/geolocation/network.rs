//! Private and local network address classification

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Check whether an address string belongs to a private or local network
///
/// Malformed input is treated as public (returns false).
pub fn is_private_address(ip: &str) -> bool {
    match ip.trim().parse::<IpAddr>() {
        Ok(addr) => is_private_ip(&addr),
        Err(_) => false,
    }
}

/// Classify a parsed address
pub fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_v4(v4),
        IpAddr::V6(v6) => is_private_v6(v6),
    }
}

fn is_private_v4(ip: &Ipv4Addr) -> bool {
    let [a, b, _, _] = ip.octets();
    a == 10
        || (a == 172 && (16..=31).contains(&b))
        || (a == 192 && b == 168)
        || a == 127
        || (a == 169 && b == 254)
}

fn is_private_v6(ip: &Ipv6Addr) -> bool {
    if ip.is_loopback() {
        return true;
    }
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_private_v4(&v4);
    }
    let first = ip.segments()[0];
    // fe80::/10 link-local
    (first & 0xffc0) == 0xfe80
        // fc00::/7 unique local
        || (first & 0xfe00) == 0xfc00
}
