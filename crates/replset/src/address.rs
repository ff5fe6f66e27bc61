//! Host:port canonicalization
//!
//! Some server versions report IPv6 members as `::1:27017` instead of
//! `[::1]:27017`. Every address read back from the store goes through
//! [`normalize_address`] so it compares equal to the address that was written.

use std::net::Ipv6Addr;

/// Canonicalize a `host:port` string.
///
/// IPv6 hosts are wrapped in brackets; IPv4 and hostnames are returned as-is.
/// Normalizing an already-canonical address is a no-op.
pub fn normalize_address(addr: &str) -> String {
    if addr.starts_with('[') || addr.matches(':').count() < 2 {
        return addr.to_string();
    }

    match addr.rfind(':') {
        Some(idx) if addr[..idx].parse::<Ipv6Addr>().is_ok() => {
            format!("[{}]{}", &addr[..idx], &addr[idx..])
        }
        _ => addr.to_string(),
    }
}

/// Strip the brackets from an IPv6 `host:port`, the way older servers report it.
pub fn strip_ipv6_brackets(addr: &str) -> String {
    match (addr.strip_prefix('['), addr.find(']')) {
        (Some(_), Some(end)) => format!("{}{}", &addr[1..end], &addr[end + 1..]),
        _ => addr.to_string(),
    }
}
