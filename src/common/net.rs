//! Network helpers used during compilation

use std::net::IpAddr;

/// Loopback address every bridged inbound/outbound binds to.
pub const LOCALHOST: &str = "127.0.0.1";

/// True when `s` parses as a bare IPv4/IPv6 address.
pub fn is_ip_address(s: &str) -> bool {
    s.parse::<IpAddr>().is_ok()
}

/// Split a `host:port` suffix off a DNS server address, if present.
///
/// URL-form servers (`https+local://...`) are returned untouched.
pub fn split_host_port(address: &str) -> (&str, Option<u16>) {
    if address.contains("://") {
        return (address, None);
    }
    // IPv6 literals contain colons; only split when the tail parses as a port
    // and the head is still a valid address or hostname.
    if let Some(idx) = address.rfind(':') {
        let (head, tail) = (&address[..idx], &address[idx + 1..]);
        if let Ok(port) = tail.parse::<u16>() {
            if !head.contains(':') || head.parse::<IpAddr>().is_ok() {
                return (head, Some(port));
            }
        }
    }
    (address, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_ip_address() {
        assert!(is_ip_address("1.1.1.1"));
        assert!(is_ip_address("::1"));
        assert!(!is_ip_address("dns.google"));
        assert!(!is_ip_address("https://1.1.1.1/dns-query"));
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("1.1.1.1:5353"), ("1.1.1.1", Some(5353)));
        assert_eq!(split_host_port("1.1.1.1"), ("1.1.1.1", None));
        assert_eq!(split_host_port("https://dns.google/dns-query"), ("https://dns.google/dns-query", None));
        assert_eq!(split_host_port("::1"), ("::1", None));
    }
}
