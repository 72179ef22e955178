//! Client IP derivation (§6.4), used for audit/notification events. Lives
//! outside the Router proper since both the gateway's message channel and
//! the RDP tunnel need the same precedence rule.

/// `X-Forwarded-For` (first value of the comma-separated list) → `X-Real-IP`
/// → socket remote address → `"unknown"`.
pub fn derive_ip(forwarded_for: Option<&str>, real_ip: Option<&str>, socket_ip: Option<std::net::IpAddr>) -> String {
    if let Some(list) = forwarded_for {
        if let Some(first) = list.split(',').map(str::trim).find(|s| !s.is_empty()) {
            return first.to_string();
        }
    }
    if let Some(ip) = real_ip {
        if !ip.trim().is_empty() {
            return ip.trim().to_string();
        }
    }
    if let Some(ip) = socket_ip {
        return ip.to_string();
    }
    "unknown".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn prefers_forwarded_for() {
        let ip = derive_ip(Some("1.2.3.4, 5.6.7.8"), Some("9.9.9.9"), None);
        assert_eq!(ip, "1.2.3.4");
    }

    #[test]
    fn falls_back_to_real_ip() {
        let ip = derive_ip(None, Some("9.9.9.9"), None);
        assert_eq!(ip, "9.9.9.9");
    }

    #[test]
    fn falls_back_to_socket_addr() {
        let socket = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
        let ip = derive_ip(None, None, Some(socket));
        assert_eq!(ip, "127.0.0.1");
    }

    #[test]
    fn falls_back_to_unknown() {
        assert_eq!(derive_ip(None, None, None), "unknown");
    }

    #[test]
    fn skips_blank_forwarded_for_entries() {
        let ip = derive_ip(Some(""), Some("9.9.9.9"), None);
        assert_eq!(ip, "9.9.9.9");
    }
}
