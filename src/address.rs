//! Destination address canonicalization.
//!
//! Everything that talks to a remote host goes through [`canonicalize`] so
//! that one unambiguous `host:port` string is logged, reported and dialed.

use crate::config::DEFAULT_MANAGEMENT_PORT;
use crate::{FerryError, Result, log_debug};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, ToSocketAddrs};

const LOCALHOST: &str = "localhost";

/// Canonicalize `host` and `port` into the wire-format destination.
///
/// A missing host (or the `"0"` placeholder) means this host. A host that
/// already carries a port is passed through untouched when no separate
/// port is given.
pub fn canonicalize(host: Option<&str>, port: Option<u16>) -> Result<String> {
    if port == Some(0) {
        return Err(FerryError::InvalidArgument("port 0 is not dialable".to_string()));
    }

    let host = match host.map(str::trim) {
        None | Some("") | Some("0") => {
            let local = local_address();
            log_debug!("No destination host given, using local address {}", local);
            return Ok(render(&local, port.unwrap_or(DEFAULT_MANAGEMENT_PORT)));
        }
        Some(host) => host,
    };

    if let Some((addr, embedded)) = split_host_port(host)? {
        return match port {
            None => Ok(host.to_string()),
            Some(port) => {
                log_debug!(
                    "Replacing embedded port {} of {} with {}",
                    embedded,
                    addr,
                    port
                );
                Ok(render(&addr, port))
            }
        };
    }

    let addr = strip_brackets(host);
    validate_host(addr)?;
    Ok(render(addr, port.unwrap_or(DEFAULT_MANAGEMENT_PORT)))
}

/// Like [`canonicalize`], for a port that arrived as JSON and has not been
/// type checked yet. Anything but an integer is rejected, strings included.
pub fn canonicalize_value(host: Option<&str>, port: Option<&serde_json::Value>) -> Result<String> {
    let port = match port {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::Number(number)) => {
            let value = number.as_u64().ok_or_else(|| {
                FerryError::InvalidArgument(format!("port must be a positive integer, got {}", number))
            })?;
            let port = u16::try_from(value).map_err(|_| {
                FerryError::InvalidArgument(format!("port {} out of range", value))
            })?;
            Some(port)
        }
        Some(other) => {
            return Err(FerryError::InvalidArgument(format!(
                "port must be an integer, got {}",
                other
            )));
        }
    };
    canonicalize(host, port)
}

/// Split `host:port` / `[v6]:port` into its parts.
///
/// `Ok(None)` when there is no port to split off, which covers bare
/// hostnames, IPv4 and unbracketed IPv6 literals.
pub fn split_host_port(addr: &str) -> Result<Option<(String, u16)>> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (inner, tail) = rest
            .split_once(']')
            .ok_or_else(|| FerryError::InvalidAddress(format!("unterminated bracket in {}", addr)))?;
        validate_ipv6(inner)?;
        return match tail {
            "" => Ok(None),
            tail => {
                let port = tail
                    .strip_prefix(':')
                    .ok_or_else(|| FerryError::InvalidAddress(addr.to_string()))?;
                Ok(Some((inner.to_string(), parse_port(port, addr)?)))
            }
        };
    }

    // More than one colon without brackets can only be a bare IPv6 literal.
    if addr.matches(':').count() != 1 {
        return Ok(None);
    }

    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| FerryError::InvalidAddress(addr.to_string()))?;
    validate_host(host)?;
    Ok(Some((host.to_string(), parse_port(port, addr)?)))
}

/// Host part of `addr` as it appears in a URI: port dropped, IPv6 bracketed.
pub fn uri_host(addr: &str) -> Result<String> {
    let host = match split_host_port(addr)? {
        Some((host, _)) => host,
        None => strip_brackets(addr).to_string(),
    };
    if host.contains(':') {
        Ok(format!("[{}]", host))
    } else {
        Ok(host)
    }
}

fn parse_port(port: &str, addr: &str) -> Result<u16> {
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(FerryError::InvalidAddress(format!(
            "malformed port in {}",
            addr
        ))),
        Ok(port) => Ok(port),
    }
}

fn strip_brackets(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

fn render(addr: &str, port: u16) -> String {
    if addr.contains(':') {
        format!("[{}]:{}", addr, port)
    } else {
        format!("{}:{}", addr, port)
    }
}

fn validate_host(host: &str) -> Result<()> {
    if host == LOCALHOST {
        return Ok(());
    }
    if host.contains(':') {
        return validate_ipv6(host);
    }
    if looks_like_ipv4(host) {
        return host
            .parse::<Ipv4Addr>()
            .map(|_| ())
            .map_err(|_| FerryError::InvalidAddress(format!("invalid IPv4 address: {}", host)));
    }
    if is_hostname(host) {
        return Ok(());
    }
    Err(FerryError::InvalidAddress(format!(
        "unrecognized address: {}",
        host
    )))
}

/// IPv6 literal, optionally suffixed with `/prefixlen` in `0..=127`.
fn validate_ipv6(addr: &str) -> Result<()> {
    let (literal, prefix) = match addr.split_once('/') {
        Some((literal, prefix)) => (literal, Some(prefix)),
        None => (addr, None),
    };

    literal
        .parse::<Ipv6Addr>()
        .map_err(|_| FerryError::InvalidAddress(format!("invalid IPv6 address: {}", addr)))?;

    if let Some(prefix) = prefix {
        match prefix.parse::<u8>() {
            Ok(len) if len <= 127 => {}
            _ => {
                return Err(FerryError::InvalidAddress(format!(
                    "invalid IPv6 prefix length: {}",
                    addr
                )));
            }
        }
    }
    Ok(())
}

fn looks_like_ipv4(host: &str) -> bool {
    host.chars().all(|c| c.is_ascii_digit() || c == '.')
}

// RFC 1123 labels. An all-numeric name was already routed to IPv4.
fn is_hostname(host: &str) -> bool {
    if host.is_empty() || host.len() > 253 {
        return false;
    }
    host.trim_end_matches('.').split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

/// First non-loopback address this host's name resolves to.
fn local_address() -> String {
    let hostname = match nix::unistd::gethostname() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(_) => return LOCALHOST.to_string(),
    };

    (hostname.as_str(), 0)
        .to_socket_addrs()
        .ok()
        .and_then(|addrs| {
            addrs
                .map(|sa| sa.ip())
                .find(|ip| !ip.is_loopback() && !is_link_local(ip))
        })
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| LOCALHOST.to_string())
}

fn is_link_local(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_is_address_with_port(addr: &str) {
        let (host, port) = addr
            .rsplit_once(':')
            .unwrap_or_else(|| panic!("{} has no port", addr));
        let port: u16 = port.parse().expect("numeric port");
        assert!(port > 0);
        if host != LOCALHOST {
            if let Some(inner) = host.strip_prefix('[') {
                assert!(host.ends_with(']'), "malformed IPv6 address: {}", host);
                validate_ipv6(inner.trim_end_matches(']')).unwrap();
            } else {
                validate_host(host).unwrap();
            }
        }
    }

    #[test]
    fn test_no_arguments() {
        assert_is_address_with_port(&canonicalize(None, None).unwrap());
    }

    #[test]
    fn test_no_host_with_port() {
        let res = canonicalize(None, Some(65432)).unwrap();
        assert_is_address_with_port(&res);
        assert!(res.ends_with("65432"));
    }

    #[test]
    fn test_zero_host_means_local() {
        assert_is_address_with_port(&canonicalize(Some("0"), None).unwrap());
    }

    #[test]
    fn test_address_no_port() {
        let res = canonicalize(Some("127.0.0.1"), None).unwrap();
        assert_is_address_with_port(&res);
        assert_eq!(res, "127.0.0.1:54321");
    }

    #[test]
    fn test_address_with_port_passes_through() {
        let address = "127.0.0.1:65432";
        assert_eq!(canonicalize(Some(address), None).unwrap(), address);
    }

    #[test]
    fn test_address_with_port_parameter() {
        let res = canonicalize(Some("127.0.0.1"), Some(65432)).unwrap();
        assert_is_address_with_port(&res);
        assert!(res.ends_with("65432"));
    }

    #[test]
    fn test_string_port_is_a_type_error() {
        let port = serde_json::json!("65432");
        assert!(matches!(
            canonicalize_value(Some("127.0.0.1"), Some(&port)),
            Err(FerryError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_integer_json_port() {
        let port = serde_json::json!(65432);
        assert_eq!(
            canonicalize_value(Some("127.0.0.1"), Some(&port)).unwrap(),
            "127.0.0.1:65432"
        );
        let huge = serde_json::json!(70000);
        assert!(canonicalize_value(Some("127.0.0.1"), Some(&huge)).is_err());
    }

    #[test]
    fn test_ipv6_is_bracketed() {
        assert_eq!(
            canonicalize(Some("fe80::1"), Some(1234)).unwrap(),
            "[fe80::1]:1234"
        );
        assert_eq!(
            canonicalize(Some("[::1]"), Some(1234)).unwrap(),
            "[::1]:1234"
        );
        assert_eq!(
            canonicalize(Some("2001:db8::1/64"), Some(1234)).unwrap(),
            "[2001:db8::1/64]:1234"
        );
        let passthrough = "[2001:db8::1]:4000";
        assert_eq!(canonicalize(Some(passthrough), None).unwrap(), passthrough);
    }

    #[test]
    fn test_ipv6_prefix_bounds() {
        assert!(canonicalize(Some("2001:db8::1/127"), None).is_ok());
        assert!(matches!(
            canonicalize(Some("2001:db8::1/128"), None),
            Err(FerryError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_localhost_and_hostnames() {
        assert_eq!(canonicalize(Some("localhost"), None).unwrap(), "localhost:54321");
        assert_eq!(
            canonicalize(Some("dst-host.example.com"), Some(22)).unwrap(),
            "dst-host.example.com:22"
        );
    }

    #[test]
    fn test_invalid_addresses() {
        for bad in ["256.1.1.1", "1.2.3", "not a host", "[::1", "-bad-.example", "::g"] {
            assert!(
                matches!(canonicalize(Some(bad), None), Err(FerryError::InvalidAddress(_))),
                "{} should be rejected",
                bad
            );
        }
        assert!(canonicalize(Some("127.0.0.1:0"), None).is_err());
        assert!(canonicalize(Some("127.0.0.1:http"), None).is_err());
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(
            split_host_port("10.0.0.1:2222").unwrap(),
            Some(("10.0.0.1".to_string(), 2222))
        );
        assert_eq!(
            split_host_port("[::1]:2222").unwrap(),
            Some(("::1".to_string(), 2222))
        );
        assert_eq!(split_host_port("10.0.0.1").unwrap(), None);
        assert_eq!(split_host_port("::1").unwrap(), None);
    }

    #[test]
    fn test_uri_host() {
        assert_eq!(uri_host("10.0.0.1:54321").unwrap(), "10.0.0.1");
        assert_eq!(uri_host("10.0.0.1").unwrap(), "10.0.0.1");
        assert_eq!(uri_host("[fe80::1]:54321").unwrap(), "[fe80::1]");
        assert_eq!(uri_host("fe80::1").unwrap(), "[fe80::1]");
        assert_eq!(uri_host("[::1]").unwrap(), "[::1]");
        assert_eq!(uri_host("dst.example.com:54321").unwrap(), "dst.example.com");
    }
}
