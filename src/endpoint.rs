use std::net::IpAddr;

/// Malformed `host:port` endpoint
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("address {address}: {reason}")]
pub struct AddrError {
    pub address: String,
    pub reason: &'static str,
}

/// Splits `host:port` or `[v6]:port` into host and port
pub fn split_host_port(address: &str) -> Result<(String, String), AddrError> {
    let err = |reason| AddrError {
        address: address.to_string(),
        reason,
    };
    if let Some(rest) = address.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(|| err("missing ']' in address"))?;
        let port = tail.strip_prefix(':').ok_or_else(|| err("missing port in address"))?;
        return Ok((host.to_string(), port.to_string()));
    }
    let (host, port) = address.rsplit_once(':').ok_or_else(|| err("missing port in address"))?;
    if host.contains(':') {
        return Err(err("too many colons in address"));
    }
    Ok((host.to_string(), port.to_string()))
}

/// Joins host and port, bracketing IPv6 literals
pub fn join_host_port(host: &str, port: &str) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

pub fn is_ip_literal(host: &str) -> bool {
    host.parse::<IpAddr>().is_ok()
}

#[cfg(test)]
mod endpoint_tests {
    use super::*;

    #[test]
    fn test_split_host_port() {
        assert_eq!(
            split_host_port("8.8.8.8:53").unwrap(),
            ("8.8.8.8".to_string(), "53".to_string())
        );
        assert_eq!(
            split_host_port("[2001:db8::1]:443").unwrap(),
            ("2001:db8::1".to_string(), "443".to_string())
        );
        assert!(split_host_port("example.com").is_err());
        assert!(split_host_port("2001:db8::1").is_err());
    }

    #[test]
    fn test_join_host_port() {
        assert_eq!(join_host_port("::1", "53"), "[::1]:53");
        assert_eq!(join_host_port("dns.google", "853"), "dns.google:853");
    }
}
