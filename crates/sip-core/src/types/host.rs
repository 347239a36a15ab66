//! `host[:port]` helpers shared by URIs, Via hops and transport targets.

use std::net::IpAddr;

use crate::error::{Error, Result};

/// Split `host[:port]`, accepting bracketed IPv6 literals (`[::1]:5060`).
///
/// The returned host keeps the brackets of an IPv6 literal so it can be
/// written back unchanged.
pub fn split_host_port(s: &str) -> Result<(String, Option<u16>)> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::Syntax("empty host".to_string()));
    }

    if s.starts_with('[') {
        let end = s
            .find(']')
            .ok_or_else(|| Error::Syntax(format!("unterminated IPv6 literal in '{}'", s)))?;
        let host = &s[..=end];
        let rest = &s[end + 1..];
        return match rest.strip_prefix(':') {
            Some(port) => Ok((host.to_string(), Some(parse_port(port)?))),
            None if rest.is_empty() => Ok((host.to_string(), None)),
            None => Err(Error::Syntax(format!("unexpected '{}' after IPv6 literal", rest))),
        };
    }

    // A bare IPv6 address has more than one colon and no port.
    if s.matches(':').count() > 1 {
        return Ok((s.to_string(), None));
    }

    match s.split_once(':') {
        Some((host, port)) if !host.is_empty() => Ok((host.to_string(), Some(parse_port(port)?))),
        Some(_) => Err(Error::Syntax(format!("missing host in '{}'", s))),
        None => Ok((s.to_string(), None)),
    }
}

/// Join a host and optional port, bracketing bare IPv6 literals.
pub fn join_host_port(host: &str, port: Option<u16>) -> String {
    let host = if host.contains(':') && !host.starts_with('[') {
        format!("[{}]", host)
    } else {
        host.to_string()
    };
    match port {
        Some(port) => format!("{}:{}", host, port),
        None => host,
    }
}

/// Parse a host as an IP address, with or without IPv6 brackets.
pub fn host_ip(host: &str) -> Option<IpAddr> {
    host.trim_start_matches('[').trim_end_matches(']').parse().ok()
}

fn parse_port(s: &str) -> Result<u16> {
    s.trim()
        .parse::<u16>()
        .map_err(|_| Error::Syntax(format!("invalid port '{}'", s)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_host_port() {
        assert_eq!(
            split_host_port("example.com:5070").unwrap(),
            ("example.com".to_string(), Some(5070))
        );
        assert_eq!(split_host_port("10.0.0.1").unwrap(), ("10.0.0.1".to_string(), None));
        assert_eq!(split_host_port("[::1]:5061").unwrap(), ("[::1]".to_string(), Some(5061)));
        assert_eq!(split_host_port("::1").unwrap(), ("::1".to_string(), None));
        assert!(split_host_port("host:notaport").is_err());
        assert!(split_host_port(":5060").is_err());
    }

    #[test]
    fn test_join_and_ip() {
        assert_eq!(join_host_port("::1", Some(5060)), "[::1]:5060");
        assert_eq!(join_host_port("[::1]", None), "[::1]");
        assert_eq!(join_host_port("a.b", Some(1)), "a.b:1");
        assert!(host_ip("[::1]").is_some());
        assert!(host_ip("127.0.0.1").is_some());
        assert!(host_ip("sip.example.com").is_none());
    }
}
