use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::types::host::{join_host_port, split_host_port};
use crate::types::param::Params;

/// A SIP/SIPS URI: `scheme:[user@]host[:port][;params][?headers]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uri {
    pub scheme: String,
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub params: Params,
    pub headers: Option<String>,
}

impl Uri {
    pub fn sip(host: &str, port: Option<u16>) -> Self {
        Uri {
            scheme: "sip".to_string(),
            user: None,
            host: host.to_string(),
            port,
            params: Params::new(),
            headers: None,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_param(mut self, name: &str, value: Option<&str>) -> Self {
        self.params.set(name, value.map(str::to_string));
        self
    }

    pub fn host_port(&self) -> String {
        join_host_port(&self.host, self.port)
    }
}

impl FromStr for Uri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().trim_start_matches('<').trim_end_matches('>');
        let (scheme, rest) = s
            .split_once(':')
            .filter(|(scheme, _)| !scheme.is_empty() && scheme.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'-' || b == b'.'))
            .ok_or_else(|| Error::InvalidUri(s.to_string()))?;

        let (rest, headers) = match rest.split_once('?') {
            Some((rest, headers)) => (rest, Some(headers.to_string())),
            None => (rest, None),
        };

        // user part may itself contain ';' so look for params after the '@'
        let (user, hostpart) = match rest.rfind('@') {
            Some(at) => (Some(rest[..at].to_string()), &rest[at + 1..]),
            None => (None, rest),
        };

        let (host_port, params) = match hostpart.split_once(';') {
            Some((host_port, params)) => (host_port, Params::parse(params)),
            None => (hostpart, Params::new()),
        };

        let (host, port) = split_host_port(host_port).map_err(|_| Error::InvalidUri(s.to_string()))?;

        Ok(Uri {
            scheme: scheme.to_ascii_lowercase(),
            user,
            host,
            port,
            params,
            headers,
        })
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        write!(f, "{}{}", self.host_port(), self.params)?;
        if let Some(headers) = &self.headers {
            write!(f, "?{}", headers)?;
        }
        Ok(())
    }
}
