use std::fmt;

use hyper::header::UPGRADE;
use hyper::HeaderMap;
use url::form_urlencoded;

use crate::error::RequestError;

pub const DEFAULT_PORT: u16 = 22;

/// Destination of a relay session, taken from the `host` and `port` query
/// parameters of the upgrade request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    host: String,
    port: u16,
}

impl Target {
    pub fn new(host: impl AsRef<str>, port: u16) -> Result<Self, RequestError> {
        let host = host.as_ref().trim();
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() || port == 0 {
            return Err(RequestError::InvalidTarget);
        }
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    /// Parses `host` and `port` out of a raw query string. The first
    /// occurrence of each key wins; a missing `port` falls back to
    /// `default_port`.
    pub fn from_query(query: Option<&str>, default_port: u16) -> Result<Self, RequestError> {
        let mut host = None;
        let mut port = None;
        for (key, value) in form_urlencoded::parse(query.unwrap_or_default().as_bytes()) {
            match key.as_ref() {
                "host" if host.is_none() => host = Some(value),
                "port" if port.is_none() => port = Some(value),
                _ => {}
            }
        }

        let host = host.ok_or(RequestError::InvalidTarget)?;
        let port = match port {
            Some(raw) => parse_port(&raw)?,
            None => default_port,
        };
        Self::new(host, port)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

fn parse_port(raw: &str) -> Result<u16, RequestError> {
    match raw.trim().parse::<u16>() {
        Ok(0) | Err(_) => Err(RequestError::InvalidTarget),
        Ok(port) => Ok(port),
    }
}

/// The `Upgrade` header has to be exactly `websocket`.
pub fn require_websocket_upgrade(headers: &HeaderMap) -> Result<(), RequestError> {
    match headers.get(UPGRADE) {
        Some(value) if value.as_bytes() == b"websocket" => Ok(()),
        _ => Err(RequestError::UpgradeRequired),
    }
}
