use std::fmt;
use std::path::PathBuf;

use crate::error::{Result, TransportError};

/// A resolved transport address.
///
/// The host supplies an opaque connection string; this is the only place
/// that looks inside it:
/// - `unix:<path>` or anything containing a `/` is a Unix domain socket path
/// - `tcp:<host:port>` or a bare `host:port` is a TCP address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Filesystem-path Unix domain socket.
    Unix(PathBuf),
    /// TCP `host:port` address.
    Tcp(String),
}

impl Endpoint {
    /// Interpret an opaque connection string.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(TransportError::InvalidEndpoint(input.to_string()));
        }

        if let Some(path) = input.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(TransportError::InvalidEndpoint(input.to_string()));
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }

        if let Some(addr) = input.strip_prefix("tcp:") {
            return parse_tcp(addr).ok_or_else(|| TransportError::InvalidEndpoint(input.to_string()));
        }

        if input.contains('/') {
            return Ok(Self::Unix(PathBuf::from(input)));
        }

        parse_tcp(input).ok_or_else(|| TransportError::InvalidEndpoint(input.to_string()))
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        match self {
            Self::Unix(_) => "unix-domain-socket",
            Self::Tcp(_) => "tcp",
        }
    }
}

fn parse_tcp(addr: &str) -> Option<Endpoint> {
    let (host, port) = addr.rsplit_once(':')?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return None;
    }
    Some(Endpoint::Tcp(addr.to_string()))
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
            Self::Tcp(addr) => write!(f, "tcp:{addr}"),
        }
    }
}

impl std::str::FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_unix_forms() {
        assert_eq!(
            Endpoint::parse("unix:/tmp/a.sock").unwrap(),
            Endpoint::Unix(PathBuf::from("/tmp/a.sock"))
        );
        assert_eq!(
            Endpoint::parse("/run/analytics/svc.sock").unwrap(),
            Endpoint::Unix(PathBuf::from("/run/analytics/svc.sock"))
        );
        assert_eq!(
            Endpoint::parse("./relative.sock").unwrap(),
            Endpoint::Unix(PathBuf::from("./relative.sock"))
        );
    }

    #[test]
    fn parses_tcp_forms() {
        assert_eq!(
            Endpoint::parse("127.0.0.1:9000").unwrap(),
            Endpoint::Tcp("127.0.0.1:9000".to_string())
        );
        assert_eq!(
            Endpoint::parse("tcp:localhost:7001").unwrap(),
            Endpoint::Tcp("localhost:7001".to_string())
        );
    }

    #[test]
    fn rejects_garbage() {
        for bad in ["", "   ", "unix:", "tcp:nohost", "localhost", "host:notaport", ":80"] {
            assert!(
                matches!(Endpoint::parse(bad), Err(TransportError::InvalidEndpoint(_))),
                "expected '{bad}' to be rejected"
            );
        }
    }

    #[test]
    fn display_is_reparseable() {
        for input in ["unix:/tmp/x.sock", "tcp:127.0.0.1:1"] {
            let endpoint = Endpoint::parse(input).unwrap();
            assert_eq!(Endpoint::parse(&endpoint.to_string()).unwrap(), endpoint);
        }
    }
}
