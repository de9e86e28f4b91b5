//! Peer and listener address parsing.

use crate::SessionError;
use std::fmt;

/// Transport scheme of a peer or listener address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// Raw framed TCP
    Rnp,
    /// Raw framed TCP over TLS
    Rnps,
    /// WebSocket
    Ws,
    /// WebSocket over TLS
    Wss,
}

impl Scheme {
    /// Port used when the address does not name one.
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Rnp => 8888,
            Scheme::Rnps => 8899,
            Scheme::Ws => 80,
            Scheme::Wss => 443,
        }
    }

    /// True for the TLS-wrapped variants.
    pub fn is_tls(self) -> bool {
        matches!(self, Scheme::Rnps | Scheme::Wss)
    }

    /// True for the WebSocket variants.
    pub fn is_websocket(self) -> bool {
        matches!(self, Scheme::Ws | Scheme::Wss)
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Scheme::Rnp => "rnp",
            Scheme::Rnps => "rnps",
            Scheme::Ws => "ws",
            Scheme::Wss => "wss",
        };
        f.write_str(s)
    }
}

/// A parsed peer or listener address.
///
/// Recognized schemes are `rnp`, `rnps`, `ws`, and `wss`, plus the legacy
/// `receptor://` alias for `rnp`. Paths and queries are rejected on listener
/// addresses and allowed only on WebSocket peer addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerUrl {
    /// Transport scheme
    pub scheme: Scheme,
    /// Host name or address literal
    pub host: String,
    /// Port, defaulted from the scheme when absent
    pub port: u16,
    /// Path plus query for WebSocket peers, always starting with `/`
    pub path: Option<String>,
}

impl PeerUrl {
    /// Parse an address to dial.
    pub fn parse_peer(input: &str) -> Result<Self, SessionError> {
        let url = Self::parse(input)?;
        if url.path.is_some() && !url.scheme.is_websocket() {
            return Err(SessionError::Url(format!(
                "{}: path only allowed on ws/wss peers",
                input
            )));
        }
        Ok(url)
    }

    /// Parse an address to listen on. Paths and queries are never allowed.
    pub fn parse_listen(input: &str) -> Result<Self, SessionError> {
        let url = Self::parse(input)?;
        if url.path.is_some() {
            return Err(SessionError::Url(format!(
                "{}: listener addresses cannot carry a path",
                input
            )));
        }
        Ok(url)
    }

    fn parse(input: &str) -> Result<Self, SessionError> {
        let (scheme_str, rest) = input
            .split_once("://")
            .ok_or_else(|| SessionError::Url(format!("{}: missing scheme", input)))?;

        let scheme = match scheme_str {
            "rnp" | "receptor" => Scheme::Rnp,
            "rnps" => Scheme::Rnps,
            "ws" => Scheme::Ws,
            "wss" => Scheme::Wss,
            other => {
                return Err(SessionError::Url(format!("unknown scheme {:?}", other)));
            }
        };

        let (authority, path) = match rest.find(['/', '?']) {
            Some(idx) => {
                let (authority, tail) = rest.split_at(idx);
                let path = if tail.starts_with('?') {
                    format!("/{}", tail)
                } else {
                    tail.to_string()
                };
                (authority, Some(path))
            }
            None => (rest, None),
        };

        // Bracketed IPv6 literal, else a single optional ":port" split.
        let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| SessionError::Url(format!("{}: unclosed '['", input)))?;
            let port = match tail.strip_prefix(':') {
                Some(p) => Some(p),
                None if tail.is_empty() => None,
                None => {
                    return Err(SessionError::Url(format!("{}: malformed authority", input)));
                }
            };
            (host.to_string(), port)
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host.to_string(), Some(port)),
                None => (authority.to_string(), None),
            }
        };

        if host.is_empty() {
            return Err(SessionError::Url(format!("{}: empty host", input)));
        }

        let port = match port {
            Some(p) => p
                .parse::<u16>()
                .map_err(|_| SessionError::Url(format!("{}: bad port {:?}", input, p)))?,
            None => scheme.default_port(),
        };

        Ok(Self {
            scheme,
            host,
            port,
            path,
        })
    }

    /// The `host:port` pair for socket operations.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Full URL string for WebSocket dialing.
    pub fn websocket_url(&self) -> String {
        format!(
            "{}://{}{}",
            self.scheme,
            self.authority(),
            self.path.as_deref().unwrap_or("/")
        )
    }
}

impl fmt::Display for PeerUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.authority())?;
        if let Some(path) = &self.path {
            f.write_str(path)?;
        }
        Ok(())
    }
}
