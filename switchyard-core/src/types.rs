//! Addressing types: protocol and command codes, and destination URLs.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Width of a protocol code on the wire, in bytes.
pub const PROTOCOL_CODE_LENGTH: usize = 2;

/// Port used when a URL does not name one.
pub const DEFAULT_PORT: u16 = 9009;

/// Identifier selecting a protocol bundle.
///
/// Encoded as two big-endian bytes at the very start of every frame, which
/// lets a multiplexing decoder pick the protocol before reading any header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProtocolCode(u16);

impl ProtocolCode {
    /// Create a protocol code from its integer value.
    pub const fn new(code: u16) -> Self {
        Self(code)
    }

    /// Decode a protocol code from its wire bytes.
    pub const fn from_bytes(bytes: [u8; PROTOCOL_CODE_LENGTH]) -> Self {
        Self(u16::from_be_bytes(bytes))
    }

    /// Wire bytes for this code.
    pub const fn to_bytes(self) -> [u8; PROTOCOL_CODE_LENGTH] {
        self.0.to_be_bytes()
    }

    /// Integer value of this code.
    pub const fn value(self) -> u16 {
        self.0
    }
}

impl fmt::Display for ProtocolCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Identifier selecting a processor within a protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommandCode(u16);

impl CommandCode {
    /// Create a command code from its integer value.
    pub const fn new(code: u16) -> Self {
        Self(code)
    }

    /// Integer value of this code.
    pub const fn value(self) -> u16 {
        self.0
    }
}

impl fmt::Display for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error parsing a [`Url`] from string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UrlParseError {
    /// The input had no host part.
    #[error("missing host")]
    MissingHost,
    /// The port number could not be parsed.
    #[error("invalid port number: {0}")]
    InvalidPort(String),
    /// No `protocol` property was given.
    #[error("missing protocol property")]
    MissingProtocol,
    /// The `protocol` property is not a 16-bit integer.
    #[error("invalid protocol code: {0}")]
    InvalidProtocol(String),
    /// The `conn` property is not a positive integer.
    #[error("invalid connection count: {0}")]
    InvalidConnections(String),
    /// A property had no `=` separator.
    #[error("malformed property: {0}")]
    MalformedProperty(String),
}

/// Destination of outbound connections.
///
/// Parsed from `host:port?protocol=<code>&conn=<count>&key=value`. The
/// `protocol` property is mandatory. `conn` is the target pool size; when it
/// is absent the transport's configured default applies. Any further
/// properties are kept verbatim, the first occurrence of a key wins.
///
/// # Examples
///
/// ```
/// use switchyard_core::{ProtocolCode, Url};
///
/// let url: Url = "127.0.0.1:9000?protocol=1&conn=4".parse().expect("valid url");
/// assert_eq!(url.address(), "127.0.0.1:9000");
/// assert_eq!(url.protocol(), ProtocolCode::new(1));
/// assert_eq!(url.connections(), Some(4));
/// assert_eq!(url.pool_key(), "127.0.0.1:9000#1");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Url {
    host: String,
    port: u16,
    protocol: ProtocolCode,
    connections: Option<usize>,
    properties: BTreeMap<String, String>,
}

impl Url {
    /// Build a URL without going through string parsing.
    pub fn new(host: impl Into<String>, port: u16, protocol: ProtocolCode) -> Self {
        Self {
            host: host.into(),
            port,
            protocol,
            connections: None,
            properties: BTreeMap::new(),
        }
    }

    /// Set the target number of pooled connections.
    pub fn with_connections(mut self, connections: usize) -> Self {
        self.connections = Some(connections);
        self
    }

    /// Host part.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port part.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`, suitable for dialing.
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Protocol every connection to this destination speaks.
    pub fn protocol(&self) -> ProtocolCode {
        self.protocol
    }

    /// Target pool size, if the URL names one.
    pub fn connections(&self) -> Option<usize> {
        self.connections
    }

    /// Extra property by key.
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Key identifying the connection pool for this destination.
    ///
    /// Two URLs share a pool exactly when they share address and protocol.
    pub fn pool_key(&self) -> String {
        format!("{}#{}", self.address(), self.protocol.value())
    }
}

impl FromStr for Url {
    type Err = UrlParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (authority, query) = match s.split_once('?') {
            Some((authority, query)) => (authority, query),
            None => (s, ""),
        };

        let (host, port) = split_host_port(authority)?;

        let mut properties = BTreeMap::new();
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| UrlParseError::MalformedProperty(pair.to_string()))?;
            properties
                .entry(key.to_string())
                .or_insert_with(|| value.to_string());
        }

        let protocol = properties
            .remove("protocol")
            .ok_or(UrlParseError::MissingProtocol)?;
        let protocol = protocol
            .parse::<u16>()
            .map(ProtocolCode::new)
            .map_err(|_| UrlParseError::InvalidProtocol(protocol))?;

        let connections = match properties.remove("conn") {
            Some(raw) => match raw.parse::<usize>() {
                Ok(n) if n > 0 => Some(n),
                _ => return Err(UrlParseError::InvalidConnections(raw)),
            },
            None => None,
        };

        Ok(Self {
            host,
            port,
            protocol,
            connections,
            properties,
        })
    }
}

fn split_host_port(authority: &str) -> Result<(String, u16), UrlParseError> {
    // IPv6 bracket notation [::1]:port
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or(UrlParseError::MissingHost)?;
        let port = match tail.strip_prefix(':') {
            Some(port) => parse_port(port)?,
            None if tail.is_empty() => DEFAULT_PORT,
            None => return Err(UrlParseError::InvalidPort(tail.to_string())),
        };
        if host.is_empty() {
            return Err(UrlParseError::MissingHost);
        }
        return Ok((host.to_string(), port));
    }

    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => (host, parse_port(port)?),
        None => (authority, DEFAULT_PORT),
    };
    if host.is_empty() {
        return Err(UrlParseError::MissingHost);
    }
    Ok((host.to_string(), port))
}

fn parse_port(port: &str) -> Result<u16, UrlParseError> {
    port.parse()
        .map_err(|_| UrlParseError::InvalidPort(port.to_string()))
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}?protocol={}", self.address(), self.protocol.value())?;
        if let Some(conn) = self.connections {
            write!(f, "&conn={}", conn)?;
        }
        for (key, value) in &self.properties {
            write!(f, "&{}={}", key, value)?;
        }
        Ok(())
    }
}
