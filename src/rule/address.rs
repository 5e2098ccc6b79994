use std::fmt;
use std::net::{AddrParseError, Ipv4Addr};
use std::num::ParseIntError;
use std::str::FromStr;

use thiserror::Error;

/// A port match or translation target, either a single port or an inclusive
/// range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Port {
    Single(u16),
    Range { start: u16, end: u16 },
}

impl Port {
    /// Number of ports covered, `None` when the range is inverted.
    pub fn len(&self) -> Option<u32> {
        match *self {
            Port::Single(_) => Some(1),
            Port::Range { start, end } if start <= end => Some(u32::from(end - start) + 1),
            Port::Range { .. } => None,
        }
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Port::Single(x) => write!(f, "{x}"),
            Port::Range { start, end } => write!(f, "{start}:{end}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParsePortError {
    #[error("{0}")]
    InvalidPort(ParseIntError),
}

impl Port {
    fn parse_with(s: &str, separator: char) -> Result<Self, ParsePortError> {
        use ParsePortError::*;

        match s.split_once(separator) {
            None => Ok(Port::Single(s.parse().map_err(InvalidPort)?)),

            Some((start, end)) => {
                let start: u16 = start.parse().map_err(InvalidPort)?;
                let end: u16 = end.parse().map_err(InvalidPort)?;

                if start == end {
                    Ok(Port::Single(start))
                } else {
                    Ok(Port::Range { start, end })
                }
            }
        }
    }
}

impl FromStr for Port {
    type Err = ParsePortError;

    // Syntax: <port> | <port>:<port>
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_with(s, ':')
    }
}

/// An IPv4 network as printed by `iptables -S` (`10.0.0.1/32`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Net {
    pub ip: Ipv4Addr,
    pub len: u8,
}

impl Net {
    pub fn host(ip: Ipv4Addr) -> Self {
        Self { ip, len: 32 }
    }

    pub fn is_host(&self, ip: Ipv4Addr) -> bool {
        self.len == 32 && self.ip == ip
    }
}

impl fmt::Display for Net {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ip, self.len)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseNetError {
    #[error("{0}")]
    InvalidAddress(AddrParseError),

    #[error("invalid prefix length: {0}")]
    InvalidLength(String),
}

impl FromStr for Net {
    type Err = ParseNetError;

    // Syntax: <ip> | <ip>/<len>
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use ParseNetError::*;

        let (ip, len) = match s.split_once('/') {
            Some((ip, len)) => {
                let len = len
                    .parse()
                    .ok()
                    .filter(|x| *x <= 32)
                    .ok_or_else(|| InvalidLength(len.to_owned()))?;

                (ip, len)
            }
            None => (s, 32),
        };

        let ip = ip.parse().map_err(InvalidAddress)?;
        Ok(Self { ip, len })
    }
}

/// The `--to-destination` argument of a DNAT rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub ip: Ipv4Addr,
    pub port: Option<Port>,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            None => write!(f, "{}", self.ip),
            Some(Port::Single(x)) => write!(f, "{}:{x}", self.ip),
            Some(Port::Range { start, end }) => write!(f, "{}:{start}-{end}", self.ip),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseEndpointError {
    #[error("{0}")]
    InvalidAddress(AddrParseError),

    #[error("{0}")]
    InvalidPort(ParsePortError),
}

impl FromStr for Endpoint {
    type Err = ParseEndpointError;

    // Syntax: <ip> | <ip>:<port> | <ip>:<port>-<port>
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use ParseEndpointError::*;

        let (ip, port) = match s.split_once(':') {
            Some((ip, port)) => (ip, Some(Port::parse_with(port, '-').map_err(InvalidPort)?)),
            None => (s, None),
        };

        let ip = ip.parse().map_err(InvalidAddress)?;
        Ok(Self { ip, port })
    }
}
