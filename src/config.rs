use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

use crate::allocation::{Layout, PortsPerHost};
use crate::host::{HostId, ValidationError};
use crate::rule::address::Net;

/// The `/24` network the mapped hosts live in, identified by its first three
/// octets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subnet([u8; 3]);

impl Subnet {
    pub const fn new(a: u8, b: u8, c: u8) -> Self {
        Self([a, b, c])
    }

    pub fn host(&self, octet: u8) -> Ipv4Addr {
        let [a, b, c] = self.0;
        Ipv4Addr::new(a, b, c, octet)
    }

    pub fn network(&self) -> Net {
        Net {
            ip: self.host(0),
            len: 24,
        }
    }

    /// The last octet of `ip`, if it belongs to this subnet.
    pub fn octet_of(&self, ip: Ipv4Addr) -> Option<u8> {
        let [a, b, c, d] = ip.octets();
        ([a, b, c] == self.0).then_some(d)
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.octet_of(ip).is_some()
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.network().fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("expected a /24 prefix like '192.168.1', '192.168.1.0' or '192.168.1.0/24'")]
pub struct ParseSubnetError;

impl FromStr for Subnet {
    type Err = ParseSubnetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = match s.split_once('/') {
            Some((prefix, "24")) => prefix,
            Some(_) => return Err(ParseSubnetError),
            None => s,
        };

        let octets = s
            .trim_end_matches('.')
            .split('.')
            .map(|x| x.parse::<u8>().map_err(|_| ParseSubnetError))
            .collect::<Result<Vec<_>, _>>()?;

        match octets[..] {
            [a, b, c] | [a, b, c, 0] => Ok(Self::new(a, b, c)),
            _ => Err(ParseSubnetError),
        }
    }
}

/// Everything an invocation is configured with, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub subnet: Subnet,
    pub layout: Layout,
    pub max_host: u8,
    pub default_ports_per_host: PortsPerHost,
    /// Skips inference when set.
    pub ports_per_host: Option<PortsPerHost>,
    pub persist: bool,
    pub rules_file: PathBuf,
    pub sysctl_file: PathBuf,
    pub ip_forward_file: PathBuf,
    pub boot_unit: Option<PathBuf>,
    pub lock_file: PathBuf,
    pub wan_interface: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettingsError {
    #[error("host bounds must satisfy 1 <= min ({min}) <= max ({max}) <= 254")]
    InvalidHostBounds { min: u8, max: u8 },

    #[error("default ports per host: {0}")]
    InvalidDefault(ValidationError),

    #[error("ports per host: {0}")]
    InvalidOverride(ValidationError),
}

impl Settings {
    pub fn min_host(&self) -> u8 {
        self.layout.min_host
    }

    pub fn validate_host(&self, input: &str) -> Result<HostId, ValidationError> {
        HostId::validate(input, self.min_host(), self.max_host)
    }

    pub fn address(&self, host: HostId) -> Ipv4Addr {
        self.subnet.host(host.get())
    }

    pub(crate) fn check_host_bounds(min: u8, max: u8) -> Result<(), SettingsError> {
        if min == 0 || min > max || max > 254 {
            return Err(SettingsError::InvalidHostBounds { min, max });
        }

        Ok(())
    }

    /// Defaults with every path under `dir`, for tests.
    #[cfg(test)]
    pub fn for_tests(dir: &std::path::Path) -> Self {
        Self {
            subnet: Subnet::new(192, 168, 1),
            layout: Layout {
                min_host: 100,
                base_ssh: 30000,
                base_block: 40000,
            },
            max_host: 250,
            default_ports_per_host: PortsPerHost::new(20).expect("20 is in range"),
            ports_per_host: None,
            persist: true,
            rules_file: dir.join("rules.v4"),
            sysctl_file: dir.join("sysctl.conf"),
            ip_forward_file: dir.join("ip_forward"),
            boot_unit: None,
            lock_file: dir.join("natmap.lock"),
            wan_interface: None,
        }
    }
}
