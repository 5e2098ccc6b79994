//! The mapping scheme.
//!
//! Every host owns one SSH port and one contiguous block of service ports,
//! both derived from nothing but its host number and the block size:
//!
//! ```text
//! ssh         = base_ssh + host
//! block_start = base_block + (host - min_host) * ports_per_host + 1
//! block_end   = block_start + ports_per_host - 1
//! ```
//!
//! Blocks of distinct hosts never overlap and grow with the host number, so no
//! registry is needed to keep mappings collision-free.

use std::fmt;
use std::num::NonZero;
use std::ops::RangeInclusive;

use thiserror::Error;

use crate::host::{HostId, ValidationError, parse_digits};

/// Size of every host's service port block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortsPerHost(NonZero<u16>);

impl PortsPerHost {
    /// Largest block size an operator may choose.
    pub const MAX_CHOSEN: u16 = 2000;

    /// Validates an operator-chosen block size.
    pub fn new(x: u16) -> Result<Self, ValidationError> {
        Self::parse(&x.to_string())
    }

    /// Validates operator input in `[1, 2000]`.
    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        let value = parse_digits(input)?;

        match u16::try_from(value).ok().and_then(NonZero::new) {
            Some(x) if x.get() <= Self::MAX_CHOSEN => Ok(Self(x)),
            _ => Err(ValidationError::OutOfRange {
                value,
                min: 1,
                max: Self::MAX_CHOSEN.into(),
            }),
        }
    }

    /// Accepts any block size that fits in the port space, for values read
    /// back from installed rules.
    pub fn from_installed(size: u32) -> Option<Self> {
        u16::try_from(size).ok().and_then(NonZero::new).map(Self)
    }

    pub fn get(&self) -> u16 {
        self.0.get()
    }
}

impl fmt::Display for PortsPerHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Constants of the mapping scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub min_host: u8,
    pub base_ssh: u16,
    pub base_block: u16,
}

/// Ports assigned to one host. Computed in `u32` so the function stays total
/// even for layouts that do not fit in the port space; [`Allocation::ports`]
/// performs that check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub host: HostId,
    pub ssh_port: u32,
    pub block_start: u32,
    pub block_end: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("ports {ssh_port} and {block_start}-{block_end} of host {host} exceed the port space")]
pub struct AllocationError {
    pub host: HostId,
    pub ssh_port: u32,
    pub block_start: u32,
    pub block_end: u32,
}

impl Allocation {
    /// The SSH port and the service block as real port numbers.
    pub fn ports(&self) -> Result<(u16, RangeInclusive<u16>), AllocationError> {
        let port = |x: u32| u16::try_from(x).ok().filter(|x| *x != 0);

        match (port(self.ssh_port), port(self.block_start), port(self.block_end)) {
            (Some(ssh), Some(start), Some(end)) => Ok((ssh, start..=end)),
            _ => Err(AllocationError {
                host: self.host,
                ssh_port: self.ssh_port,
                block_start: self.block_start,
                block_end: self.block_end,
            }),
        }
    }
}

pub fn allocate(host: HostId, ports_per_host: PortsPerHost, layout: &Layout) -> Allocation {
    let pph = u32::from(ports_per_host.get());
    let offset = u32::from(host.get().saturating_sub(layout.min_host));

    let ssh_port = u32::from(layout.base_ssh) + u32::from(host.get());
    let block_start = u32::from(layout.base_block) + offset * pph + 1;
    let block_end = block_start + pph - 1;

    Allocation {
        host,
        ssh_port,
        block_start,
        block_end,
    }
}
