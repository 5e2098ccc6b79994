use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;

use super::{Error, Mapper};
use crate::backend::RuleStore;
use crate::config::Subnet;
use crate::host::HostId;
use crate::rule::address::Port;
use crate::rule::{PREROUTING, Protocol, Rule, Table};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ListMode {
    /// Ports as found in each host's rules.
    #[default]
    Parsed,
    /// Ports recomputed from the current block size. Faster to reason about
    /// but wrong for hosts mapped under a different block size.
    Computed,
}

/// What the rule set says about one host. Fields that cannot be found in the
/// rules are `None` rather than guessed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub address: Ipv4Addr,
    pub ssh_port: Option<u16>,
    pub tcp_ports: Option<Port>,
    pub udp_ports: Option<Port>,
}

impl HostEntry {
    fn parse(address: Ipv4Addr, rules: &[Rule]) -> Self {
        let to_host = || rules.iter().filter(move |x| x.dnat_address() == Some(address));

        let ssh_port = to_host().find_map(|x| match (&x.protocol, x.dport, x.to_destination) {
            (Some(Protocol::Tcp), Some(Port::Single(port)), Some(to))
                if to.port == Some(Port::Single(22)) =>
            {
                Some(port)
            }
            _ => None,
        });

        let block = |protocol: Protocol| {
            to_host()
                .filter(|x| x.protocol.as_ref() == Some(&protocol))
                .filter(|x| x.to_destination.is_some_and(|to| to.port.is_none()))
                .find_map(|x| x.dport)
        };

        Self {
            address,
            ssh_port,
            tcp_ports: block(Protocol::Tcp),
            udp_ports: block(Protocol::Udp),
        }
    }
}

struct Field<T>(Option<T>);

impl<T: fmt::Display> fmt::Display for Field<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(x) => x.fmt(f),
            None => f.write_str("not detected"),
        }
    }
}

impl fmt::Display for HostEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ports = |x: Option<Port>| {
            x.map(|x| match x {
                Port::Single(x) => x.to_string(),
                Port::Range { start, end } => format!("{start}-{end}"),
            })
        };

        write!(
            f,
            "{:<15}  ssh {:<12}  tcp {:<12}  udp {}",
            self.address,
            Field(self.ssh_port).to_string(),
            Field(ports(self.tcp_ports)).to_string(),
            Field(ports(self.udp_ports)),
        )
    }
}

/// Every address in `subnet` some translation rule points to, in ascending
/// order.
fn mapped_addresses(rules: &[Rule], subnet: &Subnet) -> BTreeSet<Ipv4Addr> {
    rules
        .iter()
        .filter_map(Rule::dnat_address)
        .filter(|x| subnet.contains(*x))
        .collect()
}

impl<S: RuleStore> Mapper<S> {
    async fn translations(&self) -> Result<Vec<Rule>, Error> {
        Ok(self.store.list(Table::Nat, PREROUTING).await?)
    }

    pub async fn list(&self, mode: ListMode) -> Result<Vec<HostEntry>, Error> {
        let rules = self.translations().await?;

        let entries = mapped_addresses(&rules, &self.settings.subnet)
            .into_iter()
            .map(|address| match mode {
                ListMode::Parsed => HostEntry::parse(address, &rules),
                ListMode::Computed => self
                    .computed(address)
                    .unwrap_or_else(|| HostEntry::parse(address, &rules)),
            })
            .collect();

        Ok(entries)
    }

    /// The entry for `address` assuming it was mapped with the current block
    /// size, or `None` if the address is outside the host bounds.
    fn computed(&self, address: Ipv4Addr) -> Option<HostEntry> {
        let octet = self.settings.subnet.octet_of(address)?;
        let host = self.validate(&octet.to_string()).ok()?;
        let (ssh_port, block) = self.allocation(host).ports().ok()?;

        let block = Port::Range {
            start: *block.start(),
            end: *block.end(),
        };

        Some(HostEntry {
            address,
            ssh_port: Some(ssh_port),
            tcp_ports: Some(block),
            udp_ports: Some(block),
        })
    }

    pub async fn inspect(&self, host: HostId) -> Result<HostEntry, Error> {
        let address = self.settings.address(host);
        let rules = self.translations().await?;

        if !rules.iter().any(|x| x.dnat_address() == Some(address)) {
            return Err(Error::NotMapped(address));
        }

        Ok(HostEntry::parse(address, &rules))
    }
}
