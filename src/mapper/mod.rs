//! Converges the packet filter toward (add) or away from (delete) the
//! mappings of individual hosts.
//!
//! Nothing is remembered between operations: each one starts by reading the
//! live rule set, so a run interrupted halfway is completed by running the
//! same operation again.

use std::io;
use std::net::Ipv4Addr;
use std::ops::RangeInclusive;
use std::path::PathBuf;

use thiserror::Error;

use crate::allocation::{Allocation, AllocationError, PortsPerHost, allocate};
use crate::backend::{BackendError, RuleStore};
use crate::config::Settings;
use crate::host::{HostId, ValidationError};
use crate::lock::{Lock, LockError};
use crate::rule::address::{Endpoint, Port};
use crate::rule::{ACCEPT, FORWARD, MASQUERADE, POSTROUTING, PREROUTING, Protocol, Rule, Table};

mod forwarding;
mod inventory;
mod persist;

pub use self::inventory::{HostEntry, ListMode};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error("host {0} is not mapped")]
    NotMapped(Ipv4Addr),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("cannot write {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddReport {
    pub added: usize,
    pub present: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Nothing referenced the host.
    Skipped,
    Removed { rules: usize },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub done: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Everything an operation needs, fixed for the lifetime of one invocation.
#[derive(Debug)]
pub struct Mapper<S> {
    store: S,
    settings: Settings,
    ports_per_host: PortsPerHost,
}

impl<S: RuleStore> Mapper<S> {
    pub fn new(store: S, settings: Settings, ports_per_host: PortsPerHost) -> Self {
        Self {
            store,
            settings,
            ports_per_host,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn ports_per_host(&self) -> PortsPerHost {
        self.ports_per_host
    }

    #[cfg(test)]
    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn validate(&self, input: &str) -> Result<HostId, ValidationError> {
        self.settings.validate_host(input)
    }

    pub fn allocation(&self, host: HostId) -> Allocation {
        allocate(host, self.ports_per_host, &self.settings.layout)
    }

    /// Rules a mapped host needs, in the order they are installed.
    fn desired_rules(
        &self,
        address: Ipv4Addr,
        ssh_port: u16,
        block: RangeInclusive<u16>,
    ) -> Vec<(Table, Rule)> {
        let block = match (*block.start(), *block.end()) {
            (start, end) if start == end => Port::Single(start),
            (start, end) => Port::Range { start, end },
        };

        let host = Endpoint {
            ip: address,
            port: None,
        };
        let ssh = Endpoint {
            ip: address,
            port: Some(Port::Single(22)),
        };

        vec![
            (Table::Nat, self.masquerade()),
            (Table::Filter, Rule::forward_to(address)),
            (Table::Filter, Rule::forward_established_from(address)),
            (Table::Nat, Rule::dnat(Protocol::Tcp, Port::Single(ssh_port), ssh)),
            (Table::Nat, Rule::dnat(Protocol::Tcp, block, host)),
            (Table::Nat, Rule::dnat(Protocol::Udp, block, host)),
        ]
    }

    fn masquerade(&self) -> Rule {
        Rule::masquerade(
            self.settings.subnet.network(),
            self.settings.wan_interface.as_deref(),
        )
    }

    /// Installs whatever part of `host`'s mapping is missing.
    pub async fn add(&self, host: HostId, persist: bool) -> Result<AddReport, Error> {
        let (ssh_port, block) = self.allocation(host).ports()?;

        let _lock = Lock::acquire(&self.settings.lock_file).await?;
        forwarding::enable(&self.settings).await;

        let address = self.settings.address(host);
        let mut report = AddReport {
            added: 0,
            present: 0,
        };

        for (table, rule) in self.desired_rules(address, ssh_port, block.clone()) {
            if self.store.contains(table, &rule).await? {
                trace!("present: {rule}");
                report.present += 1;
                continue;
            }

            self.store.append(table, &rule).await?;
            debug!("added: {rule}");
            report.added += 1;
        }

        info!(
            "mapped {} ssh {} ports {}-{}",
            display!(address),
            display!(ssh_port),
            block.start(),
            block.end()
        );

        if persist && self.settings.persist {
            self.save_locked().await?;
        }

        Ok(report)
    }

    /// Removes every translation to `host`, whatever ports it was mapped with,
    /// together with its forwarding rules.
    pub async fn delete(&self, host: HostId, persist: bool) -> Result<DeleteOutcome, Error> {
        let _lock = Lock::acquire(&self.settings.lock_file).await?;
        let address = self.settings.address(host);

        let translations: Vec<Rule> = self
            .store
            .list(Table::Nat, PREROUTING)
            .await?
            .into_iter()
            .filter(|x| x.dnat_address() == Some(address))
            .collect();

        if translations.is_empty() {
            info!("{} is not mapped, skipping", display!(address));
            return Ok(DeleteOutcome::Skipped);
        }

        let forwards: Vec<Rule> = self
            .store
            .list(Table::Filter, FORWARD)
            .await?
            .into_iter()
            .filter(|x| x.is_target(ACCEPT) && x.references(address))
            .collect();

        let mut rules = 0;
        for rule in &translations {
            rules += self.remove(Table::Nat, rule).await? as usize;
        }
        for rule in &forwards {
            rules += self.remove(Table::Filter, rule).await? as usize;
        }

        rules += self.remove_unused_masquerade().await?;

        info!("unmapped {}", display!(address));

        if persist && self.settings.persist {
            self.save_locked().await?;
        }

        Ok(DeleteOutcome::Removed { rules })
    }

    async fn remove(&self, table: Table, rule: &Rule) -> Result<bool, Error> {
        let found = self.store.delete(table, rule).await?;

        if found {
            debug!("removed: {rule}");
        } else {
            debug!("already gone: {rule}");
        }

        Ok(found)
    }

    /// The masquerade rule is shared, so it only goes away with the last
    /// mapped host.
    async fn remove_unused_masquerade(&self) -> Result<usize, Error> {
        let subnet = self.settings.subnet;

        let in_use = self
            .store
            .list(Table::Nat, PREROUTING)
            .await?
            .iter()
            .any(|x| x.dnat_address().is_some_and(|ip| subnet.contains(ip)));

        if in_use {
            return Ok(0);
        }

        let network = subnet.network();
        let mut removed = 0;

        for rule in self.store.list(Table::Nat, POSTROUTING).await? {
            if rule.is_target(MASQUERADE) && rule.source == Some(network) {
                removed += self.remove(Table::Nat, &rule).await? as usize;
            }
        }

        if removed > 0 {
            info!("no hosts left, removed masquerading for {subnet}");
        }

        Ok(removed)
    }

    /// Adds every host in `[first, last]`, saving once at the end.
    pub async fn add_range(&self, first: HostId, last: HostId) -> Result<BatchReport, Error> {
        let mut report = BatchReport::default();

        for host in HostId::range(first, last)? {
            match self.add(host, false).await {
                Ok(_) => report.done += 1,
                Err(e) => {
                    error!("host {}: {e}", display!(host));
                    report.failed += 1;
                }
            }
        }

        self.finish_batch(&report).await?;
        Ok(report)
    }

    /// Deletes every host in `[first, last]`, saving once at the end.
    pub async fn delete_range(&self, first: HostId, last: HostId) -> Result<BatchReport, Error> {
        let mut report = BatchReport::default();

        for host in HostId::range(first, last)? {
            match self.delete(host, false).await {
                Ok(DeleteOutcome::Removed { .. }) => report.done += 1,
                Ok(DeleteOutcome::Skipped) => report.skipped += 1,
                Err(e) => {
                    error!("host {}: {e}", display!(host));
                    report.failed += 1;
                }
            }
        }

        self.finish_batch(&report).await?;
        Ok(report)
    }

    async fn finish_batch(&self, report: &BatchReport) -> Result<(), Error> {
        info!(
            "{} done, {} skipped, {} failed",
            report.done, report.skipped, report.failed
        );

        if report.done > 0 && self.settings.persist {
            self.persist().await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::path::Path;

    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;
    use crate::backend::memory::MemoryStore;

    /// A fresh directory for files a test makes the mapper write, removed on
    /// drop.
    pub fn scratch() -> TempDir {
        tempfile::tempdir().unwrap()
    }

    pub fn mapper(dir: &Path, store: MemoryStore) -> Mapper<MemoryStore> {
        let settings = Settings::for_tests(dir);
        Mapper::new(store, settings, PortsPerHost::new(20).unwrap())
    }

    pub fn host(x: u8) -> HostId {
        HostId::new_unchecked(x)
    }

    const ADDR: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 100);

    #[tokio::test]
    async fn add_installs_mapping() {
        let tmp = scratch();
        let dir = tmp.path();
        let m = mapper(dir, MemoryStore::new("memory"));

        let report = m.add(host(100), false).await.unwrap();
        assert_eq!((report.added, report.present), (6, 0));

        let nat: Vec<String> = m.store.rules(Table::Nat).iter().map(|x| x.to_string()).collect();
        assert_eq!(
            nat,
            [
                "-A POSTROUTING -s 192.168.1.0/24 -j MASQUERADE",
                "-A PREROUTING -p tcp --dport 30100 -j DNAT --to-destination 192.168.1.100:22",
                "-A PREROUTING -p tcp --dport 40001:40020 -j DNAT --to-destination 192.168.1.100",
                "-A PREROUTING -p udp --dport 40001:40020 -j DNAT --to-destination 192.168.1.100",
            ]
        );

        let filter = m.store.rules(Table::Filter);
        assert_eq!(
            filter,
            [Rule::forward_to(ADDR), Rule::forward_established_from(ADDR)]
        );

        assert_eq!(std::fs::read_to_string(dir.join("ip_forward")).unwrap(), "1\n");
        assert!(
            std::fs::read_to_string(dir.join("sysctl.conf"))
                .unwrap()
                .contains("net.ipv4.ip_forward=1")
        );
    }

    #[tokio::test]
    async fn add_is_idempotent() {
        let tmp = scratch();
        let dir = tmp.path();
        let m = mapper(dir, MemoryStore::new("memory"));

        m.add(host(100), false).await.unwrap();
        let once = m.store.all_rules();

        let report = m.add(host(100), false).await.unwrap();
        assert_eq!((report.added, report.present), (0, 6));
        assert_eq!(m.store.all_rules(), once);
    }

    #[tokio::test]
    async fn add_completes_partial_state() {
        let tmp = scratch();
        let dir = tmp.path();
        let store = MemoryStore::new("memory").with_rules(
            Table::Nat,
            "-A POSTROUTING -s 192.168.1.0/24 -j MASQUERADE\n\
             -A PREROUTING -p tcp --dport 30100 -j DNAT --to-destination 192.168.1.100:22",
        );
        let m = mapper(dir, store);

        let report = m.add(host(100), false).await.unwrap();
        assert_eq!((report.added, report.present), (4, 2));
        assert_eq!(m.store.rules(Table::Nat).len(), 4);
    }

    #[tokio::test]
    async fn masquerade_is_shared() {
        let tmp = scratch();
        let dir = tmp.path();
        let m = mapper(dir, MemoryStore::new("memory"));

        m.add(host(100), false).await.unwrap();
        m.add(host(101), false).await.unwrap();

        let masquerades = m
            .store
            .rules(Table::Nat)
            .iter()
            .filter(|x| x.is_target(MASQUERADE))
            .count();
        assert_eq!(masquerades, 1);

        let unique: HashSet<_> = m.store.all_rules().into_iter().collect();
        assert_eq!(unique.len(), m.store.all_rules().len());
    }

    #[tokio::test]
    async fn add_then_delete() {
        let tmp = scratch();
        let dir = tmp.path();
        let m = mapper(dir, MemoryStore::new("memory"));

        m.add(host(100), false).await.unwrap();
        m.add(host(105), false).await.unwrap();

        let outcome = m.delete(host(100), false).await.unwrap();
        assert_eq!(outcome, DeleteOutcome::Removed { rules: 5 });
        assert!(!m.store.all_rules().iter().any(|x| x.references(ADDR)));
        assert!(m.store.rules(Table::Nat).contains(&m.masquerade()));

        let outcome = m.delete(host(105), false).await.unwrap();
        assert_eq!(outcome, DeleteOutcome::Removed { rules: 6 });
        assert!(m.store.all_rules().is_empty());
    }

    #[tokio::test]
    async fn delete_unmapped_is_noop() {
        let tmp = scratch();
        let dir = tmp.path();
        let m = mapper(dir, MemoryStore::new("memory"));

        m.add(host(105), false).await.unwrap();
        let before = m.store.all_rules();

        assert_eq!(m.delete(host(100), true).await.unwrap(), DeleteOutcome::Skipped);
        assert_eq!(m.store.all_rules(), before);
        assert!(!dir.join("rules.v4").exists());
    }

    #[tokio::test]
    async fn delete_follows_installed_ports() {
        let tmp = scratch();
        let dir = tmp.path();
        let store = MemoryStore::new("memory")
            .with_rules(
                Table::Nat,
                "-A POSTROUTING -s 192.168.1.0/24 -j MASQUERADE\n\
                 -A PREROUTING -p tcp --dport 30100 -j DNAT --to-destination 192.168.1.100:22\n\
                 -A PREROUTING -p tcp --dport 40001:40050 -j DNAT --to-destination 192.168.1.100\n\
                 -A PREROUTING -p udp --dport 40001:40050 -j DNAT --to-destination 192.168.1.100\n\
                 -A PREROUTING -p tcp --dport 8080 -j DNAT --to-destination 10.0.0.1:80",
            )
            .with_rules(
                Table::Filter,
                "-A FORWARD -d 192.168.1.100/32 -j ACCEPT\n\
                 -A FORWARD -s 192.168.1.100/32 -m conntrack --ctstate RELATED,ESTABLISHED -j ACCEPT\n\
                 -A FORWARD -i eth0 -j ACCEPT",
            );
        let m = mapper(dir, store);

        let outcome = m.delete(host(100), false).await.unwrap();
        assert_eq!(outcome, DeleteOutcome::Removed { rules: 6 });

        let left: Vec<String> = m.store.all_rules().iter().map(|x| x.to_string()).collect();
        assert_eq!(
            left,
            [
                "-A FORWARD -i eth0 -j ACCEPT",
                "-A PREROUTING -p tcp --dport 8080 -j DNAT --to-destination 10.0.0.1:80",
            ]
        );
    }

    #[tokio::test]
    async fn delete_removes_state_module_rules() {
        let tmp = scratch();
        let dir = tmp.path();
        let store = MemoryStore::new("memory")
            .with_rules(
                Table::Nat,
                "-A PREROUTING -p tcp --dport 30100 -j DNAT --to-destination 192.168.1.100:22",
            )
            .with_rules(
                Table::Filter,
                "-A FORWARD -d 192.168.1.100/32 -j ACCEPT\n\
                 -A FORWARD -s 192.168.1.100/32 -m state --state RELATED,ESTABLISHED -j ACCEPT",
            );
        let m = mapper(dir, store);

        let outcome = m.delete(host(100), false).await.unwrap();
        assert_eq!(outcome, DeleteOutcome::Removed { rules: 3 });
        assert!(m.store.rules(Table::Filter).is_empty());
    }

    #[tokio::test]
    async fn allocation_outside_port_space_writes_nothing() {
        let tmp = scratch();
        let dir = tmp.path();
        let settings = Settings::for_tests(dir);
        let m = Mapper::new(
            MemoryStore::new("memory"),
            settings,
            PortsPerHost::new(2000).unwrap(),
        );

        assert!(matches!(m.add(host(250), true).await, Err(Error::Allocation(_))));
        assert_eq!(m.store.calls(), 0);
    }

    #[tokio::test]
    async fn batch_saves_once() {
        let tmp = scratch();
        let dir = tmp.path();
        let m = mapper(dir, MemoryStore::new("memory"));

        let report = m.add_range(host(100), host(104)).await.unwrap();
        assert_eq!(report, BatchReport { done: 5, skipped: 0, failed: 0 });

        let saved = std::fs::read_to_string(dir.join("rules.v4")).unwrap();
        assert!(saved.contains("--to-destination 192.168.1.104:22"));

        let report = m.delete_range(host(103), host(106)).await.unwrap();
        assert_eq!(report, BatchReport { done: 2, skipped: 2, failed: 0 });

        let saved = std::fs::read_to_string(dir.join("rules.v4")).unwrap();
        assert!(!saved.contains("192.168.1.104"));
        assert!(saved.contains("192.168.1.102"));
    }

    #[tokio::test]
    async fn batch_rejects_inverted_range() {
        let tmp = scratch();
        let dir = tmp.path();
        let m = mapper(dir, MemoryStore::new("memory"));

        assert!(matches!(
            m.add_range(host(110), host(100)).await,
            Err(Error::Validation(ValidationError::InvertedRange { .. }))
        ));
        assert_eq!(m.store.calls(), 0);
    }

    #[tokio::test]
    async fn batch_continues_past_failures() {
        let tmp = scratch();
        let dir = tmp.path();
        let m = mapper(dir, MemoryStore::missing("memory"));

        let report = m.add_range(host(100), host(102)).await.unwrap();
        assert_eq!(report, BatchReport { done: 0, skipped: 0, failed: 3 });
    }
}
