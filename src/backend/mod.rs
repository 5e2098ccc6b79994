//! Access to the packet filter's live rule set.

use std::io;

use thiserror::Error;

use crate::rule::{Rule, Table};

mod iptables;
#[cfg(test)]
pub mod memory;
pub mod select;

pub use self::iptables::Iptables;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("'{0}' is not installed")]
    NotInstalled(String),

    #[error("failed to run '{program}': {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("'{command}' exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: i32,
        stderr: String,
    },
}

/// The operations this tool needs from a packet filter.
///
/// Implementations own the canonical rule set. Nothing read through this trait
/// is cached: every call observes the current state.
pub trait RuleStore {
    /// A short name for logs, e.g. the program being run.
    fn name(&self) -> &str;

    /// Program that replays a [`RuleStore::save`] dump at boot.
    fn restore_program(&self) -> String {
        format!("{}-restore", self.name())
    }

    async fn list(&self, table: Table, chain: &str) -> Result<Vec<Rule>, BackendError>;

    async fn contains(&self, table: Table, rule: &Rule) -> Result<bool, BackendError>;

    async fn append(&self, table: Table, rule: &Rule) -> Result<(), BackendError>;

    /// Returns `false` if no such rule was installed.
    async fn delete(&self, table: Table, rule: &Rule) -> Result<bool, BackendError>;

    /// The whole rule set in the packet filter's native save format.
    async fn save(&self) -> Result<String, BackendError>;
}
