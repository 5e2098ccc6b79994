use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt::Write;

use super::{BackendError, RuleStore};
use crate::rule::{Rule, Table, parse_rules};

/// Rule store kept in memory, behaving like iptables for the operations this
/// tool uses.
#[derive(Debug, Default)]
pub struct MemoryStore {
    name: String,
    tables: RefCell<BTreeMap<Table, Vec<Rule>>>,
    calls: Cell<usize>,
    installed: bool,
}

impl MemoryStore {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            installed: true,
            ..Default::default()
        }
    }

    /// A store whose every call fails as if the program were missing.
    pub fn missing(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            installed: false,
            ..Default::default()
        }
    }

    /// Loads `-A ...` lines into `table`.
    pub fn with_rules(self, table: Table, dump: &str) -> Self {
        self.tables
            .borrow_mut()
            .entry(table)
            .or_default()
            .extend(parse_rules(dump));
        self
    }

    pub fn rules(&self, table: Table) -> Vec<Rule> {
        self.tables.borrow().get(&table).cloned().unwrap_or_default()
    }

    pub fn all_rules(&self) -> Vec<Rule> {
        self.tables.borrow().values().flatten().cloned().collect()
    }

    /// Number of calls made through [`RuleStore`].
    pub fn calls(&self) -> usize {
        self.calls.get()
    }

    fn enter(&self) -> Result<(), BackendError> {
        self.calls.set(self.calls.get() + 1);

        if self.installed {
            Ok(())
        } else {
            Err(BackendError::NotInstalled(self.name.clone()))
        }
    }
}

impl RuleStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list(&self, table: Table, chain: &str) -> Result<Vec<Rule>, BackendError> {
        self.enter()?;

        Ok(self
            .rules(table)
            .into_iter()
            .filter(|x| x.chain == chain)
            .collect())
    }

    async fn contains(&self, table: Table, rule: &Rule) -> Result<bool, BackendError> {
        self.enter()?;
        Ok(self.rules(table).contains(rule))
    }

    async fn append(&self, table: Table, rule: &Rule) -> Result<(), BackendError> {
        self.enter()?;
        self.tables
            .borrow_mut()
            .entry(table)
            .or_default()
            .push(rule.clone());
        Ok(())
    }

    async fn delete(&self, table: Table, rule: &Rule) -> Result<bool, BackendError> {
        self.enter()?;

        let mut tables = self.tables.borrow_mut();
        let rules = tables.entry(table).or_default();

        match rules.iter().position(|x| x == rule) {
            Some(i) => {
                rules.remove(i);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn save(&self) -> Result<String, BackendError> {
        self.enter()?;

        let mut out = String::new();
        for (table, rules) in self.tables.borrow().iter() {
            let _ = writeln!(out, "*{table}");
            for rule in rules {
                let _ = writeln!(out, "{rule}");
            }
            let _ = writeln!(out, "COMMIT");
        }

        Ok(out)
    }
}
