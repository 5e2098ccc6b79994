use std::io;
use std::process::Output;

use tokio::process::Command;

use super::{BackendError, RuleStore};
use crate::rule::{Rule, Table, parse_rules};

/// One of the iptables front-ends (`iptables`, `iptables-legacy`,
/// `iptables-nft`), driven through its command line.
#[derive(Debug, Clone)]
pub struct Iptables {
    program: String,
}

impl Iptables {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn output(&self, program: &str, args: &[String]) -> Result<Output, BackendError> {
        trace!("{program} {}", args.join(" "));

        Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => BackendError::NotInstalled(program.to_owned()),
                _ => BackendError::Io {
                    program: program.to_owned(),
                    source: e,
                },
            })
    }

    /// Runs `self.program -w -t <table> <args>`. `Ok(false)` is returned when
    /// the command exits with status 1, which for `-C` and `-D` means the rule
    /// does not exist.
    async fn run(&self, table: Table, args: Vec<String>) -> Result<bool, BackendError> {
        let full = Self::table_args(table, args);
        let output = self.output(&self.program, &full).await?;

        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            status => Err(failed(&self.program, &full, &output, status)),
        }
    }

    fn table_args(table: Table, args: Vec<String>) -> Vec<String> {
        let mut full = vec!["-w".to_owned(), "-t".to_owned(), table.as_str().to_owned()];
        full.extend(args);
        full
    }

    fn rule_args(op: &str, rule: &Rule) -> Vec<String> {
        let mut args = vec![op.to_owned(), rule.chain.clone()];
        args.extend(rule.to_args());
        args
    }
}

fn failed(program: &str, args: &[String], output: &Output, status: Option<i32>) -> BackendError {
    BackendError::Failed {
        command: format!("{program} {}", args.join(" ")),
        status: status.unwrap_or(-1),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
    }
}

impl RuleStore for Iptables {
    fn name(&self) -> &str {
        &self.program
    }

    async fn list(&self, table: Table, chain: &str) -> Result<Vec<Rule>, BackendError> {
        let args = Self::table_args(table, vec!["-S".to_owned(), chain.to_owned()]);

        let output = self.output(&self.program, &args).await?;
        if !output.status.success() {
            return Err(failed(&self.program, &args, &output, output.status.code()));
        }

        Ok(parse_rules(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn contains(&self, table: Table, rule: &Rule) -> Result<bool, BackendError> {
        self.run(table, Self::rule_args("-C", rule)).await
    }

    async fn append(&self, table: Table, rule: &Rule) -> Result<(), BackendError> {
        let args = Self::table_args(table, Self::rule_args("-A", rule));
        let output = self.output(&self.program, &args).await?;

        if !output.status.success() {
            return Err(failed(&self.program, &args, &output, output.status.code()));
        }

        Ok(())
    }

    async fn delete(&self, table: Table, rule: &Rule) -> Result<bool, BackendError> {
        self.run(table, Self::rule_args("-D", rule)).await
    }

    async fn save(&self) -> Result<String, BackendError> {
        let program = format!("{}-save", self.program);

        let output = self.output(&program, &[]).await?;
        if !output.status.success() {
            return Err(failed(&program, &[], &output, output.status.code()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::rule::address::{Endpoint, Port};
    use crate::rule::Protocol;

    #[test]
    fn delete_args() {
        let rule = Rule::dnat(
            Protocol::Tcp,
            Port::Single(30100),
            Endpoint {
                ip: Ipv4Addr::new(192, 168, 1, 100),
                port: Some(Port::Single(22)),
            },
        );

        assert_eq!(
            Iptables::rule_args("-D", &rule).join(" "),
            "-D PREROUTING -p tcp --dport 30100 -j DNAT --to-destination 192.168.1.100:22"
        );
    }

    #[tokio::test]
    async fn exit_status_decides_presence() {
        let rule = Rule::forward_to(Ipv4Addr::new(192, 168, 1, 100));

        assert!(Iptables::new("true").contains(Table::Filter, &rule).await.unwrap());
        assert!(!Iptables::new("false").contains(Table::Filter, &rule).await.unwrap());
    }

    #[tokio::test]
    async fn rejected_append_keeps_command_output() {
        let rule = Rule::forward_to(Ipv4Addr::new(192, 168, 1, 100));

        match Iptables::new("false").append(Table::Filter, &rule).await {
            Err(BackendError::Failed { command, status, .. }) => {
                assert_eq!(status, 1);
                assert_eq!(command, "false -w -t filter -A FORWARD -d 192.168.1.100/32 -j ACCEPT");
            }
            x => panic!("unexpected result: {x:?}"),
        }
    }

    #[tokio::test]
    async fn rejected_append_reports_stderr() {
        let rule = Rule::forward_to(Ipv4Addr::new(192, 168, 1, 100));

        // `sh` refuses the leading `-w` and says so on stderr
        match Iptables::new("sh").append(Table::Filter, &rule).await {
            Err(BackendError::Failed { stderr, .. }) => assert!(stderr.contains("-w"), "{stderr}"),
            x => panic!("unexpected result: {x:?}"),
        }
    }

    #[tokio::test]
    async fn missing_program_is_not_installed() {
        let store = Iptables::new("natmap-test-no-such-iptables");

        assert!(matches!(
            store.list(Table::Nat, "PREROUTING").await,
            Err(BackendError::NotInstalled(_))
        ));
        assert_eq!(store.restore_program(), "natmap-test-no-such-iptables-restore");
    }
}
