//! Recovers the port block size from the rules already installed, so an
//! invocation keeps using whatever size earlier mappings were created with.

use crate::allocation::PortsPerHost;
use crate::backend::RuleStore;
use crate::config::{Settings, Subnet};
use crate::prompt::Prompt;
use crate::rule::{DNAT, PREROUTING, Rule, Table};
use crate::rule::address::Port;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inference {
    Found(PortsPerHost),
    /// Translation rules for the subnet exist, but none carries a usable port
    /// range.
    Unreadable,
    /// No translation rules for the subnet at all.
    NoRules,
}

fn translates_into(rule: &Rule, subnet: &Subnet) -> bool {
    rule.is_target(DNAT) && rule.to_destination.is_some_and(|x| subnet.contains(x.ip))
}

/// Looks at the first range-based translation rule into `subnet`. Only that
/// rule is considered: a later rule with a different size is never consulted.
pub fn infer(rules: &[Rule], subnet: &Subnet) -> Inference {
    let mut translations = rules.iter().filter(|x| translates_into(x, subnet)).peekable();

    if translations.peek().is_none() {
        return Inference::NoRules;
    }

    let first_range = translations.find_map(|x| match x.dport {
        Some(range @ Port::Range { .. }) => Some(range),
        _ => None,
    });

    match first_range
        .and_then(|x| x.len())
        .and_then(PortsPerHost::from_installed)
    {
        Some(x) => Inference::Found(x),
        None => Inference::Unreadable,
    }
}

/// Decides the block size for this invocation: explicit setting, then
/// inference, then the operator (only when nothing is installed yet), then the
/// configured default.
pub async fn resolve<S, P>(store: &S, settings: &Settings, prompt: Option<&mut P>) -> PortsPerHost
where
    S: RuleStore,
    P: Prompt,
{
    if let Some(x) = settings.ports_per_host {
        debug!("using configured block size of {x} ports");
        return x;
    }

    let rules = match store.list(Table::Nat, PREROUTING).await {
        Ok(x) => x,
        Err(e) => {
            warn!("cannot read installed rules: {e}");
            Vec::new()
        }
    };

    let default = settings.default_ports_per_host;

    match infer(&rules, &settings.subnet) {
        Inference::Found(x) => {
            info!("detected {} ports per host from installed rules", display!(x));
            x
        }

        Inference::Unreadable => {
            warn!(
                "rules for {} exist but none has a readable port range, assuming {default} ports per host",
                settings.subnet
            );
            default
        }

        Inference::NoRules => match prompt {
            Some(prompt) => ask(prompt, default).await,
            None => {
                info!("no mappings installed, using {default} ports per host");
                default
            }
        },
    }
}

async fn ask<P: Prompt>(prompt: &mut P, default: PortsPerHost) -> PortsPerHost {
    let question = format!(
        "ports per host (1-{}) [{default}]: ",
        PortsPerHost::MAX_CHOSEN
    );

    loop {
        let answer = match prompt.ask(&question).await {
            Ok(Some(x)) => x,
            Ok(None) => return default,
            Err(e) => {
                warn!("cannot read answer: {e}");
                return default;
            }
        };

        if answer.is_empty() {
            return default;
        }

        match PortsPerHost::parse(&answer) {
            Ok(x) => return x,
            Err(e) => warn!("{e}"),
        }
    }
}
