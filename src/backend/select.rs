use super::RuleStore;
use crate::config::Subnet;
use crate::rule::{DNAT, MASQUERADE, PREROUTING, Rule, Table};

/// iptables front-ends in order of preference. The first one is used when
/// none of them holds any rules yet.
pub const CANDIDATES: &[&str] = &["iptables", "iptables-legacy", "iptables-nft"];

fn is_evidence(rule: &Rule, subnet: &Subnet) -> bool {
    let translated = rule.is_target(DNAT) || rule.is_target(MASQUERADE);
    let references = rule.to_destination.is_some_and(|x| subnet.contains(x.ip))
        || rule.source.is_some_and(|x| subnet.contains(x.ip))
        || rule.destination.is_some_and(|x| subnet.contains(x.ip));

    translated && references
}

/// How many pre-routing translation rules of `store` point into `subnet`.
/// A store that cannot be queried counts as holding none.
pub async fn evidence<S: RuleStore>(store: &S, subnet: &Subnet) -> usize {
    match store.list(Table::Nat, PREROUTING).await {
        Ok(rules) => rules.iter().filter(|x| is_evidence(x, subnet)).count(),
        Err(e) => {
            debug!("{}: {e}", store.name());
            0
        }
    }
}

/// Picks the candidate holding the most rules for `subnet`, ties going to the
/// earlier one. Returns the first candidate if none holds any.
pub async fn select<S: RuleStore>(candidates: Vec<S>, subnet: &Subnet) -> Option<S> {
    let mut best: Option<(usize, usize)> = None;

    for (i, store) in candidates.iter().enumerate() {
        let n = evidence(store, subnet).await;
        debug!("{} holds {n} rules for {subnet}", store.name());

        if n > 0 && best.is_none_or(|(_, most)| n > most) {
            best = Some((i, n));
        }
    }

    let index = best.map(|(i, _)| i).unwrap_or(0);
    candidates.into_iter().nth(index)
}
