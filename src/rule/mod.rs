//! Structured view of packet-filter rules.
//!
//! Rules are read back from `iptables -S` output, one `-A <chain> ...` line per
//! rule, and rendered back into the argument vector accepted by `-C`, `-A` and
//! `-D`. Only the options this tool emits or matches on get their own fields,
//! everything else is carried verbatim in [`Rule::extra`] so that a foreign
//! rule can still be deleted by its exact specification.

use std::fmt;
use std::net::Ipv4Addr;

use thiserror::Error;

mod parse;

pub mod address;

use self::address::{Endpoint, Net, ParseEndpointError, ParseNetError, ParsePortError, Port};
use self::parse::{Parse, ParseStream, parse_stream, take_values};

pub const PREROUTING: &str = "PREROUTING";
pub const POSTROUTING: &str = "POSTROUTING";
pub const FORWARD: &str = "FORWARD";

pub const DNAT: &str = "DNAT";
pub const MASQUERADE: &str = "MASQUERADE";
pub const ACCEPT: &str = "ACCEPT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Table {
    Filter,
    Nat,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Filter => "filter",
            Table::Nat => "nat",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
    Other(String),
}

impl Protocol {
    pub fn as_str(&self) -> &str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Other(x) => x,
        }
    }
}

impl From<&str> for Protocol {
    fn from(s: &str) -> Self {
        match s {
            "tcp" => Protocol::Tcp,
            "udp" => Protocol::Udp,
            x => Protocol::Other(x.to_owned()),
        }
    }
}

/// Connection state match, remembered with the module that provided it so
/// the rule renders back to the same specification.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StateMatch {
    /// `-m conntrack --ctstate <states>`
    Conntrack(String),
    /// `-m state --state <states>`
    State(String),
}

impl StateMatch {
    fn to_args(&self) -> [&str; 4] {
        match self {
            StateMatch::Conntrack(x) => ["-m", "conntrack", "--ctstate", x.as_str()],
            StateMatch::State(x) => ["-m", "state", "--state", x.as_str()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Rule {
    pub chain: String,
    pub protocol: Option<Protocol>,
    pub source: Option<Net>,
    pub destination: Option<Net>,
    pub in_interface: Option<String>,
    pub out_interface: Option<String>,
    pub dport: Option<Port>,
    pub state: Option<StateMatch>,
    pub target: Option<String>,
    pub to_destination: Option<Endpoint>,
    pub extra: Vec<String>,
}

impl Rule {
    pub fn new(chain: &str) -> Self {
        Self {
            chain: chain.to_owned(),
            protocol: None,
            source: None,
            destination: None,
            in_interface: None,
            out_interface: None,
            dport: None,
            state: None,
            target: None,
            to_destination: None,
            extra: Vec::new(),
        }
    }

    /// `-A PREROUTING -p <proto> --dport <port> -j DNAT --to-destination <to>`
    pub fn dnat(protocol: Protocol, dport: Port, to: Endpoint) -> Self {
        Self {
            protocol: Some(protocol),
            dport: Some(dport),
            target: Some(DNAT.to_owned()),
            to_destination: Some(to),
            ..Self::new(PREROUTING)
        }
    }

    /// `-A POSTROUTING -s <net> [-o <iface>] -j MASQUERADE`
    pub fn masquerade(source: Net, out_interface: Option<&str>) -> Self {
        Self {
            source: Some(source),
            out_interface: out_interface.map(str::to_owned),
            target: Some(MASQUERADE.to_owned()),
            ..Self::new(POSTROUTING)
        }
    }

    /// `-A FORWARD -d <host>/32 -j ACCEPT`
    pub fn forward_to(host: Ipv4Addr) -> Self {
        Self {
            destination: Some(Net::host(host)),
            target: Some(ACCEPT.to_owned()),
            ..Self::new(FORWARD)
        }
    }

    /// `-A FORWARD -s <host>/32 -m conntrack --ctstate RELATED,ESTABLISHED -j ACCEPT`
    pub fn forward_established_from(host: Ipv4Addr) -> Self {
        Self {
            source: Some(Net::host(host)),
            state: Some(StateMatch::Conntrack("RELATED,ESTABLISHED".to_owned())),
            target: Some(ACCEPT.to_owned()),
            ..Self::new(FORWARD)
        }
    }

    pub fn is_target(&self, target: &str) -> bool {
        self.target.as_deref() == Some(target)
    }

    /// The internal address this rule translates to, for DNAT rules.
    pub fn dnat_address(&self) -> Option<Ipv4Addr> {
        if !self.is_target(DNAT) {
            return None;
        }

        self.to_destination.map(|x| x.ip)
    }

    /// Whether this rule is scoped to exactly `host`, by source, destination
    /// or translation target.
    pub fn references(&self, host: Ipv4Addr) -> bool {
        self.dnat_address() == Some(host)
            || self.source.is_some_and(|x| x.is_host(host))
            || self.destination.is_some_and(|x| x.is_host(host))
    }

    /// Rule specification without the leading `-A <chain>`.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        let mut push = |flag: &str, value: String| {
            args.push(flag.to_owned());
            args.push(value);
        };

        if let Some(x) = &self.source {
            push("-s", x.to_string());
        }
        if let Some(x) = &self.destination {
            push("-d", x.to_string());
        }
        if let Some(x) = &self.in_interface {
            push("-i", x.clone());
        }
        if let Some(x) = &self.out_interface {
            push("-o", x.clone());
        }
        if let Some(x) = &self.protocol {
            push("-p", x.as_str().to_owned());
        }
        if let Some(x) = &self.dport {
            push("--dport", x.to_string());
        }
        if let Some(x) = &self.state {
            args.extend(x.to_args().map(str::to_owned));
        }

        args.extend(self.extra.iter().cloned());

        if let Some(x) = &self.target {
            args.push("-j".to_owned());
            args.push(x.clone());
        }
        if let Some(x) = &self.to_destination {
            args.push("--to-destination".to_owned());
            args.push(x.to_string());
        }

        args
    }

    /// Parses one line of `iptables -S` output. Policy (`-P`) and chain
    /// (`-N`) declarations yield `Ok(None)`.
    pub fn parse_line(line: &str) -> Result<Option<Self>, ParseRuleError> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }

        let mut stream = parse_stream(line);
        match stream.next() {
            Some("-A") => Rule::parse(&mut stream).map(Some),
            _ => Ok(None),
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "-A {}", self.chain)?;
        for x in self.to_args() {
            write!(f, " {x}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseRuleError {
    #[error("expected chain name")]
    ExpectedChain,

    #[error("expected a value for '{0}'")]
    ExpectedValue(&'static str),

    #[error("invalid address: {0}")]
    InvalidNet(ParseNetError),

    #[error("invalid port: {0}")]
    InvalidPort(ParsePortError),

    #[error("invalid translation target: {0}")]
    InvalidEndpoint(ParseEndpointError),
}

impl Parse for Rule {
    type Output = Self;
    type Error = ParseRuleError;

    // Syntax: <chain> [<option> [<value>...]]...
    fn parse(stream: &mut ParseStream<'_>) -> Result<Self::Output, Self::Error> {
        use ParseRuleError::*;

        let chain = stream.next().ok_or(ExpectedChain)?;
        let mut rule = Rule::new(chain);

        while let Some(x) = stream.next() {
            match x {
                "!" => {
                    rule.extra.push(x.to_owned());
                    if let Some(flag) = stream.next() {
                        rule.extra.push(flag.to_owned());
                        rule.extra.extend(take_values(stream));
                    }
                }

                "-s" | "--source" => {
                    rule.source = Some(value(stream, "-s")?.parse().map_err(InvalidNet)?);
                }

                "-d" | "--destination" => {
                    rule.destination = Some(value(stream, "-d")?.parse().map_err(InvalidNet)?);
                }

                "-i" | "--in-interface" => {
                    rule.in_interface = Some(value(stream, "-i")?.to_owned());
                }

                "-o" | "--out-interface" => {
                    rule.out_interface = Some(value(stream, "-o")?.to_owned());
                }

                "-p" | "--protocol" => {
                    rule.protocol = Some(value(stream, "-p")?.into());
                }

                "--dport" | "--destination-port" => {
                    rule.dport = Some(value(stream, "--dport")?.parse().map_err(InvalidPort)?);
                }

                "--ctstate" => {
                    let states = value(stream, "--ctstate")?.to_owned();
                    rule.state = Some(StateMatch::Conntrack(states));
                }

                "--state" => {
                    let states = value(stream, "--state")?.to_owned();
                    rule.state = Some(StateMatch::State(states));
                }

                "-j" | "--jump" => {
                    rule.target = Some(value(stream, "-j")?.to_owned());
                }

                "--to-destination" => {
                    rule.to_destination = Some(
                        value(stream, "--to-destination")?
                            .parse()
                            .map_err(InvalidEndpoint)?,
                    );
                }

                "-m" | "--match" => {
                    let module = value(stream, "-m")?;

                    // implied by the protocol and state fields, rendered back
                    // from them
                    if !matches!(module, "tcp" | "udp" | "conntrack" | "state") {
                        rule.extra.push(x.to_owned());
                        rule.extra.push(module.to_owned());
                    }
                }

                _ => {
                    rule.extra.push(x.to_owned());
                    rule.extra.extend(take_values(stream));
                }
            }
        }

        Ok(rule)
    }
}

fn value<'a>(stream: &mut ParseStream<'a>, flag: &'static str) -> Result<&'a str, ParseRuleError> {
    stream.next().ok_or(ParseRuleError::ExpectedValue(flag))
}

/// Parses a whole `iptables -S` dump, skipping lines that cannot be parsed.
pub fn parse_rules(dump: &str) -> Vec<Rule> {
    dump.lines()
        .enumerate()
        .filter_map(|(i, line)| match Rule::parse_line(line) {
            Ok(x) => x,
            Err(e) => {
                warn!("skipping unreadable rule on line {}: {e}", i + 1);
                None
            }
        })
        .collect()
}
