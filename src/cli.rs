use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::Level;

use crate::allocation::{Layout, PortsPerHost};
use crate::config::{Settings, SettingsError, Subnet};

/// Deterministic SSH and service port mapping for hosts behind a NAT gateway.
///
/// Host N of the subnet gets SSH on BASE_SSH+N and a block of service ports
/// right after the blocks of all lower-numbered hosts. Without a subcommand an
/// interactive menu is started.
#[derive(Debug, Parser)]
#[command(version, about)]
pub struct Cli {
    #[command(flatten)]
    pub options: Options,

    /// Log more, repeat for even more.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

impl Cli {
    pub fn level(&self) -> Level {
        match (self.quiet, self.verbose) {
            (true, _) => Level::WARN,
            (false, 0) => Level::INFO,
            (false, 1) => Level::DEBUG,
            (false, _) => Level::TRACE,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Map one host.
    Add { host: String },

    /// Map every host in an inclusive range.
    AddRange { first: String, last: String },

    /// Remove a host's mapping.
    Delete { host: String },

    /// Remove the mappings of every host in an inclusive range.
    DeleteRange { first: String, last: String },

    /// Show the ports of one mapped host.
    Show { host: String },

    /// Show every mapped host.
    List {
        /// Recompute ports from the current block size instead of reading them
        /// from each host's rules.
        #[arg(long)]
        computed: bool,
    },

    /// Write the current rule set to the rules file.
    Save,

    /// Run the interactive menu.
    Menu,
}

#[derive(Debug, Args)]
pub struct Options {
    /// The /24 network of the internal hosts.
    #[arg(long, env = "NATMAP_SUBNET", default_value = "192.168.1")]
    pub subnet: Subnet,

    /// Lowest host number that may be mapped.
    #[arg(long, env = "NATMAP_MIN_HOST", default_value_t = 100)]
    pub min_host: u8,

    /// Highest host number that may be mapped.
    #[arg(long, env = "NATMAP_MAX_HOST", default_value_t = 250)]
    pub max_host: u8,

    /// SSH port of host N is BASE_SSH + N.
    #[arg(long, env = "NATMAP_BASE_SSH", default_value_t = 30000)]
    pub base_ssh: u16,

    /// Service blocks start right after this port.
    #[arg(long, env = "NATMAP_BASE_BLOCK", default_value_t = 40000)]
    pub base_block: u16,

    /// Block size used when nothing is installed and nobody is asked.
    #[arg(long, env = "NATMAP_DEFAULT_PORTS_PER_HOST", default_value_t = 20)]
    pub default_ports_per_host: u16,

    /// Block size to use instead of detecting it from installed rules.
    #[arg(long, env = "NATMAP_PORTS_PER_HOST")]
    pub ports_per_host: Option<u16>,

    /// Save the rule set after every change.
    #[arg(long, env = "NATMAP_PERSIST", default_value_t = true, action = ArgAction::Set)]
    pub persist: bool,

    #[arg(long, env = "NATMAP_RULES_FILE", default_value = "/etc/iptables/rules.v4")]
    pub rules_file: PathBuf,

    #[arg(long, env = "NATMAP_SYSCTL_FILE", default_value = "/etc/sysctl.conf")]
    pub sysctl_file: PathBuf,

    #[arg(
        long,
        env = "NATMAP_IP_FORWARD_FILE",
        default_value = "/proc/sys/net/ipv4/ip_forward"
    )]
    pub ip_forward_file: PathBuf,

    /// Service unit that restores the rules file at boot.
    #[arg(
        long,
        env = "NATMAP_BOOT_UNIT",
        default_value = "/etc/systemd/system/natmap-restore.service"
    )]
    pub boot_unit: PathBuf,

    /// Never create the boot unit.
    #[arg(long)]
    pub no_boot_unit: bool,

    #[arg(long, env = "NATMAP_LOCK_FILE", default_value = "/run/natmap.lock")]
    pub lock_file: PathBuf,

    /// Only masquerade traffic leaving through this interface.
    #[arg(long, env = "NATMAP_WAN_INTERFACE")]
    pub wan_interface: Option<String>,

    /// iptables program to use instead of probing for the one holding the
    /// rules.
    #[arg(long, env = "NATMAP_BACKEND")]
    pub backend: Option<String>,
}

impl TryFrom<&Options> for Settings {
    type Error = SettingsError;

    fn try_from(x: &Options) -> Result<Self, Self::Error> {
        Settings::check_host_bounds(x.min_host, x.max_host)?;

        let default_ports_per_host =
            PortsPerHost::new(x.default_ports_per_host).map_err(SettingsError::InvalidDefault)?;

        let ports_per_host = x
            .ports_per_host
            .map(PortsPerHost::new)
            .transpose()
            .map_err(SettingsError::InvalidOverride)?;

        Ok(Self {
            subnet: x.subnet,
            layout: Layout {
                min_host: x.min_host,
                base_ssh: x.base_ssh,
                base_block: x.base_block,
            },
            max_host: x.max_host,
            default_ports_per_host,
            ports_per_host,
            persist: x.persist,
            rules_file: x.rules_file.clone(),
            sysctl_file: x.sysctl_file.clone(),
            ip_forward_file: x.ip_forward_file.clone(),
            boot_unit: (!x.no_boot_unit).then(|| x.boot_unit.clone()),
            lock_file: x.lock_file.clone(),
            wan_interface: x.wan_interface.clone(),
        })
    }
}
