use std::process::ExitCode;

use eyre::{ContextCompat, Result};

use crate::backend::select::{CANDIDATES, select};
use crate::backend::{Iptables, RuleStore};
use crate::cli::Command;
use crate::config::Settings;
use crate::host::{HostId, ValidationError};
use crate::infer;
use crate::mapper::{DeleteOutcome, HostEntry, ListMode, Mapper};
use crate::menu;
use crate::prompt::Prompt;

/// A subcommand with its arguments validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Add(HostId),
    AddRange(HostId, HostId),
    Delete(HostId),
    DeleteRange(HostId, HostId),
    Show(HostId),
    List(ListMode),
    Save,
    Menu,
}

impl Request {
    /// Validates host arguments before anything touches the packet filter.
    pub fn new(command: Option<Command>, settings: &Settings) -> Result<Self, ValidationError> {
        let host = |x: &str| settings.validate_host(x);
        let range = |first: &str, last: &str| -> Result<(HostId, HostId), ValidationError> {
            let (first, last) = (host(first)?, host(last)?);
            HostId::check_range(first, last)?;
            Ok((first, last))
        };

        let request = match command {
            None | Some(Command::Menu) => Self::Menu,
            Some(Command::Add { host: x }) => Self::Add(host(&x)?),
            Some(Command::Delete { host: x }) => Self::Delete(host(&x)?),
            Some(Command::Show { host: x }) => Self::Show(host(&x)?),
            Some(Command::AddRange { first, last }) => {
                let (first, last) = range(&first, &last)?;
                Self::AddRange(first, last)
            }
            Some(Command::DeleteRange { first, last }) => {
                let (first, last) = range(&first, &last)?;
                Self::DeleteRange(first, last)
            }
            Some(Command::List { computed }) => Self::List(match computed {
                true => ListMode::Computed,
                false => ListMode::Parsed,
            }),
            Some(Command::Save) => Self::Save,
        };

        Ok(request)
    }
}

/// Picks the backend and the block size for this invocation.
pub async fn open<P: Prompt>(
    settings: Settings,
    backend: Option<&str>,
    prompt: Option<&mut P>,
) -> Result<Mapper<Iptables>> {
    let store = match backend {
        Some(x) => Iptables::new(x),
        None => {
            let candidates = CANDIDATES.iter().copied().map(Iptables::new).collect();
            select(candidates, &settings.subnet)
                .await
                .context("no iptables candidates")?
        }
    };

    debug!("using {}", store.name());

    let ports_per_host = infer::resolve(&store, &settings, prompt).await;
    Ok(Mapper::new(store, settings, ports_per_host))
}

pub async fn run<S, P>(mapper: &Mapper<S>, request: Request, prompt: &mut P) -> Result<ExitCode>
where
    S: RuleStore,
    P: Prompt,
{
    match request {
        Request::Add(host) => {
            mapper.add(host, true).await?;
        }

        Request::Delete(host) => {
            if let DeleteOutcome::Removed { rules } = mapper.delete(host, true).await? {
                debug!("removed {rules} rules");
            }
        }

        Request::AddRange(first, last) => {
            let report = mapper.add_range(first, last).await?;
            if report.failed > 0 {
                return Ok(ExitCode::FAILURE);
            }
        }

        Request::DeleteRange(first, last) => {
            let report = mapper.delete_range(first, last).await?;
            if report.failed > 0 {
                return Ok(ExitCode::FAILURE);
            }
        }

        Request::Show(host) => {
            let entry = mapper.inspect(host).await?;
            print_entries(&[entry]);
        }

        Request::List(mode) => {
            let entries = mapper.list(mode).await?;
            print_entries(&entries);
        }

        Request::Save => {
            mapper.persist().await?;
        }

        Request::Menu => {
            menu::run(mapper, prompt).await?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

pub fn print_entries(entries: &[HostEntry]) {
    if entries.is_empty() {
        println!("no hosts mapped");
        return;
    }

    for entry in entries {
        println!("{entry}");
    }
}
