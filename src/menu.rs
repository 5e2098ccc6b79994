//! The numbered operator menu. One command is read and dispatched per
//! iteration; a failed command is reported and the menu comes back.

use std::io;

use eyre::Result;

use crate::app::print_entries;
use crate::backend::RuleStore;
use crate::host::HostId;
use crate::mapper::{ListMode, Mapper};
use crate::prompt::Prompt;
use crate::signal::{Signals, Terminate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Choice {
    Add,
    AddRange,
    Delete,
    DeleteRange,
    Show,
    ShowAll,
    Save,
    Exit,
}

impl Choice {
    const ALL: [(Self, &'static str); 8] = [
        (Self::Add, "add host"),
        (Self::AddRange, "add host range"),
        (Self::Delete, "delete host"),
        (Self::DeleteRange, "delete host range"),
        (Self::Show, "show host"),
        (Self::ShowAll, "show all hosts"),
        (Self::Save, "save rules now"),
        (Self::Exit, "exit"),
    ];

    fn parse(input: &str) -> Option<Self> {
        let n: usize = input.trim().parse().ok()?;
        Self::ALL.get(n.checked_sub(1)?).map(|(x, _)| *x)
    }
}

fn print_menu<S: RuleStore>(mapper: &Mapper<S>) {
    let settings = mapper.settings();
    let ports_per_host = mapper.ports_per_host();

    println!();
    println!(
        "{} hosts {}-{}, {} ports per host",
        settings.subnet,
        settings.min_host(),
        settings.max_host,
        display!(ports_per_host),
    );

    for (i, (_, label)) in Choice::ALL.iter().enumerate() {
        println!("  {}) {label}", i + 1);
    }
}

/// Every question races the termination signal, which reads as end of input.
struct Guarded<'a, P, T> {
    prompt: &'a mut P,
    terminate: T,
}

impl<P: Prompt, T: Terminate> Prompt for Guarded<'_, P, T> {
    async fn ask(&mut self, question: &str) -> io::Result<Option<String>> {
        tokio::select! {
            biased;

            x = self.prompt.ask(question) => x,
            name = self.terminate.wait_terminate() => {
                println!();
                info!("received {name}, exiting");
                Ok(None)
            }
        }
    }
}

pub async fn run<S, P>(mapper: &Mapper<S>, prompt: &mut P) -> Result<()>
where
    S: RuleStore,
    P: Prompt,
{
    let signals = Signals::new()?;
    run_until(mapper, prompt, signals).await
}

async fn run_until<S, P, T>(mapper: &Mapper<S>, prompt: &mut P, terminate: T) -> Result<()>
where
    S: RuleStore,
    P: Prompt,
    T: Terminate,
{
    let mut prompt = Guarded { prompt, terminate };

    loop {
        print_menu(mapper);

        let Some(answer) = prompt.ask("choice: ").await? else {
            return Ok(());
        };

        let Some(choice) = Choice::parse(&answer) else {
            warn!("invalid selection '{answer}'");
            continue;
        };

        match dispatch(mapper, &mut prompt, choice).await {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            Err(e) => error!("{e:#}"),
        }
    }
}

/// Runs one menu entry. Returns `false` when the menu should close.
async fn dispatch<S, P>(mapper: &Mapper<S>, prompt: &mut P, choice: Choice) -> Result<bool>
where
    S: RuleStore,
    P: Prompt,
{
    match choice {
        Choice::Add => {
            let Some(host) = ask_host(mapper, prompt, "host: ").await? else {
                return Ok(false);
            };
            mapper.add(host, true).await?;
        }

        Choice::Delete => {
            let Some(host) = ask_host(mapper, prompt, "host: ").await? else {
                return Ok(false);
            };
            mapper.delete(host, true).await?;
        }

        Choice::AddRange => {
            let Some((first, last)) = ask_range(mapper, prompt).await? else {
                return Ok(false);
            };
            mapper.add_range(first, last).await?;
        }

        Choice::DeleteRange => {
            let Some((first, last)) = ask_range(mapper, prompt).await? else {
                return Ok(false);
            };
            mapper.delete_range(first, last).await?;
        }

        Choice::Show => {
            let Some(host) = ask_host(mapper, prompt, "host: ").await? else {
                return Ok(false);
            };
            print_entries(&[mapper.inspect(host).await?]);
        }

        Choice::ShowAll => {
            print_entries(&mapper.list(ListMode::Parsed).await?);
        }

        Choice::Save => {
            mapper.persist().await?;
        }

        Choice::Exit => return Ok(false),
    }

    Ok(true)
}

/// `None` when input has ended.
async fn ask_host<S, P>(
    mapper: &Mapper<S>,
    prompt: &mut P,
    question: &str,
) -> Result<Option<HostId>>
where
    S: RuleStore,
    P: Prompt,
{
    match prompt.ask(question).await? {
        Some(x) => Ok(Some(mapper.validate(&x)?)),
        None => Ok(None),
    }
}

async fn ask_range<S, P>(mapper: &Mapper<S>, prompt: &mut P) -> Result<Option<(HostId, HostId)>>
where
    S: RuleStore,
    P: Prompt,
{
    let Some(first) = ask_host(mapper, prompt, "first host: ").await? else {
        return Ok(None);
    };
    let Some(last) = ask_host(mapper, prompt, "last host: ").await? else {
        return Ok(None);
    };

    HostId::check_range(first, last)?;
    Ok(Some((first, last)))
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use tempfile::tempdir;

    use super::*;
    use crate::allocation::PortsPerHost;
    use crate::backend::memory::MemoryStore;
    use crate::config::Settings;
    use crate::prompt::scripted::Scripted;
    use crate::rule::Table;

    /// No signal ever arrives.
    struct Never;

    impl Terminate for Never {
        async fn wait_terminate(&mut self) -> &'static str {
            std::future::pending().await
        }
    }

    /// A signal is already pending.
    struct Interrupted;

    impl Terminate for Interrupted {
        async fn wait_terminate(&mut self) -> &'static str {
            "SIGINT"
        }
    }

    fn mapper(dir: &Path) -> Mapper<MemoryStore> {
        let settings = Settings {
            persist: false,
            ..Settings::for_tests(dir)
        };
        Mapper::new(MemoryStore::new("memory"), settings, PortsPerHost::new(20).unwrap())
    }

    #[test]
    fn parses_choices() {
        assert_eq!(Choice::parse("1"), Some(Choice::Add));
        assert_eq!(Choice::parse(" 8 "), Some(Choice::Exit));
        assert_eq!(Choice::parse("0"), None);
        assert_eq!(Choice::parse("9"), None);
        assert_eq!(Choice::parse("add"), None);
    }

    #[tokio::test]
    async fn dispatches_until_exit() {
        let dir = tempdir().unwrap();
        let m = mapper(dir.path());
        let mut prompt = Scripted::new(&["1", "100", "9", "2", "101", "102", "3", "101", "8", "1"]);

        run_until(&m, &mut prompt, Never).await.unwrap();

        // "1" after exit is never read
        assert_eq!(prompt.asked.len(), 9);

        let nat = m.store().rules(Table::Nat);
        let mapped = |x| {
            let address = m.settings().address(HostId::new_unchecked(x));
            nat.iter().any(|rule| rule.references(address))
        };
        assert!(mapped(100));
        assert!(!mapped(101));
        assert!(mapped(102));
    }

    #[tokio::test]
    async fn bad_host_keeps_menu_open() {
        let dir = tempdir().unwrap();
        let m = mapper(dir.path());
        let mut prompt = Scripted::new(&["1", "99", "1", "abc", "5", "100", "2", "110", "100"]);

        run_until(&m, &mut prompt, Never).await.unwrap();

        assert_eq!(prompt.asked.len(), 10);
        assert!(m.store().rules(Table::Nat).is_empty());
    }

    #[tokio::test]
    async fn signal_ends_menu_at_choice() {
        let dir = tempdir().unwrap();
        let m = mapper(dir.path());
        let mut prompt = Scripted::stalling(&[]);

        run_until(&m, &mut prompt, Interrupted).await.unwrap();

        assert_eq!(prompt.asked, ["choice: "]);
    }

    #[tokio::test]
    async fn signal_ends_menu_at_host_question() {
        let dir = tempdir().unwrap();
        let m = mapper(dir.path());
        let mut prompt = Scripted::stalling(&["1"]);

        run_until(&m, &mut prompt, Interrupted).await.unwrap();

        assert_eq!(prompt.asked, ["choice: ", "host: "]);
        assert_eq!(m.store().calls(), 0);
    }
}
