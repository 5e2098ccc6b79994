#[macro_use]
extern crate tracing;

#[macro_use]
mod display;

mod allocation;
mod app;
mod backend;
mod cli;
mod config;
mod host;
mod infer;
mod lock;
mod mapper;
mod menu;
mod prompt;
mod rule;
mod signal;

use std::io::IsTerminal;
use std::process::ExitCode;

use clap::Parser;
use eyre::{Context, Result};

use self::app::Request;
use self::cli::Cli;
use self::config::Settings;
use self::prompt::Terminal;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .compact()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_max_level(cli.level())
        .init();

    match try_main(cli).await {
        Ok(x) => x,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn try_main(cli: Cli) -> Result<ExitCode> {
    let settings = Settings::try_from(&cli.options).context("invalid settings")?;
    let request = Request::new(cli.command, &settings)?;

    let interactive = std::io::stdin().is_terminal();
    let mut terminal = Terminal::new();

    let mapper = app::open(
        settings,
        cli.options.backend.as_deref(),
        interactive.then_some(&mut terminal),
    )
    .await?;

    app::run(&mapper, request, &mut terminal).await
}
