// src/bin/muster.rs

use anyhow::Result;
use clap::Parser;
use colored::*;
use muster::{
    CancellationToken,
    cli::{Cli, handlers},
};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

// --- Command Definition and Registry ---

/// A command, its aliases, and its handler.
struct CommandDefinition {
    name: &'static str,
    aliases: &'static [&'static str],
    handler: fn(Vec<String>, &CancellationToken) -> Result<()>,
}

static COMMAND_REGISTRY: &[CommandDefinition] = &[
    CommandDefinition {
        name: "build",
        aliases: &[],
        handler: handlers::build::handle,
    },
    CommandDefinition {
        name: "list",
        aliases: &["ls"],
        handler: handlers::list::handle,
    },
    CommandDefinition {
        name: "log",
        aliases: &["tail"],
        handler: handlers::log::handle,
    },
    CommandDefinition {
        name: "restart",
        aliases: &[],
        handler: handlers::restart::handle,
    },
    CommandDefinition {
        name: "start",
        aliases: &["up"],
        handler: handlers::start::handle,
    },
    CommandDefinition {
        name: "status",
        aliases: &["ps"],
        handler: handlers::status::handle,
    },
    CommandDefinition {
        name: "stop",
        aliases: &["down"],
        handler: handlers::stop::handle,
    },
];

fn find_command(name: &str) -> Option<&'static CommandDefinition> {
    COMMAND_REGISTRY
        .iter()
        .find(|cmd| cmd.name == name || cmd.aliases.contains(&name))
}

fn main() {
    let cancellation_token = Arc::new(AtomicBool::new(false));
    env_logger::init();

    if let Err(e) = run_cli(Cli::parse(), &cancellation_token) {
        // clap errors print their own usage.
        if let Some(clap_err) = e.downcast_ref::<clap::Error>() {
            clap_err.exit();
        }
        eprintln!("\n{}: {:#}", "Error".red().bold(), e);
        std::process::exit(1);
    }
}

fn run_cli(cli: Cli, cancellation_token: &CancellationToken) -> Result<()> {
    log::debug!("CLI args parsed: {:?}", cli);

    let Some((action, args)) = cli.args.split_first() else {
        let mut command = <Cli as clap::CommandFactory>::command();
        command.print_help()?;
        return Ok(());
    };

    match find_command(action) {
        Some(command) => (command.handler)(args.to_vec(), cancellation_token),
        None => Err(anyhow::anyhow!(
            "Unknown command '{}'. Run `muster --help` for the list of commands.",
            action
        )),
    }
}
