// src/cli/handlers/commons.rs

// Shared setup for the command handlers.

use crate::cli::args::GlobalArgs;
use crate::cli::render::CompletionRenderer;
use crate::cli::ui::TerminalUi;
use crate::core::orchestrator::{Client, OrchestratorError, Settings};
use crate::core::paths::{self, HomeDirs};
use crate::core::tracker::{TaskSnapshot, TaskState};
use crate::system::backend::BackendRegistry;
use anyhow::{Context, Result};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Finds the config file: the explicit one, or the nearest one above the current directory.
pub fn config_path(global: &GlobalArgs) -> Result<PathBuf> {
    if let Some(path) = &global.config {
        return Ok(path.clone());
    }
    let cwd = std::env::current_dir().context("Could not read the current directory")?;
    Ok(paths::find_config_file(&cwd)?)
}

/// Runtime settings from the global flags.
pub fn settings(global: &GlobalArgs, exclusions: Vec<String>) -> Result<Settings> {
    let mut settings = Settings {
        concurrency: global.concurrency,
        working_dir: std::env::current_dir().context("Could not read the current directory")?,
        exclusions,
        ..Settings::default()
    };
    if let Some(secs) = global.launch_timeout {
        settings.launch_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = global.stop_timeout {
        settings.stop_timeout = Duration::from_secs(secs);
    }
    Ok(settings)
}

/// Loads the config and builds a client that renders task progress to the terminal.
pub fn open_client(global: &GlobalArgs, settings: Settings) -> Result<Client> {
    let config = config_path(global)?;
    log::debug!("Using config '{}'.", config.display());
    let dirs = HomeDirs::resolve(global.home.as_deref())?;
    let registry = BackendRegistry::with_defaults();
    let client = Client::load(&config, &registry, dirs, settings, Arc::new(TerminalUi::new()))?
        .with_task_handler(CompletionRenderer::new().into_handler());
    Ok(client)
}

/// Prints a one-line summary of a finished flow.
pub fn print_summary(verb: &str, snapshot: &TaskSnapshot) {
    let warnings = snapshot.count_in_state(TaskState::Warning);
    let mut line = format!("{} finished.", verb);
    if warnings > 0 {
        line.push_str(&format!(" {} warning(s).", warnings));
    }
    println!("\n{}", line.green());
}

/// Maps a flow result onto the command result, printing the summary on success.
pub fn finish(verb: &str, result: Result<TaskSnapshot, OrchestratorError>) -> Result<()> {
    let snapshot = result?;
    print_summary(verb, &snapshot);
    Ok(())
}
