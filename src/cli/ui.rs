// src/cli/ui.rs

use crate::core::ui::{ListEntry, Provider, ServiceStatus};
use crate::models::{InstanceStatus, LogLine};
use colored::Colorize;
use dialoguer::{Confirm, theme::ColorfulTheme};
use std::io::IsTerminal;
use std::sync::mpsc::Receiver;

/// Prints to the terminal; prompts only when stdin is a terminal.
#[derive(Debug, Default)]
pub struct TerminalUi;

impl TerminalUi {
    pub fn new() -> Self {
        Self
    }
}

fn status_label(status: &ServiceStatus) -> String {
    match (status.status, status.alive) {
        (_, false) if status.pid != 0 => "DEAD".red().bold().to_string(),
        (Some(InstanceStatus::Running), _) => "RUNNING".green().bold().to_string(),
        (Some(InstanceStatus::Starting), _) => "STARTING".yellow().to_string(),
        (Some(InstanceStatus::Failed), _) => "FAILED".red().bold().to_string(),
        (Some(InstanceStatus::Stopped), _) | (None, _) => "STOPPED".dimmed().to_string(),
    }
}

fn print_entries(title: &str, entries: &[ListEntry]) {
    if entries.is_empty() {
        return;
    }
    println!("\n{}", title.yellow().bold());
    for entry in entries {
        let mut line = format!("  {}", entry.name.cyan());
        if !entry.aliases.is_empty() {
            line.push_str(&format!(" ({})", entry.aliases.join(", ")).dimmed().to_string());
        }
        if let Some(description) = &entry.description {
            line.push_str(&format!(": {}", description));
        }
        println!("{}", line);
        if !entry.children.is_empty() {
            println!("    {} {}", "->".dimmed(), entry.children.join(", "));
        }
    }
}

impl Provider for TerminalUi {
    fn info(&self, message: &str) {
        println!("{}", message);
    }

    fn error(&self, message: &str) {
        eprintln!("{}: {}", "Error".red().bold(), message);
    }

    fn confirm(&self, prompt: &str) -> bool {
        if !std::io::stdin().is_terminal() {
            return false;
        }
        Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(prompt)
            .default(false)
            .interact()
            .unwrap_or(false)
    }

    fn list(&self, services: &[ListEntry], groups: &[ListEntry]) {
        if services.is_empty() && groups.is_empty() {
            println!("No services or groups are defined.");
            return;
        }
        print_entries("Services", services);
        print_entries("Groups", groups);
    }

    fn status(&self, statuses: &[ServiceStatus]) {
        let width = statuses.iter().map(|s| s.name.len()).max().unwrap_or(0);
        for status in statuses {
            let pid = if status.pid == 0 {
                "-".to_string()
            } else {
                status.pid.to_string()
            };
            let since = status
                .started_at
                .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_default();
            println!(
                "{:<width$}  {:<10}  {:>8}  {}",
                status.name,
                status_label(status),
                pid,
                since.dimmed(),
                width = width
            );
        }
    }

    fn show_log(&self, lines: Receiver<LogLine>, multi_service: bool) {
        for line in lines {
            if multi_service {
                println!("{} {}", format!("[{}]", line.service).cyan(), line.message);
            } else {
                println!("{}", line.message);
            }
        }
    }
}
