// src/core/ui.rs

//! The presentation boundary. The orchestrator calls into a [`Provider`]; a provider never
//! calls back into the orchestrator.

use crate::models::{InstanceStatus, LogLine};
use chrono::{DateTime, Utc};
use std::sync::mpsc::Receiver;

/// One row of `status` output.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceStatus {
    pub name: String,
    /// 0 when not running.
    pub pid: u32,
    /// Latest entry of the current run's history.
    pub status: Option<InstanceStatus>,
    pub started_at: Option<DateTime<Utc>>,
    /// Whether the recorded pid still belongs to a live process.
    pub alive: bool,
}

/// One row of `list` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub name: String,
    pub aliases: Vec<String>,
    pub description: Option<String>,
    /// Child names for groups, empty for services.
    pub children: Vec<String>,
}

pub trait Provider: Send + Sync {
    fn info(&self, message: &str);

    fn error(&self, message: &str);

    /// Asks a yes/no question. Non-interactive providers answer `false`.
    fn confirm(&self, prompt: &str) -> bool;

    fn list(&self, services: &[ListEntry], groups: &[ListEntry]);

    fn status(&self, statuses: &[ServiceStatus]);

    /// Consumes `lines` until every sender is gone. `multi_service` asks for each line to be
    /// labelled with its service.
    fn show_log(&self, lines: Receiver<LogLine>, multi_service: bool);
}
