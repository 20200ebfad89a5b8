// src/cli/render.rs

//! Prints task progress as nodes finish. Each node is printed once, on reaching a terminal
//! state, with its output when it failed.

use crate::core::tracker::{TaskHandler, TaskState, TaskUpdate};
use colored::Colorize;
use std::collections::HashSet;
use std::io::Write;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
pub struct CompletionRenderer {
    printed: Mutex<HashSet<String>>,
}

impl CompletionRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps the renderer as a task handler writing to stdout.
    pub fn into_handler(self) -> TaskHandler {
        let renderer = Arc::new(self);
        Arc::new(move |update: &TaskUpdate| {
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            if let Err(e) = renderer.render(update, &mut out) {
                log::debug!("Could not render task update: {}", e);
            }
        })
    }

    /// Writes `update`'s node if it just reached a terminal state.
    pub fn render<W: Write>(&self, update: &TaskUpdate, out: &mut W) -> std::io::Result<()> {
        let lineage = update.task.lineage();
        // The root only frames the run.
        if lineage.len() < 2 {
            return Ok(());
        }
        let state = update.task.state();
        if !state.is_terminal() {
            return Ok(());
        }
        let key = lineage.join("/");
        {
            let mut printed = self
                .printed
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if !printed.insert(key) {
                return Ok(());
            }
        }

        let label = match state {
            TaskState::Success => "OK".green().bold(),
            TaskState::Warning => "WARN".yellow().bold(),
            TaskState::Failed => "FAIL".red().bold(),
            TaskState::Pending | TaskState::InProgress => return Ok(()),
        };
        let path = lineage.iter().skip(1).cloned().collect::<Vec<_>>().join(" > ");
        writeln!(out, "[{}] {}", label, path)?;

        let output = update.task.output();
        let shown: &[String] = match state {
            TaskState::Failed => output.as_slice(),
            // Warnings carry a single explanatory line.
            TaskState::Warning => output.get(..1).unwrap_or(&[]),
            _ => &[],
        };
        for line in shown {
            writeln!(out, "    {}", line.dimmed())?;
        }
        Ok(())
    }
}
