// src/cli/handlers/mod.rs

// One module per command.

pub mod build;
pub mod commons;
pub mod list;
pub mod log;
pub mod restart;
pub mod start;
pub mod status;
pub mod stop;
