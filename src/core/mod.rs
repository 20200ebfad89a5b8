// src/core/mod.rs

pub mod config_loader;
pub mod config_resolver;
pub mod env;
pub mod instance;
pub mod log_follower;
pub mod orchestrator;
pub mod paths;
pub mod tracker;
pub mod ui;
pub mod worker_pool;
