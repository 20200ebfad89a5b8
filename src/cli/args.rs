// src/cli/args.rs
use clap::{Args, Parser};
use std::path::PathBuf;

/// Options every command accepts.
#[derive(Args, Debug, Default, Clone)]
pub struct GlobalArgs {
    /// The config file to use. Defaults to the nearest muster.json or muster.toml.
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Directory for state and run logs. Defaults to $MUSTER_HOME, then the data directory.
    #[arg(long)]
    pub home: Option<PathBuf>,

    /// Maximum number of services handled at once (0 = no limit).
    #[arg(long, short = 'j', default_value_t = 0)]
    pub concurrency: usize,

    /// Seconds a service may take to become ready.
    #[arg(long)]
    pub launch_timeout: Option<u64>,

    /// Seconds a stopped service gets to exit before it is killed.
    #[arg(long)]
    pub stop_timeout: Option<u64>,
}

#[derive(Parser, Debug, Default)]
#[command(no_binary_name = true, about = "Builds services and groups.")]
pub struct BuildArgs {
    /// Services or groups to build.
    #[arg(required = true)]
    pub names: Vec<String>,

    /// Rebuild services that are currently running.
    #[arg(long, short)]
    pub force: bool,

    /// Services to leave alone (names or aliases).
    #[arg(long, short = 'x', value_delimiter = ',')]
    pub exclude: Vec<String>,

    #[command(flatten)]
    pub global: GlobalArgs,
}

#[derive(Parser, Debug, Default)]
#[command(no_binary_name = true, about = "Builds and launches services and groups.")]
pub struct StartArgs {
    /// Services or groups to start.
    #[arg(required = true)]
    pub names: Vec<String>,

    /// Launch without building first.
    #[arg(long, short = 's')]
    pub skip_build: bool,

    /// Services to leave alone (names or aliases).
    #[arg(long, short = 'x', value_delimiter = ',')]
    pub exclude: Vec<String>,

    #[command(flatten)]
    pub global: GlobalArgs,
}

#[derive(Parser, Debug, Default)]
#[command(no_binary_name = true, about = "Stops services and groups.")]
pub struct StopArgs {
    /// Services or groups to stop.
    #[arg(required = true)]
    pub names: Vec<String>,

    #[command(flatten)]
    pub global: GlobalArgs,
}

#[derive(Parser, Debug, Default)]
#[command(
    no_binary_name = true,
    about = "Restarts services and groups. With no names, restarts everything running."
)]
pub struct RestartArgs {
    pub names: Vec<String>,

    /// Do not ask for confirmation.
    #[arg(long, short)]
    pub force: bool,

    /// Restart without rebuilding.
    #[arg(long, short = 's')]
    pub skip_build: bool,

    /// Services to leave alone (names or aliases).
    #[arg(long, short = 'x', value_delimiter = ',')]
    pub exclude: Vec<String>,

    #[command(flatten)]
    pub global: GlobalArgs,
}

#[derive(Parser, Debug, Default)]
#[command(no_binary_name = true, about = "Shows the state of services.")]
pub struct StatusArgs {
    /// Services or groups to report on. Defaults to every service.
    pub names: Vec<String>,

    #[command(flatten)]
    pub global: GlobalArgs,
}

#[derive(Parser, Debug, Default)]
#[command(no_binary_name = true, about = "Lists the services and groups in the config.")]
pub struct ListArgs {
    #[command(flatten)]
    pub global: GlobalArgs,
}

#[derive(Parser, Debug, Default)]
#[command(no_binary_name = true, about = "Follows the run logs of services.")]
pub struct LogArgs {
    /// Services or groups whose logs to follow.
    #[arg(required = true)]
    pub names: Vec<String>,

    /// Seconds between checks for whether any followed service is still running.
    #[arg(long)]
    pub liveness_interval: Option<u64>,

    #[command(flatten)]
    pub global: GlobalArgs,
}
