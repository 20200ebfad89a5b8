use crate::CancellationToken;
use crate::cli::args::LogArgs;
use crate::cli::handlers::commons;
use anyhow::Result;
use clap::Parser;
use std::time::Duration;

pub fn handle(args: Vec<String>, cancellation_token: &CancellationToken) -> Result<()> {
    let log_args = LogArgs::try_parse_from(&args)?;
    let mut settings = commons::settings(&log_args.global, Vec::new())?;
    if let Some(secs) = log_args.liveness_interval {
        settings.log_liveness_interval = Duration::from_secs(secs);
    }
    let client = commons::open_client(&log_args.global, settings)?;
    client.log(&log_args.names, cancellation_token)?;
    Ok(())
}
