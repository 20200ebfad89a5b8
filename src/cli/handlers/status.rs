use crate::CancellationToken;
use crate::cli::args::StatusArgs;
use crate::cli::handlers::commons;
use anyhow::Result;
use clap::Parser;

pub fn handle(args: Vec<String>, _cancellation_token: &CancellationToken) -> Result<()> {
    let status_args = StatusArgs::try_parse_from(&args)?;
    let settings = commons::settings(&status_args.global, Vec::new())?;
    let client = commons::open_client(&status_args.global, settings)?;
    client.status(&status_args.names)?;
    Ok(())
}
