use crate::CancellationToken;
use crate::cli::args::RestartArgs;
use crate::cli::handlers::commons;
use anyhow::Result;
use clap::Parser;

pub fn handle(args: Vec<String>, _cancellation_token: &CancellationToken) -> Result<()> {
    let restart_args = RestartArgs::try_parse_from(&args)?;
    let settings = commons::settings(&restart_args.global, restart_args.exclude)?;
    let client = commons::open_client(&restart_args.global, settings)?;

    // `None` means the user declined the restart-all prompt.
    if let Some(snapshot) = client.restart(
        &restart_args.names,
        restart_args.force,
        restart_args.skip_build,
    )? {
        commons::print_summary("Restart", &snapshot);
    }
    Ok(())
}
