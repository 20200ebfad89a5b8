use crate::CancellationToken;
use crate::cli::args::StopArgs;
use crate::cli::handlers::commons;
use anyhow::Result;
use clap::Parser;

pub fn handle(args: Vec<String>, _cancellation_token: &CancellationToken) -> Result<()> {
    let stop_args = StopArgs::try_parse_from(&args)?;
    let settings = commons::settings(&stop_args.global, Vec::new())?;
    let client = commons::open_client(&stop_args.global, settings)?;
    commons::finish("Stop", client.stop(&stop_args.names))
}
