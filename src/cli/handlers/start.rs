use crate::CancellationToken;
use crate::cli::args::StartArgs;
use crate::cli::handlers::commons;
use anyhow::Result;
use clap::Parser;

pub fn handle(args: Vec<String>, _cancellation_token: &CancellationToken) -> Result<()> {
    let start_args = StartArgs::try_parse_from(&args)?;
    let settings = commons::settings(&start_args.global, start_args.exclude)?;
    let client = commons::open_client(&start_args.global, settings)?;
    commons::finish("Start", client.start(&start_args.names, start_args.skip_build))
}
