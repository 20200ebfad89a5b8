use crate::CancellationToken;
use crate::cli::args::BuildArgs;
use crate::cli::handlers::commons;
use anyhow::Result;
use clap::Parser;

pub fn handle(args: Vec<String>, _cancellation_token: &CancellationToken) -> Result<()> {
    let build_args = BuildArgs::try_parse_from(&args)?;
    let settings = commons::settings(&build_args.global, build_args.exclude)?;
    let client = commons::open_client(&build_args.global, settings)?;
    commons::finish("Build", client.build(&build_args.names, build_args.force))
}
