use crate::CancellationToken;
use crate::cli::args::ListArgs;
use crate::cli::handlers::commons;
use anyhow::Result;
use clap::Parser;
use colored::Colorize;

pub fn handle(args: Vec<String>, _cancellation_token: &CancellationToken) -> Result<()> {
    let list_args = ListArgs::try_parse_from(&args)?;
    let settings = commons::settings(&list_args.global, Vec::new())?;
    let client = commons::open_client(&list_args.global, settings)?;
    println!(
        "{} {}",
        "Config:".dimmed(),
        client.graph().file_path.display()
    );
    client.list();
    Ok(())
}
