use clap::Parser;

pub mod args;
pub mod handlers;
pub mod render;
pub mod ui;

const HELP_TEMPLATE: &str = "\
{before-help}{name} {version}
{about}

{usage-heading} muster <COMMAND> [ARGS...]

Commands:
  build    <names...>   Build services and groups
  start    <names...>   Build and launch services and groups
  stop     <names...>   Stop services and groups
  restart  [names...]   Restart services (everything running when no names are given)
  status   [names...]   Show the state of services
  list                  List the services and groups in the config
  log      <names...>   Follow run logs (alias: tail)

Run `muster <COMMAND> --help` for the options of a command.
{after-help}";

/// muster: bring up, stop and restart groups of local development services.
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about,
    help_template = HELP_TEMPLATE,
    styles = clap::builder::Styles::styled()
        .header(clap::builder::styling::AnsiColor::Yellow.on_default().bold())
        .usage(clap::builder::styling::AnsiColor::Yellow.on_default().bold())
        .literal(clap::builder::styling::AnsiColor::Cyan.on_default().bold())
        .placeholder(clap::builder::styling::AnsiColor::Green.on_default()),
)]
#[command(disable_help_subcommand = true)]
#[command(trailing_var_arg = true)]
pub struct Cli {
    /// The command followed by its arguments.
    #[arg(allow_hyphen_values = true)]
    pub args: Vec<String>,
}
