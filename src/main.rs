#![deny(unsafe_code)]
pub mod commands;

use anyhow::Result;
use clap::builder::styling::{AnsiColor, Effects, Styles};
use clap::Parser;
use enum_dispatch::enum_dispatch;
use env_logger::Env;
use log::{error, info};

use commands::command::Command;
use commands::merge::Merge;
use commands::realign::Realign;
use commands::sort::Sort;
use commands::view::View;
use readforge_lib::ReadforgeError;

/// Custom styles for CLI help output.
const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default());

#[derive(Parser, Debug)]
#[command(styles = STYLES, version)]
struct Args {
    /// Verbose (debug-level) logging.
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,

    #[clap(subcommand)]
    subcommand: Subcommand,
}

#[enum_dispatch(Command)]
#[derive(Parser, Debug)]
#[allow(clippy::large_enum_variant)]
enum Subcommand {
    #[command(display_order = 1)]
    Sort(Sort),
    #[command(display_order = 2)]
    Realign(Realign),
    #[command(display_order = 3)]
    Merge(Merge),
    #[command(display_order = 4)]
    View(View),
}

fn main() {
    // Capture the full command line before clap parsing, for @PG records.
    let command_line = std::env::args().collect::<Vec<_>>().join(" ");

    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(default_level)).init();

    info!("Running readforge version {}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(&args, &command_line) {
        error!("{e:#}");
        let code = e.downcast_ref::<ReadforgeError>().map_or(1, ReadforgeError::exit_code);
        std::process::exit(code);
    }
}

fn run(args: &Args, command_line: &str) -> Result<()> {
    args.subcommand.execute(command_line)
}
