//! Command trait definition for CLI commands.
//!
//! All subcommands implement [`Command`]; dispatch across the subcommand
//! enum uses `enum_dispatch`.

use anyhow::Result;
use enum_dispatch::enum_dispatch;

/// Trait implemented by all readforge CLI commands.
///
/// `command_line` is the full invocation, recorded in @PG header records.
#[enum_dispatch]
pub trait Command {
    #[allow(clippy::missing_errors_doc)]
    fn execute(&self, command_line: &str) -> Result<()>;
}
