use tracing::Level;

use crate::commands::Command;
use crate::env::Env;
use crate::error::Exit;

#[derive(Clone, Debug, clap::Parser)]
#[command(version, disable_help_subcommand = true)]
pub struct Args {
    /// Log what is being decided and why
    #[arg(short = 'v', long = "verbose", global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Only log warnings and errors
    #[arg(short = 'q', long = "quiet", global = true)]
    quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl Args {
    pub fn execute(self, env: impl Env) -> Result<(), Exit> {
        self.command.execute(env)
    }

    /// The most detailed level that is logged.
    pub fn log_level(&self) -> Level {
        if self.verbose {
            Level::DEBUG
        } else if self.quiet {
            Level::WARN
        } else {
            Level::INFO
        }
    }
}

impl From<Command> for Args {
    fn from(value: Command) -> Self {
        Args {
            verbose: false,
            quiet: false,
            command: value,
        }
    }
}
