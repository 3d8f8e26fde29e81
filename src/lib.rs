//! Automated DNSSEC key rollovers for BIND-style key directories.
//!
//! The keys of a zone are kept as `K<zone>+<alg>+<tag>` files in a key
//! directory. Every run looks at their timing metadata, decides which keys
//! have to move to their next lifecycle state, and writes the new metadata
//! back. The name server picks the changes up from the files.

pub mod args;
pub mod commands;
pub mod env;
pub mod error;
pub mod keys;
pub mod log;
pub mod machine;
pub mod notify;
pub mod orchestrator;
pub mod parent;
pub mod parse;
pub mod policy;
pub mod report;
pub mod util;

use clap::Parser;

pub use args::Args;
use env::Env;
use error::{Error, Exit};

/// Parse the command line of the environment.
pub fn parse_args(env: impl Env) -> Result<Args, Error> {
    let args = Args::try_parse_from(env.args_os())?;
    Ok(args)
}

/// Run the program in the given environment and return its exit code.
pub fn run(env: impl Env) -> u8 {
    let args = match Args::try_parse_from(env.args_os()) {
        Ok(args) => args,
        // Help and version output is not an error.
        Err(err) if !err.use_stderr() => {
            write!(env.stdout(), "{}", err.render());
            return 0;
        }
        Err(err) => {
            let err = Error::from(err);
            err.pretty_print(&env);
            return err.exit_code();
        }
    };

    let level = args.log_level();
    match log::with_logging(&env, level, || args.execute(&env)) {
        Ok(()) | Err(Exit::Success) => 0,
        Err(Exit::Error(err)) => {
            err.pretty_print(&env);
            err.exit_code()
        }
    }
}
