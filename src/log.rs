//! Sending log output to the environment.

use tracing::Level;

use crate::env::Env;

/// Run `op` with log output going to the stderr of `env`.
///
/// The subscriber is only installed for the duration of `op`, so that
/// concurrent runs in tests each log to their own environment.
pub fn with_logging<T>(env: impl Env, level: Level, op: impl FnOnce() -> T) -> T {
    let stderr = env.stderr();
    let ansi = stderr.is_terminal();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(stderr)
        .with_max_level(level)
        .with_ansi(ansi)
        .with_target(false)
        .without_time()
        .finish();
    tracing::subscriber::with_default(subscriber, op)
}
