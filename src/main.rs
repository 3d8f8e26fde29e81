use std::process::ExitCode;

fn main() -> ExitCode {
    ExitCode::from(keyroll::run(keyroll::env::RealEnv))
}
