use crate::env::Env;
use crate::error::Exit;
use crate::keys::TimingField;
use crate::policy::ZoneConfig;
use crate::report;

use super::{open_store, ZoneArgs};

#[derive(Clone, Debug, PartialEq, Eq, clap::Args)]
pub struct Status {
    #[command(flatten)]
    pub zone: ZoneArgs,

    /// Order keys by this timing field
    #[arg(short = 's', long = "sort", value_name = "FIELD", default_value = "created")]
    pub sort: TimingField,
}

impl Status {
    pub fn execute(self, env: impl Env) -> Result<(), Exit> {
        let config = self.zone.to_config(&env)?;
        show(env, &config, self.sort)
    }
}

/// Print the state of the keys of a zone.
pub fn show(env: impl Env, config: &ZoneConfig, sort: TimingField) -> Result<(), Exit> {
    let store = open_store(config)?;
    let report = report::report(&store, config, env.now(), sort)?;
    write!(env.stdout(), "{report}");
    Ok(())
}
