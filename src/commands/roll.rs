use tracing::warn;

use crate::env::Env;
use crate::error::{Error, Exit};
use crate::keys::generate::{ExternalGenerator, KeyGenerator, NativeGenerator};
use crate::keys::TimingField;
use crate::notify;
use crate::orchestrator::{Orchestrator, RolloverReport};
use crate::parent::ResolverLookup;
use crate::policy::{KeygenConfig, ZoneConfig};

use super::{open_store, status, ZoneArgs};

#[derive(Clone, Debug, PartialEq, Eq, clap::Args)]
pub struct Roll {
    #[command(flatten)]
    pub zone: ZoneArgs,

    /// Only show the state of the keys, like 'status'
    #[arg(short = 'p', long = "report-only")]
    pub report_only: bool,

    /// Order the report by this timing field
    ///
    /// One of created, publish, activate, revoke, inactive or delete, or
    /// their first letter.
    #[arg(
        short = 's',
        long = "sort",
        value_name = "FIELD",
        default_value = "created",
        requires = "report_only"
    )]
    pub sort: TimingField,
}

impl Roll {
    pub fn execute(self, env: impl Env) -> Result<(), Exit> {
        let config = self.zone.to_config(&env)?;
        if self.report_only {
            return status::show(&env, &config, self.sort);
        }

        let store = open_store(&config)?;
        let generator = generator(&config);
        let notifier = notify::from_config(&config.notify);
        let lookup = ResolverLookup;
        let orchestrator = Orchestrator::new(&config, &store, generator.as_ref(), notifier.as_ref())
            .with_ds_lookup(&lookup);

        let report = orchestrator.run(env.now()).map_err(Error::from)?;
        print_report(&env, &report);
        if report.locked_out {
            return Err(Exit::Success);
        }

        if !report.is_success() {
            return Err(Error::new(&format!(
                "{} of {} due transitions failed",
                report.failures.len(),
                report.failures.len() + report.applied.len()
            ))
            .into());
        }
        Ok(())
    }
}

/// The key generator to use for a zone.
pub fn generator(config: &ZoneConfig) -> Box<dyn KeyGenerator> {
    match &config.keygen {
        KeygenConfig::Native => Box::new(NativeGenerator),
        KeygenConfig::External { command } => Box::new(ExternalGenerator::new(command.clone())),
    }
}

fn print_report(env: impl Env, report: &RolloverReport) {
    let mut out = env.stdout();
    let zone = &report.zone;
    if report.locked_out {
        writeln!(out, "{zone}: another run is in progress, nothing done");
        return;
    }
    for applied in &report.applied {
        if applied.transition.key().is_some() {
            writeln!(out, "{zone}: {}", applied.transition);
        } else {
            writeln!(out, "{zone}: {} ({})", applied.transition, applied.key);
        }
    }
    for (role, blocked) in &report.blocked {
        writeln!(out, "{zone}: {role} rollover waiting: {blocked}");
    }
    for reminder in &report.reminders {
        writeln!(out, "{zone}: {reminder}");
    }
    if let Some(err) = &report.lookup_failure {
        writeln!(out, "{zone}: {err}");
    }
    for err in &report.notification_failures {
        warn!("{err}");
    }
    if report.applied.is_empty()
        && report.failures.is_empty()
        && report.blocked.is_empty()
        && report.reminders.is_empty()
        && report.lookup_failure.is_none()
    {
        writeln!(out, "{zone}: no action needed");
    }
}
