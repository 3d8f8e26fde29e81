//! Showing the state of the keys of a zone.
//!
//! The report is built from the key files alone and never writes. The next
//! transition of a key is derived from the policy and labelled as due
//! rather than scheduled: whether it happens depends on the run at that
//! time.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use domain::base::iana::SecurityAlgorithm;

use crate::error::StorageError;
use crate::keys::keyfile::format_timestamp;
use crate::keys::{after, elapsed, Key, KeyState, KeyStore, Role, SkippedFile, Timing, TimingField};
use crate::policy::ZoneConfig;

//------------ StatusReport --------------------------------------------------

/// The state of all keys of a zone at one moment.
#[derive(Clone, Debug)]
pub struct StatusReport {
    pub zone: String,
    pub now: DateTime<Utc>,
    pub keys: Vec<KeySummary>,
    pub skipped: Vec<SkippedFile>,
}

/// Build the report for a zone.
///
/// Keys are ordered by the given timing field, keys without it first.
pub fn report(
    store: &KeyStore,
    config: &ZoneConfig,
    now: DateTime<Utc>,
    sort: TimingField,
) -> Result<StatusReport, StorageError> {
    let listing = store.list_keys()?;
    let mut keys: Vec<KeySummary> = listing
        .keys
        .iter()
        .map(|key| KeySummary::new(key, &listing.keys, config, now, store.ds_record(key)))
        .collect();
    keys.sort_by(|a, b| {
        let a_at = a.timing.get(sort).unwrap_or(DateTime::UNIX_EPOCH);
        let b_at = b.timing.get(sort).unwrap_or(DateTime::UNIX_EPOCH);
        (a_at, a.role, a.state)
            .cmp(&(b_at, b.role, b.state))
            .then_with(|| a.base.cmp(&b.base))
    });
    Ok(StatusReport {
        zone: store.zone().into(),
        now,
        keys,
        skipped: listing.skipped,
    })
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "-".repeat(75);
        if self.keys.is_empty() {
            writeln!(f, "No keys found for {}", self.zone)?;
        }
        for key in &self.keys {
            writeln!(f, "{rule}")?;
            key.fmt_at(f, self.now)?;
        }
        if !self.keys.is_empty() {
            writeln!(f, "{rule}")?;
        }
        for skipped in &self.skipped {
            writeln!(f, "Skipped {}: {}", skipped.path.display(), skipped.reason)?;
        }
        Ok(())
    }
}

//------------ KeySummary ----------------------------------------------------

/// The state of one key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeySummary {
    pub base: String,
    pub owner: String,
    pub role: Role,
    pub algorithm: SecurityAlgorithm,
    pub key_tag: u16,
    pub state: KeyState,

    /// When the key entered its state.
    pub since: DateTime<Utc>,

    /// How long the key has been in its state.
    pub dwell: Duration,

    /// The next transition of the key under the zone's policy.
    pub next: Option<NextTransition>,

    pub timing: Timing,
    pub ds: Option<String>,
}

impl KeySummary {
    fn new(
        key: &Key,
        all: &[Key],
        config: &ZoneConfig,
        now: DateTime<Utc>,
        ds: Option<String>,
    ) -> Self {
        let status = key.status(now);
        KeySummary {
            base: key.base_name().into(),
            owner: key.owner().into(),
            role: key.role(),
            algorithm: key.algorithm(),
            key_tag: key.key_tag(),
            state: status.state,
            since: status.since,
            dwell: status.dwell(now),
            next: NextTransition::of(key, all, config, now),
            timing: key.timing().clone(),
            ds,
        }
    }

    fn fmt_at(&self, f: &mut fmt::Formatter<'_>, now: DateTime<Utc>) -> fmt::Result {
        writeln!(f, "F: {}", self.base)?;
        writeln!(
            f,
            "N: {} ID: {} T: {} A: {}",
            self.owner, self.key_tag, self.role, self.algorithm
        )?;

        let stamps: Vec<String> = TimingField::ALL
            .iter()
            .filter(|field| **field != TimingField::DsPublish)
            .map(|field| {
                let label = &field.tag()[..1];
                match self.timing.get(*field) {
                    Some(at) if at > now => format!("{label}: {} (scheduled)", format_timestamp(at)),
                    Some(at) => format!("{label}: {}", format_timestamp(at)),
                    None => format!("{label}: -"),
                }
            })
            .collect();
        writeln!(f, "{}", stamps.join(" "))?;

        writeln!(
            f,
            "S: {} since {} ({})",
            self.state,
            self.since,
            fmt_duration(self.dwell)
        )?;
        match &self.next {
            Some(next) => writeln!(f, "X: {next}")?,
            None if self.state == KeyState::Removed => {}
            None => writeln!(f, "X: not rolled")?,
        }
        if self.role == Role::Ksk {
            match self.timing.get(TimingField::DsPublish) {
                Some(at) if at <= now => writeln!(f, "DS confirmed: {}", format_timestamp(at))?,
                _ => writeln!(f, "DS confirmed: no")?,
            }
        }
        if let Some(ds) = &self.ds {
            writeln!(f, "{ds}")?;
        }
        Ok(())
    }
}

//------------ NextTransition ------------------------------------------------

/// What happens to a key next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NextStep {
    Publish,
    Activate,

    /// Activation waits for the DS record to be confirmed.
    AwaitDs,
    Retire,
    Remove,
    Purge,
}

impl fmt::Display for NextStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NextStep::Publish => "publish",
            NextStep::Activate => "activate",
            NextStep::AwaitDs => "activate after 'confirm-ds'",
            NextStep::Retire => "retire",
            NextStep::Remove => "remove",
            NextStep::Purge => "delete files",
        })
    }
}

/// The next transition of a key and when it is due.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NextTransition {
    pub step: NextStep,

    /// When the transition is due. `None` if it waits for the operator.
    pub at: Option<DateTime<Utc>>,

    /// The time left until it is due, zero if overdue.
    pub remaining: Option<Duration>,
}

impl NextTransition {
    fn due(step: NextStep, at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        NextTransition {
            step,
            at: Some(at),
            remaining: Some(elapsed(now, at)),
        }
    }

    /// Determine the next transition of a key.
    ///
    /// Roles without a policy are not rolled and have none.
    pub fn of(key: &Key, all: &[Key], config: &ZoneConfig, now: DateTime<Utc>) -> Option<Self> {
        let policy = config.policy(key.role())?;
        let status = key.status(now);
        let next = match status.state {
            KeyState::Generated => Self::due(NextStep::Publish, now, now),
            KeyState::Published => {
                let ready = after(status.since, policy.margin);
                let handover = all
                    .iter()
                    .filter(|other| other.role() == key.role())
                    .map(|other| other.status(now))
                    .filter(|other| other.state == KeyState::Active)
                    .map(|other| after(other.since, policy.interval))
                    .min()
                    .unwrap_or(now);
                let at = ready.max(handover);
                let needs_ds = key.role() == Role::Ksk
                    && config.ksk_activation.gates_on_ds()
                    && !key.ds_confirmed(now);
                if needs_ds && at <= now {
                    NextTransition {
                        step: NextStep::AwaitDs,
                        at: None,
                        remaining: None,
                    }
                } else {
                    Self::due(NextStep::Activate, at, now)
                }
            }
            KeyState::Active => {
                Self::due(NextStep::Retire, after(status.since, policy.interval), now)
            }
            KeyState::Retired => Self::due(NextStep::Remove, after(status.since, policy.margin), now),
            KeyState::Removed => Self::due(
                NextStep::Purge,
                after(status.since, config.autoremove_delay),
                now,
            ),
        };
        Some(next)
    }
}

impl fmt::Display for NextTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.at, self.remaining) {
            (Some(at), Some(remaining)) if !remaining.is_zero() => write!(
                f,
                "{} due {at} (in {})",
                self.step,
                fmt_duration(remaining)
            ),
            (Some(_), _) => write!(f, "{} due now", self.step),
            _ => write!(f, "{}", self.step),
        }
    }
}

/// Format a duration as days, hours, minutes and seconds.
pub fn fmt_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (days, hours, minutes, seconds) = (
        secs / 86400,
        secs % 86400 / 3600,
        secs % 3600 / 60,
        secs % 60,
    );
    if days > 0 {
        format!("{days}d {hours}h {minutes}m {seconds}s")
    } else if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}
