//! DNSSEC keys and the directory they are kept in.
//!
//! A key is described entirely by its files. Its role, algorithm and key
//! tag come from the public key file, its lifecycle from the timing
//! metadata BIND keeps alongside the key material. The state of a key is
//! never stored separately: it is derived from that metadata for the moment
//! a decision is made.

pub mod generate;
pub mod keyfile;
pub mod store;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use domain::base::iana::SecurityAlgorithm;
use serde::{Deserialize, Serialize};

pub use self::store::{DirLock, KeyStore, Listing, SkippedFile};

//------------ Role ----------------------------------------------------------

/// The role a key plays in signing a zone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub enum Role {
    /// A zone signing key signs the records of the zone.
    #[serde(rename = "zsk")]
    Zsk,

    /// A key signing key signs the DNSKEY RRset and is referenced by the
    /// DS record at the parent.
    #[serde(rename = "ksk")]
    Ksk,
}

impl Role {
    pub const ALL: [Role; 2] = [Role::Ksk, Role::Zsk];

    /// The DNSKEY flags for keys of this role.
    pub fn flags(self) -> u16 {
        match self {
            Role::Zsk => 256,
            Role::Ksk => 257,
        }
    }

    /// Determine the role from DNSKEY flags, based on the SEP bit.
    pub fn from_flags(flags: u16) -> Self {
        if flags & 1 == 1 {
            Role::Ksk
        } else {
            Role::Zsk
        }
    }

    /// The wording BIND uses for this role in key file headers.
    pub fn bind_label(self) -> &'static str {
        match self {
            Role::Zsk => "zone",
            Role::Ksk => "key",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Zsk => "ZSK",
            Role::Ksk => "KSK",
        })
    }
}

//------------ KeyState ------------------------------------------------------

/// The lifecycle state of a key.
///
/// The variants are ordered by the lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeyState {
    /// Key material exists but the key is not in the zone.
    Generated,

    /// The key is in the DNSKEY RRset but does not sign.
    Published,

    /// The key signs.
    Active,

    /// The key no longer signs but remains published.
    Retired,

    /// The key is withdrawn from the zone and waits to be deleted.
    Removed,
}

impl fmt::Display for KeyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            KeyState::Generated => "generated",
            KeyState::Published => "published",
            KeyState::Active => "active",
            KeyState::Retired => "retired",
            KeyState::Removed => "removed",
        })
    }
}

//------------ TimingField ---------------------------------------------------

/// One of the timing metadata fields of a BIND key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimingField {
    Created,
    Publish,
    Activate,
    Revoke,
    Inactive,
    Delete,
    DsPublish,
}

impl TimingField {
    /// All fields in the order BIND writes them.
    pub const ALL: [TimingField; 7] = [
        TimingField::Created,
        TimingField::Publish,
        TimingField::Activate,
        TimingField::Revoke,
        TimingField::Inactive,
        TimingField::Delete,
        TimingField::DsPublish,
    ];

    /// The tag of the field in key files.
    pub fn tag(self) -> &'static str {
        match self {
            TimingField::Created => "Created",
            TimingField::Publish => "Publish",
            TimingField::Activate => "Activate",
            TimingField::Revoke => "Revoke",
            TimingField::Inactive => "Inactive",
            TimingField::Delete => "Delete",
            TimingField::DsPublish => "DSPublish",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|field| field.tag() == tag)
    }

    /// The state a key enters when this field is reached, if any.
    fn entered_state(self) -> Option<KeyState> {
        match self {
            TimingField::Publish => Some(KeyState::Published),
            TimingField::Activate => Some(KeyState::Active),
            TimingField::Inactive => Some(KeyState::Retired),
            TimingField::Delete => Some(KeyState::Removed),
            _ => None,
        }
    }
}

impl FromStr for TimingField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let field = match s.to_ascii_lowercase().as_str() {
            "c" | "created" => TimingField::Created,
            "p" | "publish" => TimingField::Publish,
            "a" | "activate" => TimingField::Activate,
            "r" | "revoke" => TimingField::Revoke,
            "i" | "inactive" => TimingField::Inactive,
            "d" | "delete" => TimingField::Delete,
            _ => return Err(format!("unknown timing field '{s}'")),
        };
        Ok(field)
    }
}

//------------ Timing --------------------------------------------------------

/// The timing metadata of a key.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Timing {
    created: Option<DateTime<Utc>>,
    publish: Option<DateTime<Utc>>,
    activate: Option<DateTime<Utc>>,
    revoke: Option<DateTime<Utc>>,
    inactive: Option<DateTime<Utc>>,
    delete: Option<DateTime<Utc>>,
    ds_publish: Option<DateTime<Utc>>,
}

impl Timing {
    /// Timing metadata of a key created at the given time.
    pub fn created_at(created: DateTime<Utc>) -> Self {
        Self {
            created: Some(created),
            ..Default::default()
        }
    }

    pub fn get(&self, field: TimingField) -> Option<DateTime<Utc>> {
        match field {
            TimingField::Created => self.created,
            TimingField::Publish => self.publish,
            TimingField::Activate => self.activate,
            TimingField::Revoke => self.revoke,
            TimingField::Inactive => self.inactive,
            TimingField::Delete => self.delete,
            TimingField::DsPublish => self.ds_publish,
        }
    }

    pub fn set(&mut self, field: TimingField, value: Option<DateTime<Utc>>) {
        let slot = match field {
            TimingField::Created => &mut self.created,
            TimingField::Publish => &mut self.publish,
            TimingField::Activate => &mut self.activate,
            TimingField::Revoke => &mut self.revoke,
            TimingField::Inactive => &mut self.inactive,
            TimingField::Delete => &mut self.delete,
            TimingField::DsPublish => &mut self.ds_publish,
        };
        *slot = value;
    }

    /// Iterate over the fields that are set.
    pub fn iter(&self) -> impl Iterator<Item = (TimingField, DateTime<Utc>)> + '_ {
        TimingField::ALL
            .into_iter()
            .filter_map(|field| self.get(field).map(|value| (field, value)))
    }
}

//------------ Status --------------------------------------------------------

/// The state of a key at a given moment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Status {
    pub state: KeyState,

    /// When the key entered its state.
    pub since: DateTime<Utc>,
}

impl Status {
    /// How long the key has been in its state.
    pub fn dwell(&self, now: DateTime<Utc>) -> Duration {
        elapsed(self.since, now)
    }
}

//------------ Key -----------------------------------------------------------

/// A DNSSEC key of a zone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Key {
    /// The base name of the key files, `K<zone>+<alg>+<tag>`.
    base: String,

    /// The owner name of the DNSKEY record, with a trailing dot.
    owner: String,

    role: Role,
    algorithm: SecurityAlgorithm,
    key_tag: u16,
    timing: Timing,
}

impl Key {
    pub fn new(
        base: String,
        owner: String,
        role: Role,
        algorithm: SecurityAlgorithm,
        key_tag: u16,
        timing: Timing,
    ) -> Self {
        Self {
            base,
            owner,
            role,
            algorithm,
            key_tag,
            timing,
        }
    }

    pub fn base_name(&self) -> &str {
        &self.base
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn algorithm(&self) -> SecurityAlgorithm {
        self.algorithm
    }

    pub fn key_tag(&self) -> u16 {
        self.key_tag
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    /// When the key was created.
    ///
    /// Keys without a creation time are never loaded by the key store, so
    /// the epoch only shows up for keys built by hand.
    pub fn created(&self) -> DateTime<Utc> {
        self.timing.created.unwrap_or(DateTime::UNIX_EPOCH)
    }

    /// Record that the key entered a new stage at the given time.
    pub fn stamp(&mut self, field: TimingField, at: DateTime<Utc>) {
        self.timing.set(field, Some(at));
    }

    /// The state of the key at the given time.
    ///
    /// This is the state belonging to the latest stage whose timestamp is
    /// not in the future. Stages that are scheduled for later are ignored.
    pub fn status(&self, now: DateTime<Utc>) -> Status {
        let reached = [
            TimingField::Delete,
            TimingField::Inactive,
            TimingField::Activate,
            TimingField::Publish,
        ]
        .into_iter()
        .find_map(|field| {
            let at = self.timing.get(field)?;
            (at <= now).then(|| (field.entered_state(), at))
        });

        match reached {
            Some((Some(state), since)) => Status { state, since },
            _ => Status {
                state: KeyState::Generated,
                since: self.created(),
            },
        }
    }

    /// Whether the DS record for this key has been confirmed at the parent.
    pub fn ds_confirmed(&self, now: DateTime<Utc>) -> bool {
        self.timing.ds_publish.is_some_and(|at| at <= now)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} (tag {}, {})",
            self.role, self.base, self.key_tag, self.algorithm
        )
    }
}

//------------ Helpers -------------------------------------------------------

/// The time elapsed between two moments, zero if `now` is before `since`.
pub fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}

/// The moment a duration after `since`.
pub fn after(since: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| since.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn key(timing: Timing) -> Key {
        Key::new(
            "Kexample.test.+013+01234".into(),
            "example.test.".into(),
            Role::Zsk,
            SecurityAlgorithm::ECDSAP256SHA256,
            1234,
            timing,
        )
    }

    #[test]
    fn state_follows_latest_reached_stage() {
        let mut timing = Timing::created_at(at(0));
        assert_eq!(key(timing.clone()).status(at(10)).state, KeyState::Generated);

        timing.set(TimingField::Publish, Some(at(5)));
        timing.set(TimingField::Activate, Some(at(20)));
        let status = key(timing.clone()).status(at(10));
        assert_eq!(status.state, KeyState::Published);
        assert_eq!(status.since, at(5));
        assert_eq!(status.dwell(at(10)), Duration::from_secs(5));

        let status = key(timing.clone()).status(at(20));
        assert_eq!(status.state, KeyState::Active);
        assert_eq!(status.since, at(20));

        timing.set(TimingField::Inactive, Some(at(30)));
        timing.set(TimingField::Delete, Some(at(40)));
        assert_eq!(key(timing.clone()).status(at(35)).state, KeyState::Retired);
        assert_eq!(key(timing).status(at(40)).state, KeyState::Removed);
    }

    #[test]
    fn role_from_flags() {
        assert_eq!(Role::from_flags(256), Role::Zsk);
        assert_eq!(Role::from_flags(257), Role::Ksk);
        assert_eq!(Role::from_flags(Role::Ksk.flags()), Role::Ksk);
    }

    #[test]
    fn ds_confirmation_is_not_scheduled() {
        let mut timing = Timing::created_at(at(0));
        timing.set(TimingField::DsPublish, Some(at(100)));
        let key = key(timing);
        assert!(!key.ds_confirmed(at(99)));
        assert!(key.ds_confirmed(at(100)));
    }

    #[test]
    fn elapsed_never_negative() {
        assert_eq!(elapsed(at(10), at(5)), Duration::ZERO);
        assert_eq!(after(at(0), Duration::from_secs(60)), at(60));
    }
}
