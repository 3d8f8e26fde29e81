//! The configuration of a zone.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::keys::generate::KeyParameters;
use crate::keys::Role;
use crate::parse::parse_name;
use crate::util::Owner;

/// How long a removed key is kept before its files are deleted.
pub const DEFAULT_AUTOREMOVE_DELAY: Duration = Duration::from_secs(7 * 24 * 3600);

/// The program used to deliver notifications by default.
pub const DEFAULT_SENDMAIL: &str = "/usr/sbin/sendmail";

//------------ ZoneConfig ----------------------------------------------------

/// Everything a run needs to know about a zone.
///
/// This is read from a JSON file and/or assembled from command line
/// options. Durations are given in seconds.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ZoneConfig {
    /// The zone apex.
    pub name: String,

    /// Directory holding the key files of the zone.
    #[serde(default = "default_keys_dir")]
    pub keys_dir: PathBuf,

    /// Owner given to new key files, as `user[:group]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,

    /// Roll policy for zone signing keys. ZSKs are left alone without one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zsk: Option<RolloverPolicy>,

    /// Roll policy for key signing keys. KSKs are left alone without one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ksk: Option<RolloverPolicy>,

    #[serde(default)]
    pub ksk_activation: KskActivation,

    #[serde(default)]
    pub notify: NotifyConfig,

    /// How long a removed key is kept before its files are deleted.
    #[serde(default = "default_autoremove_delay", with = "seconds")]
    pub autoremove_delay: Duration,

    #[serde(default)]
    pub keygen: KeygenConfig,
}

fn default_keys_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_autoremove_delay() -> Duration {
    DEFAULT_AUTOREMOVE_DELAY
}

impl ZoneConfig {
    /// A configuration for a zone without any roll policies.
    pub fn new(name: impl Into<String>) -> Self {
        ZoneConfig {
            name: name.into(),
            keys_dir: default_keys_dir(),
            owner: None,
            zsk: None,
            ksk: None,
            ksk_activation: KskActivation::default(),
            notify: NotifyConfig::default(),
            autoremove_delay: DEFAULT_AUTOREMOVE_DELAY,
            keygen: KeygenConfig::default(),
        }
    }

    /// Load a configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let file = File::open(path)
            .map_err(|e| format!("unable to open config file {}: {e}", path.display()))?;
        serde_json::from_reader(file)
            .map_err(|e| format!("error loading {}: {e}", path.display()).into())
    }

    /// The policy for a role, if that role is rolled.
    pub fn policy(&self, role: Role) -> Option<&RolloverPolicy> {
        match role {
            Role::Zsk => self.zsk.as_ref(),
            Role::Ksk => self.ksk.as_ref(),
        }
    }

    /// The zone apex in lower case with a trailing dot.
    pub fn apex(&self) -> Result<String, Error> {
        let name = parse_name(&self.name).map_err(|e| e.context("parsing the zone name"))?;
        Ok(format!("{}", name.fmt_with_dot()))
    }

    /// The parsed owner for new key files.
    pub fn file_owner(&self) -> Result<Option<Owner>, Error> {
        self.owner
            .as_deref()
            .map(|owner| owner.parse::<Owner>().map_err(Error::from))
            .transpose()
    }

    /// Check that the configuration can be acted upon.
    pub fn validate(&self) -> Result<(), Error> {
        self.apex()?;
        self.file_owner()?;
        for role in Role::ALL {
            if let Some(policy) = self.policy(role) {
                policy
                    .validate()
                    .map_err(|e| e.context(&format!("checking the {role} policy")))?;
            }
        }
        if self.autoremove_delay.is_zero() {
            return Err("the autoremove delay must be larger than zero".into());
        }
        if let KeygenConfig::External { command } = &self.keygen {
            if command.as_os_str().is_empty() {
                return Err("the key generation command must not be empty".into());
            }
        }
        Ok(())
    }
}

//------------ RolloverPolicy ------------------------------------------------

/// When keys of a role are replaced.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RolloverPolicy {
    /// How long a key stays active.
    #[serde(with = "seconds")]
    pub interval: Duration,

    /// How long a key is published before it becomes active and after it
    /// stopped being active.
    #[serde(with = "seconds")]
    pub margin: Duration,

    /// Parameters for new keys.
    #[serde(default)]
    pub algorithm: KeyParameters,
}

impl RolloverPolicy {
    pub fn new(interval: Duration, margin: Duration) -> Self {
        RolloverPolicy {
            interval,
            margin,
            algorithm: KeyParameters::default(),
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.interval.is_zero() {
            return Err("the rollover interval must be larger than zero".into());
        }
        if self.margin >= self.interval {
            return Err(format!(
                "the safety margin ({}s) must be smaller than the rollover interval ({}s)",
                self.margin.as_secs(),
                self.interval.as_secs()
            )
            .into());
        }
        Ok(())
    }
}

//------------ KskActivation -------------------------------------------------

/// How a new KSK learns that the parent refers to it.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum KskActivation {
    /// Activate once the safety margin has elapsed.
    Auto,

    /// Wait for `confirm-ds` in addition to the safety margin.
    #[default]
    Manual,

    /// Wait until the DS record shows up in the DNS, or for `confirm-ds`.
    ///
    /// The lookup also keeps the files of a removed KSK around for as long
    /// as the parent still has its DS record.
    Dns,
}

impl KskActivation {
    /// Whether a new KSK needs its DS record at the parent to take over.
    pub fn gates_on_ds(self) -> bool {
        self != KskActivation::Auto
    }
}

//------------ NotifyConfig --------------------------------------------------

/// Where operator notifications go.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct NotifyConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub to: Vec<String>,

    #[serde(default = "default_sendmail")]
    pub sendmail: PathBuf,
}

fn default_sendmail() -> PathBuf {
    PathBuf::from(DEFAULT_SENDMAIL)
}

impl Default for NotifyConfig {
    fn default() -> Self {
        NotifyConfig {
            from: None,
            to: Vec::new(),
            sendmail: default_sendmail(),
        }
    }
}

//------------ KeygenConfig --------------------------------------------------

/// How new keys are created.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum KeygenConfig {
    /// Use the built-in generator.
    #[default]
    Native,

    /// Run a `dnssec-keygen` compatible program.
    External { command: PathBuf },
}

//------------ seconds -------------------------------------------------------

/// (De)serialize a [`Duration`] as a number of seconds.
mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
