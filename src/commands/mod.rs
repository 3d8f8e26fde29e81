//! The commands of _keyroll_.
pub mod confirm_ds;
pub mod roll;
pub mod status;

use std::path::PathBuf;
use std::time::Duration;

use domain::base::Name;
use tracing::debug;

use crate::env::Env;
use crate::error::{Error, Exit};
use crate::keys::generate::KeyParameters;
use crate::keys::KeyStore;
use crate::parse::{parse_duration, parse_name};
use crate::policy::{KeygenConfig, KskActivation, RolloverPolicy, ZoneConfig};

#[derive(Clone, Debug, clap::Subcommand)]
pub enum Command {
    /// Roll the keys of a zone that are due
    ///
    /// Every key whose time has come is moved to its next state: successors
    /// are generated and published ahead of time, take over once the old key
    /// reached the end of its rollover interval, and old keys are withdrawn
    /// after the safety margin. Only the roles given a policy with '-z' or
    /// '-k' (or in the config file) are rolled.
    ///
    /// This is meant to be run periodically, e.g. from cron. A run that
    /// finds nothing to do changes nothing.
    #[command(name = "roll", verbatim_doc_comment)]
    Roll(self::roll::Roll),

    /// Show the state of the keys of a zone
    #[command(name = "status")]
    Status(self::status::Status),

    /// Record that the DS record of a KSK is published in the parent zone
    ///
    /// With manual KSK activation, a new KSK only takes over once this was
    /// done for it.
    #[command(name = "confirm-ds")]
    ConfirmDs(self::confirm_ds::ConfirmDs),
}

impl Command {
    pub fn execute(self, env: impl Env) -> Result<(), Exit> {
        match self {
            Self::Roll(roll) => roll.execute(env),
            Self::Status(status) => status.execute(env),
            Self::ConfirmDs(confirm) => confirm.execute(env),
        }
    }
}

//------------ ZoneArgs ------------------------------------------------------

/// Options selecting a zone and the policy for its keys.
///
/// Options override the values of a config file.
#[derive(Clone, Debug, Default, PartialEq, Eq, clap::Args)]
pub struct ZoneArgs {
    /// The zone whose keys to manage
    #[arg(short = 'n', long = "zone", value_name = "NAME", value_parser = parse_name)]
    pub zone: Option<Name<Vec<u8>>>,

    /// The directory holding the key files [default: .]
    #[arg(short = 'd', long = "directory", value_name = "DIR")]
    pub directory: Option<PathBuf>,

    /// A JSON file with the configuration of the zone
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Roll ZSKs with the given rollover interval and safety margin
    ///
    /// Durations are seconds or spans like '30d' or '5d 12h'.
    #[arg(
        short = 'z',
        long = "zsk",
        num_args = 2,
        value_names = ["INTERVAL", "MARGIN"],
        value_parser = parse_duration,
    )]
    pub zsk: Option<Vec<Duration>>,

    /// Roll KSKs with the given rollover interval and safety margin
    #[arg(
        short = 'k',
        long = "ksk",
        num_args = 2,
        value_names = ["INTERVAL", "MARGIN"],
        value_parser = parse_duration,
    )]
    pub ksk: Option<Vec<Duration>>,

    /// Parameters for new ZSKs, e.g. 'RSASHA256:2048' or 'ECDSAP256SHA256'
    #[arg(long = "zsk-algorithm", value_name = "ALGORITHM")]
    pub zsk_algorithm: Option<KeyParameters>,

    /// Parameters for new KSKs
    #[arg(long = "ksk-algorithm", value_name = "ALGORITHM")]
    pub ksk_algorithm: Option<KeyParameters>,

    /// How new KSKs wait for their DS record at the parent: auto, manual or dns
    #[arg(long = "ksk-activation", value_name = "MODE", value_enum)]
    pub ksk_activation: Option<KskActivation>,

    /// How long removed keys are kept before their files are deleted
    #[arg(long = "autoremove-delay", value_name = "DURATION", value_parser = parse_duration)]
    pub autoremove_delay: Option<Duration>,

    /// Sender address of notification mails
    #[arg(long = "mail-from", value_name = "ADDR")]
    pub mail_from: Option<String>,

    /// Send notification mails to this address
    #[arg(short = 'e', long = "notify", value_name = "ADDR")]
    pub notify: Vec<String>,

    /// Owner of new key files as USER[:GROUP]
    #[arg(short = 'o', long = "owner", value_name = "OWNER")]
    pub owner: Option<String>,

    /// Generate keys by running this dnssec-keygen compatible program
    #[arg(long = "keygen-command", value_name = "PATH")]
    pub keygen_command: Option<PathBuf>,
}

impl ZoneArgs {
    /// Assemble the configuration of the zone.
    pub fn to_config(&self, env: impl Env) -> Result<ZoneConfig, Error> {
        let mut config = match &self.config {
            Some(path) => ZoneConfig::load(&env.in_cwd(path))?,
            None => match &self.zone {
                Some(zone) => ZoneConfig::new(zone.to_string()),
                None => return Err("no zone given, use '-n' or a config file".into()),
            },
        };

        if let Some(zone) = &self.zone {
            config.name = zone.to_string();
        }
        if let Some(dir) = &self.directory {
            config.keys_dir = dir.clone();
        }
        config.keys_dir = env.in_cwd(&config.keys_dir).into_owned();

        set_policy(&mut config.zsk, self.zsk.as_deref(), self.zsk_algorithm);
        set_policy(&mut config.ksk, self.ksk.as_deref(), self.ksk_algorithm);

        if let Some(activation) = self.ksk_activation {
            config.ksk_activation = activation;
        }
        if let Some(delay) = self.autoremove_delay {
            config.autoremove_delay = delay;
        }
        if let Some(from) = &self.mail_from {
            config.notify.from = Some(from.clone());
        }
        if !self.notify.is_empty() {
            config.notify.to = self.notify.clone();
        }
        if let Some(owner) = &self.owner {
            config.owner = Some(owner.clone());
        }
        if let Some(command) = &self.keygen_command {
            config.keygen = KeygenConfig::External {
                command: command.clone(),
            };
        }

        config.validate()?;
        Ok(config)
    }
}

/// Apply policy options to the policy of a role.
///
/// Algorithm options without a policy are ignored.
fn set_policy(
    policy: &mut Option<RolloverPolicy>,
    times: Option<&[Duration]>,
    algorithm: Option<KeyParameters>,
) {
    if let Some(&[interval, margin]) = times {
        let previous = policy.as_ref().map(|p| p.algorithm).unwrap_or_default();
        *policy = Some(RolloverPolicy {
            interval,
            margin,
            algorithm: previous,
        });
    }
    if let (Some(policy), Some(algorithm)) = (policy.as_mut(), algorithm) {
        policy.algorithm = algorithm;
    }
}

/// Open the key directory of a zone.
pub fn open_store(config: &ZoneConfig) -> Result<KeyStore, Error> {
    let apex = config.apex()?;
    if !config.keys_dir.is_dir() {
        return Err(format!(
            "key directory {} does not exist",
            config.keys_dir.display()
        )
        .into());
    }
    debug!("keys of {apex} are in {}", config.keys_dir.display());
    Ok(KeyStore::new(&config.keys_dir, &apex).with_owner(config.file_owner()?))
}

#[cfg(test)]
mod test {
    use std::path::PathBuf;
    use std::time::Duration;

    use crate::commands::Command;
    use crate::env::fake::FakeCmd;
    use crate::keys::generate::KeyParameters;
    use crate::policy::{KeygenConfig, KskActivation};

    use super::ZoneArgs;

    #[track_caller]
    fn parse(args: FakeCmd) -> ZoneArgs {
        let res = args.parse();
        let Command::Status(x) = res.unwrap().command else {
            panic!("Not a Status!");
        };
        x.zone
    }

    #[test]
    fn parse_zone_args() {
        let cmd = FakeCmd::new(["keyroll", "status"]);

        let res = parse(cmd.args(["-n", "Example.COM"]));
        assert_eq!(res.zone.unwrap().to_string(), "example.com");

        let res = parse(cmd.args(["-z", "30d", "5d", "--ksk", "31536000", "604800"]));
        assert_eq!(
            res.zsk,
            Some(vec![
                Duration::from_secs(30 * 86400),
                Duration::from_secs(5 * 86400)
            ])
        );
        assert_eq!(
            res.ksk,
            Some(vec![
                Duration::from_secs(31536000),
                Duration::from_secs(604800)
            ])
        );

        let res = parse(cmd.args([
            "-e",
            "a@example.com",
            "--notify",
            "b@example.com",
            "--ksk-activation",
            "auto",
            "--zsk-algorithm",
            "ecdsap256sha256",
        ]));
        assert_eq!(res.notify, ["a@example.com", "b@example.com"]);
        assert_eq!(res.ksk_activation, Some(KskActivation::Auto));
        assert_eq!(res.zsk_algorithm, Some(KeyParameters::EcdsaP256Sha256));

        let res = parse(cmd.args(["--ksk-activation", "dns"]));
        assert_eq!(res.ksk_activation, Some(KskActivation::Dns));

        cmd.args(["-z", "30d"]).parse().unwrap_err();
        cmd.args(["-z", "30d", "never"]).parse().unwrap_err();
        cmd.args(["--ksk-activation", "sometimes"])
            .parse()
            .unwrap_err();
    }

    #[test]
    fn options_override_config_file() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("zone.json"),
            r#"{
                "name": "example.com",
                "keys_dir": "keys",
                "zsk": { "interval": 1000, "margin": 100, "algorithm": "ED25519" },
                "notify": { "to": ["ops@example.com"] }
            }"#,
        )
        .unwrap();

        let args = ZoneArgs {
            config: Some(PathBuf::from("zone.json")),
            zsk: Some(vec![Duration::from_secs(2000), Duration::from_secs(200)]),
            keygen_command: Some(PathBuf::from("/usr/sbin/dnssec-keygen")),
            ..Default::default()
        };
        let env = crate::env::fake::FakeEnv {
            cmd: FakeCmd::new(["keyroll"]).cwd(&dir),
            stdout: Default::default(),
            stderr: Default::default(),
        };
        let config = args.to_config(&env).unwrap();
        assert_eq!(config.keys_dir, dir.path().join("keys"));
        let zsk = config.zsk.unwrap();
        assert_eq!(zsk.interval, Duration::from_secs(2000));
        assert_eq!(zsk.algorithm, KeyParameters::Ed25519);
        assert_eq!(config.notify.to, ["ops@example.com"]);
        assert!(matches!(config.keygen, KeygenConfig::External { .. }));

        let bad = ZoneArgs {
            zone: Some(crate::parse::parse_name("example.com").unwrap()),
            ksk: Some(vec![Duration::from_secs(100), Duration::from_secs(100)]),
            ..Default::default()
        };
        assert!(bad.to_config(&env).is_err());
        assert!(ZoneArgs::default().to_config(&env).is_err());
    }
}
