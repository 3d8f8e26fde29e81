use tracing::info;

use crate::env::Env;
use crate::error::{Error, Exit};
use crate::keys::{KeyState, Role};

use super::{open_store, ZoneArgs};

#[derive(Clone, Debug, PartialEq, Eq, clap::Args)]
pub struct ConfirmDs {
    #[command(flatten)]
    pub zone: ZoneArgs,

    /// The key tag of the KSK whose DS record is in the parent zone
    #[arg(value_name = "KEYTAG")]
    pub key_tag: u16,
}

impl ConfirmDs {
    pub fn execute(self, env: impl Env) -> Result<(), Exit> {
        let config = self.zone.to_config(&env)?;
        let store = open_store(&config)?;
        let Some(_lock) = store.lock()? else {
            return Err(Error::new("another run is in progress, try again later").into());
        };

        let now = env.now();
        let mut candidates = store
            .list_keys()?
            .keys
            .into_iter()
            .filter(|key| key.role() == Role::Ksk && key.key_tag() == self.key_tag);
        let Some(mut key) = candidates.next() else {
            crate::bail!("{} has no KSK with key tag {}", store.zone(), self.key_tag);
        };
        if candidates.next().is_some() {
            crate::bail!("{} has more than one KSK with key tag {}", store.zone(), self.key_tag);
        }

        let state = key.status(now).state;
        if state > KeyState::Active {
            crate::bail!("{key} is {state}, its DS record should not be in the parent zone");
        }
        if key.ds_confirmed(now) {
            writeln!(
                env.stdout(),
                "{}: DS record of {} was confirmed before",
                store.zone(),
                key.base_name()
            );
            return Ok(());
        }

        store.confirm_ds(&mut key, now)?;
        info!("confirmed DS record of {key}");
        writeln!(
            env.stdout(),
            "{}: DS record of {} confirmed",
            store.zone(),
            key.base_name()
        );
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use chrono::{DateTime, TimeZone, Utc};
    use tempfile::TempDir;

    use crate::env::fake::FakeCmd;
    use crate::keys::{KeyState, KeyStore, TimingField};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn confirmation_opens_the_gate() {
        let dir = TempDir::new().unwrap();
        let roll = FakeCmd::new([
            "keyroll",
            "roll",
            "-n",
            "example.test",
            "-k",
            "1000",
            "100",
            "--ksk-algorithm",
            "ECDSAP256SHA256",
        ])
        .cwd(&dir);
        assert_eq!(roll.now(at(0)).run().exit_code, 0);
        assert_eq!(roll.now(at(900)).run().exit_code, 0);

        let store = KeyStore::new(dir.path(), "example.test.");
        let keys = store.list_keys().unwrap().keys;
        assert_eq!(keys.len(), 2);
        let successor = keys[1].clone();
        assert!(successor.timing().get(TimingField::DsPublish).is_none());

        let res = roll.now(at(1000)).run();
        assert_eq!(res.exit_code, 0, "{}", res.stderr);
        assert!(res.stdout.contains("KSK rollover waiting"), "{}", res.stdout);
        assert!(res.stdout.contains("confirm-ds"), "{}", res.stdout);

        let confirm = FakeCmd::new(["keyroll", "confirm-ds", "-n", "example.test"]).cwd(&dir);
        let wrong = (0..=u16::MAX)
            .find(|tag| keys.iter().all(|key| key.key_tag() != *tag))
            .unwrap();
        let res = confirm.args([wrong.to_string()]).now(at(1000)).run();
        assert_eq!(res.exit_code, 1);
        assert!(res.stderr.contains("has no KSK with key tag"), "{}", res.stderr);

        let res = confirm
            .args([successor.key_tag().to_string()])
            .now(at(1000))
            .run();
        assert_eq!(res.exit_code, 0, "{}", res.stderr);
        assert!(res.stdout.ends_with("confirmed\n"));

        let res = roll.now(at(1000)).run();
        assert_eq!(res.exit_code, 0, "{}", res.stderr);
        let keys = store.list_keys().unwrap().keys;
        assert_eq!(keys[0].status(at(1000)).state, KeyState::Retired);
        assert_eq!(keys[1].status(at(1000)).state, KeyState::Active);

        let res = confirm
            .args([keys[0].key_tag().to_string()])
            .now(at(1000))
            .run();
        assert_eq!(res.exit_code, 1);
        assert!(
            res.stderr.contains("is retired, its DS record should not be"),
            "{}",
            res.stderr
        );
    }
}
