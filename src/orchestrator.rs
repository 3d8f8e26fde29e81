//! Running the state machines of a zone and applying their decisions.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::error::{ConsistencyError, LookupError, NotificationError, RollError, StorageError};
use crate::keys::generate::{KeyGenerator, KeyRequest};
use crate::keys::{Key, KeyState, KeyStore, Listing, Role, SkippedFile, TimingField};
use crate::machine::{Blocked, Plan, Reminder, StateMachine, Transition};
use crate::notify::{Event, Notifier};
use crate::parent::{DsLookup, ParentDs};
use crate::policy::{KskActivation, ZoneConfig};

//------------ RolloverReport ------------------------------------------------

/// What a run did.
#[derive(Debug, Default)]
pub struct RolloverReport {
    /// The zone apex.
    pub zone: String,

    /// Set if another run held the lock and nothing was looked at.
    pub locked_out: bool,

    /// Transitions that were applied, in order.
    pub applied: Vec<Applied>,

    /// Rollovers that are due but have to wait.
    pub blocked: Vec<(Role, Blocked)>,

    /// DS records the operator was reminded to add or remove.
    pub reminders: Vec<Reminder>,

    /// Set if the DS records at the parent were needed but could not be
    /// looked up.
    pub lookup_failure: Option<LookupError>,

    /// Transitions that failed. Other transitions were still applied.
    pub failures: Vec<(Role, RollError)>,

    /// Notifications that could not be delivered.
    pub notification_failures: Vec<NotificationError>,

    /// Files in the key directory that were ignored.
    pub skipped_files: Vec<SkippedFile>,
}

impl RolloverReport {
    fn new(zone: &str) -> Self {
        RolloverReport {
            zone: zone.into(),
            ..Default::default()
        }
    }

    /// Whether every due transition was applied.
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// A transition that was applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Applied {
    pub role: Role,
    pub transition: Transition,

    /// The key that changed, including newly created ones.
    pub key: String,
}

//------------ Orchestrator --------------------------------------------------

/// Drives the key rollovers of one zone.
pub struct Orchestrator<'a> {
    config: &'a ZoneConfig,
    store: &'a KeyStore,
    generator: &'a dyn KeyGenerator,
    notifier: &'a dyn Notifier,
    ds_lookup: Option<&'a dyn DsLookup>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        config: &'a ZoneConfig,
        store: &'a KeyStore,
        generator: &'a dyn KeyGenerator,
        notifier: &'a dyn Notifier,
    ) -> Self {
        Orchestrator {
            config,
            store,
            generator,
            notifier,
            ds_lookup: None,
        }
    }

    /// Look up DS records at the parent with the given lookup.
    ///
    /// This is only done when KSK activation follows the DNS.
    pub fn with_ds_lookup(self, ds_lookup: &'a dyn DsLookup) -> Self {
        Orchestrator {
            ds_lookup: Some(ds_lookup),
            ..self
        }
    }

    /// Find out which KSKs the parent refers to, if that matters.
    ///
    /// Returns `Ok(None)` if the parent is not watched.
    fn parent_ds(&self, keys: &[Key]) -> Result<Option<ParentDs>, LookupError> {
        if self.config.ksk.is_none() || self.config.ksk_activation != KskActivation::Dns {
            return Ok(None);
        }
        let zone = self.store.zone();
        let lookup = self
            .ds_lookup
            .ok_or_else(|| LookupError::new(zone, "no lookup available"))?;
        let records = lookup.lookup(zone)?;
        Ok(Some(ParentDs::new(self.store, keys, &records)))
    }

    /// Compute the transitions for all configured roles without applying
    /// them.
    ///
    /// A role without readable keys is not bootstrapped while files of the
    /// zone could not be read, as these may well be its keys.
    pub fn plan(
        &self,
        listing: &Listing,
        parent: Option<&ParentDs>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Plan>, RollError> {
        let mut plans = Vec::new();
        let mut inconsistencies = Vec::new();
        for role in Role::ALL {
            let Some(policy) = self.config.policy(role) else {
                debug!("no policy for {role}s, leaving them alone");
                continue;
            };
            let machine = StateMachine::new(
                role,
                policy,
                self.config.ksk_activation,
                self.config.autoremove_delay,
            )
            .with_parent(parent);
            match machine.evaluate(&listing.keys, now) {
                Ok(plan) if bootstraps(&plan) && !listing.skipped.is_empty() => {
                    inconsistencies.push(ConsistencyError::UnreadableKeys {
                        role,
                        files: listing
                            .skipped
                            .iter()
                            .map(|file| file.path.display().to_string())
                            .collect(),
                    })
                }
                Ok(plan) => plans.push(plan),
                Err(err) => inconsistencies.push(err),
            }
        }

        match inconsistencies.into_iter().next() {
            None => Ok(plans),
            Some(err) => Err(err.into()),
        }
    }

    /// Perform one run at the given time.
    ///
    /// All transitions are computed before the first one is applied. An
    /// inconsistent key set aborts the run before anything is written.
    pub fn run(&self, now: DateTime<Utc>) -> Result<RolloverReport, RollError> {
        let zone = self.store.zone();
        let mut report = RolloverReport::new(zone);

        let Some(_lock) = self.store.lock()? else {
            info!("another run is busy with {zone}, skipping");
            report.locked_out = true;
            return Ok(report);
        };

        let listing = self.store.list_keys()?;

        let parent = match self.parent_ds(&listing.keys) {
            Ok(parent) => parent,
            Err(err) => {
                warn!("{err}");
                report.lookup_failure = Some(err);
                None
            }
        };

        let plans = match self.plan(&listing, parent.as_ref(), now) {
            Ok(plans) => plans,
            Err(err) => {
                error!("{zone}: {err}");
                if let RollError::Consistency(error) = &err {
                    let event = Event::Inconsistency {
                        error: error.clone(),
                    };
                    if let Err(e) = self.notifier.notify(zone, &event) {
                        warn!("{e}");
                    }
                }
                return Err(err);
            }
        };
        report.skipped_files = listing.skipped;

        let mut keys: HashMap<String, Key> = listing
            .keys
            .into_iter()
            .map(|key| (key.base_name().to_string(), key))
            .collect();
        let mut tags: Vec<u16> = keys.values().map(Key::key_tag).collect();

        for plan in plans {
            let role = plan.role;
            report
                .blocked
                .extend(plan.blocked.into_iter().map(|blocked| (role, blocked)));

            let mut transitions = plan.transitions;
            transitions.sort_by_key(Transition::apply_rank);

            let mut activated = HashSet::new();
            for transition in transitions {
                if let Transition::Retire {
                    key,
                    successor: Some(successor),
                } = &transition
                {
                    if !activated.contains(successor) {
                        warn!("not retiring {key} because {successor} could not be activated");
                        continue;
                    }
                }

                match self.apply(role, &transition, &mut keys, &mut tags, now) {
                    Ok((key, event)) => {
                        info!("{zone}: {transition}");
                        if matches!(
                            transition,
                            Transition::Activate { .. } | Transition::Bootstrap { .. }
                        ) {
                            activated.insert(key.clone());
                        }
                        if let Some(event) = event {
                            if let Err(err) = self.notifier.notify(zone, &event) {
                                warn!("{err}");
                                report.notification_failures.push(err);
                            }
                        }
                        report.applied.push(Applied {
                            role,
                            transition,
                            key,
                        });
                    }
                    Err(err) => {
                        error!("{zone}: unable to {transition}: {err}");
                        report.failures.push((role, err));
                    }
                }
            }

            for reminder in plan.reminders {
                info!("{zone}: {reminder}");
                if let Some(event) = self.reminder_event(&reminder, &keys) {
                    if let Err(err) = self.notifier.notify(zone, &event) {
                        warn!("{err}");
                        report.notification_failures.push(err);
                    }
                }
                report.reminders.push(reminder);
            }
        }

        Ok(report)
    }

    /// The notification repeating a DS record change at the parent.
    fn reminder_event(&self, reminder: &Reminder, keys: &HashMap<String, Key>) -> Option<Event> {
        let key = keys.get(reminder.key())?;
        let (key_name, key_tag, ds) = (
            key.base_name().to_string(),
            key.key_tag(),
            self.store.ds_record(key),
        );
        Some(match reminder {
            Reminder::InsertDs { .. } => Event::DsInsertion {
                key: key_name,
                key_tag,
                ds,
            },
            Reminder::RemoveDs { .. } => Event::DsRemoval {
                key: key_name,
                key_tag,
                ds,
            },
        })
    }

    /// Apply a single transition.
    ///
    /// Returns the name of the affected key and the event to tell the
    /// operator about. The in-memory copy of a key only changes once its
    /// files were written.
    fn apply(
        &self,
        role: Role,
        transition: &Transition,
        keys: &mut HashMap<String, Key>,
        tags: &mut Vec<u16>,
        now: DateTime<Utc>,
    ) -> Result<(String, Option<Event>), RollError> {
        match transition {
            Transition::Bootstrap { .. } | Transition::Generate { .. } => {
                let bootstrap = matches!(transition, Transition::Bootstrap { .. });
                let key = self.create(role, bootstrap, tags, now)?;
                let base = key.base_name().to_string();
                tags.push(key.key_tag());

                let event = (role == Role::Ksk).then(|| {
                    let ds = self.store.ds_record(&key);
                    if bootstrap {
                        Event::KskActivated {
                            key: base.clone(),
                            key_tag: key.key_tag(),
                            ds,
                        }
                    } else {
                        Event::DsInsertion {
                            key: base.clone(),
                            key_tag: key.key_tag(),
                            ds,
                        }
                    }
                });
                keys.insert(base.clone(), key);
                Ok((base, event))
            }
            Transition::Publish { key } => {
                let key = self.stamp(keys, key, &[TimingField::Publish], now)?;
                let event = (role == Role::Ksk).then(|| Event::DsInsertion {
                    key: key.base_name().into(),
                    key_tag: key.key_tag(),
                    ds: self.store.ds_record(key),
                });
                Ok((key.base_name().into(), event))
            }
            Transition::Activate { key } => {
                let published = keys
                    .get(key)
                    .is_some_and(|k| k.status(now).state >= KeyState::Published);
                let fields: &[TimingField] = if published {
                    &[TimingField::Activate]
                } else {
                    &[TimingField::Publish, TimingField::Activate]
                };
                let key = self.stamp(keys, key, fields, now)?;
                let event = (role == Role::Ksk).then(|| Event::KskActivated {
                    key: key.base_name().into(),
                    key_tag: key.key_tag(),
                    ds: self.store.ds_record(key),
                });
                Ok((key.base_name().into(), event))
            }
            Transition::Retire { key, .. } => {
                let key = self.stamp(keys, key, &[TimingField::Inactive], now)?;
                Ok((key.base_name().into(), None))
            }
            Transition::Remove { key } => {
                let key = self.stamp(keys, key, &[TimingField::Delete], now)?;
                let event = (role == Role::Ksk).then(|| Event::DsRemoval {
                    key: key.base_name().into(),
                    key_tag: key.key_tag(),
                    ds: self.store.ds_record(key),
                });
                Ok((key.base_name().into(), event))
            }
            Transition::Purge { key } => {
                let stored = keys.get(key).ok_or_else(|| missing(self.store, key))?;
                self.store.remove_key(stored)?;
                keys.remove(key);
                Ok((key.clone(), None))
            }
            Transition::RecordDs { key } => {
                let key = self.stamp(keys, key, &[TimingField::DsPublish], now)?;
                Ok((key.base_name().into(), None))
            }
        }
    }

    /// Generate a new key and publish it, activating it as well when
    /// bootstrapping a role.
    fn create(
        &self,
        role: Role,
        bootstrap: bool,
        tags: &[u16],
        now: DateTime<Utc>,
    ) -> Result<Key, RollError> {
        let params = self
            .config
            .policy(role)
            .map(|policy| policy.algorithm)
            .unwrap_or_default();
        let request = KeyRequest {
            zone: self.store.zone(),
            role,
            params,
            dir: self.store.dir(),
            now,
            existing_tags: tags,
        };
        let base = self.generator.generate(&request)?;

        let mut key = self.store.adopt(&base)?;
        if key.role() != role {
            warn!("{base} was generated as {} instead of {role}", key.role());
        }
        key.stamp(TimingField::Publish, now);
        if bootstrap {
            key.stamp(TimingField::Activate, now);
        }
        self.store.write_key(&key)?;
        Ok(key)
    }

    /// Record new timing metadata for a key and write it.
    fn stamp<'k>(
        &self,
        keys: &'k mut HashMap<String, Key>,
        base: &str,
        fields: &[TimingField],
        now: DateTime<Utc>,
    ) -> Result<&'k Key, RollError> {
        let stored = keys.get_mut(base).ok_or_else(|| missing(self.store, base))?;
        let mut key = stored.clone();
        for field in fields {
            key.stamp(*field, now);
        }
        self.store.write_key(&key)?;
        *stored = key;
        Ok(stored)
    }
}

fn bootstraps(plan: &Plan) -> bool {
    plan.transitions
        .iter()
        .any(|t| matches!(t, Transition::Bootstrap { .. }))
}

fn missing(store: &KeyStore, base: &str) -> RollError {
    StorageError::new(store.path(base, "key"), "key disappeared during the run").into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GenerationError;
    use crate::keys::keyfile;
    use crate::keys::Timing;
    use crate::parent::DsRecord;
    use crate::policy::RolloverPolicy;
    use chrono::TimeZone;
    use std::cell::{Cell, RefCell};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Writes minimal key files with increasing key tags.
    struct CountingGenerator {
        next: Cell<u16>,
        fail: Cell<bool>,
    }

    impl KeyGenerator for CountingGenerator {
        fn generate(&self, request: &KeyRequest<'_>) -> Result<String, GenerationError> {
            if self.fail.get() {
                return Err(GenerationError::new(request.role, "out of entropy"));
            }
            let tag = self.next.get();
            self.next.set(tag + 1);
            let base = keyfile::base_name(request.zone, 13, tag);
            let public = format!(
                "{}{} IN DNSKEY {} 3 13 dGVzdA==\n",
                keyfile::public_header(
                    request.zone,
                    request.role,
                    tag,
                    &Timing::created_at(request.now)
                ),
                request.zone,
                request.role.flags()
            );
            std::fs::write(request.dir.join(format!("{base}.key")), public).unwrap();
            Ok(base)
        }
    }

    #[derive(Default)]
    struct Recorder(RefCell<Vec<Event>>);

    impl Notifier for Recorder {
        fn notify(&self, _zone: &str, event: &Event) -> Result<(), NotificationError> {
            self.0.borrow_mut().push(event.clone());
            Ok(())
        }
    }

    /// A parent publishing DS records for fixed key tags.
    #[derive(Default)]
    struct FixedParent {
        tags: RefCell<Vec<u16>>,
        fail: Cell<bool>,
    }

    impl FixedParent {
        fn set(&self, tags: &[u16]) {
            *self.tags.borrow_mut() = tags.to_vec();
        }
    }

    impl DsLookup for FixedParent {
        fn lookup(&self, zone: &str) -> Result<Vec<DsRecord>, LookupError> {
            if self.fail.get() {
                return Err(LookupError::new(zone, "timed out"));
            }
            Ok(self
                .tags
                .borrow()
                .iter()
                .map(|tag| DsRecord::new(*tag, 13, 2, &[0xab]))
                .collect())
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn config() -> ZoneConfig {
        let mut config = ZoneConfig::new("example.test");
        config.ksk = Some(RolloverPolicy::new(
            Duration::from_secs(1000),
            Duration::from_secs(100),
        ));
        config
    }

    #[test]
    fn bootstrap_notifies_ksk() {
        let dir = TempDir::new().unwrap();
        let store = KeyStore::new(dir.path(), "example.test.");
        let config = config();
        let generator = CountingGenerator {
            next: Cell::new(1),
            fail: Cell::new(false),
        };
        let notifier = Recorder::default();
        let orchestrator = Orchestrator::new(&config, &store, &generator, &notifier);

        let report = orchestrator.run(at(0)).unwrap();
        assert!(report.is_success());
        assert_eq!(report.applied.len(), 1);
        assert_eq!(
            report.applied[0].transition,
            Transition::Bootstrap { role: Role::Ksk }
        );
        assert!(matches!(
            notifier.0.borrow()[0],
            Event::KskActivated { key_tag: 1, .. }
        ));

        let keys = store.list_keys().unwrap().keys;
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].status(at(0)).state, KeyState::Active);
    }

    #[test]
    fn generation_failure_is_reported() {
        let dir = TempDir::new().unwrap();
        let store = KeyStore::new(dir.path(), "example.test.");
        let config = config();
        let generator = CountingGenerator {
            next: Cell::new(1),
            fail: Cell::new(true),
        };
        let notifier = Recorder::default();
        let orchestrator = Orchestrator::new(&config, &store, &generator, &notifier);

        let report = orchestrator.run(at(0)).unwrap();
        assert!(!report.is_success());
        assert!(matches!(
            report.failures[0],
            (Role::Ksk, RollError::Generation(_))
        ));
        assert!(store.list_keys().unwrap().keys.is_empty());

        // The next run retries.
        generator.fail.set(false);
        assert!(orchestrator.run(at(10)).unwrap().is_success());
        assert_eq!(store.list_keys().unwrap().keys.len(), 1);
    }

    #[test]
    fn failed_activation_keeps_predecessor_active() {
        let dir = TempDir::new().unwrap();
        let store = KeyStore::new(dir.path(), "example.test.");
        let mut config = config();
        config.zsk = config.ksk.clone();
        config.ksk_activation = KskActivation::Auto;
        let generator = CountingGenerator {
            next: Cell::new(1),
            fail: Cell::new(false),
        };
        let notifier = Recorder::default();
        let orchestrator = Orchestrator::new(&config, &store, &generator, &notifier);

        // KSK 1 and ZSK 2, then successors KSK 3 and ZSK 4.
        assert!(orchestrator.run(at(0)).unwrap().is_success());
        assert!(orchestrator.run(at(900)).unwrap().is_success());

        // The successor ZSK cannot be rewritten.
        let blocker = dir.path().join("Kexample.test.+013+00004.key.new");
        std::fs::create_dir(&blocker).unwrap();

        let report = orchestrator.run(at(1000)).unwrap();
        assert_eq!(report.failures.len(), 1);
        assert!(matches!(
            report.failures[0],
            (Role::Zsk, RollError::Storage(_))
        ));
        let applied: Vec<_> = report
            .applied
            .iter()
            .map(|a| (a.role, a.transition.clone()))
            .collect();
        assert_eq!(
            applied,
            [
                (
                    Role::Ksk,
                    Transition::Activate {
                        key: "Kexample.test.+013+00003".into()
                    }
                ),
                (
                    Role::Ksk,
                    Transition::Retire {
                        key: "Kexample.test.+013+00001".into(),
                        successor: Some("Kexample.test.+013+00003".into())
                    }
                ),
            ]
        );

        let states = |now: DateTime<Utc>| -> Vec<(u16, KeyState)> {
            store
                .list_keys()
                .unwrap()
                .keys
                .iter()
                .map(|key| (key.key_tag(), key.status(now).state))
                .collect()
        };
        assert_eq!(
            states(at(1000)),
            [
                (1, KeyState::Retired),
                (2, KeyState::Active),
                (3, KeyState::Active),
                (4, KeyState::Published),
            ]
        );

        // Once the file can be written, the handover completes.
        std::fs::remove_dir(&blocker).unwrap();
        let report = orchestrator.run(at(1010)).unwrap();
        assert!(report.is_success());
        assert_eq!(
            states(at(1010)),
            [
                (1, KeyState::Retired),
                (2, KeyState::Retired),
                (3, KeyState::Active),
                (4, KeyState::Active),
            ]
        );
    }

    #[test]
    fn unreadable_key_file_prevents_bootstrap() {
        let dir = TempDir::new().unwrap();
        let store = KeyStore::new(dir.path(), "example.test.");
        let config = config();
        let generator = CountingGenerator {
            next: Cell::new(1),
            fail: Cell::new(false),
        };
        let notifier = Recorder::default();
        let orchestrator = Orchestrator::new(&config, &store, &generator, &notifier);

        std::fs::write(dir.path().join("Kexample.test.+013+00007.key"), "garbage\n").unwrap();
        let err = orchestrator.run(at(0)).unwrap_err();
        assert!(matches!(
            err,
            RollError::Consistency(ConsistencyError::UnreadableKeys { role: Role::Ksk, .. })
        ));
        assert!(matches!(
            notifier.0.borrow()[0],
            Event::Inconsistency { .. }
        ));
        assert!(store.list_keys().unwrap().keys.is_empty());
    }

    #[test]
    fn dns_lookup_drives_ksk_rollover() {
        let dir = TempDir::new().unwrap();
        let store = KeyStore::new(dir.path(), "example.test.");
        let mut config = config();
        config.ksk_activation = KskActivation::Dns;
        config.autoremove_delay = Duration::from_secs(50);
        let generator = CountingGenerator {
            next: Cell::new(1),
            fail: Cell::new(false),
        };
        let notifier = Recorder::default();
        let parent = FixedParent::default();
        let orchestrator =
            Orchestrator::new(&config, &store, &generator, &notifier).with_ds_lookup(&parent);

        assert!(orchestrator.run(at(0)).unwrap().is_success());
        parent.set(&[1]);
        let report = orchestrator.run(at(10)).unwrap();
        assert!(report.reminders.is_empty());
        assert!(store.list_keys().unwrap().keys[0].ds_confirmed(at(10)));

        // The successor is announced, then reminded of on every run.
        orchestrator.run(at(900)).unwrap();
        let report = orchestrator.run(at(950)).unwrap();
        assert_eq!(
            report.reminders,
            [Reminder::InsertDs {
                key: "Kexample.test.+013+00002".into()
            }]
        );
        let insertions = notifier
            .0
            .borrow()
            .iter()
            .filter(|e| matches!(e, Event::DsInsertion { key_tag: 2, .. }))
            .count();
        assert_eq!(insertions, 2);

        // No handover without the DS record.
        let report = orchestrator.run(at(1000)).unwrap();
        assert!(report.applied.is_empty());
        assert!(matches!(report.blocked[0], (Role::Ksk, Blocked::AwaitingDs { .. })));

        parent.set(&[1, 2]);
        let report = orchestrator.run(at(1010)).unwrap();
        assert!(report
            .applied
            .iter()
            .any(|a| a.transition == Transition::Activate {
                key: "Kexample.test.+013+00002".into()
            }));

        // The files of the old KSK stay while its DS is at the parent.
        orchestrator.run(at(1110)).unwrap();
        let report = orchestrator.run(at(1160)).unwrap();
        assert!(matches!(
            report.blocked[0],
            (Role::Ksk, Blocked::DsStillAtParent { .. })
        ));
        assert_eq!(
            report.reminders,
            [Reminder::RemoveDs {
                key: "Kexample.test.+013+00001".into()
            }]
        );
        assert_eq!(store.list_keys().unwrap().keys.len(), 2);

        parent.fail.set(true);
        let report = orchestrator.run(at(1161)).unwrap();
        assert!(report.lookup_failure.is_some());
        assert_eq!(store.list_keys().unwrap().keys.len(), 2);

        parent.fail.set(false);
        parent.set(&[2]);
        let report = orchestrator.run(at(1162)).unwrap();
        assert!(report.is_success());
        assert_eq!(store.list_keys().unwrap().keys.len(), 1);
    }

    #[test]
    fn locked_out_run_does_nothing() {
        let dir = TempDir::new().unwrap();
        let store = KeyStore::new(dir.path(), "example.test.");
        let config = config();
        let generator = CountingGenerator {
            next: Cell::new(1),
            fail: Cell::new(false),
        };
        let notifier = Recorder::default();
        let orchestrator = Orchestrator::new(&config, &store, &generator, &notifier);

        let lock = store.lock().unwrap();
        let report = orchestrator.run(at(0)).unwrap();
        assert!(report.locked_out);
        assert!(report.applied.is_empty());
        drop(lock);
        assert_eq!(orchestrator.run(at(0)).unwrap().applied.len(), 1);
    }
}
