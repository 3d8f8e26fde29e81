//! Deciding which keys of a role change state.
//!
//! The state machine looks at the keys of one role at one moment and
//! computes the transitions that are due. It never touches storage; the
//! orchestrator applies what it returns. Both roles use the same machine,
//! parameterized by their own policy.
//!
//! A rollover for a role goes like this:
//!
//! ```text
//!            interval - margin      interval        interval + margin
//! current  |---- active ---------------|---- retired ----|-- removed
//! next                 |-- published --|---- active ---------------->
//! ```
//!
//! The successor is published `margin` before the active key's interval
//! ends, so it has been visible for the full margin when it takes over.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::error::ConsistencyError;
use crate::keys::{after, Key, KeyState, Role, Status, TimingField};
use crate::parent::ParentDs;
use crate::policy::{KskActivation, RolloverPolicy};

//------------ Transition ----------------------------------------------------

/// A change to the keys of a role.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transition {
    /// Create the first key of a role, published and active at once.
    Bootstrap { role: Role },

    /// Create a successor for the active key and publish it.
    Generate { role: Role },

    /// Publish a key that exists but is not in the zone yet.
    Publish { key: String },

    /// Start signing with a key.
    Activate { key: String },

    /// Stop signing with a key but keep it published.
    ///
    /// The successor, if any, is activated in the same run. Its activation
    /// must have succeeded before this transition is applied.
    Retire {
        key: String,
        successor: Option<String>,
    },

    /// Withdraw a key from the zone.
    Remove { key: String },

    /// Delete the files of a key that was removed long enough ago.
    Purge { key: String },

    /// Note that the DS record of a KSK was seen at the parent.
    RecordDs { key: String },
}

impl Transition {
    /// The position of the transition when applying a plan.
    ///
    /// New keys are written before any key is activated, and successors
    /// are activated before their predecessors are retired. This way, no
    /// point between two writes leaves a role without an active key.
    pub fn apply_rank(&self) -> u8 {
        match self {
            Transition::Purge { .. } | Transition::Remove { .. } => 0,
            Transition::Bootstrap { .. }
            | Transition::Generate { .. }
            | Transition::Publish { .. }
            | Transition::RecordDs { .. } => 1,
            Transition::Activate { .. } => 2,
            Transition::Retire { .. } => 3,
        }
    }

    /// The key the transition applies to, if it already exists.
    pub fn key(&self) -> Option<&str> {
        match self {
            Transition::Bootstrap { .. } | Transition::Generate { .. } => None,
            Transition::Publish { key }
            | Transition::Activate { key }
            | Transition::Retire { key, .. }
            | Transition::Remove { key }
            | Transition::Purge { key }
            | Transition::RecordDs { key } => Some(key),
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transition::Bootstrap { role } => write!(f, "create first {role}"),
            Transition::Generate { role } => write!(f, "generate successor {role}"),
            Transition::Publish { key } => write!(f, "publish {key}"),
            Transition::Activate { key } => write!(f, "activate {key}"),
            Transition::Retire { key, .. } => write!(f, "retire {key}"),
            Transition::Remove { key } => write!(f, "remove {key}"),
            Transition::Purge { key } => write!(f, "delete files of {key}"),
            Transition::RecordDs { key } => write!(f, "record DS of {key} at the parent"),
        }
    }
}

//------------ Blocked -------------------------------------------------------

/// A rollover that is due but cannot happen yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Blocked {
    /// The successor KSK waits for its DS record to be at the parent.
    AwaitingDs { key: String },

    /// The successor has not been published for the full margin.
    SuccessorNotReady { key: String, ready_at: DateTime<Utc> },

    /// The files of a removed KSK are kept while the parent may still
    /// refer to it.
    DsStillAtParent { key: String },
}

impl fmt::Display for Blocked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Blocked::AwaitingDs { key } => write!(
                f,
                "{key} waits for its DS record at the parent (use 'confirm-ds' once it is there)"
            ),
            Blocked::SuccessorNotReady { key, ready_at } => {
                write!(f, "{key} cannot take over before {ready_at}")
            }
            Blocked::DsStillAtParent { key } => {
                write!(f, "{key} is kept until its DS record is gone from the parent")
            }
        }
    }
}

//------------ Reminder ------------------------------------------------------

/// A DS record at the parent that does not match the keys of the zone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reminder {
    /// A published or active KSK has no DS record at the parent.
    InsertDs { key: String },

    /// A removed KSK still has a DS record at the parent.
    RemoveDs { key: String },
}

impl Reminder {
    pub fn key(&self) -> &str {
        match self {
            Reminder::InsertDs { key } | Reminder::RemoveDs { key } => key,
        }
    }
}

impl fmt::Display for Reminder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reminder::InsertDs { key } => write!(f, "DS record of {key} is missing at the parent"),
            Reminder::RemoveDs { key } => write!(f, "DS record of {key} is still at the parent"),
        }
    }
}

//------------ Plan ----------------------------------------------------------

/// The transitions due for one role.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Plan {
    pub role: Role,

    /// Transitions in the order they were decided.
    pub transitions: Vec<Transition>,

    pub blocked: Vec<Blocked>,

    /// DS records the operator has to add or remove at the parent.
    pub reminders: Vec<Reminder>,
}

impl Plan {
    fn new(role: Role) -> Self {
        Plan {
            role,
            transitions: Vec::new(),
            blocked: Vec::new(),
            reminders: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }

    fn push(&mut self, transition: Transition) {
        self.transitions.push(transition);
    }

    fn touches(&self, key: &str) -> bool {
        self.transitions.iter().any(|t| t.key() == Some(key))
    }
}

//------------ StateMachine --------------------------------------------------

/// The rules for the keys of one role.
#[derive(Clone, Debug)]
pub struct StateMachine<'a> {
    role: Role,
    policy: &'a RolloverPolicy,
    activation: KskActivation,
    autoremove_delay: Duration,

    /// The DS records found at the parent, if they were looked up.
    parent: Option<&'a ParentDs>,
}

/// A key together with its state at the time of evaluation.
type Entry<'k> = (&'k Key, Status);

impl<'a> StateMachine<'a> {
    pub fn new(
        role: Role,
        policy: &'a RolloverPolicy,
        activation: KskActivation,
        autoremove_delay: Duration,
    ) -> Self {
        StateMachine {
            role,
            policy,
            activation,
            autoremove_delay,
            parent: None,
        }
    }

    /// Use what the parent publishes for the zone.
    pub fn with_parent(self, parent: Option<&'a ParentDs>) -> Self {
        StateMachine { parent, ..self }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether a published successor must have a DS record at the parent
    /// before it can become active.
    pub fn needs_ds(&self) -> bool {
        self.role == Role::Ksk && self.activation.gates_on_ds()
    }

    /// Whether the DS records at the parent are watched.
    fn watches_parent(&self) -> bool {
        self.role == Role::Ksk && self.activation == KskActivation::Dns
    }

    /// Whether the DS record of a key is known to be at the parent.
    fn ds_ready(&self, key: &Key, now: DateTime<Utc>) -> bool {
        key.ds_confirmed(now) || self.parent.is_some_and(|parent| parent.has(key))
    }

    /// Whether the parent may still have the DS record of a key.
    ///
    /// Without a successful lookup, this has to be assumed.
    fn ds_maybe_at_parent(&self, key: &Key) -> bool {
        self.watches_parent() && self.parent.map_or(true, |parent| parent.has(key))
    }

    /// Compute the transitions that are due at `now`.
    ///
    /// Keys of other roles are ignored. All transitions are computed from
    /// this single snapshot; nothing is applied.
    pub fn evaluate(&self, keys: &[Key], now: DateTime<Utc>) -> Result<Plan, ConsistencyError> {
        let mut entries: Vec<Entry> = keys
            .iter()
            .filter(|key| key.role() == self.role)
            .map(|key| (key, key.status(now)))
            .collect();
        entries.sort_by(|(a, _), (b, _)| {
            (a.created(), a.base_name()).cmp(&(b.created(), b.base_name()))
        });

        let mut plan = Plan::new(self.role);

        // Old keys go first.
        for (key, status) in &entries {
            let dwell = status.dwell(now);
            match status.state {
                KeyState::Removed if dwell >= self.autoremove_delay => {
                    if self.ds_maybe_at_parent(key) {
                        plan.blocked.push(Blocked::DsStillAtParent {
                            key: key.base_name().into(),
                        });
                    } else {
                        plan.push(Transition::Purge {
                            key: key.base_name().into(),
                        })
                    }
                }
                KeyState::Retired if dwell >= self.policy.margin => plan.push(Transition::Remove {
                    key: key.base_name().into(),
                }),
                _ => {}
            }
        }

        if let Some(parent) = self.parent.filter(|_| self.watches_parent()) {
            self.compare_with_parent(&entries, parent, &mut plan);
        }

        let current = self.current(&entries, &mut plan)?;
        let published: Vec<&Entry> = in_state(&entries, KeyState::Published);
        let generated: Vec<&Entry> = in_state(&entries, KeyState::Generated);

        match current {
            Some((key, status)) => {
                let dwell = status.dwell(now);
                let mut handed_over = false;
                if dwell >= self.policy.interval {
                    if let Some(next) = self.ready_successor(&published, now, &mut plan) {
                        plan.push(Transition::Activate { key: next.clone() });
                        plan.push(Transition::Retire {
                            key: key.base_name().into(),
                            successor: Some(next),
                        });
                        handed_over = true;
                    }
                }

                let remaining = self.policy.interval.saturating_sub(dwell);
                if !handed_over
                    && published.is_empty()
                    && generated.is_empty()
                    && remaining <= self.policy.margin
                {
                    plan.push(Transition::Generate { role: self.role });
                }
            }
            None => {
                if let Some((key, _)) = published.first().or(generated.first()) {
                    if self.needs_ds() && !self.ds_ready(key, now) {
                        return Err(ConsistencyError::UnconfirmedKsk {
                            key: key.base_name().into(),
                        });
                    }
                    warn!(
                        "no active {}, activating {} without waiting for the safety margin",
                        self.role,
                        key.base_name()
                    );
                    plan.push(Transition::Activate {
                        key: key.base_name().into(),
                    });
                } else {
                    plan.push(Transition::Bootstrap { role: self.role });
                }
            }
        }

        // A generated key only waits for being written.
        for (key, _) in generated {
            if !plan.touches(key.base_name()) {
                plan.push(Transition::Publish {
                    key: key.base_name().into(),
                });
            }
        }

        self.check(&entries, &plan)?;
        Ok(plan)
    }

    /// Determine the key that is active for the rest of the evaluation.
    ///
    /// Two active keys are only accepted when a handover was interrupted
    /// after the successor was activated: the newer key must have been
    /// activated when the older one was due. The older key is then retired.
    fn current<'k>(
        &self,
        entries: &[Entry<'k>],
        plan: &mut Plan,
    ) -> Result<Option<Entry<'k>>, ConsistencyError> {
        let mut active: Vec<Entry<'k>> = entries
            .iter()
            .filter(|(_, status)| status.state == KeyState::Active)
            .copied()
            .collect();
        active.sort_by_key(|(key, status)| (status.since, key.created()));

        match active.as_slice() {
            [] => Ok(None),
            [one] => Ok(Some(*one)),
            [(older, older_status), newer]
                if newer.1.since >= after(older_status.since, self.policy.interval) =>
            {
                warn!(
                    "resuming interrupted rollover from {} to {}",
                    older.base_name(),
                    newer.0.base_name()
                );
                plan.push(Transition::Retire {
                    key: older.base_name().into(),
                    successor: None,
                });
                Ok(Some(*newer))
            }
            _ => Err(ConsistencyError::DuplicateActive {
                role: self.role,
                keys: active
                    .iter()
                    .map(|(key, _)| key.base_name().to_string())
                    .collect(),
            }),
        }
    }

    /// The earliest published key that may become active now.
    ///
    /// Records why the handover is blocked if there is none.
    fn ready_successor(
        &self,
        published: &[&Entry],
        now: DateTime<Utc>,
        plan: &mut Plan,
    ) -> Option<String> {
        let mut blocked = None;
        for (key, status) in published {
            if status.dwell(now) < self.policy.margin {
                blocked.get_or_insert(Blocked::SuccessorNotReady {
                    key: key.base_name().into(),
                    ready_at: after(status.since, self.policy.margin),
                });
            } else if self.needs_ds() && !self.ds_ready(key, now) {
                blocked.get_or_insert(Blocked::AwaitingDs {
                    key: key.base_name().into(),
                });
            } else {
                return Some(key.base_name().into());
            }
        }
        plan.blocked.extend(blocked);
        None
    }

    /// Record DS records newly seen at the parent and collect the ones the
    /// operator still has to take care of.
    fn compare_with_parent(&self, entries: &[Entry], parent: &ParentDs, plan: &mut Plan) {
        for (key, status) in entries {
            let base = key.base_name();
            match (status.state, parent.has(key)) {
                (KeyState::Published | KeyState::Active, true) => {
                    if key.timing().get(TimingField::DsPublish).is_none() {
                        plan.push(Transition::RecordDs { key: base.into() });
                    }
                }
                (KeyState::Published | KeyState::Active, false) => {
                    plan.reminders.push(Reminder::InsertDs { key: base.into() });
                }
                (KeyState::Removed, true) => {
                    plan.reminders.push(Reminder::RemoveDs { key: base.into() });
                }
                _ => {}
            }
        }
    }

    /// Make sure the plan leaves the role with exactly one active key.
    fn check(&self, entries: &[Entry], plan: &Plan) -> Result<(), ConsistencyError> {
        let mut active = entries
            .iter()
            .filter(|(_, status)| status.state == KeyState::Active)
            .count();
        for transition in &plan.transitions {
            match transition {
                Transition::Bootstrap { .. } | Transition::Activate { .. } => active += 1,
                Transition::Retire { .. } => active = active.saturating_sub(1),
                _ => {}
            }
        }
        if active == 0 {
            return Err(ConsistencyError::NoActiveKey { role: self.role });
        }
        if active > 1 {
            return Err(ConsistencyError::DuplicateActive {
                role: self.role,
                keys: plan
                    .transitions
                    .iter()
                    .filter_map(|t| t.key().map(String::from))
                    .collect(),
            });
        }
        Ok(())
    }
}

fn in_state<'e, 'k>(entries: &'e [Entry<'k>], state: KeyState) -> Vec<&'e Entry<'k>> {
    entries
        .iter()
        .filter(|(_, status)| status.state == state)
        .collect()
}
