//! Telling the operator about things they need to do.

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use tracing::{debug, warn};

use crate::error::{ConsistencyError, NotificationError};
use crate::policy::NotifyConfig;

//------------ Event ---------------------------------------------------------

/// Something that needs the attention of the operator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// A new KSK was published and its DS record must go to the parent.
    DsInsertion {
        key: String,
        key_tag: u16,
        ds: Option<String>,
    },

    /// A KSK became active; the parent must reference it from now on.
    KskActivated {
        key: String,
        key_tag: u16,
        ds: Option<String>,
    },

    /// A KSK was withdrawn and its DS record must leave the parent.
    DsRemoval {
        key: String,
        key_tag: u16,
        ds: Option<String>,
    },

    /// The keys of the zone are in a state that needs manual repair.
    Inconsistency { error: ConsistencyError },
}

impl Event {
    pub fn subject(&self) -> &'static str {
        match self {
            Event::DsInsertion { .. } => "DS record insertion required",
            Event::KskActivated { .. } => "DNSSEC KSK activated",
            Event::DsRemoval { .. } => "DS record removal required",
            Event::Inconsistency { .. } => "DNSSEC key state inconsistent",
        }
    }

    pub fn body(&self, zone: &str) -> String {
        match self {
            Event::DsInsertion { key, key_tag, ds } => format!(
                "A new KSK {key} (key tag {key_tag}) was published for {zone}.\n\
                 The parent zone needs its DS record before the key can take over.\n{}",
                ds_section("Please insert the following DS record into the parent zone:", ds)
            ),
            Event::KskActivated { key, key_tag, ds } => format!(
                "The KSK {key} (key tag {key_tag}) of {zone} is now active.\n{}",
                ds_section("The parent zone must contain the following DS record:", ds)
            ),
            Event::DsRemoval { key, key_tag, ds } => format!(
                "The KSK {key} (key tag {key_tag}) was removed from {zone}.\n{}",
                ds_section(
                    "Please remove the following DS record from the parent zone:",
                    ds
                )
            ),
            Event::Inconsistency { error } => format!(
                "No keys of {zone} were changed: {error}.\n\
                 The key directory needs manual repair.\n"
            ),
        }
    }
}

fn ds_section(intro: &str, ds: &Option<String>) -> String {
    match ds {
        Some(ds) => format!("\n{intro}\n\n{ds}\n"),
        None => "\nNo DS record file was found for this key.\n".into(),
    }
}

//------------ Notifier ------------------------------------------------------

/// Delivers operator notifications.
pub trait Notifier {
    fn notify(&self, zone: &str, event: &Event) -> Result<(), NotificationError>;
}

/// Create the notifier for a configuration.
///
/// Without recipients, notifications only end up in the log.
pub fn from_config(config: &NotifyConfig) -> Box<dyn Notifier> {
    if config.to.is_empty() {
        Box::new(LogNotifier)
    } else {
        Box::new(SendmailNotifier {
            from: config.from.clone(),
            to: config.to.clone(),
            sendmail: config.sendmail.clone(),
        })
    }
}

//------------ LogNotifier ---------------------------------------------------

/// Writes notifications to the log.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, zone: &str, event: &Event) -> Result<(), NotificationError> {
        warn!("{zone}: {}\n{}", event.subject(), event.body(zone).trim_end());
        Ok(())
    }
}

//------------ SendmailNotifier ----------------------------------------------

/// Sends notifications as mail through `sendmail -t -oi`.
#[derive(Clone, Debug)]
pub struct SendmailNotifier {
    pub from: Option<String>,
    pub to: Vec<String>,
    pub sendmail: PathBuf,
}

impl SendmailNotifier {
    /// The complete message, headers included.
    pub fn message(&self, zone: &str, event: &Event) -> String {
        let mut msg = String::new();
        if let Some(from) = &self.from {
            msg.push_str(&format!("From: {from}\n"));
        }
        msg.push_str(&format!("To: {}\n", self.to.join(", ")));
        msg.push_str(&format!("Subject: [{zone}] {}\n", event.subject()));
        msg.push_str("MIME-Version: 1.0\n");
        msg.push_str("Content-Type: text/plain; charset=utf-8\n");
        msg.push_str("Content-Transfer-Encoding: 8bit\n");
        msg.push('\n');
        msg.push_str(&event.body(zone));
        msg
    }
}

impl Notifier for SendmailNotifier {
    fn notify(&self, zone: &str, event: &Event) -> Result<(), NotificationError> {
        let failed = |msg: String| NotificationError::new(event.subject(), msg);

        let mut child = Command::new(&self.sendmail)
            .args(["-t", "-oi"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| failed(format!("unable to run {}: {e}", self.sendmail.display())))?;

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(self.message(zone, event).as_bytes()) {
                drop(stdin);
                if let Err(err) = child.kill().and_then(|_| child.wait()) {
                    debug!("unable to reap sendmail: {err}");
                }
                return Err(failed(format!("unable to pass message to sendmail: {e}")));
            }
        }

        let output = child
            .wait_with_output()
            .map_err(|e| failed(format!("sendmail did not finish: {e}")))?;
        if !output.status.success() {
            return Err(failed(format!(
                "sendmail failed with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        debug!("sent '{}' to {}", event.subject(), self.to.join(", "));
        Ok(())
    }
}
