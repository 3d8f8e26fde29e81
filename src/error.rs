use std::fmt;
use std::path::{Path, PathBuf};
use std::{error, io};

use crate::env::Env;
use crate::keys::Role;

//------------ Error ---------------------------------------------------------

/// A program error.
///
/// Such errors are highly likely to halt the program.
pub struct Error(Box<Information>);

/// Information about an error.
struct Information {
    /// The primary error message.
    primary: PrimaryError,

    /// Layers of context to the error.
    ///
    /// Ordered from innermost to outermost.
    context: Vec<Box<str>>,
}

#[derive(Debug)]
enum PrimaryError {
    Clap(clap::Error),
    Roll(RollError),
    Other(Box<str>),
}

impl fmt::Display for PrimaryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimaryError::Clap(e) => e.fmt(f),
            PrimaryError::Roll(e) => e.fmt(f),
            PrimaryError::Other(e) => e.fmt(f),
        }
    }
}

//--- Interaction

impl Error {
    /// Construct a new error from a string.
    pub fn new(error: &str) -> Self {
        Self(Box::new(Information {
            primary: PrimaryError::Other(error.into()),
            context: Vec::new(),
        }))
    }

    /// Add context to this error.
    pub fn context(mut self, context: &str) -> Self {
        self.0.context.push(context.into());
        self
    }

    /// Pretty-print this error.
    pub fn pretty_print(&self, env: impl Env) {
        let mut err = env.stderr();

        let info = match &self.0.primary {
            // Clap errors are already styled. We don't want our own pretty
            // styling around that and context does not make sense for command
            // line arguments either. So we just print the styled string that
            // clap produces and return.
            PrimaryError::Clap(e) => {
                writeln!(err, "{}", e.render().ansi());
                return;
            }
            other => other,
        };

        let prog = env
            .args_os()
            .next()
            .map(|arg| arg.to_string_lossy().into_owned())
            .unwrap_or_else(|| "keyroll".into());
        if err.is_terminal() {
            writeln!(err, "[{prog}] \x1B[31mERROR:\x1B[0m {info}");
        } else {
            writeln!(err, "[{prog}] ERROR: {info}");
        }
        for context in &self.0.context {
            writeln!(err, "\n... while {context}");
        }
    }

    pub fn exit_code(&self) -> u8 {
        // Clap uses the exit code 2 and we want to keep that, but we aren't
        // actually returning the clap error, so we replicate that behaviour
        // here.
        if let PrimaryError::Clap(e) = &self.0.primary {
            e.exit_code() as u8
        } else {
            1
        }
    }
}

//--- Conversions for '?'

impl From<&str> for Error {
    fn from(error: &str) -> Self {
        Self::new(error)
    }
}

impl From<String> for Error {
    fn from(error: String) -> Self {
        Self::new(&error)
    }
}

impl From<fmt::Error> for Error {
    fn from(error: fmt::Error) -> Self {
        Self::new(&error.to_string())
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Self::new(&error.to_string())
    }
}

impl From<clap::Error> for Error {
    fn from(value: clap::Error) -> Self {
        Self(Box::new(Information {
            primary: PrimaryError::Clap(value),
            context: Vec::new(),
        }))
    }
}

impl From<RollError> for Error {
    fn from(value: RollError) -> Self {
        Self(Box::new(Information {
            primary: PrimaryError::Roll(value),
            context: Vec::new(),
        }))
    }
}

impl From<StorageError> for Error {
    fn from(value: StorageError) -> Self {
        RollError::from(value).into()
    }
}

//--- Display, Debug

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.primary.fmt(f)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Error")
            .field("primary", &self.0.primary)
            .field("context", &self.0.context)
            .finish()
    }
}

//--- Error

impl error::Error for Error {}

//------------ Exit ----------------------------------------------------------

/// The reason a command stopped.
///
/// Some conditions end a command early without being a failure, such as
/// another run already holding the lock on a key directory.
#[derive(Debug)]
pub enum Exit {
    Success,
    Error(Error),
}

impl From<Error> for Exit {
    fn from(value: Error) -> Self {
        Exit::Error(value)
    }
}

impl From<RollError> for Exit {
    fn from(value: RollError) -> Self {
        Exit::Error(value.into())
    }
}

impl From<StorageError> for Exit {
    fn from(value: StorageError) -> Self {
        Exit::Error(value.into())
    }
}

//------------ RollError -----------------------------------------------------

/// A failure while managing the keys of a zone.
///
/// How far such a failure reaches depends on its kind: storage failures
/// affect a single key, generation failures the pending transition of one
/// role, notification failures nothing at all. Consistency failures stop
/// the whole run before anything is changed.
#[derive(Debug)]
pub enum RollError {
    Storage(StorageError),
    Generation(GenerationError),
    Notification(NotificationError),
    Consistency(ConsistencyError),
}

impl fmt::Display for RollError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RollError::Storage(e) => e.fmt(f),
            RollError::Generation(e) => e.fmt(f),
            RollError::Notification(e) => e.fmt(f),
            RollError::Consistency(e) => e.fmt(f),
        }
    }
}

impl error::Error for RollError {}

impl From<StorageError> for RollError {
    fn from(value: StorageError) -> Self {
        RollError::Storage(value)
    }
}

impl From<GenerationError> for RollError {
    fn from(value: GenerationError) -> Self {
        RollError::Generation(value)
    }
}

impl From<NotificationError> for RollError {
    fn from(value: NotificationError) -> Self {
        RollError::Notification(value)
    }
}

impl From<ConsistencyError> for RollError {
    fn from(value: ConsistencyError) -> Self {
        RollError::Consistency(value)
    }
}

//------------ StorageError --------------------------------------------------

/// Reading or writing a key directory failed.
#[derive(Debug)]
pub struct StorageError {
    path: PathBuf,
    message: String,
}

impl StorageError {
    pub fn new(path: impl AsRef<Path>, message: impl fmt::Display) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            message: message.to_string(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}': {}", self.path.display(), self.message)
    }
}

impl error::Error for StorageError {}

//------------ GenerationError -----------------------------------------------

/// The key generator could not produce a new key.
#[derive(Debug)]
pub struct GenerationError {
    role: Role,
    message: String,
}

impl GenerationError {
    pub fn new(role: Role, message: impl fmt::Display) -> Self {
        Self {
            role,
            message: message.to_string(),
        }
    }
}

impl fmt::Display for GenerationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "generating a new {}: {}", self.role, self.message)
    }
}

impl error::Error for GenerationError {}

//------------ NotificationError ---------------------------------------------

/// An operator notification could not be delivered.
#[derive(Debug)]
pub struct NotificationError {
    subject: String,
    message: String,
}

impl NotificationError {
    pub fn new(subject: impl Into<String>, message: impl fmt::Display) -> Self {
        Self {
            subject: subject.into(),
            message: message.to_string(),
        }
    }
}

impl fmt::Display for NotificationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unable to deliver notification '{}': {}",
            self.subject, self.message
        )
    }
}

impl error::Error for NotificationError {}

//------------ LookupError ---------------------------------------------------

/// The DS records of a zone could not be looked up at its parent.
#[derive(Clone, Debug)]
pub struct LookupError {
    zone: String,
    message: String,
}

impl LookupError {
    pub fn new(zone: impl Into<String>, message: impl fmt::Display) -> Self {
        Self {
            zone: zone.into(),
            message: message.to_string(),
        }
    }
}

impl fmt::Display for LookupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "looking up the DS records of {}: {}", self.zone, self.message)
    }
}

impl error::Error for LookupError {}

//------------ ConsistencyError ----------------------------------------------

/// The keys of a role are in a state this tool never produces.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsistencyError {
    /// More than one key of a role is active.
    DuplicateActive { role: Role, keys: Vec<String> },

    /// Applying the plan would leave a role without an active key.
    NoActiveKey { role: Role },

    /// No KSK is active and the candidate lacks a DS record at the parent.
    UnconfirmedKsk { key: String },

    /// A role has no readable key while key files of the zone are broken.
    UnreadableKeys { role: Role, files: Vec<String> },
}

impl fmt::Display for ConsistencyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsistencyError::DuplicateActive { role, keys } => write!(
                f,
                "inconsistent key state: {} {role}s are active at the same time ({})",
                keys.len(),
                keys.join(", ")
            ),
            ConsistencyError::NoActiveKey { role } => write!(
                f,
                "inconsistent key state: the planned transitions leave no active {role}"
            ),
            ConsistencyError::UnconfirmedKsk { key } => write!(
                f,
                "inconsistent key state: no KSK is active and {key} has no confirmed DS record"
            ),
            ConsistencyError::UnreadableKeys { role, files } => write!(
                f,
                "inconsistent key state: no {role} could be read, refusing to create one \
                 while {} is unreadable",
                files.join(", ")
            ),
        }
    }
}

impl error::Error for ConsistencyError {}

//------------ Macros --------------------------------------------------------

// NOTE: Exported macros are placed in the crate root by default.  We hide
// them using 'doc(hidden)' and then manually re-export them here, forcing
// documentation to appear using 'doc(inline)'.

#[doc(inline)]
pub use crate::bail;

/// Return an [`Error`] from the current function.
#[doc(hidden)]
#[macro_export]
macro_rules! bail {
    ($fmt:expr) => {
        return Err($crate::error::Error::new(&format!($fmt)).into())
    };

    ($fmt:expr, $($args:tt)*) => {
        return Err($crate::error::Error::new(&format!($fmt, $($args)*)).into())
    };
}
