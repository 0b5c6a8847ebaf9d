//! Error types for tix

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::ticket::State;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Ticket not found: {0}")]
    NotFound(String),

    #[error("Invalid ticket ID: {0}")]
    InvalidId(String),

    #[error(
        "Cannot move {id} from '{from}' to '{to}'. Allowed targets: {}",
        format_states(allowed)
    )]
    InvalidTransition {
        id: String,
        from: State,
        to: State,
        allowed: Vec<State>,
    },

    #[error("Unknown state '{state}'. Valid states: {}", format_states(valid))]
    UnknownState { state: String, valid: Vec<State> },

    #[error(
        "{id} is in state '{state}', which the current policy does not define. Valid states: {}",
        format_states(valid)
    )]
    UnknownCurrentState {
        id: String,
        state: State,
        valid: Vec<State>,
    },

    #[error("Invalid ticket type '{ty}'. Valid types: {}", valid.join(", "))]
    InvalidType { ty: String, valid: Vec<String> },

    #[error("Unknown field: {0}")]
    UnknownField(String),

    #[error("Field '{0}' cannot be set directly")]
    ReadOnlyField(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error(transparent)]
    SyncConflict(#[from] SyncConflict),

    #[error("Hook '{hook}' vetoed transition of {ticket}: {reason}")]
    HookVetoed {
        hook: String,
        ticket: String,
        reason: HookFailure,
    },

    #[error("Invalid configuration: {0}")]
    ConfigurationInvalid(String),

    #[error("Malformed ticket {id}: {reason}")]
    MalformedTicket { id: String, reason: String },

    #[error("Store not initialized. Run 'tix init' first.")]
    NotInitialized,

    #[error("Store already initialized at {0}")]
    AlreadyInitialized(PathBuf),

    #[error("git {command} failed: {stderr}")]
    Git { command: String, stderr: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("TOML error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether pulling and retrying the operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::SyncConflict(_))
    }

    /// Every shape of a rejected transition: unknown target, a current
    /// state the policy no longer knows, or an illegal edge.
    pub fn is_invalid_transition(&self) -> bool {
        matches!(
            self,
            Error::InvalidTransition { .. }
                | Error::UnknownState { .. }
                | Error::UnknownCurrentState { .. }
        )
    }
}

/// Optimistic concurrency failures. Recoverable by pulling and retrying.
#[derive(Error, Debug)]
pub enum SyncConflict {
    #[error("push to {branch} rejected: origin has advanced, pull and retry")]
    PushRejected { branch: String },

    #[error("origin branch {branch} moved during write, retry")]
    OriginAdvanced { branch: String },

    #[error("replica has uncommitted changes that pull would overwrite: {}", paths.join(", "))]
    DirtyReplica { paths: Vec<String> },

    #[error("concurrent edits to {id} conflict on: {}", fields.join(", "))]
    Diverged { id: String, fields: Vec<String> },

    #[error("cannot reconcile concurrent changes to {path}")]
    Unmergeable { path: String },
}

/// Why a hook did not approve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookFailure {
    Exit(i32),
    Signal,
    TimedOut(Duration),
    Spawn(String),
}

impl std::fmt::Display for HookFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HookFailure::Exit(code) => write!(f, "exited with status {code}"),
            HookFailure::Signal => write!(f, "terminated by signal"),
            HookFailure::TimedOut(after) => write!(f, "timed out after {}s", after.as_secs_f64()),
            HookFailure::Spawn(e) => write!(f, "could not be started: {e}"),
        }
    }
}

fn format_states(states: &[State]) -> String {
    if states.is_empty() {
        return "(none, terminal state)".to_string();
    }
    states
        .iter()
        .map(State::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}
