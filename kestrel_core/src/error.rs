//! Error types for the KESTREL core
//!
//! Errors are split by where they surface:
//!
//! - [`BindError`]: connection time (unknown command, type mismatch, unconnected interface)
//! - [`CommandError`]: per-call outcome of invoking a bound function
//! - [`StateTableError`]: state table registration and history reads
//! - [`KestrelError`]: everything else, and the umbrella for the above

use crate::core::ComponentState;
use thiserror::Error;

/// Result alias used throughout the crate
pub type KestrelResult<T> = Result<T, KestrelError>;

/// Crate-wide error type
#[derive(Debug, Error)]
pub enum KestrelError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Component '{0}' already exists")]
    DuplicateComponent(String),

    #[error("Interface '{interface}' already exists on component '{component}'")]
    DuplicateInterface { component: String, interface: String },

    #[error("'{name}' is already registered on interface '{interface}'")]
    DuplicateName { interface: String, name: String },

    #[error("Component '{component}': cannot {operation} while {state}")]
    Lifecycle {
        component: String,
        operation: &'static str,
        state: ComponentState,
    },

    #[error("Failed to spawn thread for '{0}': {1}")]
    ThreadSpawn(String, std::io::Error),

    #[error(transparent)]
    Bind(#[from] BindError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    StateTable(#[from] StateTableError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl KestrelError {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        KestrelError::Config(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        KestrelError::Internal(msg.into())
    }

    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        KestrelError::InvalidInput(msg.into())
    }

    pub(crate) fn lifecycle(component: &str, operation: &'static str, state: ComponentState) -> Self {
        KestrelError::Lifecycle {
            component: component.to_string(),
            operation,
            state,
        }
    }
}

/// Errors raised while binding a required interface to a provided interface
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BindError {
    #[error("Unknown component '{0}'")]
    UnknownComponent(String),

    #[error("Component '{component}' has no interface '{interface}'")]
    UnknownInterface { component: String, interface: String },

    #[error("Command '{command}' not found on provided interface '{interface}'")]
    UnknownCommand { interface: String, command: String },

    #[error("Event '{event}' not found on provided interface '{interface}'")]
    UnknownEvent { interface: String, event: String },

    #[error("'{name}' type mismatch: expected {expected}, provided {found}")]
    TypeMismatch {
        name: String,
        expected: String,
        found: String,
    },

    #[error("Required interface '{0}' is already connected")]
    AlreadyConnected(String),

    #[error("Required interface '{0}' is not connected")]
    NotConnected(String),

    /// Owner of the provided interface has finished and no longer drains mailboxes
    #[error("Component '{component}' has finished, interface '{interface}' accepts no connections")]
    ProviderFinished { component: String, interface: String },
}

/// Per-call outcome of invoking a function. All variants are recoverable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// Function is not bound to any provided interface
    #[error("function is not bound to an interface")]
    NotBound,

    /// Target mailbox was full, nothing was queued
    #[error("mailbox '{0}' is full, command not queued")]
    QueueFull(String),

    /// Command has been disabled by its owner
    #[error("command '{0}' is disabled")]
    Disabled(String),

    /// Underlying callable failed (panicked)
    #[error("command '{command}' failed: {reason}")]
    ExecutionFailed { command: String, reason: String },

    /// Mailbox was closed (owner finished) before the command ran
    #[error("mailbox '{0}' is closed")]
    MailboxClosed(String),

    /// Blocking call did not complete within the configured timeout
    #[error("blocking call to '{0}' timed out")]
    Timeout(String),

    /// Argument or result did not have the registered type
    #[error("argument type mismatch for '{0}'")]
    ArgumentMismatch(String),
}

/// State table registration and read errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateTableError {
    /// Row at this index has been overwritten since the index was taken
    #[error("state table '{table}': row {index} (tick {ticks}) is no longer available")]
    Overwritten {
        table: String,
        index: usize,
        ticks: u64,
    },

    /// Nothing has been published yet
    #[error("state table '{0}' has no published data")]
    NoData(String),

    /// Elements can only be added before the table is put into service
    #[error("state table '{table}' is in service, cannot add element '{element}'")]
    Sealed { table: String, element: String },

    #[error("state table '{table}' has no element '{element}'")]
    UnknownElement { table: String, element: String },

    #[error("state table '{table}': element '{element}' is not of type {requested}")]
    TypeMismatch {
        table: String,
        element: String,
        requested: &'static str,
    },

    #[error("state table '{table}': delay {delay} exceeds history length {capacity}")]
    InvalidDelay {
        table: String,
        delay: usize,
        capacity: usize,
    },

    #[error("state table '{table}': requested {requested} rows, history holds {capacity}")]
    HistoryTooLong {
        table: String,
        requested: usize,
        capacity: usize,
    },

    #[error("element '{element}' already exists in state table '{table}'")]
    DuplicateElement { table: String, element: String },
}

/// Extract a readable message from a caught panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
