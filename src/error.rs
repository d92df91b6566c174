//! Error types used across the lifecycle framework.
//!
//! Two families:
//!
//! - [`TaskError`] — errors produced by supervised tasks and latched by an
//!   [`Environment`](crate::Environment). Cloneable so the latched value can
//!   be handed to every `wait` caller.
//! - [`SetupError`] — synchronous setup failures (bind, inherit, TLS load,
//!   descriptor export, re-exec). These are returned directly to the caller;
//!   restart-protocol variants are fatal only to the restart attempt.

use std::io;

use thiserror::Error;

/// # Errors latched by an [`Environment`](crate::Environment).
///
/// A spawned task returning `Err` cancels its siblings and latches the error
/// as the Environment's terminal result. Only the first error is retained;
/// later ones are dropped (logged at debug level).
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// The process received an interrupt/terminate signal.
    ///
    /// This is a sentinel, not a genuine failure: use [`is_signaled`] (or
    /// [`TaskError::is_signaled`]) to tell an operator-requested stop apart
    /// from an application error.
    #[error("signaled")]
    Signaled,

    /// Generic task failure.
    #[error("{error}")]
    Fail {
        /// Human-readable failure message.
        error: String,
    },

    /// I/O failure (bind, accept, read/write, ...).
    #[error("{error}")]
    Io {
        /// Stringified source error.
        error: String,
    },
}

impl TaskError {
    /// Shorthand for [`TaskError::Fail`] from any displayable message.
    pub fn fail(error: impl Into<String>) -> Self {
        TaskError::Fail {
            error: error.into(),
        }
    }

    /// Returns true if this error is the signal sentinel.
    pub fn is_signaled(&self) -> bool {
        matches!(self, TaskError::Signaled)
    }

    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            TaskError::Signaled => "signaled",
            TaskError::Fail { .. } => "task_failed",
            TaskError::Io { .. } => "io_error",
        }
    }
}

impl From<io::Error> for TaskError {
    fn from(err: io::Error) -> Self {
        TaskError::Io {
            error: err.to_string(),
        }
    }
}

/// Returns true if `err` indicates that the program received an
/// interrupt/terminate signal rather than failing on its own.
pub fn is_signaled(err: &TaskError) -> bool {
    err.is_signaled()
}

/// # Synchronous setup and restart-protocol failures.
///
/// Setup variants (`Bind`, `TlsLoad`, `SocketActivation`, `Inherit`) are
/// fatal to startup. Restart variants (`ExportFd`, `Reexec`, `NotReady`)
/// abort only the restart attempt; the running generation keeps serving.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum SetupError {
    /// Binding a fresh listener failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// The address that could not be bound.
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Loading TLS certificate/key material failed.
    #[error("failed to load TLS credentials: {source}")]
    TlsLoad {
        #[source]
        source: io::Error,
    },

    /// The socket-activation environment was present but malformed.
    #[error("socket activation protocol error: {reason}")]
    SocketActivation {
        /// What was wrong with the activation environment.
        reason: String,
    },

    /// An inherited descriptor could not be turned into a listener.
    #[error("failed to inherit listener descriptor {fd}: {source}")]
    Inherit {
        /// The raw descriptor number.
        fd: i32,
        #[source]
        source: io::Error,
    },

    /// A listener could not expose its OS descriptor for handoff.
    #[error("listener {addr} cannot export a descriptor: {source}")]
    ExportFd {
        /// Address of the listener that failed to export.
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Re-executing the current binary failed.
    #[error("failed to re-execute binary: {source}")]
    Reexec {
        #[source]
        source: io::Error,
    },

    /// The successor process exited before signaling readiness.
    #[error("successor exited before signaling readiness")]
    NotReady,
}

impl From<SetupError> for TaskError {
    fn from(err: SetupError) -> Self {
        TaskError::Io {
            error: err.to_string(),
        }
    }
}
