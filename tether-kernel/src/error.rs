//! Process supervision error types.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Coarse classification of a [`ProcError`], for callers that only need to branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    CommandNotFound,
    Argument,
    Ipc,
    ProcessNotFound,
    ProcessStillRunning,
    Timeout,
    Io,
    InvalidPidFile,
    NonZeroExit,
    Principal,
}

#[derive(Debug, Error)]
pub enum ProcError {
    #[error("command not found: {0}")]
    CommandNotFound(String),

    #[error("argument error: {0}")]
    Argument(String),

    /// Pipe creation or fork failed. The engine is left idle.
    #[error("ipc error during {context}: {source}")]
    Ipc {
        context: &'static str,
        #[source]
        source: nix::Error,
    },

    #[error("process {0} not found")]
    ProcessNotFound(i32),

    #[error("process {0} still running after SIGKILL")]
    ProcessStillRunning(i32),

    #[error("{command} (pid {pid}) timed out after {elapsed:?}")]
    Timeout {
        command: String,
        pid: i32,
        elapsed: Duration,
    },

    #[error("invalid pid file {}: {reason}", path.display())]
    InvalidPidFile { path: PathBuf, reason: String },

    /// Only produced when non-zero exits are configured to be errors.
    #[error("{command} exited with {code}")]
    NonZeroExit {
        command: String,
        code: i32,
        output: String,
    },

    #[error("principal error: {0}")]
    Principal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProcError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProcError::CommandNotFound(_) => ErrorKind::CommandNotFound,
            ProcError::Argument(_) => ErrorKind::Argument,
            ProcError::Ipc { .. } => ErrorKind::Ipc,
            ProcError::ProcessNotFound(_) => ErrorKind::ProcessNotFound,
            ProcError::ProcessStillRunning(_) => ErrorKind::ProcessStillRunning,
            ProcError::Timeout { .. } => ErrorKind::Timeout,
            ProcError::InvalidPidFile { .. } => ErrorKind::InvalidPidFile,
            ProcError::NonZeroExit { .. } => ErrorKind::NonZeroExit,
            ProcError::Principal(_) => ErrorKind::Principal,
            ProcError::Io(_) => ErrorKind::Io,
        }
    }

    /// None of these errors clear up by themselves; retrying the same call
    /// against the same state gives the same answer.
    pub fn is_retryable(&self) -> bool {
        false
    }
}

/// System-call failures outside of pipe/fork setup surface as plain I/O errors.
pub(crate) fn os_error(errno: nix::Error) -> ProcError {
    ProcError::Io(std::io::Error::from(errno))
}
