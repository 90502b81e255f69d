//! Engine lifecycle states and wait-status decoding.

use std::fmt;

use nix::sys::wait::WaitStatus;

/// Exit code reported for a child that died by signal (or was killed by us).
pub const SIGNALED_EXIT_CODE: i32 = -1;

/// Lifecycle of a [`ProcessEngine`](super::ProcessEngine).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// No process. Also the state after `wait` has reported a result.
    Idle,
    /// A child forked by this engine, pipes attached.
    Running,
    /// A process attached by pid; no pipes, not reaped by us.
    Daemon,
    /// Exited normally with this code.
    Exited(i32),
    /// Terminated by a signal.
    Killed,
    /// Stopped because its timeout ran out.
    TimedOut,
}

impl ProcessState {
    /// A process is attached (forked or adopted).
    pub fn is_active(&self) -> bool {
        matches!(self, ProcessState::Running | ProcessState::Daemon)
    }

    /// The last run has ended and its result not yet collected by `wait`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessState::Exited(_) | ProcessState::Killed | ProcessState::TimedOut
        )
    }

    /// Exit code of a finished run.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ProcessState::Exited(code) => Some(*code),
            ProcessState::Killed | ProcessState::TimedOut => Some(SIGNALED_EXIT_CODE),
            _ => None,
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessState::Idle => write!(f, "idle"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::Daemon => write!(f, "daemon"),
            ProcessState::Exited(code) => write!(f, "exited({code})"),
            ProcessState::Killed => write!(f, "killed"),
            ProcessState::TimedOut => write!(f, "timed out"),
        }
    }
}

/// Map a wait status to the terminal state it implies, or `None` while the
/// process is still alive (running, stopped or continued).
pub(crate) fn decode(status: WaitStatus) -> Option<ProcessState> {
    match status {
        WaitStatus::Exited(_, code) => Some(ProcessState::Exited(code)),
        WaitStatus::Signaled(..) => Some(ProcessState::Killed),
        _ => None,
    }
}
