//! Bounded TERM -> KILL escalation.

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::config::EscalationPolicy;
use crate::error::{os_error, ProcError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EscalationStage {
    Running,
    TermSent,
    KillSent,
    Reaped,
}

/// Drives one process through the escalation ladder.
///
/// `probe` returns `Some` once the process is gone; whatever it returns is
/// handed back from [`Escalation::run`].
pub(crate) struct Escalation<'a, P> {
    pid: Pid,
    policy: &'a EscalationPolicy,
    probe: P,
    stage: EscalationStage,
}

impl<'a, P> Escalation<'a, P> {
    pub(crate) fn new(pid: Pid, policy: &'a EscalationPolicy, probe: P) -> Self {
        Self {
            pid,
            policy,
            probe,
            stage: EscalationStage::Running,
        }
    }

    #[cfg(test)]
    pub(crate) fn stage(&self) -> EscalationStage {
        self.stage
    }

    pub(crate) fn run<T>(&mut self) -> Result<T, ProcError>
    where
        P: FnMut() -> Result<Option<T>, ProcError>,
    {
        loop {
            match self.stage {
                EscalationStage::Running => {
                    if let Some(done) = (self.probe)()? {
                        return Ok(self.reaped(done));
                    }
                    self.signal(Signal::SIGTERM)?;
                    self.stage = EscalationStage::TermSent;
                }
                EscalationStage::TermSent => {
                    if let Some(done) = self.poll(self.policy.term_polls)? {
                        return Ok(self.reaped(done));
                    }
                    warn!(pid = self.pid.as_raw(), grace = ?self.policy.term_grace(), "ignored SIGTERM, sending SIGKILL");
                    self.signal(Signal::SIGKILL)?;
                    self.stage = EscalationStage::KillSent;
                }
                EscalationStage::KillSent => {
                    if let Some(done) = self.poll(self.policy.kill_polls)? {
                        return Ok(self.reaped(done));
                    }
                    return Err(ProcError::ProcessStillRunning(self.pid.as_raw()));
                }
                // run() is not re-entered after a result was handed out
                EscalationStage::Reaped => {
                    return Err(ProcError::ProcessNotFound(self.pid.as_raw()));
                }
            }
        }
    }

    fn poll<T>(&mut self, attempts: u32) -> Result<Option<T>, ProcError>
    where
        P: FnMut() -> Result<Option<T>, ProcError>,
    {
        for _ in 0..attempts {
            std::thread::sleep(self.policy.interval);
            if let Some(done) = (self.probe)()? {
                return Ok(Some(done));
            }
        }
        Ok(None)
    }

    fn signal(&self, signal: Signal) -> Result<(), ProcError> {
        debug!(pid = self.pid.as_raw(), ?signal, "signalling");
        match kill(self.pid, signal) {
            // Gone between probe and signal; the next probe picks that up
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(os_error(e)),
        }
    }

    fn reaped<T>(&mut self, done: T) -> T {
        debug!(pid = self.pid.as_raw(), from = ?self.stage, "process gone");
        self.stage = EscalationStage::Reaped;
        done
    }
}
