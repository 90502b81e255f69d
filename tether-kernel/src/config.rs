//! Engine configuration.
//!
//! Everything that used to be process-global tuning (dry run, non-zero exit
//! handling, default timeout, pipe sizes, escalation schedules) lives in an
//! [`EngineConfig`] owned by each engine. Durations serialize as integer
//! milliseconds so the config can be loaded from JSON.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_pump::{LARGE_CAPACITY, SMALL_CAPACITY};

use crate::args::DEFAULT_MAX_ARGS;

/// Preset capacities for the stdout/stderr rings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipeSize {
    /// Output is drained and discarded.
    None,
    Small,
    Large,
}

impl PipeSize {
    pub fn capacity(self) -> usize {
        match self {
            PipeSize::None => 0,
            PipeSize::Small => SMALL_CAPACITY,
            PipeSize::Large => LARGE_CAPACITY,
        }
    }
}

/// Schedule for the TERM -> KILL escalation.
///
/// After SIGTERM the process is probed `term_polls` times, `interval` apart.
/// If it is still alive SIGKILL follows and it gets `kill_polls` more probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationPolicy {
    #[serde(with = "duration_millis")]
    pub interval: Duration,
    pub term_polls: u32,
    pub kill_polls: u32,
}

impl EscalationPolicy {
    /// For children this engine forked: 500ms of TERM grace, 2s after KILL.
    pub const CHILD: Self = Self {
        interval: Duration::from_millis(50),
        term_polls: 10,
        kill_polls: 40,
    };

    /// For attached daemons: 8s of TERM grace, 4s after KILL.
    pub const DAEMON: Self = Self {
        interval: Duration::from_millis(400),
        term_polls: 20,
        kill_polls: 10,
    };

    pub fn term_grace(&self) -> Duration {
        self.interval * self.term_polls
    }

    pub fn kill_grace(&self) -> Duration {
        self.interval * self.kill_polls
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Log the command line instead of running it.
    pub dry_run: bool,
    /// Turn a non-zero exit (or death by signal) into `ProcError::NonZeroExit`.
    pub nonzero_exit_is_error: bool,
    /// Log the full command line at info level before each start.
    pub echo: bool,
    /// Leave a started child running when the engine is dropped.
    pub daemon: bool,
    /// Sleep between liveness checks in `is_running`.
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,
    /// Wall-clock limit per run. `None` or zero means unbounded.
    #[serde(with = "option_duration_millis")]
    pub timeout: Option<Duration>,
    pub stdout_capacity: usize,
    pub stderr_capacity: usize,
    /// Upper bound on argv length, program path included.
    pub max_args: usize,
    pub child_escalation: EscalationPolicy,
    pub daemon_escalation: EscalationPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            nonzero_exit_is_error: false,
            echo: false,
            daemon: false,
            poll_interval: Duration::from_millis(100),
            timeout: None,
            stdout_capacity: 0,
            stderr_capacity: 0,
            max_args: DEFAULT_MAX_ARGS,
            child_escalation: EscalationPolicy::CHILD,
            daemon_escalation: EscalationPolicy::DAEMON,
        }
    }
}

impl EngineConfig {
    pub fn with_pipe_size(self, size: PipeSize) -> Self {
        self.with_pipe_capacity(size.capacity(), size.capacity())
    }

    pub fn with_pipe_capacity(mut self, stdout: usize, stderr: usize) -> Self {
        self.stdout_capacity = stdout;
        self.stderr_capacity = stderr;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The timeout actually enforced; zero counts as unbounded.
    pub fn effective_timeout(&self) -> Option<Duration> {
        self.timeout.filter(|t| !t.is_zero())
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        duration: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match duration {
            Some(value) => serializer.serialize_some(&(value.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert!(!config.dry_run);
        assert!(!config.nonzero_exit_is_error);
        assert!(!config.daemon);
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.stdout_capacity, 0);
        assert_eq!(config.max_args, 100);
        assert_eq!(config.effective_timeout(), None);
        assert_eq!(config.child_escalation.term_grace(), Duration::from_millis(500));
        assert_eq!(config.child_escalation.kill_grace(), Duration::from_secs(2));
        assert_eq!(config.daemon_escalation.term_grace(), Duration::from_secs(8));
        assert_eq!(config.daemon_escalation.kill_grace(), Duration::from_secs(4));
    }

    #[test]
    fn test_zero_timeout_is_unbounded() {
        let config = EngineConfig::default().with_timeout(Duration::ZERO);
        assert_eq!(config.effective_timeout(), None);

        let config = EngineConfig::default().with_timeout(Duration::from_secs(3));
        assert_eq!(config.effective_timeout(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_pipe_presets() {
        assert_eq!(PipeSize::None.capacity(), 0);
        assert_eq!(PipeSize::Small.capacity(), 256);
        assert_eq!(PipeSize::Large.capacity(), 8192);

        let config = EngineConfig::default().with_pipe_size(PipeSize::Large);
        assert_eq!(config.stdout_capacity, 8192);
        assert_eq!(config.stderr_capacity, 8192);
    }

    #[test]
    fn test_json_partial_config() {
        let json = r#"{"timeout": 1500, "stdout_capacity": 256, "dry_run": true}"#;
        let config: EngineConfig = serde_json::from_str(json).expect("deserialize");
        assert!(config.dry_run);
        assert!(!config.daemon);
        assert_eq!(config.timeout, Some(Duration::from_millis(1500)));
        assert_eq!(config.stdout_capacity, 256);
        assert_eq!(config.stderr_capacity, 0);
        assert_eq!(config.poll_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_json_escalation_millis() {
        let json = serde_json::to_value(EscalationPolicy::CHILD).expect("serialize");
        assert_eq!(json["interval"], 50);
        assert_eq!(json["term_polls"], 10);
    }
}
