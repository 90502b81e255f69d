//! Process supervision - fork/exec, pipe draining, timeouts, termination.
//!
//! A [`ProcessEngine`] owns one command and at most one live process at a
//! time. Output is pulled from non-blocking pipes into two
//! [`RingBuffer`]s every time the caller polls [`ProcessEngine::is_running`];
//! nothing runs in the background.

mod escalation;
mod launcher;
mod pipes;
mod status;

pub use launcher::{ChildLauncher, EXEC_FAILURE_CODE, ForkLauncher, SETUP_FAILURE_CODE, SpawnRequest};
pub use pipes::PipeSet;
pub use status::{ProcessState, SIGNALED_EXIT_CODE};

use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tether_pump::{RingBuffer, LARGE_CAPACITY};
use tracing::{debug, info, warn};

use crate::args::{self, ArgTokenizer};
use crate::config::{EngineConfig, PipeSize};
use crate::error::{os_error, ProcError};
use crate::pidfile::read_pid_file;
use crate::principal::{Credentials, Principal};
use crate::resolve::resolve_command;
use escalation::Escalation;

/// Drain passes when a process is stopped; bounds the work when a grandchild
/// keeps the pipe open and writing.
const FINAL_DRAIN_PASSES: usize = 64;

/// Where the child's stdin comes from at start.
#[derive(Debug, Clone)]
enum StdinSource {
    Bytes(Vec<u8>),
    File(PathBuf),
}

/// Runs one external command at a time and captures its output.
///
/// The engine is driven by polling: [`start`](Self::start) forks and returns,
/// then each [`is_running`](Self::is_running) call moves pipe data into the
/// [`stdout`](Self::stdout) and [`stderr`](Self::stderr) rings and checks for
/// exit. Callers that consume the rings between polls see every byte the
/// child wrote; after exit `is_running` keeps returning true while the pipes
/// still hold output that did not fit.
///
/// Dropping the engine stops a started child unless the engine is in daemon
/// mode. Processes adopted with [`attach`](Self::attach) are never stopped on
/// drop.
pub struct ProcessEngine {
    command: Option<PathBuf>,
    args: String,
    config: EngineConfig,
    launcher: Box<dyn ChildLauncher>,
    owner: Option<Credentials>,
    stdin_source: Option<StdinSource>,
    pipes: Option<PipeSet>,
    state: ProcessState,
    pid: Option<Pid>,
    /// Exit status collected by `waitpid` while output is still draining.
    reaped: Option<ProcessState>,
    last_exit_code: i32,
    started_at: Option<Instant>,
    ended_at: Option<Instant>,
    stdout: RingBuffer,
    stderr: RingBuffer,
}

impl Default for ProcessEngine {
    /// An engine with no command, for attaching to existing processes.
    fn default() -> Self {
        Self::unbound(EngineConfig::default())
    }
}

impl ProcessEngine {
    /// Resolve `command` and build an engine with the default config.
    pub fn new(command: &str) -> Result<Self, ProcError> {
        Self::with_config(command, EngineConfig::default())
    }

    pub fn with_config(command: &str, config: EngineConfig) -> Result<Self, ProcError> {
        let mut engine = Self::unbound(config);
        engine.set_command(command)?;
        Ok(engine)
    }

    /// An engine without a command. `start` fails until one is set.
    pub fn unbound(config: EngineConfig) -> Self {
        Self {
            command: None,
            args: String::new(),
            stdout: RingBuffer::new(config.stdout_capacity),
            stderr: RingBuffer::new(config.stderr_capacity),
            config,
            launcher: Box::new(ForkLauncher),
            owner: None,
            stdin_source: None,
            pipes: None,
            state: ProcessState::Idle,
            pid: None,
            reaped: None,
            last_exit_code: 0,
            started_at: None,
            ended_at: None,
        }
    }

    pub fn with_launcher(mut self, launcher: impl ChildLauncher + 'static) -> Self {
        self.launcher = Box::new(launcher);
        self
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    /// Resolve and set the command. On failure the engine has no command.
    pub fn set_command(&mut self, name: &str) -> Result<(), ProcError> {
        match resolve_command(name) {
            Ok(path) => {
                debug!(command = %path.display(), "command resolved");
                self.command = Some(path);
                Ok(())
            }
            Err(e) => {
                self.command = None;
                Err(e)
            }
        }
    }

    /// Replace the argument string.
    pub fn set_args(&mut self, args: &str) {
        self.args = args.to_string();
    }

    /// Append raw argument text, separated by a space.
    pub fn push_arg(&mut self, arg: &str) {
        if !self.args.is_empty() {
            self.args.push(' ');
        }
        self.args.push_str(arg);
    }

    /// Append one argument, quoted so it stays a single token.
    pub fn push_quoted_arg(&mut self, arg: &str) {
        self.push_arg(&args::quote(arg));
    }

    pub fn set_owner(&mut self, principal: &dyn Principal) {
        self.owner = Some(Credentials::from_principal(principal));
    }

    pub fn clear_owner(&mut self) {
        self.owner = None;
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.config.timeout = timeout;
    }

    pub fn set_echo(&mut self, echo: bool) {
        self.config.echo = echo;
    }

    /// In daemon mode a started child keeps running after the engine is
    /// dropped. `stop` still terminates it.
    pub fn set_daemon(&mut self, daemon: bool) {
        self.config.daemon = daemon;
    }

    pub fn set_pipe_size(&mut self, size: PipeSize) {
        self.set_pipe_capacity(size.capacity(), size.capacity());
    }

    /// Resize the output rings. Buffered output is discarded.
    pub fn set_pipe_capacity(&mut self, stdout: usize, stderr: usize) {
        self.config.stdout_capacity = stdout;
        self.config.stderr_capacity = stderr;
        self.stdout.reallocate(stdout);
        self.stderr.reallocate(stderr);
    }

    /// Feed these bytes to the child's stdin on every start.
    pub fn set_stdin_bytes(&mut self, data: impl Into<Vec<u8>>) {
        self.stdin_source = Some(StdinSource::Bytes(data.into()));
    }

    /// Feed this file's contents to the child's stdin on every start.
    pub fn set_stdin_file(&mut self, path: impl Into<PathBuf>) {
        self.stdin_source = Some(StdinSource::File(path.into()));
    }

    pub fn clear_stdin(&mut self) {
        self.stdin_source = None;
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Ring capacities are not changed through here; use `set_pipe_capacity`.
    pub fn config_mut(&mut self) -> &mut EngineConfig {
        &mut self.config
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Start the command with the current arguments. A process already
    /// attached to this engine is stopped first.
    pub fn start(&mut self) -> Result<(), ProcError> {
        let program = self
            .command
            .clone()
            .ok_or_else(|| ProcError::CommandNotFound("no command set".into()))?;

        if self.state.is_active() {
            self.stop()?;
        }

        let argv = ArgTokenizer::new(self.config.max_args).argv(&program, &self.args)?;
        self.state = ProcessState::Idle;
        self.last_exit_code = 0;

        if self.config.echo {
            info!(command = %program.display(), args = %self.args, "starting");
        }
        if self.config.dry_run {
            info!(argv = ?argv, "dry run, not starting");
            return Ok(());
        }

        // Opened before fork so a missing file fails without a child
        let stdin_file = match &self.stdin_source {
            Some(StdinSource::File(path)) => Some(File::open(path)?),
            _ => None,
        };
        let mut pipes = PipeSet::new()?;
        self.stdout.clear();
        self.stderr.clear();

        let request = SpawnRequest {
            program: &program,
            argv: &argv,
            credentials: self.owner.as_ref(),
        };
        let pid = self.launcher.spawn(&request, &pipes)?;
        pipes.prepare_parent();

        self.started_at = Some(Instant::now());
        self.ended_at = None;
        self.pid = Some(pid);
        self.reaped = None;
        self.state = ProcessState::Running;
        debug!(pid = pid.as_raw(), command = %program.display(), "child started");

        let fed = match (stdin_file, &self.stdin_source) {
            (Some(mut file), _) => pipes.feed_stdin(&mut file),
            (None, Some(StdinSource::Bytes(data))) => pipes.feed_stdin(&mut data.as_slice()),
            _ => Ok(0),
        };
        self.pipes = Some(pipes);
        if let Ok(written) = fed {
            debug!(written, "stdin fed");
        }
        fed.map(|_| ())
    }

    /// Replace the arguments and start.
    pub fn start_with(&mut self, args: &str) -> Result<(), ProcError> {
        self.set_args(args);
        self.start()
    }

    /// Poll the process once.
    ///
    /// For a forked child this sleeps one poll interval, enforces the
    /// timeout, drains both pipes and checks for exit. Once the child has
    /// exited, each call drains without sleeping and returns true while
    /// output is still arriving; it returns false when both pipes are at end
    /// of stream, or when a full ring was not consumed since the last call.
    /// Then the pipes are closed and the exit code recorded.
    /// For an attached daemon only liveness is checked.
    pub fn is_running(&mut self) -> Result<bool, ProcError> {
        let pid = match (self.state, self.pid) {
            (ProcessState::Running | ProcessState::Daemon, Some(pid)) => pid,
            _ => return Ok(false),
        };

        if let Some(outcome) = self.reaped {
            return self.drain_after_exit(outcome);
        }

        std::thread::sleep(self.config.poll_interval);

        if self.state == ProcessState::Daemon {
            let gone = probe_daemon(pid)?.is_some();
            if gone {
                debug!(pid = pid.as_raw(), "attached process is gone");
                self.release_daemon();
            }
            return Ok(!gone);
        }

        if let (Some(limit), Some(started)) = (self.config.effective_timeout(), self.started_at) {
            let elapsed = started.elapsed();
            if elapsed > limit {
                warn!(pid = pid.as_raw(), ?elapsed, "timeout reached, stopping child");
                self.terminate_child(pid)?;
                self.state = ProcessState::TimedOut;
                return Err(ProcError::Timeout {
                    command: self.command_display(),
                    pid: pid.as_raw(),
                    elapsed,
                });
            }
        }

        self.drain_pipes()?;

        let status = waitpid(pid, Some(WaitPidFlag::WNOHANG)).map_err(os_error)?;
        match status::decode(status) {
            None => Ok(true),
            Some(outcome) => {
                debug!(pid = pid.as_raw(), state = %outcome, "child exited, draining output");
                self.reaped = Some(outcome);
                self.ended_at = Some(Instant::now());
                self.drain_after_exit(outcome)
            }
        }
    }

    /// Poll until the process is gone and return its exit code. A finished
    /// run collapses back to `Idle`.
    pub fn wait(&mut self) -> Result<i32, ProcError> {
        while self.is_running()? {}
        if self.state.is_terminal() {
            self.state = ProcessState::Idle;
        }
        Ok(self.last_exit_code)
    }

    /// Terminate the attached process, escalating from SIGTERM to SIGKILL.
    ///
    /// Does nothing when no process is attached.
    pub fn stop(&mut self) -> Result<(), ProcError> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        match self.state {
            ProcessState::Running => match self.reaped {
                Some(outcome) => self.finish(outcome),
                None => self.terminate_child(pid),
            },
            ProcessState::Daemon => {
                info!(pid = pid.as_raw(), "stopping attached process");
                Escalation::new(pid, &self.config.daemon_escalation, || probe_daemon(pid)).run()?;
                self.release_daemon();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Adopt a process this engine did not start. No pipes are attached and
    /// the process is left alone when the engine is dropped.
    pub fn attach(&mut self, pid: Pid) -> Result<(), ProcError> {
        if self.state.is_active() {
            self.stop()?;
        }
        if pid.as_raw() <= 0 || probe_daemon(pid)?.is_some() {
            return Err(ProcError::ProcessNotFound(pid.as_raw()));
        }
        debug!(pid = pid.as_raw(), "attached");
        self.pid = Some(pid);
        self.state = ProcessState::Daemon;
        self.last_exit_code = 0;
        self.started_at = None;
        self.ended_at = None;
        Ok(())
    }

    /// Attach to the pid recorded in `path`.
    pub fn attach_pid_file(&mut self, path: &Path) -> Result<(), ProcError> {
        let pid = read_pid_file(path)?;
        self.attach(pid)
    }

    // ------------------------------------------------------------------
    // One-shot helpers
    // ------------------------------------------------------------------

    /// Start with the current arguments and wait for the exit code.
    pub fn execute_once(&mut self) -> Result<i32, ProcError> {
        self.start()?;
        self.wait()
    }

    /// Replace the arguments, then run to completion.
    pub fn execute_with(&mut self, args: &str) -> Result<i32, ProcError> {
        self.set_args(args);
        self.execute_once()
    }

    /// Run once with `arg` appended; the stored arguments are left unchanged.
    pub fn execute_appended(&mut self, arg: &str) -> Result<i32, ProcError> {
        let saved = self.args.clone();
        self.push_arg(arg);
        let result = self.execute_once();
        self.args = saved;
        result
    }

    /// Run once with `input` on stdin and return everything written to
    /// stdout. An engine without a stdout ring gets the large preset.
    ///
    /// Input is written between polls as the child reads it, so a filter
    /// can be given more input than the pipes hold. Only the most recent
    /// stderr is kept.
    pub fn query(&mut self, input: &[u8]) -> Result<Vec<u8>, ProcError> {
        if self.stdout.capacity() == 0 {
            self.stdout.reallocate(LARGE_CAPACITY);
            self.config.stdout_capacity = LARGE_CAPACITY;
        }
        let saved = self.stdin_source.take();
        let result = self.run_collecting(input);
        self.stdin_source = saved;
        result.map(|(_, output)| output)
    }

    /// Run `command args` to completion and return its stdout. The child's
    /// stdin is closed and its stderr discarded.
    ///
    /// A non-zero exit is an error carrying the output.
    pub fn capture(command: &str, args: &str) -> Result<String, ProcError> {
        let config = EngineConfig::default().with_pipe_capacity(LARGE_CAPACITY, 0);
        let mut engine = Self::with_config(command, config)?;
        engine.set_args(args);
        let (code, output) = engine.run_collecting(&[])?;
        let output = String::from_utf8_lossy(&output).into_owned();
        if code != 0 {
            return Err(ProcError::NonZeroExit {
                command: engine.command_display(),
                code,
                output,
            });
        }
        Ok(output)
    }

    fn run_collecting(&mut self, input: &[u8]) -> Result<(i32, Vec<u8>), ProcError> {
        let mut output = Vec::new();
        let mut pending = input;
        self.start()?;
        if let Some(pipes) = self.pipes.as_mut() {
            pipes.set_stdin_nonblocking()?;
        }
        loop {
            pending = self.offer_input(pending)?;
            let running = self.is_running()?;
            self.stdout.read_into_vec(&mut output);
            if self.stderr.is_full() {
                self.stderr.discard(self.stderr.capacity() / 2);
            }
            if !running {
                break;
            }
        }
        let code = self.wait()?;
        Ok((code, output))
    }

    /// Write what the stdin pipe takes now; close it once `pending` is
    /// exhausted. Returns the part still to be written.
    fn offer_input<'a>(&mut self, pending: &'a [u8]) -> Result<&'a [u8], ProcError> {
        let Some(pipes) = self.pipes.as_mut() else {
            return Ok(&[]);
        };
        if !pipes.stdin_open() {
            return Ok(&[]);
        }
        let mut rest = pending;
        while !rest.is_empty() {
            let n = pipes.offer_stdin(rest)?;
            if n == 0 {
                break;
            }
            rest = &rest[n..];
        }
        if rest.is_empty() {
            pipes.close_stdin();
        }
        Ok(rest)
    }

    // ------------------------------------------------------------------
    // Stdin
    // ------------------------------------------------------------------

    /// Write to a running child's stdin. Returns 0 when there is no open stdin.
    pub fn write_stdin(&mut self, data: &[u8]) -> Result<usize, ProcError> {
        match self.pipes.as_mut() {
            Some(pipes) => pipes.write_stdin(data),
            None => Ok(0),
        }
    }

    /// Close the child's stdin so it sees EOF.
    pub fn close_stdin(&mut self) {
        if let Some(pipes) = self.pipes.as_mut() {
            pipes.close_stdin();
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn last_exit_code(&self) -> i32 {
        self.last_exit_code
    }

    /// Wall time of the last run, or of the current one so far.
    pub fn duration(&self) -> Option<Duration> {
        let started = self.started_at?;
        Some(match self.ended_at {
            Some(ended) => ended.duration_since(started),
            None => started.elapsed(),
        })
    }

    pub fn command(&self) -> Option<&Path> {
        self.command.as_deref()
    }

    pub fn args(&self) -> &str {
        &self.args
    }

    pub fn stdout(&self) -> &RingBuffer {
        &self.stdout
    }

    pub fn stdout_mut(&mut self) -> &mut RingBuffer {
        &mut self.stdout
    }

    pub fn stderr(&self) -> &RingBuffer {
        &self.stderr
    }

    pub fn stderr_mut(&mut self) -> &mut RingBuffer {
        &mut self.stderr
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn drain_pipes(&mut self) -> Result<bool, ProcError> {
        let Some(pipes) = self.pipes.as_mut() else {
            return Ok(false);
        };
        let out = pipes.drain_stdout(&mut self.stdout)?;
        let err = pipes.drain_stderr(&mut self.stderr)?;
        Ok(out || err)
    }

    /// Post-exit poll: move what the pipes hold into the rings.
    fn drain_after_exit(&mut self, outcome: ProcessState) -> Result<bool, ProcError> {
        let mut moved = false;
        loop {
            let progress = self.drain_pipes()?;
            moved |= progress;
            if !progress || self.stdout.is_full() || self.stderr.is_full() {
                break;
            }
        }
        let closed = self.pipes.as_ref().is_none_or(PipeSet::output_closed);
        if moved && !closed {
            return Ok(true);
        }
        if !closed && !self.stdout.is_full() && !self.stderr.is_full() {
            debug!("pipes still held open after exit, closing");
        }
        self.finish(outcome)?;
        self.check_exit()?;
        Ok(false)
    }

    /// Record a finished child: drain what is left, close the pipes, store
    /// the exit code.
    fn finish(&mut self, outcome: ProcessState) -> Result<(), ProcError> {
        let mut drained = Ok(());
        for _ in 0..FINAL_DRAIN_PASSES {
            match self.drain_pipes() {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    drained = Err(e);
                    break;
                }
            }
        }
        let closed = self.pipes.as_ref().is_none_or(PipeSet::output_closed);
        if !closed && (self.stdout.is_full() || self.stderr.is_full()) {
            warn!("output ring full at exit, unread pipe data discarded");
        }

        self.pipes = None;
        self.pid = None;
        self.reaped = None;
        if self.ended_at.is_none() {
            self.ended_at = Some(Instant::now());
        }
        self.last_exit_code = outcome.exit_code().unwrap_or(0);
        self.state = outcome;
        debug!(state = %outcome, "child finished");
        drained
    }

    fn check_exit(&self) -> Result<(), ProcError> {
        if !self.config.nonzero_exit_is_error || self.last_exit_code == 0 {
            return Ok(());
        }
        let mut stderr = vec![0u8; self.stderr.size()];
        let n = self.stderr.peek(&mut stderr);
        stderr.truncate(n);
        Err(ProcError::NonZeroExit {
            command: self.command_display(),
            code: self.last_exit_code,
            output: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    fn terminate_child(&mut self, pid: Pid) -> Result<(), ProcError> {
        let outcome = Escalation::new(pid, &self.config.child_escalation, || {
            let status = waitpid(pid, Some(WaitPidFlag::WNOHANG)).map_err(os_error)?;
            Ok(status::decode(status))
        })
        .run()?;
        self.finish(outcome)
    }

    fn release_daemon(&mut self) {
        self.pid = None;
        self.state = ProcessState::Idle;
    }

    fn command_display(&self) -> String {
        self.command
            .as_deref()
            .map(|c| c.display().to_string())
            .unwrap_or_default()
    }
}

impl Drop for ProcessEngine {
    fn drop(&mut self) {
        // Attached daemons and daemon-mode children outlive the engine
        if self.state == ProcessState::Running && !self.config.daemon {
            if let Err(e) = self.stop() {
                warn!(error = %e, "failed to stop child on drop");
            }
        }
    }
}

impl fmt::Display for ProcessEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.command {
            Some(command) => write!(f, "{}", command.display())?,
            None => write!(f, "<no command>")?,
        }
        if !self.args.is_empty() {
            write!(f, " {}", self.args)?;
        }
        write!(f, " [{}", self.state)?;
        if let Some(pid) = self.pid {
            write!(f, ", pid {pid}")?;
        }
        write!(f, ", last exit {}]", self.last_exit_code)
    }
}

impl fmt::Debug for ProcessEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessEngine")
            .field("command", &self.command)
            .field("args", &self.args)
            .field("state", &self.state)
            .field("pid", &self.pid)
            .field("last_exit_code", &self.last_exit_code)
            .field("stdout", &self.stdout)
            .field("stderr", &self.stderr)
            .finish_non_exhaustive()
    }
}

/// `Some(())` once `pid` is gone. Our own children are reaped on the way;
/// anything else is checked with signal 0.
fn probe_daemon(pid: Pid) -> Result<Option<()>, ProcError> {
    match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::StillAlive) => return Ok(None),
        Ok(status) => return Ok(status::decode(status).map(|_| ())),
        Err(Errno::ECHILD) => {}
        Err(e) => return Err(os_error(e)),
    }
    match kill(pid, None) {
        Ok(()) | Err(Errno::EPERM) => Ok(None),
        Err(Errno::ESRCH) => Ok(Some(())),
        Err(e) => Err(os_error(e)),
    }
}
