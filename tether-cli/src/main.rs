mod cli;
mod logging;

use std::io::{self, Write};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tether_kernel::pidfile::write_pid_file;
use tether_kernel::{
    EngineConfig, ErrorKind, Pid, ProcError, ProcessEngine, RingBuffer, RingError, SystemUser,
};
use tracing::{debug, info, warn};

use crate::cli::{Args, Command, RunArgs, StopArgs};
use crate::logging::setup_logging;

/// Exit status when the command is killed for running too long.
const TIMEOUT_EXIT: u8 = 124;

fn main() -> Result<ExitCode> {
    let args = Args::parse();
    setup_logging(args.verbose);

    match args.command {
        Command::Run(run) => cmd_run(run),
        Command::Stop(stop) => cmd_stop(stop),
    }
}

fn cmd_run(args: RunArgs) -> Result<ExitCode> {
    let config = EngineConfig {
        echo: args.echo,
        timeout: args.timeout.map(Duration::from_secs),
        ..EngineConfig::default()
    }
    .with_pipe_capacity(args.pipe_size, args.pipe_size);

    let mut engine = ProcessEngine::with_config(&args.program, config)?;
    for arg in &args.args {
        engine.push_quoted_arg(arg);
    }
    if let Some(name) = &args.user {
        let user = SystemUser::lookup(name)?;
        engine.set_owner(&user);
    }
    if let Some(path) = &args.stdin {
        engine.set_stdin_file(path);
    }

    engine.start()?;
    if args.stdin.is_none() {
        engine.close_stdin();
    }
    if let (Some(path), Some(pid)) = (&args.pid_file, engine.pid()) {
        write_pid_file(path, pid)
            .with_context(|| format!("failed to write pid file {}", path.display()))?;
    }

    let result = forward_until_exit(
        &mut engine,
        &mut io::stdout().lock(),
        &mut io::stderr().lock(),
    );

    if let Some(path) = &args.pid_file {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "failed to remove pid file");
        }
    }

    match result {
        Ok(()) => {
            let code = engine.last_exit_code();
            debug!(code, duration = ?engine.duration(), "command finished");
            Ok(ExitCode::from(exit_byte(code)))
        }
        Err(e) if is_timeout(&e) => {
            eprintln!("tether: {e}");
            Ok(ExitCode::from(TIMEOUT_EXIT))
        }
        Err(e) => Err(e),
    }
}

/// Poll the child and copy its output to `out`/`err` line by line.
fn forward_until_exit(
    engine: &mut ProcessEngine,
    out: &mut impl Write,
    err: &mut impl Write,
) -> Result<()> {
    loop {
        let polled = engine.is_running();
        // flush what was captured before the process ended, even on error
        let finished = !matches!(polled, Ok(true));
        forward_lines(engine.stdout_mut(), out, finished)?;
        forward_lines(engine.stderr_mut(), err, finished)?;
        if !polled? {
            return Ok(());
        }
    }
}

/// Write complete lines from `ring` to `out`. A line that fills the whole
/// ring is passed through raw; with `finished` the unterminated tail goes
/// out as well.
fn forward_lines(ring: &mut RingBuffer, out: &mut impl Write, finished: bool) -> Result<()> {
    loop {
        match ring.read_line_to(out, false) {
            Ok(Some(_)) => out.write_all(b"\n")?,
            Ok(None) => break,
            Err(RingError::LineTooLong { .. }) => {
                ring.read_to(out)?;
            }
            Err(e) => return Err(e.into()),
        }
    }
    if finished {
        ring.read_to(out)?;
    }
    out.flush()?;
    Ok(())
}

fn cmd_stop(args: StopArgs) -> Result<ExitCode> {
    let mut engine = ProcessEngine::default();
    match (args.pid, &args.pid_file) {
        (Some(pid), _) => engine.attach(Pid::from_raw(pid))?,
        (None, Some(path)) => engine.attach_pid_file(path)?,
        (None, None) => anyhow::bail!("either --pid or --pid-file is required"),
    }
    let pid = engine.pid();
    engine.stop()?;
    if let Some(pid) = pid {
        info!(pid = pid.as_raw(), "stopped");
    }
    Ok(ExitCode::SUCCESS)
}

fn is_timeout(err: &anyhow::Error) -> bool {
    err.downcast_ref::<ProcError>()
        .is_some_and(|e| e.kind() == ErrorKind::Timeout)
}

/// Child exit code as our own: 0-255 pass through, death by signal is 1.
fn exit_byte(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}
