//! Fork/exec. Every unsafe call of the process module lives in this file.

use std::ffi::{CString, c_char};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use nix::errno::Errno;
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::unistd::{fork, ForkResult, Pid};

use super::pipes::PipeSet;
use crate::error::ProcError;
use crate::principal::Credentials;

/// Exit status of a child whose `execv` failed.
pub const EXEC_FAILURE_CODE: i32 = 127;

/// Exit status of a child that could not wire its stdio or switch owner.
pub const SETUP_FAILURE_CODE: i32 = 1;

/// Everything the child needs, resolved before fork.
#[derive(Debug)]
pub struct SpawnRequest<'a> {
    pub program: &'a Path,
    pub argv: &'a [String],
    pub credentials: Option<&'a Credentials>,
}

/// Starts a child attached to a [`PipeSet`].
///
/// The engine only depends on this trait, so tests can substitute launchers
/// that fail or record instead of forking.
pub trait ChildLauncher: Send {
    fn spawn(&self, request: &SpawnRequest<'_>, pipes: &PipeSet) -> Result<Pid, ProcError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ForkLauncher;

impl ChildLauncher for ForkLauncher {
    fn spawn(&self, request: &SpawnRequest<'_>, pipes: &PipeSet) -> Result<Pid, ProcError> {
        let program = c_string(request.program.as_os_str().as_bytes())?;
        let argv = request
            .argv
            .iter()
            .map(|arg| c_string(arg.as_bytes()))
            .collect::<Result<Vec<_>, _>>()?;
        let argv_ptrs: Vec<*const c_char> = argv
            .iter()
            .map(|arg| arg.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();
        let exec_prefix =
            format!("tether: unable to start {}: ", request.program.display()).into_bytes();

        // SAFETY: the child branch touches only memory prepared above and makes
        // async-signal-safe calls until it execs or exits.
        match unsafe { fork() } {
            Err(source) => Err(ProcError::Ipc {
                context: "fork",
                source,
            }),
            Ok(ForkResult::Parent { child }) => Ok(child),
            Ok(ForkResult::Child) => exec_child(
                &program,
                &argv_ptrs,
                request.credentials,
                pipes,
                &exec_prefix,
            ),
        }
    }
}

fn c_string(bytes: &[u8]) -> Result<CString, ProcError> {
    CString::new(bytes).map_err(|_| {
        ProcError::Argument(format!(
            "argument contains a NUL byte: {}",
            String::from_utf8_lossy(bytes)
        ))
    })
}

fn exec_child(
    program: &CString,
    argv: &[*const c_char],
    credentials: Option<&Credentials>,
    pipes: &PipeSet,
    exec_prefix: &[u8],
) -> ! {
    if let Err(errno) = pipes.prepare_child() {
        child_fail(b"tether: unable to wire stdio: ", errno, SETUP_FAILURE_CODE);
    }

    // The parent may ignore SIGPIPE; the child starts with the default.
    // SAFETY: installs SIG_DFL, no handler code runs.
    if let Err(errno) = unsafe { signal(Signal::SIGPIPE, SigHandler::SigDfl) } {
        child_fail(b"tether: unable to reset SIGPIPE: ", errno, SETUP_FAILURE_CODE);
    }

    if let Some(credentials) = credentials {
        if let Err(errno) = credentials.apply() {
            child_fail(b"tether: unable to change process owner: ", errno, SETUP_FAILURE_CODE);
        }
    }

    // SAFETY: both pointers reference NUL-terminated strings that outlive the
    // call, and argv ends with a null pointer.
    unsafe {
        libc::execv(program.as_ptr(), argv.as_ptr());
    }
    child_fail(exec_prefix, Errno::last(), EXEC_FAILURE_CODE)
}

/// Report on the child's stderr (the parent's stderr pipe by now) and exit
/// without running destructors or atexit handlers.
fn child_fail(prefix: &[u8], errno: Errno, code: i32) -> ! {
    write_stderr(prefix);
    write_stderr(errno.desc().as_bytes());
    write_stderr(b"\n");
    // SAFETY: _exit is async-signal-safe and never returns.
    unsafe { libc::_exit(code) }
}

fn write_stderr(bytes: &[u8]) {
    // SAFETY: writes from a valid buffer of the given length.
    unsafe {
        libc::write(libc::STDERR_FILENO, bytes.as_ptr().cast(), bytes.len());
    }
}
