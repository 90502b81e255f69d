//! Integration tests for the process engine.
//!
//! These run real commands (`sh`, `sleep`, `cat`, `printf`) through the
//! fork/exec path and check exit codes, captured output, stdin plumbing,
//! timeouts and the termination of children and attached daemons.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::process::Command;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use tempfile::TempDir;
use tether_kernel::pidfile::write_pid_file;
use tether_kernel::process::{EXEC_FAILURE_CODE, SIGNALED_EXIT_CODE};
use tether_kernel::{
    Credentials, EngineConfig, ErrorKind, Pid, PipeSize, ProcError, ProcessEngine, ProcessState,
};

/// Fast-polling config with large rings, so tests do not idle.
fn config() -> EngineConfig {
    EngineConfig {
        poll_interval: Duration::from_millis(10),
        ..EngineConfig::default()
    }
    .with_pipe_size(PipeSize::Large)
}

fn shell(script: &str) -> ProcessEngine {
    let mut engine = ProcessEngine::with_config("sh", config()).expect("sh should resolve");
    engine.push_arg("-c");
    engine.push_quoted_arg(script);
    engine
}

fn drain_string(engine: &mut ProcessEngine, stderr: bool) -> String {
    let mut out = String::new();
    let ring = if stderr {
        engine.stderr_mut()
    } else {
        engine.stdout_mut()
    };
    ring.read_into_string(&mut out);
    out
}

fn is_alive(pid: Pid) -> bool {
    !matches!(kill(pid, None), Err(Errno::ESRCH))
}

#[test]
fn test_exit_code_propagates() {
    let mut engine = shell("exit 10");
    assert_eq!(engine.execute_once().unwrap(), 10);
    assert_eq!(engine.last_exit_code(), 10);
    assert_eq!(engine.state(), ProcessState::Idle);
    assert!(engine.duration().is_some());

    let mut engine = shell("true");
    assert_eq!(engine.execute_once().unwrap(), 0);
}

#[test]
fn test_death_by_signal_reports_sentinel() {
    let mut engine = shell("kill -KILL $$");
    assert_eq!(engine.execute_once().unwrap(), SIGNALED_EXIT_CODE);
}

#[test]
fn test_output_is_captured_per_stream() {
    let mut engine = shell("echo one; echo two >&2; echo three");
    assert_eq!(engine.execute_once().unwrap(), 0);

    let mut line = [0u8; 64];
    let n = engine.stdout_mut().read_line(&mut line, false).unwrap().unwrap();
    assert_eq!(&line[..n], b"one");
    let n = engine.stdout_mut().read_line(&mut line, false).unwrap().unwrap();
    assert_eq!(&line[..n], b"three");
    assert_eq!(engine.stdout_mut().read_line(&mut line, true).unwrap(), None);

    assert_eq!(drain_string(&mut engine, true), "two\n");
}

#[test]
fn test_small_ring_keeps_up_while_polling() {
    let config = EngineConfig {
        poll_interval: Duration::from_millis(5),
        ..EngineConfig::default()
    }
    .with_pipe_size(PipeSize::Small);
    let mut engine = ProcessEngine::with_config("sh", config).unwrap();
    engine.push_arg("-c");
    engine.push_quoted_arg("i=0; while [ $i -lt 500 ]; do echo line$i; i=$((i+1)); done; sleep 1");

    engine.start().unwrap();
    let mut lines = Vec::new();
    let mut buf = [0u8; 256];
    loop {
        let running = engine.is_running().unwrap();
        while let Some(n) = engine.stdout_mut().read_line(&mut buf, false).unwrap() {
            lines.push(String::from_utf8_lossy(&buf[..n]).into_owned());
        }
        if !running {
            break;
        }
    }

    assert_eq!(lines.len(), 500);
    for (i, line) in lines.iter().enumerate() {
        assert_eq!(line, &format!("line{i}"));
    }
}

#[test]
fn test_output_beyond_ring_and_pipe_survives_exit() {
    // 256-byte ring plus a 64 KiB pipe hold far less than the child writes
    let config = EngineConfig {
        poll_interval: Duration::from_millis(5),
        ..EngineConfig::default()
    }
    .with_pipe_size(PipeSize::Small);
    let mut engine = ProcessEngine::with_config("head", config).unwrap();
    engine.set_args("-c 100000 /dev/zero");

    engine.start().unwrap();
    let mut output = Vec::new();
    loop {
        let running = engine.is_running().unwrap();
        engine.stdout_mut().read_into_vec(&mut output);
        if !running {
            break;
        }
    }

    assert_eq!(output.len(), 100_000);
    assert!(output.iter().all(|&b| b == 0));
    assert_eq!(engine.wait().unwrap(), 0);
}

#[test]
fn test_wait_without_consuming_still_returns() {
    let mut engine = shell("head -c 60000 /dev/zero");
    assert_eq!(engine.execute_once().unwrap(), 0);
    assert!(engine.stdout().is_full());
    assert_eq!(engine.state(), ProcessState::Idle);
    assert_eq!(engine.pid(), None);
}

#[test]
fn test_zero_capacity_discards_without_blocking() {
    let mut engine = ProcessEngine::new("sh").unwrap();
    engine.config_mut().poll_interval = Duration::from_millis(10);
    // far more than a pipe holds; the child would block if nobody read
    engine.set_args("-c 'head -c 300000 /dev/zero'");
    assert_eq!(engine.execute_once().unwrap(), 0);
    assert!(engine.stdout().is_empty());
}

#[test]
fn test_quoted_arguments_reach_the_child() {
    let mut engine = ProcessEngine::with_config("printf", config()).unwrap();
    engine.set_args(
        "'%s\\n' samis\\' \\'  'world for peace'  \"one's heart\".. 'dude\\'s pants' on fire",
    );
    assert_eq!(engine.execute_once().unwrap(), 0);
    assert_eq!(
        drain_string(&mut engine, false),
        "samis'\n'\nworld for peace\none's heart..\ndude's pants\non\nfire\n"
    );
}

#[test]
fn test_execute_appended_restores_args() {
    let mut engine = ProcessEngine::with_config("echo", config()).unwrap();
    engine.set_args("first");
    assert_eq!(engine.execute_appended("second").unwrap(), 0);
    assert_eq!(drain_string(&mut engine, false), "first second\n");
    assert_eq!(engine.args(), "first");

    assert_eq!(engine.execute_with("other").unwrap(), 0);
    assert_eq!(drain_string(&mut engine, false), "other\n");
}

#[test]
fn test_stdin_bytes_are_fed() {
    let mut engine = ProcessEngine::with_config("cat", config()).unwrap();
    engine.set_stdin_bytes(b"hello\nworld\n".to_vec());
    assert_eq!(engine.execute_once().unwrap(), 0);
    assert_eq!(drain_string(&mut engine, false), "hello\nworld\n");
}

#[test]
fn test_stdin_file_is_fed() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("input.txt");
    fs::write(&input, "from a file\n").unwrap();

    let mut engine = ProcessEngine::with_config("cat", config()).unwrap();
    engine.set_stdin_file(&input);
    assert_eq!(engine.execute_once().unwrap(), 0);
    assert_eq!(drain_string(&mut engine, false), "from a file\n");
}

#[test]
fn test_close_stdin_releases_blocked_reader() {
    let mut engine = ProcessEngine::with_config("cat", config()).unwrap();
    engine.start().unwrap();
    assert_eq!(engine.write_stdin(b"ping\n").unwrap(), 5);
    assert!(engine.is_running().unwrap());

    engine.close_stdin();
    engine.close_stdin();
    assert_eq!(engine.wait().unwrap(), 0);
    assert_eq!(drain_string(&mut engine, false), "ping\n");
}

#[test]
fn test_child_ignoring_stdin() {
    let mut engine = shell("exit 0");
    engine.set_stdin_bytes(vec![b'x'; 200_000]);
    assert_eq!(engine.execute_once().unwrap(), 0);
}

#[test]
fn test_query() {
    let mut engine = ProcessEngine::new("tr").unwrap();
    engine.config_mut().poll_interval = Duration::from_millis(10);
    engine.set_args("a-z A-Z");
    let answer = engine.query(b"shout this").unwrap();
    assert_eq!(answer, b"SHOUT THIS");
    assert_eq!(engine.last_exit_code(), 0);
    assert_eq!(engine.stdout().capacity(), tether_pump::LARGE_CAPACITY);
}

#[test]
fn test_capture() {
    let output = ProcessEngine::capture("echo", "captured output").unwrap();
    assert_eq!(output, "captured output\n");

    let err = ProcessEngine::capture("sh", "-c 'echo partial; exit 4'").unwrap_err();
    match err {
        ProcError::NonZeroExit { code, output, .. } => {
            assert_eq!(code, 4);
            assert_eq!(output, "partial\n");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn test_capture_collects_everything() {
    let output = ProcessEngine::capture("head", "-c 200000 /dev/zero").unwrap();
    assert_eq!(output.len(), 200_000);
}

#[test]
fn test_capture_with_heavy_stderr() {
    let output = ProcessEngine::capture("sh", "-c 'head -c 200000 /dev/zero >&2; echo ok'").unwrap();
    assert_eq!(output, "ok\n");
}

#[test]
fn test_query_input_larger_than_pipes() {
    let mut engine = ProcessEngine::new("cat").unwrap();
    engine.config_mut().poll_interval = Duration::from_millis(10);
    let input = vec![b'a'; 300_000];
    let answer = engine.query(&input).unwrap();
    assert_eq!(answer.len(), input.len());
    assert!(answer.iter().all(|&b| b == b'a'));
}

#[test]
fn test_query_with_heavy_stderr() {
    let mut engine = shell("head -c 200000 /dev/zero >&2; tr a-z A-Z; echo tail >&2");
    let answer = engine.query(b"quiet").unwrap();
    assert_eq!(answer, b"QUIET");

    let mut stderr = String::new();
    engine.stderr_mut().read_into_string(&mut stderr);
    assert!(stderr.ends_with("tail\n"));
}

#[test]
fn test_nonzero_exit_as_error() {
    let mut engine = shell("echo failed >&2; exit 3");
    engine.config_mut().nonzero_exit_is_error = true;
    let err = engine.execute_once().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NonZeroExit);
    match err {
        ProcError::NonZeroExit { code, output, .. } => {
            assert_eq!(code, 3);
            assert_eq!(output, "failed\n");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(engine.last_exit_code(), 3);
}

#[test]
fn test_timeout_kills_child() {
    let mut engine = ProcessEngine::with_config("sleep", config()).unwrap();
    engine.set_timeout(Some(Duration::from_secs(1)));
    engine.set_args("5");

    let start = Instant::now();
    engine.start().unwrap();
    let pid = engine.pid().unwrap();
    let err = engine.wait().unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(start.elapsed() < Duration::from_secs(3));
    assert_eq!(engine.state(), ProcessState::TimedOut);
    assert_eq!(engine.last_exit_code(), SIGNALED_EXIT_CODE);
    assert_eq!(engine.pid(), None);
    assert!(!is_alive(pid));
}

#[test]
fn test_stop_running_child() {
    let mut engine = ProcessEngine::with_config("sleep", config()).unwrap();
    engine.start_with("30").unwrap();
    let pid = engine.pid().unwrap();
    assert!(engine.is_running().unwrap());

    let start = Instant::now();
    engine.stop().unwrap();
    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(engine.state(), ProcessState::Killed);
    assert_eq!(engine.last_exit_code(), SIGNALED_EXIT_CODE);
    assert!(!is_alive(pid));

    // nothing left to stop
    engine.stop().unwrap();
}

#[test]
fn test_start_replaces_running_child() {
    let mut engine = ProcessEngine::with_config("sleep", config()).unwrap();
    engine.start_with("30").unwrap();
    let first = engine.pid().unwrap();

    engine.start().unwrap();
    let second = engine.pid().unwrap();
    assert_ne!(first, second);
    assert!(!is_alive(first));
    assert_eq!(engine.state(), ProcessState::Running);
    engine.stop().unwrap();
}

#[test]
fn test_drop_stops_running_child() {
    let mut engine = ProcessEngine::with_config("sleep", config()).unwrap();
    engine.start_with("30").unwrap();
    let pid = engine.pid().unwrap();
    drop(engine);
    assert!(!is_alive(pid));
}

#[test]
fn test_daemon_mode_child_survives_drop() {
    let mut engine = ProcessEngine::with_config("sleep", config()).unwrap();
    engine.set_daemon(true);
    engine.start_with("30").unwrap();
    let pid = engine.pid().unwrap();
    drop(engine);

    assert_eq!(
        waitpid(pid, Some(WaitPidFlag::WNOHANG)).unwrap(),
        WaitStatus::StillAlive
    );
    kill(pid, Signal::SIGKILL).unwrap();
    assert!(matches!(
        waitpid(pid, None).unwrap(),
        WaitStatus::Signaled(_, Signal::SIGKILL, _)
    ));
}

#[test]
fn test_daemon_mode_child_can_still_be_stopped() {
    let mut engine = ProcessEngine::with_config("sleep", config()).unwrap();
    engine.set_daemon(true);
    engine.start_with("30").unwrap();
    let pid = engine.pid().unwrap();
    engine.stop().unwrap();
    assert!(!is_alive(pid));
    assert_eq!(engine.state(), ProcessState::Killed);
}

#[test]
fn test_exec_failure_is_reported_on_stderr() {
    let dir = TempDir::new().unwrap();
    let bogus = dir.path().join("not-a-binary");
    // no shebang and no binary header: execv fails with ENOEXEC
    fs::write(&bogus, "plain text\n").unwrap();
    fs::set_permissions(&bogus, fs::Permissions::from_mode(0o755)).unwrap();

    let mut engine = ProcessEngine::with_config(bogus.to_str().unwrap(), config()).unwrap();
    assert_eq!(engine.execute_once().unwrap(), EXEC_FAILURE_CODE);
    let stderr = drain_string(&mut engine, true);
    assert!(stderr.contains("unable to start"), "stderr was {stderr:?}");
}

#[test]
fn test_unknown_command() {
    let err = ProcessEngine::new("no-such-command-3b9f").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CommandNotFound);
}

#[test]
fn test_attach_pid_file_then_stop() {
    let dir = TempDir::new().unwrap();
    let pid_file = dir.path().join("daemon.pid");
    let daemon = Command::new("sleep").arg("30").spawn().unwrap();
    let pid = Pid::from_raw(daemon.id() as i32);
    write_pid_file(&pid_file, pid).unwrap();

    let mut engine = ProcessEngine::default();
    engine.config_mut().poll_interval = Duration::from_millis(10);
    engine.attach_pid_file(&pid_file).unwrap();
    assert_eq!(engine.state(), ProcessState::Daemon);
    assert_eq!(engine.pid(), Some(pid));
    assert!(engine.is_running().unwrap());
    // attached processes have no pipes
    assert_eq!(engine.write_stdin(b"ignored").unwrap(), 0);

    engine.stop().unwrap();
    assert_eq!(engine.state(), ProcessState::Idle);
    assert!(!is_alive(pid));
    assert!(!engine.is_running().unwrap());
}

#[test]
fn test_attach_missing_process() {
    let mut engine = ProcessEngine::default();
    let err = engine.attach(Pid::from_raw(99_999_999)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProcessNotFound);

    let dir = TempDir::new().unwrap();
    let pid_file = dir.path().join("bad.pid");
    fs::write(&pid_file, "not a pid\n").unwrap();
    let err = engine.attach_pid_file(&pid_file).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidPidFile);
}

#[test]
fn test_dropping_engine_leaves_daemon_running() {
    let mut daemon = Command::new("sleep").arg("30").spawn().unwrap();
    let pid = Pid::from_raw(daemon.id() as i32);

    let mut engine = ProcessEngine::default();
    engine.attach(pid).unwrap();
    drop(engine);
    assert!(is_alive(pid));

    daemon.kill().unwrap();
    daemon.wait().unwrap();
}

#[test]
fn test_owner_switch_to_self() {
    if !nix::unistd::getuid().is_root() {
        // switching groups needs privileges
        return;
    }
    let creds = Credentials {
        uid: nix::unistd::getuid(),
        gid: nix::unistd::getgid(),
        groups: vec![nix::unistd::getgid()],
    };
    let mut engine = ProcessEngine::with_config("id", config()).unwrap();
    engine.set_owner(&creds);
    engine.set_args("-u");
    assert_eq!(engine.execute_once().unwrap(), 0);
    assert_eq!(drain_string(&mut engine, false).trim(), "0");
}
