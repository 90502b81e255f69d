//! Tether Kernel - single-child process supervision.
//!
//! This crate runs one external command at a time and keeps hold of it:
//! - Command resolution against `PATH`
//! - Argument tokenizing with shell-like quoting
//! - Fork/exec with stdin, stdout and stderr on pipes
//! - Non-blocking output capture into ring buffers
//! - Timeouts and TERM -> KILL escalation
//! - Attaching to daemons by pid or pid file
//! - Running as another user

pub mod args;
pub mod config;
pub mod pidfile;
pub mod principal;
pub mod process;
pub mod resolve;

mod error;

pub use args::ArgTokenizer;
pub use config::{EngineConfig, EscalationPolicy, PipeSize};
pub use error::{ErrorKind, ProcError};
pub use principal::{Credentials, Principal, SystemUser};
pub use process::{ChildLauncher, ForkLauncher, PipeSet, ProcessEngine, ProcessState};

pub use nix::unistd::Pid;
pub use tether_pump::{ByteSink, RingBuffer, RingError};
