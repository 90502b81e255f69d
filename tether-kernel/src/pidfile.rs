//! Plain-text pid files: one decimal pid, optional trailing whitespace.

use std::fs;
use std::path::Path;

use nix::unistd::Pid;

use crate::error::ProcError;

pub fn read_pid_file(path: &Path) -> Result<Pid, ProcError> {
    let contents = fs::read_to_string(path).map_err(|e| ProcError::InvalidPidFile {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    parse_pid(&contents).ok_or_else(|| ProcError::InvalidPidFile {
        path: path.to_path_buf(),
        reason: format!("expected a positive pid, found {:?}", contents.trim()),
    })
}

pub fn write_pid_file(path: &Path, pid: Pid) -> Result<(), ProcError> {
    fs::write(path, format!("{pid}\n"))?;
    Ok(())
}

fn parse_pid(contents: &str) -> Option<Pid> {
    let token = contents.split_whitespace().next()?;
    match token.parse::<i32>() {
        Ok(raw) if raw > 0 => Some(Pid::from_raw(raw)),
        _ => None,
    }
}
