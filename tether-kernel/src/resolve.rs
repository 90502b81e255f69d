//! Command name resolution.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use crate::error::ProcError;

/// Resolve a command name to an executable path.
///
/// A name that already points at an executable file is used as given.
/// Otherwise a bare name is looked up in each `PATH` directory in order.
pub fn resolve_command(name: &str) -> Result<PathBuf, ProcError> {
    resolve_in(name, std::env::var_os("PATH").as_deref())
}

/// Like [`resolve_command`], with an explicit search path.
pub fn resolve_in(name: &str, path_var: Option<&OsStr>) -> Result<PathBuf, ProcError> {
    if name.is_empty() {
        return Err(ProcError::CommandNotFound("(empty command name)".into()));
    }

    let literal = Path::new(name);
    if is_executable(literal) {
        return Ok(literal.to_path_buf());
    }

    // Names with a directory part are never searched for
    if name.contains('/') {
        return Err(ProcError::CommandNotFound(name.to_string()));
    }

    if let Some(path_var) = path_var {
        for dir in std::env::split_paths(path_var) {
            let dir = if dir.as_os_str().is_empty() {
                PathBuf::from(".")
            } else {
                dir
            };
            let candidate = dir.join(name);
            if is_executable(&candidate) {
                return Ok(candidate);
            }
        }
    }

    Err(ProcError::CommandNotFound(name.to_string()))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    match path.metadata() {
        Ok(metadata) => metadata.is_file() && metadata.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}
