//! Identity a child process runs as.

use nix::unistd::{Gid, Uid, User};

use crate::error::ProcError;

/// Something that can name a user identity: uid, primary gid and the full
/// supplementary group list.
pub trait Principal {
    fn uid(&self) -> Uid;
    fn gid(&self) -> Gid;
    fn supplementary_groups(&self) -> Vec<Gid>;
}

/// Owned snapshot of a [`Principal`], taken before fork so the child never
/// has to allocate or consult the user database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub uid: Uid,
    pub gid: Gid,
    pub groups: Vec<Gid>,
}

impl Credentials {
    pub fn from_principal(principal: &dyn Principal) -> Self {
        Self {
            uid: principal.uid(),
            gid: principal.gid(),
            groups: principal.supplementary_groups(),
        }
    }

    /// Switch the calling process to these credentials.
    ///
    /// Groups go first; after `setuid` the process may no longer be allowed
    /// to change them.
    pub(crate) fn apply(&self) -> nix::Result<()> {
        #[cfg(not(any(target_os = "macos", target_os = "ios")))]
        nix::unistd::setgroups(&self.groups)?;
        nix::unistd::setgid(self.gid)?;
        nix::unistd::setuid(self.uid)?;
        Ok(())
    }
}

impl Principal for Credentials {
    fn uid(&self) -> Uid {
        self.uid
    }

    fn gid(&self) -> Gid {
        self.gid
    }

    fn supplementary_groups(&self) -> Vec<Gid> {
        self.groups.clone()
    }
}

/// A user from the system account database.
#[derive(Debug, Clone)]
pub struct SystemUser {
    name: String,
    uid: Uid,
    gid: Gid,
    groups: Vec<Gid>,
}

impl SystemUser {
    pub fn lookup(name: &str) -> Result<Self, ProcError> {
        let user = User::from_name(name)
            .map_err(|e| ProcError::Principal(format!("lookup of {name} failed: {e}")))?
            .ok_or_else(|| ProcError::Principal(format!("unknown user: {name}")))?;
        Self::from_user(user)
    }

    /// The user the current process runs as.
    pub fn current() -> Result<Self, ProcError> {
        let uid = nix::unistd::getuid();
        let user = User::from_uid(uid)
            .map_err(|e| ProcError::Principal(format!("lookup of uid {uid} failed: {e}")))?
            .ok_or_else(|| ProcError::Principal(format!("no account for uid {uid}")))?;
        Self::from_user(user)
    }

    fn from_user(user: User) -> Result<Self, ProcError> {
        let groups = group_list(&user)?;
        Ok(Self {
            name: user.name,
            uid: user.uid,
            gid: user.gid,
            groups,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Principal for SystemUser {
    fn uid(&self) -> Uid {
        self.uid
    }

    fn gid(&self) -> Gid {
        self.gid
    }

    fn supplementary_groups(&self) -> Vec<Gid> {
        self.groups.clone()
    }
}

#[cfg(target_os = "linux")]
fn group_list(user: &User) -> Result<Vec<Gid>, ProcError> {
    let name = std::ffi::CString::new(user.name.as_str())
        .map_err(|_| ProcError::Principal(format!("invalid user name: {:?}", user.name)))?;
    nix::unistd::getgrouplist(&name, user.gid)
        .map_err(|e| ProcError::Principal(format!("group list for {} failed: {e}", user.name)))
}

#[cfg(not(target_os = "linux"))]
fn group_list(user: &User) -> Result<Vec<Gid>, ProcError> {
    Ok(vec![user.gid])
}
