use std::ffi::CString;
use std::path::PathBuf;

use eyre::Context;
use serde::Deserialize;

/// Control socket section.
#[derive(Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_path")]
    pub path: PathBuf,

    /// Owner of the socket node, numeric or an account name.
    #[serde(default)]
    pub uid: Option<Account>,

    /// Group of the socket node, numeric or a group name.
    #[serde(default)]
    pub gid: Option<Account>,
}

fn default_path() -> PathBuf {
    PathBuf::from("/tmp/ternd.sock")
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
            uid: None,
            gid: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum Account {
    Id(u32),
    Name(String),
}

impl TransportConfig {
    /// Resolve the configured owner, consulting the account databases
    /// for symbolic names. Unresolvable names are fatal.
    pub fn owner(&self) -> eyre::Result<Option<(u32, u32)>> {
        if self.uid.is_none() && self.gid.is_none() {
            return Ok(None);
        }

        let uid = match &self.uid {
            Some(Account::Id(id)) => *id,
            Some(Account::Name(name)) => resolve_user(name)
                .wrap_err_with(|| format!("cannot resolve user {}", name))?,
            // SAFETY: getuid cannot fail.
            None => unsafe { libc::getuid() },
        };
        let gid = match &self.gid {
            Some(Account::Id(id)) => *id,
            Some(Account::Name(name)) => resolve_group(name)
                .wrap_err_with(|| format!("cannot resolve group {}", name))?,
            // SAFETY: getgid cannot fail.
            None => unsafe { libc::getgid() },
        };

        Ok(Some((uid, gid)))
    }
}

fn resolve_user(name: &str) -> eyre::Result<u32> {
    let cname = CString::new(name).wrap_err("user name contains NUL")?;

    // SAFETY: called once at startup, before any threads care about
    // the static passwd buffer.
    let pw = unsafe { libc::getpwnam(cname.as_ptr()) };
    if pw.is_null() {
        eyre::bail!("no such user");
    }
    // SAFETY: non-null result points at a valid passwd record.
    Ok(unsafe { (*pw).pw_uid })
}

fn resolve_group(name: &str) -> eyre::Result<u32> {
    let cname = CString::new(name).wrap_err("group name contains NUL")?;

    // SAFETY: as for `resolve_user`.
    let gr = unsafe { libc::getgrnam(cname.as_ptr()) };
    if gr.is_null() {
        eyre::bail!("no such group");
    }
    // SAFETY: non-null result points at a valid group record.
    Ok(unsafe { (*gr).gr_gid })
}
