#![forbid(unsafe_code)]

//! Privilege checks for the tubecast server.

use anyhow::{Result, bail};
use nix::unistd::Uid;

/// Fails fast when the server is started as root. The downloads directory
/// and the SQLite file should belong to a regular service account, never to
/// the superuser.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!("{process} must not be run as root; use a regular user or a dedicated service account");
    }
    Ok(())
}
