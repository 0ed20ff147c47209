#![forbid(unsafe_code)]

//! Process-level guards for the backend binary.

use anyhow::{Result, bail};
use nix::unistd::Uid;

/// Refuses to start as root. The backend hands attacker-supplied URLs to an
/// external downloader and writes whatever comes back to disk, so it should
/// run under an unprivileged account. `allow_root` exists for containers where
/// uid 0 is already sandboxed.
pub fn ensure_not_root(process: &str, allow_root: bool) -> Result<()> {
    if Uid::current().is_root() && !allow_root {
        bail!("{process} must not be run as root; pass --allow-root inside a sandboxed container");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_root_always_passes() {
        assert!(ensure_not_root("backend", true).is_ok());
    }

    #[test]
    fn non_root_passes_without_override() {
        if !Uid::current().is_root() {
            assert!(ensure_not_root("backend", false).is_ok());
        } else {
            assert!(ensure_not_root("backend", false).is_err());
        }
    }
}
