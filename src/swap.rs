//! promoting the staged tree to the live repository path

use std::fs;
use std::path::Path;

use tracing::{error, info};

use crate::cleanup::{CleanupAction, CleanupRegistry};
use crate::error::{IoResultExt, Result, SyncError};
use crate::session::SyncSession;

/// how the live path was replaced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapOutcome {
    /// the previous tree was moved to the quarantine path
    Replaced,
    /// no tree existed at the live path yet
    Bootstrapped,
}

/// move the live tree aside and rename the staged tree into its place
///
/// the two renames run back to back; between them the live path does not
/// exist. if the second rename fails the previous tree is left at the
/// quarantine path and the live path stays absent, which needs manual
/// recovery. removal of the quarantined tree is scheduled only once both
/// renames succeeded.
pub fn commit(session: &SyncSession, cleanup: &CleanupRegistry) -> Result<SwapOutcome> {
    let basedir = session.basedir();
    let tempdir = session.tempdir();
    let tempdir_old = session.tempdir_old();

    if fs::symlink_metadata(basedir).is_err() {
        // first sync: nothing to move aside
        if let Some(parent) = basedir.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_path(parent)?;
        }
        rename(tempdir, basedir)?;
        info!("created repo at {}", basedir.display());
        return Ok(SwapOutcome::Bootstrapped);
    }

    rename(basedir, tempdir_old)?;
    if let Err(e) = rename(tempdir, basedir) {
        error!(
            "repo {} is missing, previous tree left at {}",
            basedir.display(),
            tempdir_old.display()
        );
        return Err(e);
    }

    cleanup.register(CleanupAction::RemoveDir(tempdir_old.to_path_buf()));
    info!("updated repo at {}", basedir.display());
    Ok(SwapOutcome::Replaced)
}

fn rename(from: &Path, to: &Path) -> Result<()> {
    fs::rename(from, to).map_err(|source| {
        SyncError::Swap {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
            source,
        }
        .into()
    })
}
