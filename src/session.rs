//! per-attempt staging paths and their cleanup registration

use std::path::{Component, Path, PathBuf};

use tracing::debug;
use uuid::Uuid;

use crate::cleanup::{CleanupAction, CleanupRegistry, Interrupt};
use crate::error::{Error, IoResultExt, Result};

/// paths owned by a single synchronization attempt
///
/// staging and quarantine directories are hidden siblings of the live
/// repository so that the final renames never cross a filesystem boundary.
#[derive(Debug, Clone)]
pub struct SyncSession {
    basedir: PathBuf,
    tempdir: PathBuf,
    tempdir_old: PathBuf,
    archive: PathBuf,
    interrupt: Interrupt,
}

impl SyncSession {
    /// start a session for the repository at `basedir`
    ///
    /// allocates the download file (in `temp_root`, or the system temp
    /// directory) and schedules removal of both it and the staging
    /// directory before anything is written to them. no directories are
    /// created here.
    pub fn begin(
        basedir: &Path,
        temp_root: Option<&Path>,
        cleanup: &CleanupRegistry,
    ) -> Result<Self> {
        let basedir = normalize(basedir);
        let (tempdir, tempdir_old) = staging_paths(&basedir)?;

        let archive = allocate_archive(temp_root)?;
        cleanup.register(CleanupAction::RemoveFile(archive.clone()));
        cleanup.register(CleanupAction::RemoveDir(tempdir.clone()));

        debug!(
            "session for {}: staging {}, download {}",
            basedir.display(),
            tempdir.display(),
            archive.display()
        );

        Ok(Self {
            basedir,
            tempdir,
            tempdir_old,
            archive,
            interrupt: cleanup.interrupt().clone(),
        })
    }

    /// live repository path, without trailing separators
    pub fn basedir(&self) -> &Path {
        &self.basedir
    }

    /// staging directory for the new tree
    pub fn tempdir(&self) -> &Path {
        &self.tempdir
    }

    /// quarantine path for the previous tree
    pub fn tempdir_old(&self) -> &Path {
        &self.tempdir_old
    }

    /// path the archive is downloaded to
    pub fn archive(&self) -> &Path {
        &self.archive
    }

    /// raised when the sync should stop
    pub fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }
}

/// generate fresh staging and quarantine paths beside `basedir`
///
/// for `/repos/foo` these are `/repos/.foo.update.<hex>` and
/// `/repos/.foo.old.<hex>`, each with its own random v4 uuid.
pub fn staging_paths(basedir: &Path) -> Result<(PathBuf, PathBuf)> {
    let basedir = normalize(basedir);
    let name = basedir
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::InvalidBasedir(basedir.clone()))?;
    let parent = basedir.parent().unwrap_or_else(|| Path::new(""));

    let update = parent.join(format!(".{}.update.{}", name, Uuid::new_v4().simple()));
    let old = parent.join(format!(".{}.old.{}", name, Uuid::new_v4().simple()));

    Ok((update, old))
}

/// drop trailing separators and `.` components
fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

fn allocate_archive(temp_root: Option<&Path>) -> Result<PathBuf> {
    let builder = {
        let mut b = tempfile::Builder::new();
        b.prefix("tarsync-");
        b
    };

    let file = match temp_root {
        Some(dir) => builder.tempfile_in(dir).with_path(dir)?,
        None => builder.tempfile().with_path(std::env::temp_dir())?,
    };

    file.into_temp_path()
        .keep()
        .map_err(|e| Error::Io {
            path: e.path.to_path_buf(),
            source: e.error,
        })
}
