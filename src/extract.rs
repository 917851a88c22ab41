//! unpacking a downloaded tarball into the staging directory
//!
//! distributed tarballs wrap their content in a single top-level directory
//! whose name carries no meaning, so every extractor drops exactly one
//! leading path component from each member.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Component, Path, PathBuf};
use std::process::{Command, Stdio};
use std::str::FromStr;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cleanup::Interrupt;
use crate::error::{Error, Result, SyncError};
use crate::session::SyncSession;
use crate::uri::Compression;

/// number of leading path components dropped from archive members
pub const STRIP_COMPONENTS: usize = 1;

/// how often a running tar child is checked for exit or interrupt
const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// capability to unpack a compressed tarball into a directory
pub trait Extractor: Send + Sync {
    /// short name used in logs
    fn name(&self) -> &'static str;

    /// unpack `archive` into the existing directory `dest`
    ///
    /// stops with `Error::Interrupted` once `interrupt` is raised, with no
    /// writer left running in `dest`.
    fn extract(
        &self,
        archive: &Path,
        compression: Compression,
        dest: &Path,
        interrupt: &Interrupt,
    ) -> Result<()>;
}

/// create the session's staging directory
pub fn create_staging(session: &SyncSession) -> Result<()> {
    let tempdir = session.tempdir();
    fs::create_dir_all(tempdir).map_err(|source| SyncError::CreateStaging {
        path: tempdir.to_path_buf(),
        source,
    })?;
    Ok(())
}

/// create the session's staging directory and unpack the archive into it
pub fn stage(
    session: &SyncSession,
    compression: Compression,
    extractor: &dyn Extractor,
) -> Result<()> {
    create_staging(session)?;
    unpack(session, compression, extractor)
}

/// unpack the session's archive into its existing staging directory
pub fn unpack(
    session: &SyncSession,
    compression: Compression,
    extractor: &dyn Extractor,
) -> Result<()> {
    let tempdir = session.tempdir();
    info!(
        "unpacking {} ({}) with {} into {}",
        session.archive().display(),
        compression,
        extractor.name(),
        tempdir.display()
    );
    extractor.extract(session.archive(), compression, tempdir, session.interrupt())
}

/// extracts by running the system `tar` binary
#[derive(Debug, Clone)]
pub struct TarCommand {
    program: PathBuf,
}

impl TarCommand {
    pub fn new() -> Self {
        Self::with_program("tar")
    }

    /// use a specific tar executable
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self, archive: &Path, compression: Compression, dest: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("--extract")
            .arg(format!("--{}", compression.name()))
            .arg("-f")
            .arg(archive)
            .arg(format!("--strip-components={STRIP_COMPONENTS}"))
            .arg("-C")
            .arg(dest);
        cmd
    }
}

impl Default for TarCommand {
    fn default() -> Self {
        Self::new()
    }
}

impl Extractor for TarCommand {
    fn name(&self) -> &'static str {
        "tar"
    }

    fn extract(
        &self,
        archive: &Path,
        compression: Compression,
        dest: &Path,
        interrupt: &Interrupt,
    ) -> Result<()> {
        interrupt.check()?;
        let mut cmd = self.command(archive, compression, dest);
        debug!("running {:?}", cmd);

        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                unpack_error(
                    archive,
                    format!("failed to run {}: {e}", self.program.display()),
                )
            })?;

        // drained on its own thread so a chatty tar cannot block on a full pipe
        let stderr = child.stderr.take().map(|mut pipe| {
            thread::spawn(move || {
                let mut buf = Vec::new();
                pipe.read_to_end(&mut buf).map(|_| buf)
            })
        });

        let status = loop {
            if let Some(status) = child.try_wait().map_err(|e| unpack_error(archive, e))? {
                break status;
            }
            if interrupt.is_triggered() {
                // the child may have exited since try_wait; either way it is reaped
                if let Err(e) = child.kill() {
                    debug!("killing {}: {}", self.program.display(), e);
                }
                child.wait().map_err(|e| unpack_error(archive, e))?;
                return Err(Error::Interrupted);
            }
            thread::sleep(CHILD_POLL_INTERVAL);
        };

        if !status.success() {
            let stderr = stderr
                .and_then(|handle| handle.join().ok())
                .and_then(|read| read.ok())
                .unwrap_or_default();
            let stderr = String::from_utf8_lossy(&stderr);
            let stderr = stderr.trim();
            let message = if stderr.is_empty() {
                status.to_string()
            } else {
                format!("{}: {}", status, stderr)
            };
            return Err(unpack_error(archive, message));
        }

        Ok(())
    }
}

/// extracts in-process with the `tar` crate
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeExtractor;

impl Extractor for NativeExtractor {
    fn name(&self) -> &'static str {
        "native"
    }

    fn extract(
        &self,
        archive: &Path,
        compression: Compression,
        dest: &Path,
        interrupt: &Interrupt,
    ) -> Result<()> {
        let file = File::open(archive).map_err(|e| unpack_error(archive, e))?;
        let reader = BufReader::new(file);
        let decoder: Box<dyn Read> = match compression {
            Compression::Gzip => Box::new(flate2::read::MultiGzDecoder::new(reader)),
            Compression::Bzip2 => Box::new(bzip2::read::BzDecoder::new(reader)),
            Compression::Xz => Box::new(xz2::read::XzDecoder::new(reader)),
        };

        let mut tarball = tar::Archive::new(decoder);
        tarball.set_preserve_permissions(true);

        let entries = tarball.entries().map_err(|e| unpack_error(archive, e))?;
        let mut unpacked = 0usize;

        for entry in entries {
            interrupt.check()?;
            let mut entry = entry.map_err(|e| unpack_error(archive, e))?;
            let member = entry
                .path()
                .map_err(|e| unpack_error(archive, e))?
                .into_owned();

            let Some(relative) = strip_member(&member, STRIP_COMPONENTS) else {
                continue;
            };
            if !is_contained(&relative) {
                return Err(unpack_error(
                    archive,
                    format!("member escapes target directory: {}", member.display()),
                ));
            }

            // a symlink unpacked earlier must never be written through
            if crosses_symlink(dest, &relative).map_err(|e| unpack_error(archive, e))? {
                return Err(unpack_error(
                    archive,
                    format!("member escapes target directory via symlink: {}", member.display()),
                ));
            }

            let target = dest.join(&relative);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| unpack_error(archive, e))?;
            }
            if fs::symlink_metadata(&target).is_ok_and(|m| m.file_type().is_symlink()) {
                fs::remove_file(&target).map_err(|e| unpack_error(archive, e))?;
            }

            if entry.header().entry_type().is_hard_link() {
                // link names are archive paths and need the same stripping
                let link = entry
                    .link_name()
                    .map_err(|e| unpack_error(archive, e))?
                    .and_then(|l| strip_member(&l, STRIP_COMPONENTS))
                    .filter(|l| is_contained(l))
                    .filter(|l| matches!(crosses_symlink(dest, l), Ok(false)))
                    .ok_or_else(|| {
                        unpack_error(
                            archive,
                            format!("bad hardlink target for {}", member.display()),
                        )
                    })?;
                fs::hard_link(dest.join(link), &target).map_err(|e| unpack_error(archive, e))?;
            } else {
                entry.unpack(&target).map_err(|e| unpack_error(archive, e))?;
            }
            unpacked += 1;
        }

        debug!("unpacked {} members from {}", unpacked, archive.display());
        Ok(())
    }
}

/// which extractor implementation to use
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractorKind {
    #[default]
    Tar,
    Native,
}

impl ExtractorKind {
    pub fn build(self) -> Box<dyn Extractor> {
        match self {
            ExtractorKind::Tar => Box::new(TarCommand::new()),
            ExtractorKind::Native => Box::new(NativeExtractor),
        }
    }
}

impl FromStr for ExtractorKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "tar" => Ok(ExtractorKind::Tar),
            "native" => Ok(ExtractorKind::Native),
            _ => Err(Error::UnknownExtractor(s.to_string())),
        }
    }
}

impl fmt::Display for ExtractorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractorKind::Tar => f.write_str("tar"),
            ExtractorKind::Native => f.write_str("native"),
        }
    }
}

/// drop `n` leading components; None when nothing remains
fn strip_member(path: &Path, n: usize) -> Option<PathBuf> {
    let stripped: PathBuf = path
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .skip(n)
        .collect();

    if stripped.as_os_str().is_empty() {
        None
    } else {
        Some(stripped)
    }
}

/// relative path that cannot climb out of its base
fn is_contained(path: &Path) -> bool {
    path.components().all(|c| matches!(c, Component::Normal(_)))
}

/// whether any existing parent of `relative` under `dest` is a symlink
fn crosses_symlink(dest: &Path, relative: &Path) -> io::Result<bool> {
    let Some(parent) = relative.parent() else {
        return Ok(false);
    };

    let mut current = dest.to_path_buf();
    for component in parent.components() {
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => return Ok(true),
            Ok(_) => {}
            // nothing below a missing directory can be a symlink yet
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        }
    }
    Ok(false)
}

fn unpack_error(archive: &Path, message: impl fmt::Display) -> Error {
    SyncError::Unpack {
        archive: archive.to_path_buf(),
        message: message.to_string(),
    }
    .into()
}
