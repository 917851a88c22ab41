//! the synchronization state machine and syncer selection
//!
//! a sync attempt walks `Idle -> Validating -> Fetching -> Staging ->
//! Extracting -> Swapping -> Done`. any failure stops the attempt where it
//! happened and is returned to the caller; nothing is retried. temporary
//! paths are handed to the cleanup registry as they are allocated, so an
//! aborted attempt leaves nothing behind once the registry runs.
//!
//! the registry's interrupt flag is checked before every transition. once
//! `Swapping` is entered the two renames always run to completion.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::checksum::{self, Sha256Digest};
use crate::cleanup::CleanupRegistry;
use crate::error::{Error, Result};
use crate::extract::{self, Extractor, ExtractorKind};
use crate::fetch::{Fetcher, HttpFetcher, DEFAULT_USER_AGENT};
use crate::session::SyncSession;
use crate::swap::{self, SwapOutcome};
use crate::uri::SourceUri;

/// stage of a sync attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Validating,
    Fetching,
    Staging,
    Extracting,
    Swapping,
    Done,
    Failed,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncState::Idle => "idle",
            SyncState::Validating => "validating",
            SyncState::Fetching => "fetching",
            SyncState::Staging => "staging",
            SyncState::Extracting => "extracting",
            SyncState::Swapping => "swapping",
            SyncState::Done => "done",
            SyncState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// settings shared by every sync, the `[sync]` config section
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncOptions {
    /// where archives are downloaded; system temp dir when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_dir: Option<PathBuf>,
    pub extractor: ExtractorKind,
    /// whole-download timeout; 0 disables it
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            temp_dir: None,
            extractor: ExtractorKind::default(),
            timeout_secs: crate::fetch::DEFAULT_TIMEOUT.as_secs(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl SyncOptions {
    /// download timeout, `None` when disabled
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

/// a repository sync implementation
pub trait Syncer {
    /// check a raw uri and turn it into a fetchable source
    fn validate(&self, raw_uri: &str) -> Result<SourceUri>;

    /// download the source into the session's archive path
    fn fetch(&self, uri: &SourceUri, session: &SyncSession) -> Result<u64>;

    /// unpack the archive into the session's existing staging directory
    fn extract(&self, uri: &SourceUri, session: &SyncSession) -> Result<()>;

    /// replace the live tree with the staged one
    fn commit(&self, session: &SyncSession, cleanup: &CleanupRegistry) -> Result<SwapOutcome> {
        swap::commit(session, cleanup)
    }
}

/// syncs a repository from a compressed tarball
pub struct TarballSyncer {
    fetcher: Box<dyn Fetcher>,
    extractor: Box<dyn Extractor>,
}

impl TarballSyncer {
    pub fn new(fetcher: Box<dyn Fetcher>, extractor: Box<dyn Extractor>) -> Self {
        Self { fetcher, extractor }
    }

    /// http fetcher and configured extractor
    pub fn from_options(options: &SyncOptions) -> Result<Self> {
        let fetcher = HttpFetcher::new(options.timeout(), &options.user_agent)?;
        Ok(Self::new(Box::new(fetcher), options.extractor.build()))
    }
}

impl Syncer for TarballSyncer {
    fn validate(&self, raw_uri: &str) -> Result<SourceUri> {
        SourceUri::parse(raw_uri)
    }

    fn fetch(&self, uri: &SourceUri, session: &SyncSession) -> Result<u64> {
        self.fetcher.fetch(uri, session.archive(), session.interrupt())
    }

    fn extract(&self, uri: &SourceUri, session: &SyncSession) -> Result<()> {
        extract::unpack(session, uri.compression(), self.extractor.as_ref())
    }
}

/// result of a completed sync
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub uri: String,
    pub basedir: PathBuf,
    pub bytes_fetched: u64,
    pub verified: bool,
    pub outcome: SwapOutcome,
}

/// why the last attempt ended in `Failed`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncFailure {
    /// state the attempt was in when the error occurred
    pub state: SyncState,
    pub message: String,
}

/// drives a syncer through one attempt
pub struct Orchestrator {
    cleanup: CleanupRegistry,
    temp_dir: Option<PathBuf>,
    state: SyncState,
    failure: Option<SyncFailure>,
}

impl Orchestrator {
    pub fn new(cleanup: CleanupRegistry) -> Self {
        Self {
            cleanup,
            temp_dir: None,
            state: SyncState::Idle,
            failure: None,
        }
    }

    /// download archives into `dir` instead of the system temp dir
    pub fn with_temp_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.temp_dir = dir;
        self
    }

    /// state reached by the last attempt
    pub fn state(&self) -> SyncState {
        self.state
    }

    /// the error behind a `Failed` state; also returned by `sync` itself
    pub fn failure(&self) -> Option<&SyncFailure> {
        self.failure.as_ref()
    }

    /// run one sync attempt of `raw_uri` into `basedir`
    ///
    /// when `expected` is given the archive must hash to it before anything
    /// is unpacked.
    pub fn sync(
        &mut self,
        syncer: &dyn Syncer,
        raw_uri: &str,
        basedir: &Path,
        expected: Option<&Sha256Digest>,
    ) -> Result<SyncReport> {
        self.state = SyncState::Idle;
        self.failure = None;
        match self.attempt(syncer, raw_uri, basedir, expected) {
            Ok(report) => {
                debug!("sync state {} -> {}", self.state, SyncState::Done);
                self.state = SyncState::Done;
                Ok(report)
            }
            Err(e) => {
                error!("sync of {} failed while {}: {}", basedir.display(), self.state, e);
                self.failure = Some(SyncFailure {
                    state: self.state,
                    message: e.to_string(),
                });
                self.state = SyncState::Failed;
                Err(e)
            }
        }
    }

    fn attempt(
        &mut self,
        syncer: &dyn Syncer,
        raw_uri: &str,
        basedir: &Path,
        expected: Option<&Sha256Digest>,
    ) -> Result<SyncReport> {
        self.enter(SyncState::Validating)?;
        let uri = syncer.validate(raw_uri)?;

        self.enter(SyncState::Fetching)?;
        let session = SyncSession::begin(basedir, self.temp_dir.as_deref(), &self.cleanup)?;
        let bytes_fetched = syncer.fetch(&uri, &session)?;
        match expected {
            Some(digest) => checksum::verify(session.archive(), digest)?,
            None => warn!("archive for {} is not verified", session.basedir().display()),
        }

        self.enter(SyncState::Staging)?;
        extract::create_staging(&session)?;

        self.enter(SyncState::Extracting)?;
        syncer.extract(&uri, &session)?;

        self.enter(SyncState::Swapping)?;
        let outcome = syncer.commit(&session, &self.cleanup)?;

        Ok(SyncReport {
            uri: uri.raw().to_string(),
            basedir: session.basedir().to_path_buf(),
            bytes_fetched,
            verified: expected.is_some(),
            outcome,
        })
    }

    fn enter(&mut self, next: SyncState) -> Result<()> {
        self.cleanup.interrupt().check()?;
        debug!("sync state {} -> {}", self.state, next);
        self.state = next;
        Ok(())
    }
}

type Constructor = fn(&SyncOptions) -> Result<Box<dyn Syncer>>;

struct Registration {
    prefix: &'static str,
    priority: u32,
    construct: Constructor,
}

/// maps uri prefixes to syncer implementations
pub struct SyncerRegistry {
    entries: Vec<Registration>,
}

impl SyncerRegistry {
    /// registry with no syncers
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// registry with the tarball syncer
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        for prefix in ["tar+http://", "tar+https://"] {
            registry.register(prefix, 5, tarball_syncer);
        }
        for prefix in ["http://", "https://"] {
            registry.register(prefix, 1, tarball_syncer);
        }
        registry
    }

    pub fn register(&mut self, prefix: &'static str, priority: u32, construct: Constructor) {
        self.entries.push(Registration {
            prefix,
            priority,
            construct,
        });
    }

    /// the highest-priority syncer whose prefix matches `raw_uri`
    pub fn syncer_for(&self, raw_uri: &str, options: &SyncOptions) -> Result<Box<dyn Syncer>> {
        let registration = self
            .entries
            .iter()
            .filter(|r| raw_uri.starts_with(r.prefix))
            .max_by_key(|r| r.priority)
            .ok_or_else(|| Error::NoSyncer(raw_uri.to_string()))?;

        debug!("using syncer registered for {}", registration.prefix);
        (registration.construct)(options)
    }
}

impl Default for SyncerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn tarball_syncer(options: &SyncOptions) -> Result<Box<dyn Syncer>> {
    Ok(Box::new(TarballSyncer::from_options(options)?))
}

/// sync `basedir` from `raw_uri` with the default registry
pub fn sync(
    raw_uri: &str,
    basedir: &Path,
    options: &SyncOptions,
    expected: Option<&Sha256Digest>,
    cleanup: &CleanupRegistry,
) -> Result<SyncReport> {
    let syncer = SyncerRegistry::with_defaults().syncer_for(raw_uri, options)?;
    let mut orchestrator =
        Orchestrator::new(cleanup.clone()).with_temp_dir(options.temp_dir.clone());

    let report = orchestrator.sync(syncer.as_ref(), raw_uri, basedir, expected)?;
    info!(
        "synced {} from {} ({} bytes)",
        report.basedir.display(),
        report.uri,
        report.bytes_fetched
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleanup::Interrupt;
    use crate::error::SyncError;
    use std::fs;
    use tempfile::tempdir;

    /// fetcher that fails every request
    struct Unreachable;

    impl Fetcher for Unreachable {
        fn fetch(&self, uri: &SourceUri, _dest: &Path, _interrupt: &Interrupt) -> Result<u64> {
            Err(Error::fetch(uri.url(), "connection refused"))
        }
    }

    /// fetcher that writes fixed bytes
    struct Canned(Vec<u8>);

    impl Fetcher for Canned {
        fn fetch(&self, _uri: &SourceUri, dest: &Path, _interrupt: &Interrupt) -> Result<u64> {
            fs::write(dest, &self.0).unwrap();
            Ok(self.0.len() as u64)
        }
    }

    /// fetcher that is interrupted while downloading
    struct InterruptedMidway(Vec<u8>);

    impl Fetcher for InterruptedMidway {
        fn fetch(&self, _uri: &SourceUri, dest: &Path, interrupt: &Interrupt) -> Result<u64> {
            fs::write(dest, &self.0).unwrap();
            interrupt.trigger();
            Ok(self.0.len() as u64)
        }
    }

    #[test]
    fn test_invalid_uri_touches_nothing() {
        let dir = tempdir().unwrap();
        let cleanup = CleanupRegistry::new();
        let syncer = TarballSyncer::new(Box::new(Unreachable), Box::new(extract::NativeExtractor));
        let mut orchestrator = Orchestrator::new(cleanup.clone());

        let result = orchestrator.sync(
            &syncer,
            "tar+https://example.org/repo.zip",
            &dir.path().join("repo"),
            None,
        );

        assert!(matches!(result, Err(Error::Uri { .. })));
        assert_eq!(orchestrator.state(), SyncState::Failed);
        let failure = orchestrator.failure().unwrap();
        assert_eq!(failure.state, SyncState::Validating);
        assert!(failure.message.contains("unsupported"), "{}", failure.message);
        assert!(cleanup.is_empty());
    }

    #[test]
    fn test_fetch_failure_schedules_cleanup() {
        let dir = tempdir().unwrap();
        let basedir = dir.path().join("repo");
        fs::create_dir(&basedir).unwrap();
        fs::write(basedir.join("A"), b"old").unwrap();

        let cleanup = CleanupRegistry::new();
        let syncer = TarballSyncer::new(Box::new(Unreachable), Box::new(extract::NativeExtractor));
        let mut orchestrator =
            Orchestrator::new(cleanup.clone()).with_temp_dir(Some(dir.path().to_path_buf()));

        let result = orchestrator.sync(&syncer, "https://example.org/repo.tar.gz", &basedir, None);

        assert!(matches!(result, Err(Error::Fetch { .. })));
        assert_eq!(cleanup.len(), 2);
        assert!(basedir.join("A").is_file());

        cleanup.run_all();
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("repo")]);
    }

    #[test]
    fn test_interrupt_stops_before_staging() {
        let dir = tempdir().unwrap();
        let basedir = dir.path().join("repo");
        fs::create_dir(&basedir).unwrap();
        fs::write(basedir.join("A"), b"old").unwrap();

        let cleanup = CleanupRegistry::new();
        let syncer = TarballSyncer::new(
            Box::new(InterruptedMidway(b"partial".to_vec())),
            Box::new(extract::NativeExtractor),
        );
        let mut orchestrator =
            Orchestrator::new(cleanup.clone()).with_temp_dir(Some(dir.path().to_path_buf()));

        let result = orchestrator.sync(&syncer, "https://example.org/repo.tar.gz", &basedir, None);

        assert!(matches!(result, Err(Error::Interrupted)));
        assert_eq!(orchestrator.state(), SyncState::Failed);
        assert_eq!(orchestrator.failure().unwrap().state, SyncState::Fetching);
        assert_eq!(fs::read(basedir.join("A")).unwrap(), b"old");

        // the staging directory was never created
        let session_dirs = fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().starts_with('.'))
            .count();
        assert_eq!(session_dirs, 0);

        cleanup.run_all();
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("repo")]);
    }

    #[test]
    fn test_checksum_mismatch_leaves_basedir() {
        let dir = tempdir().unwrap();
        let basedir = dir.path().join("repo");
        fs::create_dir(&basedir).unwrap();
        fs::write(basedir.join("A"), b"old").unwrap();

        let cleanup = CleanupRegistry::new();
        let syncer = TarballSyncer::new(
            Box::new(Canned(b"not the expected archive".to_vec())),
            Box::new(extract::NativeExtractor),
        );
        let expected = Sha256Digest::from_hex(&"00".repeat(32)).unwrap();
        let mut orchestrator =
            Orchestrator::new(cleanup.clone()).with_temp_dir(Some(dir.path().to_path_buf()));

        let result = orchestrator.sync(
            &syncer,
            "https://example.org/repo.tar.gz",
            &basedir,
            Some(&expected),
        );

        assert!(matches!(
            result,
            Err(Error::Sync(SyncError::Checksum { .. }))
        ));
        assert!(basedir.join("A").is_file());
        cleanup.run_all();
    }

    #[test]
    fn test_registry_prefers_marked_uris() {
        let registry = SyncerRegistry::with_defaults();
        let options = SyncOptions::default();

        assert!(registry
            .syncer_for("tar+https://example.org/a.tar.gz", &options)
            .is_ok());
        assert!(registry
            .syncer_for("https://example.org/a.tar.gz", &options)
            .is_ok());
        assert!(matches!(
            registry.syncer_for("rsync://example.org/gentoo", &options),
            Err(Error::NoSyncer(_))
        ));
        assert!(matches!(
            SyncerRegistry::empty().syncer_for("https://example.org/a.tar.gz", &options),
            Err(Error::NoSyncer(_))
        ));
    }

    #[test]
    fn test_registry_picks_highest_priority() {
        fn failing(_: &SyncOptions) -> Result<Box<dyn Syncer>> {
            Err(Error::NoSyncer("low priority".to_string()))
        }

        let mut registry = SyncerRegistry::empty();
        registry.register("https://", 1, failing);
        registry.register("https://", 10, tarball_syncer);

        assert!(registry
            .syncer_for("https://example.org/a.tar.gz", &SyncOptions::default())
            .is_ok());
    }

    #[test]
    fn test_sync_options_defaults() {
        let options = SyncOptions::default();
        assert_eq!(options.extractor, ExtractorKind::Tar);
        assert_eq!(options.timeout(), Some(crate::fetch::DEFAULT_TIMEOUT));
        assert!(options.user_agent.starts_with("tarsync/"));
    }

    #[test]
    fn test_zero_timeout_disables_it() {
        let options = SyncOptions {
            timeout_secs: 0,
            ..SyncOptions::default()
        };
        assert_eq!(options.timeout(), None);
        assert!(TarballSyncer::from_options(&options).is_ok());
    }
}
