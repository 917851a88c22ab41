//! tarsync - tarball repository syncer
//!
//! keeps a local package repository in step with a remote snapshot that is
//! published as a compressed tarball. each sync downloads the archive,
//! unpacks it next to the live tree, and swaps the two with renames so the
//! repository path never shows a half-written tree.
//!
//! # Sync flow
//!
//! - **Validate**: `[tar+]{http,https}://...{.tar.gz,.tar.bz2,.tar.xz}`
//! - **Fetch**: download into a temp file, removal scheduled immediately
//! - **Stage**: unpack into `.<name>.update.<hex>` beside the repo, dropping
//!   the archive's top-level directory
//! - **Swap**: rename the repo to `.<name>.old.<hex>`, then the staging dir
//!   to the repo path; the old tree is scheduled for removal
//!
//! temp paths are removed by a [`CleanupRegistry`] that the caller runs at
//! shutdown. an interrupt stops the sync at its next step and leaves the
//! cleanup to the caller's thread. concurrent syncs of the same repository
//! are not supported.
//!
//! # Example usage
//!
//! ```no_run
//! use std::path::Path;
//! use tarsync::{CleanupRegistry, SyncOptions};
//!
//! let cleanup = CleanupRegistry::new();
//! let _guard = cleanup.guard();
//!
//! tarsync::sync(
//!     "tar+https://example.org/snapshots/gentoo.tar.xz",
//!     Path::new("/var/db/repos/gentoo"),
//!     &SyncOptions::default(),
//!     None,
//!     &cleanup,
//! )
//! .unwrap();
//! ```

mod checksum;
mod cleanup;
mod config;
mod error;
mod session;
mod uri;

pub mod extract;
pub mod fetch;
pub mod swap;
pub mod syncer;

pub use checksum::{verify as verify_checksum, Sha256Digest};
pub use cleanup::{CleanupAction, CleanupGuard, CleanupRegistry, Interrupt, INTERRUPTED_EXIT_CODE};
pub use config::{Config, RepoConfig, GLOBAL_CONFIG_PATH};
pub use error::{Error, Result, SyncError};
pub use extract::{Extractor, ExtractorKind, NativeExtractor, TarCommand};
pub use fetch::{Fetcher, HttpFetcher};
pub use session::{staging_paths, SyncSession};
pub use swap::{commit, SwapOutcome};
pub use syncer::{
    sync, Orchestrator, SyncFailure, SyncOptions, SyncReport, SyncState, Syncer, SyncerRegistry,
    TarballSyncer,
};
pub use uri::{Compression, SourceUri};
