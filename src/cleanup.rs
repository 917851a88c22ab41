//! deferred removal of temporary sync artifacts
//!
//! actions are registered as soon as the path they guard is known and run
//! when the process reaches a controlled shutdown point, either a normal
//! return or a caught error. each action tolerates its path being gone
//! already, so running the registry more than once is harmless.
//!
//! an interrupt signal never runs actions itself. it raises the registry's
//! [`Interrupt`] flag, the sync in progress stops at its next checkpoint,
//! and cleanup then runs on the thread that owns the sync.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, IoResultExt, Result};

/// exit status used after an interrupt, matching shell convention for SIGINT
pub const INTERRUPTED_EXIT_CODE: u8 = 130;

/// shared flag raised when the process is asked to stop
#[derive(Clone, Debug, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// raise the flag; returns true if it was already raised
    pub fn trigger(&self) -> bool {
        self.0.swap(true, Ordering::SeqCst)
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Error::Interrupted)` once the flag is raised
    pub fn check(&self) -> Result<()> {
        if self.is_triggered() {
            Err(Error::Interrupted)
        } else {
            Ok(())
        }
    }
}

/// a single deferred removal
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CleanupAction {
    /// remove a file
    RemoveFile(PathBuf),
    /// recursively remove a directory
    RemoveDir(PathBuf),
}

impl CleanupAction {
    pub fn path(&self) -> &Path {
        match self {
            CleanupAction::RemoveFile(path) | CleanupAction::RemoveDir(path) => path,
        }
    }

    /// perform the removal; a missing path is not an error
    pub fn run(&self) -> Result<()> {
        let result = match self {
            CleanupAction::RemoveFile(path) => fs::remove_file(path),
            CleanupAction::RemoveDir(path) => fs::remove_dir_all(path),
        };

        match result {
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            other => other.with_path(self.path()),
        }
    }
}

/// process-wide registry of cleanup actions
///
/// clones share the same underlying list and interrupt flag.
#[derive(Clone, Debug, Default)]
pub struct CleanupRegistry {
    actions: Arc<Mutex<Vec<CleanupAction>>>,
    interrupt: Interrupt,
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// flag checked by syncs that use this registry
    pub fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }

    pub fn register(&self, action: CleanupAction) {
        debug!("scheduled cleanup of {}", action.path().display());
        self.actions.lock().push(action);
    }

    /// number of pending actions
    pub fn len(&self) -> usize {
        self.actions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.lock().is_empty()
    }

    /// snapshot of pending actions
    pub fn pending(&self) -> Vec<CleanupAction> {
        self.actions.lock().clone()
    }

    /// run and drain every pending action
    ///
    /// failures are logged, never propagated; returns the number of actions
    /// that failed.
    pub fn run_all(&self) -> usize {
        let actions = std::mem::take(&mut *self.actions.lock());
        let mut failed = 0;

        for action in actions {
            match action.run() {
                Ok(()) => debug!("cleaned up {}", action.path().display()),
                Err(e) => {
                    warn!("cleanup failed: {e}");
                    failed += 1;
                }
            }
        }

        failed
    }

    /// guard that runs all pending actions when dropped
    pub fn guard(&self) -> CleanupGuard {
        CleanupGuard {
            registry: self.clone(),
        }
    }

    /// raise the interrupt flag on SIGINT/SIGTERM
    ///
    /// the handler runs no cleanup itself. a second signal exits at once and
    /// leaves pending temporary paths in place. only one handler may be
    /// installed per process.
    pub fn install_signal_handler(&self) -> std::result::Result<(), ctrlc::Error> {
        let interrupt = self.interrupt.clone();
        ctrlc::set_handler(move || {
            if interrupt.trigger() {
                warn!("interrupted again, exiting without cleanup");
                std::process::exit(i32::from(INTERRUPTED_EXIT_CODE));
            }
            warn!("interrupted, stopping sync");
        })
    }
}

/// runs the registry's pending actions on drop
#[must_use = "cleanup runs when the guard is dropped"]
pub struct CleanupGuard {
    registry: CleanupRegistry,
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        self.registry.run_all();
    }
}
