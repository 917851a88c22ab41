use std::path::PathBuf;

/// error type for tarsync operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid sync uri {uri:?}: {reason}")]
    Uri { uri: String, reason: String },

    #[error("failed fetching {uri}: {message}")]
    Fetch { uri: String, message: String },

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("repository path has no parent directory or name: {0}")]
    InvalidBasedir(PathBuf),

    #[error("no syncer handles uri: {0}")]
    NoSyncer(String),

    #[error("repo not configured: {0}")]
    RepoNotFound(String),

    #[error("repo already configured: {0}")]
    RepoExists(String),

    #[error("invalid sha256 digest: {0}")]
    InvalidChecksum(String),

    #[error("unknown extractor: {0}")]
    UnknownExtractor(String),

    #[error("interrupted")]
    Interrupted,

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("config serialization error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),
}

/// failures while staging, unpacking or swapping a repository tree
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("failed creating repo update dir: {path}: {source}")]
    CreateStaging {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to unpack tarball {archive}: {message}")]
    Unpack { archive: PathBuf, message: String },

    #[error("failed to update repo: rename {from} -> {to}: {source}")]
    Swap {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("archive checksum mismatch: expected {expected}, got {actual}")]
    Checksum { expected: String, actual: String },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn uri(uri: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Uri {
            uri: uri.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn fetch(uri: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Fetch {
            uri: uri.into(),
            message: message.into(),
        }
    }
}

/// helper to wrap io errors with path context
pub trait IoResultExt<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| Error::Io {
            path: path.into(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_path_attaches_path() {
        let err = std::fs::read("/nonexistent/tarsync/file")
            .with_path("/nonexistent/tarsync/file")
            .unwrap_err();

        match err {
            Error::Io { path, .. } => assert_eq!(path, PathBuf::from("/nonexistent/tarsync/file")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_sync_error_is_transparent() {
        let err: Error = SyncError::Unpack {
            archive: PathBuf::from("/tmp/a.tar.gz"),
            message: "exit status: 2".to_string(),
        }
        .into();

        assert_eq!(
            err.to_string(),
            "failed to unpack tarball /tmp/a.tar.gz: exit status: 2"
        );
    }
}
