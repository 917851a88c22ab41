//! optional sha-256 verification of downloaded archives

use std::fmt;
use std::fs::File;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, IoResultExt, Result, SyncError};

/// expected sha-256 digest of an archive
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Sha256Digest([u8; 32]);

impl Sha256Digest {
    /// parse from hex string
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim()).map_err(|_| Error::InvalidChecksum(s.to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::InvalidChecksum(s.to_string()))?;
        Ok(Self(arr))
    }

    /// digest of a file's contents
    pub fn of_file(path: &Path) -> Result<Self> {
        let mut file = File::open(path).with_path(path)?;
        let mut hasher = Sha256::new();
        io::copy(&mut file, &mut hasher).with_path(path)?;
        Ok(Self(hasher.finalize().into()))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Sha256Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Sha256Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sha256Digest({})", &self.to_hex()[..12])
    }
}

impl Serialize for Sha256Digest {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Sha256Digest {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// fail with a checksum error unless `path` hashes to `expected`
pub fn verify(path: &Path, expected: &Sha256Digest) -> Result<()> {
    let actual = Sha256Digest::of_file(path)?;
    if &actual != expected {
        return Err(SyncError::Checksum {
            expected: expected.to_hex(),
            actual: actual.to_hex(),
        }
        .into());
    }
    Ok(())
}
