//! source uri validation for tarball repositories

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// marker distinguishing a tarball sync uri from other http syncers
pub const TAR_MARKER: &str = "tar+";

/// transports a tarball may be fetched over
pub const SUPPORTED_PROTOCOLS: &[&str] = &["http://", "https://"];

/// compression mode of a repository tarball
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Compression {
    Gzip,
    Bzip2,
    Xz,
}

impl Compression {
    pub const ALL: [Compression; 3] = [Compression::Gzip, Compression::Bzip2, Compression::Xz];

    /// map the final extension of an archive name to a compression mode
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "gz" => Some(Compression::Gzip),
            "bz2" => Some(Compression::Bzip2),
            "xz" => Some(Compression::Xz),
            _ => None,
        }
    }

    /// archive suffix accepted for this mode
    pub fn suffix(self) -> &'static str {
        match self {
            Compression::Gzip => ".tar.gz",
            Compression::Bzip2 => ".tar.bz2",
            Compression::Xz => ".tar.xz",
        }
    }

    /// name of the decompression mode as understood by tar
    pub fn name(self) -> &'static str {
        match self {
            Compression::Gzip => "gzip",
            Compression::Bzip2 => "bzip2",
            Compression::Xz => "xz",
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// a validated tarball source uri
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceUri {
    raw: String,
    url: String,
    compression: Compression,
}

impl SourceUri {
    /// validate a raw sync uri
    ///
    /// an optional `tar+` marker is stripped first; the remainder must use a
    /// supported transport and end in a supported compressed tarball suffix.
    pub fn parse(raw: &str) -> Result<Self> {
        let url = strip_marker(raw);

        let Some(scheme) = SUPPORTED_PROTOCOLS.iter().find(|p| url.starts_with(*p)) else {
            return Err(Error::uri(raw, "unsupported URI"));
        };

        let Some(compression) = Compression::ALL
            .into_iter()
            .find(|c| url.ends_with(c.suffix()))
        else {
            return Err(Error::uri(
                raw,
                "unsupported compression format for tarball archive",
            ));
        };

        // "https://.tar.gz" has nothing to fetch
        if url.len() <= scheme.len() + compression.suffix().len() {
            return Err(Error::uri(raw, "unsupported URI"));
        }

        Ok(Self {
            raw: raw.to_string(),
            url: url.to_string(),
            compression,
        })
    }

    /// the uri as given, including any `tar+` marker
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// the fetchable url with the marker stripped
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// final extension of the archive name (`gz`, `bz2` or `xz`)
    pub fn extension(&self) -> &str {
        self.url.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("")
    }
}

impl FromStr for SourceUri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for SourceUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// strip the `tar+` marker when it precedes a supported transport
fn strip_marker(raw: &str) -> &str {
    match raw.strip_prefix(TAR_MARKER) {
        Some(rest) if SUPPORTED_PROTOCOLS.iter().any(|p| rest.starts_with(p)) => rest,
        _ => raw,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_accepts_supported_uris() {
        let cases = [
            ("https://example.org/repo.tar.gz", Compression::Gzip),
            ("http://example.org/repo.tar.bz2", Compression::Bzip2),
            ("tar+https://example.org/snapshots/gentoo.tar.xz", Compression::Xz),
            ("tar+http://mirror/a/b/c.tar.gz", Compression::Gzip),
        ];

        for (raw, expected) in cases {
            let uri = SourceUri::parse(raw).unwrap();
            assert_eq!(uri.compression(), expected, "{raw}");
            assert_eq!(Compression::from_extension(uri.extension()), Some(expected));
        }
    }

    #[test]
    fn test_parse_strips_marker() {
        let uri = SourceUri::parse("tar+https://example.org/repo.tar.xz").unwrap();
        assert_eq!(uri.raw(), "tar+https://example.org/repo.tar.xz");
        assert_eq!(uri.url(), "https://example.org/repo.tar.xz");
        assert_eq!(uri.extension(), "xz");
    }

    #[test]
    fn test_parse_rejects_unsupported_compression() {
        for raw in [
            "https://example.org/repo.zip",
            "https://example.org/repo.tar",
            "https://example.org/repo.tar.zst",
            "tar+https://example.org/repo.tgz",
        ] {
            match SourceUri::parse(raw) {
                Err(Error::Uri { uri, reason }) => {
                    assert_eq!(uri, raw);
                    assert!(reason.contains("compression"), "{reason}");
                }
                other => panic!("{raw}: unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn test_parse_rejects_unsupported_transport() {
        for raw in [
            "ftp://example.org/repo.tar.gz",
            "rsync://example.org/gentoo-portage",
            "file:///srv/repo.tar.gz",
            "tar+ftp://example.org/repo.tar.gz",
            "tar+tar+https://example.org/repo.tar.gz",
            "example.org/repo.tar.gz",
            "",
            "https://.tar.gz",
        ] {
            match SourceUri::parse(raw) {
                Err(Error::Uri { reason, .. }) => assert_eq!(reason, "unsupported URI", "{raw}"),
                other => panic!("{raw}: unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn test_compression_names() {
        assert_eq!(Compression::Gzip.name(), "gzip");
        assert_eq!(Compression::Bzip2.name(), "bzip2");
        assert_eq!(Compression::Xz.name(), "xz");
        assert_eq!(Compression::from_extension("zst"), None);
    }
}
