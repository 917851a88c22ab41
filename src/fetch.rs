//! retrieving repository tarballs

use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;
use std::time::Duration;

use reqwest::blocking::Client;
use tracing::{debug, info};

use crate::cleanup::Interrupt;
use crate::error::{Error, IoResultExt, Result};
use crate::uri::SourceUri;

/// default timeout for a whole tarball download
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// user agent sent with downloads unless configured otherwise
pub const DEFAULT_USER_AGENT: &str = concat!("tarsync/", env!("CARGO_PKG_VERSION"));

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// source of archive bytes
pub trait Fetcher: Send + Sync {
    /// write the resource at `uri` to `dest`, returning bytes written
    ///
    /// stops with `Error::Interrupted` once `interrupt` is raised.
    fn fetch(&self, uri: &SourceUri, dest: &Path, interrupt: &Interrupt) -> Result<u64>;
}

/// blocking http(s) downloader
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// `None` disables the request timeout
    pub fn new(timeout: Option<Duration>, user_agent: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| Error::fetch("<client>", format!("failed to create http client: {e}")))?;

        Ok(Self { client })
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, uri: &SourceUri, dest: &Path, interrupt: &Interrupt) -> Result<u64> {
        interrupt.check()?;
        info!("downloading {}", uri.url());

        let mut response = self
            .client
            .get(uri.url())
            .send()
            .map_err(|e| Error::fetch(uri.url(), e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::fetch(
                uri.url(),
                format!("HTTP {}", response.status()),
            ));
        }

        let file = File::create(dest).with_path(dest)?;
        let mut writer = BufWriter::new(file);
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut written = 0u64;

        loop {
            interrupt.check()?;
            let n = match response.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(Error::fetch(
                        uri.url(),
                        format!("failed reading response body: {e}"),
                    ))
                }
            };
            writer.write_all(&buf[..n]).with_path(dest)?;
            written += n as u64;
        }
        writer.flush().with_path(dest)?;

        debug!("wrote {} bytes to {}", written, dest.display());
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;
    use tempfile::tempdir;

    /// answer a single request on loopback with `response`
    fn serve_once(response: &'static str) -> (String, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut buf).unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            stream.write_all(response.as_bytes()).unwrap();
        });

        (format!("http://{addr}"), handle)
    }

    fn fetcher() -> HttpFetcher {
        HttpFetcher::new(Some(Duration::from_secs(5)), DEFAULT_USER_AGENT).unwrap()
    }

    #[test]
    fn test_unreachable_host_is_fetch_error() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("archive");
        // port 9 on loopback: nothing listens there
        let uri = SourceUri::parse("http://127.0.0.1:9/repo.tar.gz").unwrap();

        let result = fetcher().fetch(&uri, &dest, &Interrupt::new());

        match result {
            Err(Error::Fetch { uri, .. }) => assert_eq!(uri, "http://127.0.0.1:9/repo.tar.gz"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_http_error_status_is_fetch_error() {
        let (base, server) = serve_once(
            "HTTP/1.1 404 Not Found\r\nContent-Length: 9\r\nConnection: close\r\n\r\nnot found",
        );
        let dir = tempdir().unwrap();
        let dest = dir.path().join("archive");
        let uri = SourceUri::parse(&format!("{base}/missing.tar.gz")).unwrap();

        let result = fetcher().fetch(&uri, &dest, &Interrupt::new());
        server.join().unwrap();

        match result {
            Err(Error::Fetch { message, .. }) => assert!(message.contains("404"), "{message}"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!dest.exists());
    }

    #[test]
    fn test_body_is_written_to_dest() {
        let (base, server) = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Length: 8\r\nConnection: close\r\n\r\nnew tree",
        );
        let dir = tempdir().unwrap();
        let dest = dir.path().join("archive");
        let uri = SourceUri::parse(&format!("tar+{base}/repo.tar.xz")).unwrap();

        let written = fetcher().fetch(&uri, &dest, &Interrupt::new()).unwrap();
        server.join().unwrap();

        assert_eq!(written, 8);
        assert_eq!(std::fs::read(&dest).unwrap(), b"new tree");
    }

    #[test]
    fn test_interrupted_fetch_sends_nothing() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("archive");
        let uri = SourceUri::parse("http://127.0.0.1:9/repo.tar.gz").unwrap();
        let interrupt = Interrupt::new();
        interrupt.trigger();

        let result = fetcher().fetch(&uri, &dest, &interrupt);

        assert!(matches!(result, Err(Error::Interrupted)));
        assert!(!dest.exists());
    }

    #[test]
    fn test_client_without_timeout() {
        assert!(HttpFetcher::new(None, DEFAULT_USER_AGENT).is_ok());
    }
}
