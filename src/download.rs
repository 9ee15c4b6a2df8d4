/* This is part of smartblock-agent - which is under the MIT License **********/

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::error;

use indicatif::{ProgressBar, ProgressStyle};
use snafu::{ResultExt, ensure};
use log::*;
use curl::easy::Easy;

/// Number of redirects a single download may follow
pub const MAX_REDIRECTS: u32 = 5;

const USER_AGENT: &str = concat!("smartblock-agent/", env!("CARGO_PKG_VERSION"));

/// What is left of an HTTP response once its body has been streamed out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: u32,
    pub location: Option<String>,
}

/// A single HTTP GET, without following redirects. The body is written to
/// `sink` whatever the status code is; interpreting the status is left to
/// the caller.
pub trait Transport: Send + Sync {
    fn get(&self, url: &url::Url, sink: &mut dyn Write) -> Result<Response>;
}

/// Transport backed by libcurl
pub struct CurlTransport {
    connect_timeout: Duration,
    stall_timeout: Duration,
    timeout: Option<Duration>,
}

impl CurlTransport {
    pub fn new(timeout: Option<Duration>) -> CurlTransport {
        CurlTransport {
            connect_timeout: Duration::from_secs(30),
            stall_timeout: Duration::from_secs(30),
            timeout: timeout,
        }
    }

    fn setup(&self, handle: &mut Easy, url: &url::Url) -> Result<()> {
        handle.url(url.as_str()).context(error::URLError{url: url.clone()})?;
        handle.follow_location(false).context(error::CURLSetupError{})?;
        handle.useragent(USER_AGENT).context(error::CURLSetupError{})?;
        handle.connect_timeout(self.connect_timeout).context(error::CURLSetupError{})?;
        // Abort transfers slower than 10 bytes/s for too long
        handle.low_speed_limit(10).context(error::CURLSetupError{})?;
        handle.low_speed_time(self.stall_timeout).context(error::CURLSetupError{})?;
        if let Some(timeout) = self.timeout {
            handle.timeout(timeout).context(error::CURLSetupError{})?;
        }
        handle.progress(true).context(error::CURLSetupError{})?;
        Ok(())
    }
}

fn progress_bar() -> ProgressBar {
    if ! atty::is(atty::Stream::Stdout) {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(0);
    pb.set_style(ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
        .progress_chars("#>-"));
    pb
}

/// Extract the value of a `Location:` header line
fn location_header(line: &[u8]) -> Option<String> {
    let line = std::str::from_utf8(line).ok()?;
    let (name, value) = line.split_at(line.find(':')?);
    if name.trim().eq_ignore_ascii_case("location") {
        let value = value[1..].trim();
        if ! value.is_empty() {
            return Some(value.to_string());
        }
    }
    None
}

impl Transport for CurlTransport {
    fn get(&self, url: &url::Url, sink: &mut dyn Write) -> Result<Response> {
        let mut handle = Easy::new();
        self.setup(&mut handle, url)?;

        let pb = progress_bar();
        let mut location = None;
        let mut write_error = None;
        let performed = {
            let mut transfer = handle.transfer();
            transfer.header_function(|line| {
                if let Some(value) = location_header(line) {
                    location = Some(value);
                }
                true
            }).context(error::CURLSetupError{})?;
            transfer.progress_function(|total, dl, _, _| {
                pb.set_length(total as u64);
                pb.set_position(dl as u64);
                true
            }).context(error::CURLSetupError{})?;
            transfer.write_function(|data| {
                // Reporting fewer bytes than received makes curl abort the
                // transfer; the I/O error is raised once perform() returns.
                match sink.write_all(data) {
                    Ok(()) => Ok(data.len()),
                    Err(err) => {
                        write_error = Some(err);
                        Ok(0)
                    },
                }
            }).context(error::CURLSetupError{})?;

            transfer.perform()
        };
        pb.finish_and_clear();

        if let Some(err) = write_error {
            return Err(err).context(error::StreamFailed{url: url.clone()});
        }
        performed.context(error::RequestError{url: url.clone()})?;

        let code = handle.response_code()
            .context(error::RequestError{url: url.clone()})?;
        Ok(Response {
            code: code,
            location: location,
        })
    }
}

/// Destination file of a download. Unless `persist()` is called, the file
/// is closed and then removed when this goes out of scope, so a failed or
/// redirected request never leaves a file that looks like a valid download.
struct PartialFile {
    path: PathBuf,
    file: Option<std::fs::File>,
    written: u64,
    keep: bool,
}

impl PartialFile {
    fn create(path: &Path) -> Result<PartialFile> {
        let file = std::fs::File::create(path).context(
            error::CreateFileError{ path: path.to_path_buf() })?;
        Ok(PartialFile {
            path: path.to_path_buf(),
            file: Some(file),
            written: 0,
            keep: false,
        })
    }

    /// Flush and close the file, keeping it on disk. Returns its size.
    fn persist(mut self) -> Result<u64> {
        if let Some(mut file) = self.file.take() {
            file.flush()
                .and_then(|_| file.sync_all())
                .context(error::FailedToWrite{ path: self.path.clone() })?;
        }
        self.keep = true;
        Ok(self.written)
    }
}

impl Write for PartialFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let file = self.file.as_mut()
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::BrokenPipe))?;
        let n = file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        drop(self.file.take());
        if self.keep {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => trace!("Removed partial download {:#?}", self.path),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {},
            Err(err) => warn!("Failed to remove partial download {:#?}: {}", self.path, err),
        }
    }
}

/// State of one download: where it started, how many redirects it may
/// still follow, and every URL it already requested.
struct DownloadJob {
    source: url::Url,
    redirects_left: u32,
    visited: HashSet<url::Url>,
}

impl DownloadJob {
    fn new(source: &url::Url) -> DownloadJob {
        DownloadJob {
            source: source.clone(),
            redirects_left: MAX_REDIRECTS,
            visited: HashSet::new(),
        }
    }

    /// Record that `url` is about to be requested
    fn visit(&mut self, url: &url::Url) -> Result<()> {
        ensure!(url.scheme() == "https", error::InsecureUrl{ url: url.clone() });
        ensure!(self.visited.insert(url.clone()), error::CyclicRedirect{ url: url.clone() });
        Ok(())
    }

    /// Compute the target of a redirect received while requesting `current`
    fn redirect(&mut self, current: &url::Url, location: &str) -> Result<url::Url> {
        ensure!(self.redirects_left > 0, error::TooManyRedirects{
            limit: MAX_REDIRECTS,
            url: self.source.clone(),
        });
        self.redirects_left -= 1;
        current.join(location).context(error::InvalidRedirect{
            location: location.to_string(),
            url: current.clone(),
        })
    }
}

/// Download `url` into `dest`, following redirects.
///
/// `dest` only exists when this returns `Ok`: every failure path removes
/// whatever was written so far.
pub fn fetch(transport: &dyn Transport, url: &url::Url, dest: &Path) -> Result<()> {
    let mut job = DownloadJob::new(url);
    let mut current = url.clone();
    loop {
        job.visit(&current)?;
        debug!("GET {}", current);
        let mut file = PartialFile::create(dest)?;
        let response = transport.get(&current, &mut file)?;
        match (response.code, response.location) {
            (200, _) => {
                let size = file.persist()?;
                info!("Downloaded {} ({}) to {:#?}", current,
                    byte_unit::Byte::from_bytes(size as u128).get_appropriate_unit(false),
                    dest);
                return Ok(());
            },
            (300..=399, Some(location)) => {
                drop(file);
                let next = job.redirect(&current, &location)?;
                debug!("{} redirected to {}", current, next);
                current = next;
            },
            (code, _) => {
                drop(file);
                return error::DownloadError{ code: code, url: current }.fail();
            },
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Transport answering from a fixed table of URL -> response
    #[derive(Default)]
    pub struct ScriptedTransport {
        routes: HashMap<String, (u32, Option<String>, Vec<u8>)>,
        requests: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        pub fn new() -> ScriptedTransport {
            ScriptedTransport::default()
        }

        pub fn ok(mut self, url: &str, body: &[u8]) -> ScriptedTransport {
            self.routes.insert(url.to_string(), (200, None, body.to_vec()));
            self
        }

        pub fn redirect(mut self, url: &str, code: u32, location: &str) -> ScriptedTransport {
            self.routes.insert(url.to_string(),
                (code, Some(location.to_string()), b"<html>moved</html>".to_vec()));
            self
        }

        pub fn status(mut self, url: &str, code: u32, body: &[u8]) -> ScriptedTransport {
            self.routes.insert(url.to_string(), (code, None, body.to_vec()));
            self
        }

        pub fn requests(&self) -> Vec<String> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl Transport for ScriptedTransport {
        fn get(&self, url: &url::Url, sink: &mut dyn Write) -> Result<Response> {
            self.requests.lock().unwrap().push(url.to_string());
            match self.routes.get(url.as_str()) {
                Some((code, location, body)) => {
                    sink.write_all(body).context(error::StreamFailed{url: url.clone()})?;
                    Ok(Response { code: *code, location: location.clone() })
                },
                None => {
                    // Behave like a connection that dies half way through
                    sink.write_all(b"partial").context(error::StreamFailed{url: url.clone()})?;
                    Err(std::io::Error::from(std::io::ErrorKind::ConnectionReset))
                        .context(error::StreamFailed{url: url.clone()})
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::testing::ScriptedTransport;
    use crate::error::Error;

    fn url(s: &str) -> url::Url {
        url::Url::parse(s).unwrap()
    }

    #[test]
    fn location_headers_are_recognized() {
        assert_eq!(location_header(b"Location: /next\r\n"), Some("/next".to_string()));
        assert_eq!(location_header(b"location:https://a/b\r\n"), Some("https://a/b".to_string()));
        assert_eq!(location_header(b"Content-Type: text/html\r\n"), None);
        assert_eq!(location_header(b"HTTP/1.1 302 Found\r\n"), None);
    }

    #[test]
    fn redirect_chain_within_budget_succeeds() {
        let transport = ScriptedTransport::new()
            .redirect("https://a.test/0", 302, "https://a.test/1")
            .redirect("https://a.test/1", 301, "/2")
            .redirect("https://a.test/2", 307, "3")
            .redirect("https://a.test/3", 308, "https://b.test/4")
            .redirect("https://b.test/4", 303, "https://a.test/final")
            .ok("https://a.test/final", b"archive bytes");
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("arduino-cli.tar.gz");

        fetch(&transport, &url("https://a.test/0"), &dest).unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"archive bytes");
        assert_eq!(transport.requests().len(), 6);
        assert_eq!(transport.requests()[2], "https://a.test/2");
    }

    #[test]
    fn six_redirects_are_too_many() {
        let mut transport = ScriptedTransport::new();
        for i in 0..6 {
            transport = transport.redirect(
                &format!("https://a.test/{}", i), 302, &format!("/{}", i + 1));
        }
        let transport = transport.ok("https://a.test/6", b"never reached");
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out");

        match fetch(&transport, &url("https://a.test/0"), &dest) {
            Err(Error::TooManyRedirects { limit, .. }) => assert_eq!(limit, MAX_REDIRECTS),
            other => panic!("expected TooManyRedirects, got {:?}", other),
        }
        assert!(! dest.exists());
    }

    #[test]
    fn revisited_url_is_a_cycle() {
        let transport = ScriptedTransport::new()
            .redirect("https://a.test/x", 302, "https://a.test/y")
            .redirect("https://a.test/y", 302, "https://a.test/x");
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out");

        match fetch(&transport, &url("https://a.test/x"), &dest) {
            Err(Error::CyclicRedirect { url: u }) => assert_eq!(u.as_str(), "https://a.test/x"),
            other => panic!("expected CyclicRedirect, got {:?}", other),
        }
        assert!(! dest.exists());
    }

    #[test]
    fn not_found_leaves_no_file() {
        let transport = ScriptedTransport::new()
            .status("https://a.test/missing", 404, b"<html>not found</html>");
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out");

        match fetch(&transport, &url("https://a.test/missing"), &dest) {
            Err(Error::DownloadError { code, .. }) => assert_eq!(code, 404),
            other => panic!("expected DownloadError, got {:?}", other),
        }
        assert!(! dest.exists());
    }

    #[test]
    fn redirect_without_location_is_an_http_error() {
        let transport = ScriptedTransport::new()
            .status("https://a.test/odd", 302, b"");
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out");

        match fetch(&transport, &url("https://a.test/odd"), &dest) {
            Err(Error::DownloadError { code, .. }) => assert_eq!(code, 302),
            other => panic!("expected DownloadError, got {:?}", other),
        }
        assert!(! dest.exists());
    }

    #[test]
    fn transport_failure_removes_partial_file() {
        let transport = ScriptedTransport::new();
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out");

        match fetch(&transport, &url("https://a.test/reset"), &dest) {
            Err(Error::StreamFailed { .. }) => {},
            other => panic!("expected StreamFailed, got {:?}", other),
        }
        assert!(! dest.exists());
    }

    #[test]
    fn plain_http_is_refused() {
        let transport = ScriptedTransport::new()
            .redirect("https://a.test/start", 302, "http://a.test/plain")
            .ok("http://a.test/plain", b"data");
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out");

        match fetch(&transport, &url("https://a.test/start"), &dest) {
            Err(Error::InsecureUrl { url: u }) => assert_eq!(u.scheme(), "http"),
            other => panic!("expected InsecureUrl, got {:?}", other),
        }
        assert_eq!(transport.requests(), vec!["https://a.test/start".to_string()]);
        assert!(! dest.exists());
    }
}
