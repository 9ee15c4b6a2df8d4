/* This is part of smartblock-agent - which is under the MIT License **********/

use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Failed to initialize logging"))]
    LogInitFailed {
    },

    // Configuration ----------------------------------------------------------

    #[snafu(display("Invalid port '{}': {}", value, source))]
    InvalidPort {
        value: String,
        source: std::num::ParseIntError,
    },

    #[snafu(display("Invalid job number '{}': {}", value, source))]
    InvalidJobNumber {
        value: String,
        source: std::num::ParseIntError,
    },

    #[snafu(display("A value of 0 jobs is meaningless"))]
    ZeroJob {
    },

    #[snafu(display("Failed to read configuration {:#?}: {}", path, source))]
    FailedToDeser {
        path: std::path::PathBuf,
        source: toml::de::Error,
    },

    // Platform ---------------------------------------------------------------

    #[snafu(display("Unsupported platform: {} on {}. Supported platforms are \
            macos-arm64, macos-x64, windows-x64 and linux-x64", os, arch))]
    UnsupportedPlatform {
        os: String,
        arch: String,
    },

    #[snafu(display("The URL to retrieve the toolchain seems invalid: {}", source))]
    InvalidToolchainURL {
        source: url::ParseError,
    },

    #[snafu(display("Failed to extract last URL component from {}", url))]
    URLExtractError {
        url: url::Url,
    },

    #[snafu(display("Unknown archive format for {:#?}", name))]
    UnknownArchiveFormat {
        name: std::path::PathBuf,
    },

    // Download ---------------------------------------------------------------

    #[snafu(display("Refusing to download from non-https URL {}", url))]
    InsecureUrl {
        url: url::Url,
    },

    #[snafu(display("curl refused url '{}': {}", url, source))]
    URLError {
        source: curl::Error,
        url: url::Url,
    },

    #[snafu(display("Failed to setup curl: {}", source))]
    CURLSetupError {
        source: curl::Error,
    },

    #[snafu(display("Failed to download file from URL {}: {}", url, source))]
    RequestError {
        source: curl::Error,
        url: url::Url,
    },

    #[snafu(display("Failed to store data received from {}: {}", url, source))]
    StreamFailed {
        source: std::io::Error,
        url: url::Url,
    },

    #[snafu(display("Failed to download file from URL {}: HTTP error {}", url, code))]
    DownloadError {
        code: u32,
        url: url::Url,
    },

    #[snafu(display("Too many redirects (more than {}) while downloading {}", limit, url))]
    TooManyRedirects {
        limit: u32,
        url: url::Url,
    },

    #[snafu(display("Cyclic redirect: {} was already visited", url))]
    CyclicRedirect {
        url: url::Url,
    },

    #[snafu(display("Invalid redirect location '{}' from {}: {}", location, url, source))]
    InvalidRedirect {
        location: String,
        url: url::Url,
        source: url::ParseError,
    },

    // Extraction and installation --------------------------------------------

    #[snafu(display("Failed to extract {:#?} with {} (status {:?}): {}",
            path, tool, code, stderr.trim()))]
    ExtractionFailed {
        path: std::path::PathBuf,
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    #[snafu(display("No file named '{}' found in the extracted archive {:#?}", name, dir))]
    ToolchainNotFoundInArchive {
        name: String,
        dir: std::path::PathBuf,
    },

    #[snafu(display("{} was not found. Set SMARTBLOCK_CLI_PATH, add it to the PATH, \
            or enable automatic installation into {:#?}", name, install_dir))]
    ToolchainNotInstalled {
        name: String,
        install_dir: std::path::PathBuf,
    },

    // Filesystem -------------------------------------------------------------

    #[snafu(display("File {:#?} does not exist", path))]
    FileDoesNotExist {
        path: std::path::PathBuf,
    },

    #[snafu(display("Failed to read file {:#?}: {}", path, source))]
    FailedToRead {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Failed to create directory {:?}: {}", path, source))]
    CreateDirError {
        source: std::io::Error,
        path: std::path::PathBuf,
    },

    #[snafu(display("Failed to create/open file {:#?}: {}", path, source))]
    CreateFileError {
        source: std::io::Error,
        path: std::path::PathBuf,
    },

    #[snafu(display("Failed to write data at path {:#?}: {}", path, source))]
    FailedToWrite {
        source: std::io::Error,
        path: std::path::PathBuf,
    },

    #[snafu(display("Failed to copy {:#?} to {:#?}: {}", from, to, source))]
    CopyFailed {
        from: std::path::PathBuf,
        to: std::path::PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Failed to iterate over directory {:#?}: {}", dir, source))]
    DirIterFailed {
        dir: std::path::PathBuf,
        source: std::io::Error,
    },

    // Toolchain processes ----------------------------------------------------

    #[snafu(display("Failed to run process '{}': {}", proc, source))]
    ProgFailed {
        source: std::io::Error,
        proc: String,
    },

    #[snafu(display("'{}' exited with status {:?}: {}", proc, code, stderr.trim()))]
    ProcessFailed {
        proc: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[snafu(display("'{}' did not complete within {:?} and was killed", proc, timeout))]
    ProcessTimedOut {
        proc: String,
        timeout: std::time::Duration,
        stdout: String,
        stderr: String,
    },

    #[snafu(display("Failed to decode the board list reported by arduino-cli: {}", source))]
    BadBoardList {
        source: serde_json::Error,
    },

    #[snafu(display("No .hex or .bin build artifact found in {:#?}", dir))]
    ArtifactNotFound {
        dir: std::path::PathBuf,
    },

    // Requests ---------------------------------------------------------------

    #[snafu(display("missing {}", field))]
    MissingRequiredField {
        field: String,
    },

    #[snafu(display("Invalid JSON request body: {}", source))]
    BadRequestBody {
        source: serde_json::Error,
    },

    // Service ----------------------------------------------------------------

    #[snafu(display("Failed to setup signal handler: {}", source))]
    CtrlCFailed {
        source: ctrlc::Error,
    },

    #[snafu(display("Failed to start the async runtime: {}", source))]
    RuntimeInit {
        source: std::io::Error,
    },

    #[snafu(display("Failed to listen on {}: {}", addr, source))]
    ServerBind {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },

    #[snafu(display("HTTP server failed: {}", source))]
    ServerFailed {
        source: std::io::Error,
    },

    #[snafu(display("Request worker failed: {}", source))]
    WorkerFailed {
        source: tokio::task::JoinError,
    },
}

impl Error {
    /// Errors caused by the caller's input rather than by this service or
    /// the toolchain.
    pub fn is_client_error(&self) -> bool {
        matches!(self,
            Error::MissingRequiredField { .. } | Error::BadRequestBody { .. })
    }

    /// Message sent back to the editor. For toolchain failures this is the
    /// diagnostic text the toolchain printed, which is what users need to
    /// see to fix their sketch.
    pub fn user_message(&self) -> String {
        match self {
            Error::ProcessFailed { stderr, stdout, .. } => {
                if ! stderr.trim().is_empty() {
                    stderr.clone()
                } else if ! stdout.trim().is_empty() {
                    stdout.clone()
                } else {
                    self.to_string()
                }
            },
            _ => self.to_string(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
