/* This is part of smartblock-agent - which is under the MIT License **********/

//! Mapping of the host operating system and CPU onto an arduino-cli
//! distribution.
//!
//! Only four combinations have a pre-built distribution: macOS on ARM64 and
//! x86_64, Windows on x86_64 and Linux on x86_64. Anything else is refused
//! before any file is created or any byte is downloaded.

use snafu::ResultExt;

use crate::error::Result;
use crate::error;

/// Where the official arduino-cli distributions are published.
const DOWNLOAD_BASE: &str = "https://downloads.arduino.cc/arduino-cli/";

/// Name of the toolchain executable, without platform suffix.
pub const TOOLCHAIN_NAME: &str = "arduino-cli";

/// Operating system and CPU of the host, as reported by the Rust standard
/// library (`std::env::consts`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformProfile {
    pub os: String,
    pub arch: String,
}

impl PlatformProfile {
    pub fn host() -> PlatformProfile {
        PlatformProfile::new(std::env::consts::OS, std::env::consts::ARCH)
    }

    pub fn new(os: &str, arch: &str) -> PlatformProfile {
        PlatformProfile {
            os: os.to_string(),
            arch: arch.to_string(),
        }
    }

    pub fn resolve(&self) -> Result<Platform> {
        match (self.os.as_str(), self.arch.as_str()) {
            ("macos", "aarch64") => Ok(Platform::MacosArm64),
            ("macos", "x86_64") => Ok(Platform::MacosX64),
            ("windows", "x86_64") => Ok(Platform::WindowsX64),
            ("linux", "x86_64") => Ok(Platform::LinuxX64),
            _ => error::UnsupportedPlatform {
                os: self.os.clone(),
                arch: self.arch.clone(),
            }.fail(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    MacosArm64,
    MacosX64,
    WindowsX64,
    LinuxX64,
}

impl Platform {
    /// Stable tag, used as the last component of the install directory.
    pub fn tag(self) -> &'static str {
        match self {
            Platform::MacosArm64 => "macos-arm64",
            Platform::MacosX64 => "macos-x64",
            Platform::WindowsX64 => "windows-x64",
            Platform::LinuxX64 => "linux-x64",
        }
    }

    pub fn is_windows(self) -> bool {
        self == Platform::WindowsX64
    }

    /// File name of the distribution archive on the download server
    fn archive_name(self) -> &'static str {
        match self {
            Platform::MacosArm64 => "arduino-cli_latest_macOS_ARM64.tar.gz",
            Platform::MacosX64 => "arduino-cli_latest_macOS_64bit.tar.gz",
            Platform::WindowsX64 => "arduino-cli_latest_Windows_64bit.zip",
            Platform::LinuxX64 => "arduino-cli_latest_Linux_64bit.tar.gz",
        }
    }

    pub fn download_url(self) -> Result<url::Url> {
        url::Url::parse(DOWNLOAD_BASE)
            .and_then(|base| base.join(self.archive_name()))
            .context(error::InvalidToolchainURL{})
    }

    /// Exact file name of the toolchain executable on this platform
    pub fn executable_name(self) -> &'static str {
        if self.is_windows() {
            "arduino-cli.exe"
        } else {
            TOOLCHAIN_NAME
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.tag())
    }
}
