/* This is part of smartblock-agent - which is under the MIT License **********/

use snafu::{ResultExt, OptionExt};
use crate::error::Result;
use crate::error;
use crate::decompress::{self, ArchiveFormat};
use crate::download::{self, Transport};
use crate::platform::{Platform, PlatformProfile, TOOLCHAIN_NAME};
use crate::util;

use log::*;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// What to do when no toolchain can be found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallMode {
    /// Download and install arduino-cli into the install directory
    Auto,
    /// Only look for an existing arduino-cli, never download
    SearchOnly,
}

#[derive(Debug, Clone)]
pub struct ToolchainOptions {
    pub profile: PlatformProfile,
    /// Explicit path to the binary, used as-is when it exists
    pub cli_path: Option<PathBuf>,
    /// Root of the per-user install tree
    pub install_dir: PathBuf,
    pub mode: InstallMode,
    /// Directories searched for the binary. None means the PATH of the
    /// process.
    pub search_path: Option<OsString>,
}

pub struct Toolchain {
    options: ToolchainOptions,
    transport: Arc<dyn Transport>,
    install_lock: Mutex<()>,
}

impl Toolchain {
    pub fn new(options: ToolchainOptions, transport: Arc<dyn Transport>) -> Toolchain {
        Toolchain {
            options: options,
            transport: transport,
            install_lock: Mutex::new(()),
        }
    }

    pub fn profile(&self) -> &PlatformProfile {
        &self.options.profile
    }

    /// Path where the installer places the binary for `platform`
    pub fn canonical_path(&self, platform: Platform) -> PathBuf {
        let mut path = self.options.install_dir.clone();
        path.push(platform.tag());
        path.push(platform.executable_name());
        path
    }

    fn search(&self) -> Option<PathBuf> {
        let found = match &self.options.search_path {
            Some(paths) => {
                let cwd = std::env::current_dir().ok()?;
                which::which_in(TOOLCHAIN_NAME, Some(paths), cwd)
            },
            None => which::which(TOOLCHAIN_NAME),
        };
        found.ok()
    }

    /// Find a usable arduino-cli binary, installing one when allowed.
    ///
    /// Lookup order: the configured override, the canonical install path,
    /// the search path. Once installed, later calls are served from the
    /// canonical path without any network access.
    pub fn locate(&self) -> Result<PathBuf> {
        if let Some(path) = &self.options.cli_path {
            if path.exists() {
                debug!("Using configured arduino-cli {:#?}", path);
                return Ok(path.clone());
            }
            warn!("Configured arduino-cli {:#?} does not exist, searching elsewhere", path);
        }

        let platform = self.options.profile.resolve()?;
        let bin = self.canonical_path(platform);
        if bin.is_file() {
            trace!("Using installed arduino-cli {:#?}", bin);
            return Ok(bin);
        }
        if let Some(path) = self.search() {
            debug!("Using arduino-cli from the search path: {:#?}", path);
            return Ok(path);
        }

        match self.options.mode {
            InstallMode::Auto => self.install(platform),
            InstallMode::SearchOnly => error::ToolchainNotInstalled{
                name: platform.executable_name(),
                install_dir: bin.parent().unwrap_or(&bin).to_path_buf(),
            }.fail(),
        }
    }

    /// Download, unpack and place arduino-cli at its canonical path.
    ///
    /// Only one installation runs at a time; callers arriving while one is
    /// in flight wait for it and then reuse its result.
    fn install(&self, platform: Platform) -> Result<PathBuf> {
        // The lock protects no data, so a poisoned lock is still usable.
        let _guard = self.install_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let bin = self.canonical_path(platform);
        if bin.is_file() {
            debug!("arduino-cli was installed by a concurrent request");
            return Ok(bin);
        }

        let install_dir = &self.options.install_dir;
        std::fs::create_dir_all(install_dir).context(
            error::CreateDirError{ path: install_dir.clone() })?;
        let staging = tempfile::Builder::new()
            .prefix("_staging-")
            .tempdir_in(install_dir)
            .context(error::CreateDirError{ path: install_dir.clone() })?;

        let result = self.install_from(platform, staging.path(), &bin);

        let staging_path = staging.path().to_path_buf();
        if let Err(err) = staging.close() {
            warn!("Failed to remove staging directory {:#?}: {}", staging_path, err);
        }
        result.map(|()| {
            info!("arduino-cli installed at {:#?}", bin);
            bin
        })
    }

    fn install_from(&self, platform: Platform, staging: &Path, bin: &Path) -> Result<()> {
        let url = platform.download_url()?;
        let archive = staging.join(util::url_last(&url)?);
        let format = archive.file_name()
            .and_then(|name| name.to_str())
            .and_then(ArchiveFormat::from_file_name)
            .context(error::UnknownArchiveFormat{ name: archive.clone() })?;

        info!("Downloading arduino-cli for {} from {}", platform, url);
        download::fetch(self.transport.as_ref(), &url, &archive)?;

        let unpacked = staging.join("unpacked");
        decompress::extract(format, &archive, &unpacked)?;

        let name = platform.executable_name();
        let found = decompress::find_file(&unpacked, name)?
            .context(error::ToolchainNotFoundInArchive{
                name: name,
                dir: unpacked.clone(),
            })?;
        util::install_file(&found, bin)
    }
}
