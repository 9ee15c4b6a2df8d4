/* This is part of smartblock-agent - which is under the MIT License **********/

use crate::error::Result;
use crate::error;

use snafu::{ResultExt, ensure};
use log::*;

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Compression formats the toolchain is distributed in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
}

impl ArchiveFormat {
    pub fn from_file_name(name: &str) -> Option<ArchiveFormat> {
        if name.ends_with(".zip") {
            Some(ArchiveFormat::Zip)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArchiveFormat::TarGz)
        } else {
            None
        }
    }
}

/// Quote a path for a single-quoted PowerShell string. Embedded single
/// quotes are doubled, which is the only escape PowerShell honours there.
fn powershell_quote(path: &Path) -> String {
    format!("'{}'", path.to_string_lossy().replace('\'', "''"))
}

/// Program and arguments that unpack `archive` into `dest`
fn extraction_command(format: ArchiveFormat, archive: &Path, dest: &Path)
    -> (&'static str, Vec<OsString>)
{
    match format {
        ArchiveFormat::TarGz => ("tar", vec![
            "-xzf".into(),
            archive.into(),
            "-C".into(),
            dest.into(),
        ]),
        ArchiveFormat::Zip if cfg!(windows) => ("powershell", vec![
            "-NoProfile".into(),
            "-Command".into(),
            format!("Expand-Archive -LiteralPath {} -DestinationPath {} -Force",
                powershell_quote(archive), powershell_quote(dest)).into(),
        ]),
        ArchiveFormat::Zip => ("unzip", vec![
            "-o".into(),
            archive.into(),
            "-d".into(),
            dest.into(),
        ]),
    }
}

/// Unpack `archive` into the existing directory `dest`, using the
/// decompression utility of the host.
pub fn extract(format: ArchiveFormat, archive: &Path, dest: &Path) -> Result<()> {
    ensure!(archive.is_file(), error::FileDoesNotExist{ path: archive.to_path_buf() });
    std::fs::create_dir_all(dest).context(
        error::CreateDirError{ path: dest.to_path_buf() })?;

    let (tool, args) = extraction_command(format, archive, dest);
    info!("Decompressing {:#?} with {}", archive, tool);
    let output = Command::new(tool)
        .args(&args)
        .stdin(Stdio::null())
        .output()
        .context(error::ProgFailed{ proc: tool.to_string() })?;
    ensure!(output.status.success(), error::ExtractionFailed{
        path: archive.to_path_buf(),
        tool: tool.to_string(),
        code: output.status.code(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    });
    Ok(())
}

/// Depth-first search for a regular file named exactly `name` below `dir`.
/// Entries are visited in name order so the result does not depend on the
/// filesystem's listing order.
pub fn find_file(dir: &Path, name: &str) -> Result<Option<PathBuf>> {
    let mut entries = std::fs::read_dir(dir)
        .context(error::DirIterFailed{ dir: dir.to_path_buf() })?
        .collect::<std::result::Result<Vec<_>, _>>()
        .context(error::DirIterFailed{ dir: dir.to_path_buf() })?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let path = entry.path();
        let file_type = entry.file_type()
            .context(error::DirIterFailed{ dir: dir.to_path_buf() })?;
        if file_type.is_dir() {
            if let Some(found) = find_file(&path, name)? {
                return Ok(Some(found));
            }
        } else if file_type.is_file() && entry.file_name() == name {
            trace!("Found {} at {:#?}", name, path);
            return Ok(Some(path));
        }
    }
    Ok(None)
}
