/* This is part of smartblock-agent - which is under the MIT License **********/

use std::path::{Path, PathBuf};

use snafu::{ResultExt, OptionExt};
use log::*;

use crate::error::Result;
use crate::error;

/// Firmware formats the editor knows how to flash, by order of preference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactFormat {
    Hex,
    Bin,
}

impl ArtifactFormat {
    const PREFERENCE: [ArtifactFormat; 2] = [ArtifactFormat::Hex, ArtifactFormat::Bin];

    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactFormat::Hex => "hex",
            ArtifactFormat::Bin => "bin",
        }
    }

    fn extension(self) -> &'static str {
        match self {
            ArtifactFormat::Hex => ".hex",
            ArtifactFormat::Bin => ".bin",
        }
    }
}

impl std::fmt::Display for ArtifactFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Firmware image produced by a compile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildArtifact {
    pub path: PathBuf,
    pub format: ArtifactFormat,
    pub bytes: Vec<u8>,
}

/// Pick the firmware image among the files directly inside `out_dir`:
/// the first `.hex` file if any, otherwise the first `.bin` file.
/// Files are considered in name order.
pub fn collect(out_dir: &Path) -> Result<BuildArtifact> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(out_dir)
        .context(error::DirIterFailed{ dir: out_dir.to_path_buf() })?
    {
        let entry = entry.context(error::DirIterFailed{ dir: out_dir.to_path_buf() })?;
        let is_file = entry.file_type()
            .context(error::DirIterFailed{ dir: out_dir.to_path_buf() })?
            .is_file();
        if is_file {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    names.sort();

    let (name, format) = ArtifactFormat::PREFERENCE.iter()
        .find_map(|format| {
            names.iter()
                .find(|name| name.ends_with(format.extension()))
                .map(|name| (name, *format))
        })
        .context(error::ArtifactNotFound{ dir: out_dir.to_path_buf() })?;

    let path = out_dir.join(name);
    let bytes = std::fs::read(&path).context(
        error::FailedToRead{ path: path.clone() })?;
    debug!("Selected {} artifact {:#?} ({} bytes)", format, path, bytes.len());
    Ok(BuildArtifact {
        path: path,
        format: format,
        bytes: bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::fs;

    #[test]
    fn hex_takes_precedence() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("sketch.ino.bin"), [0xffu8, 0xee]).unwrap();
        fs::write(dir.path().join("sketch.ino.hex"), b":00000001FF\n").unwrap();
        fs::write(dir.path().join("sketch.ino.elf"), b"ELF").unwrap();

        let artifact = collect(dir.path()).unwrap();
        assert_eq!(artifact.format, ArtifactFormat::Hex);
        assert_eq!(artifact.bytes, b":00000001FF\n");
        assert_eq!(artifact.path, dir.path().join("sketch.ino.hex"));
    }

    #[test]
    fn bin_is_the_fallback() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("sketch.ino.bin"), [1u8, 2, 3]).unwrap();
        fs::write(dir.path().join("sketch.ino.map"), b"map").unwrap();

        let artifact = collect(dir.path()).unwrap();
        assert_eq!(artifact.format, ArtifactFormat::Bin);
        assert_eq!(artifact.bytes, vec![1u8, 2, 3]);
    }

    #[test]
    fn plain_hex_is_preferred_over_bootloader_image() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("sketch.ino.with_bootloader.hex"), b"big").unwrap();
        fs::write(dir.path().join("sketch.ino.hex"), b"small").unwrap();

        assert_eq!(collect(dir.path()).unwrap().bytes, b"small");
    }

    #[test]
    fn nothing_recognizable_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("sketch.ino.elf"), b"ELF").unwrap();
        fs::create_dir(dir.path().join("firmware.hex")).unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("nested").join("deep.hex"), b"no").unwrap();

        match collect(dir.path()) {
            Err(Error::ArtifactNotFound { dir: d }) => assert_eq!(d, dir.path()),
            other => panic!("expected ArtifactNotFound, got {:?}", other),
        }
    }
}
