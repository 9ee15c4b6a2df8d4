/* This is part of smartblock-agent - which is under the MIT License **********/

use std::path::{Path, PathBuf};

use snafu::ResultExt;
use log::*;

use crate::error::Result;
use crate::error;

/// arduino-cli wants the main sketch file named after its directory
const SKETCH_DIR: &str = "sketch";
const SKETCH_FILE: &str = "sketch.ino";
const OUTPUT_DIR: &str = "out";

/// Scratch directory tree owned by a single request:
///
/// ```text
/// smartblock-XXXXXX/
///     sketch/sketch.ino
///     out/              (compile flows only)
/// ```
///
/// The tree is removed by `destroy()`, or when the value is dropped on any
/// other path (early return, panic).
pub struct Workspace {
    root: tempfile::TempDir,
    sketch_dir: PathBuf,
    output_dir: Option<PathBuf>,
}

impl Workspace {
    /// Allocate a uniquely named workspace under `base`, or under the system
    /// temporary directory.
    pub fn create(base: Option<&Path>, with_output: bool) -> Result<Workspace> {
        let base = base.map(Path::to_path_buf).unwrap_or_else(std::env::temp_dir);
        std::fs::create_dir_all(&base).context(
            error::CreateDirError{ path: base.clone() })?;
        let root = tempfile::Builder::new()
            .prefix("smartblock-")
            .tempdir_in(&base)
            .context(error::CreateDirError{ path: base.clone() })?;

        let sketch_dir = root.path().join(SKETCH_DIR);
        std::fs::create_dir(&sketch_dir).context(
            error::CreateDirError{ path: sketch_dir.clone() })?;
        let output_dir = if with_output {
            let dir = root.path().join(OUTPUT_DIR);
            std::fs::create_dir(&dir).context(
                error::CreateDirError{ path: dir.clone() })?;
            Some(dir)
        } else {
            None
        };
        debug!("Created workspace {:#?}", root.path());

        Ok(Workspace {
            root: root,
            sketch_dir: sketch_dir,
            output_dir: output_dir,
        })
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub fn sketch_dir(&self) -> &Path {
        &self.sketch_dir
    }

    pub fn output_dir(&self) -> Option<&Path> {
        self.output_dir.as_deref()
    }

    /// Write the sketch source. There is exactly one source file per
    /// workspace, so writing again replaces it.
    pub fn write_sketch(&self, source: &str) -> Result<PathBuf> {
        let path = self.sketch_dir.join(SKETCH_FILE);
        std::fs::write(&path, source).context(
            error::FailedToWrite{ path: path.clone() })?;
        Ok(path)
    }

    /// Remove the whole tree. Failures are only logged: cleanup must never
    /// replace the outcome of the request that used the workspace.
    pub fn destroy(self) {
        let root = self.root.path().to_path_buf();
        match self.root.close() {
            Ok(()) => debug!("Removed workspace {:#?}", root),
            Err(err) => warn!("Failed to remove workspace {:#?}: {}", root, err),
        }
    }
}
