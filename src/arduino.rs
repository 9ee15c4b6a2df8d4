/* This is part of smartblock-agent - which is under the MIT License **********/

//! The arduino-cli subcommands the agent relies on.

use std::ffi::OsString;
use std::path::Path;

use snafu::ResultExt;
use log::*;

use crate::error::{Error, Result};
use crate::error;
use crate::process::{Output, Runner};

/// A located arduino-cli binary, driven through a `Runner`
pub struct ArduinoCli<'a> {
    runner: &'a dyn Runner,
    bin: &'a Path,
}

fn args<I, S>(items: I) -> Vec<OsString>
where
    I: IntoIterator<Item = S>,
    S: Into<OsString>,
{
    items.into_iter().map(Into::into).collect()
}

impl<'a> ArduinoCli<'a> {
    pub fn new(runner: &'a dyn Runner, bin: &'a Path) -> ArduinoCli<'a> {
        ArduinoCli {
            runner: runner,
            bin: bin,
        }
    }

    fn run(&self, args: &[OsString], cwd: Option<&Path>) -> Result<Output> {
        self.runner.run(self.bin, args, cwd)
    }

    pub fn version(&self) -> Result<String> {
        let out = self.run(&args(&["version"]), None)?;
        Ok(out.stdout.trim().to_string())
    }

    /// Create the default configuration and refresh the package index.
    /// An existing configuration is kept.
    pub fn init(&self) -> Result<()> {
        match self.run(&args(&["config", "init"]), None) {
            Ok(_) => {},
            Err(Error::ProcessFailed { ref stderr, ref stdout, .. })
                if stderr.contains("already exists") || stdout.contains("already exists") =>
            {
                debug!("arduino-cli configuration already exists, keeping it");
            },
            Err(err) => return Err(err),
        }
        self.run(&args(&["core", "update-index"]), None)?;
        Ok(())
    }

    pub fn core_install(&self, core: &str) -> Result<Output> {
        info!("Installing core {}", core);
        self.run(&args(&["core", "install", core]), None)
    }

    /// Connected boards, as the JSON document arduino-cli reports
    pub fn board_list(&self) -> Result<serde_json::Value> {
        let out = self.run(&args(&["board", "list", "--format", "json"]), None)?;
        serde_json::from_str(&out.stdout).context(error::BadBoardList{})
    }

    /// Compile the sketch in `sketch_dir`. When `output_dir` is given the
    /// binaries are exported there.
    pub fn compile(&self, fqbn: &str, sketch_dir: &Path, output_dir: Option<&Path>)
        -> Result<Output>
    {
        let mut list = args(&["compile", "--fqbn", fqbn]);
        if let Some(dir) = output_dir {
            list.push("--output-dir".into());
            list.push(dir.into());
        }
        list.push(sketch_dir.into());
        info!("Compiling {:#?} for {}", sketch_dir, fqbn);
        self.run(&list, Some(sketch_dir))
    }

    /// Upload a compiled sketch. `input_dir` points at the binaries exported
    /// by a previous `compile`.
    pub fn upload(&self, port: &str, fqbn: &str, sketch_dir: &Path, input_dir: Option<&Path>)
        -> Result<Output>
    {
        let mut list = args(&["upload", "-p", port, "--fqbn", fqbn]);
        if let Some(dir) = input_dir {
            list.push("--input-dir".into());
            list.push(dir.into());
        }
        list.push(sketch_dir.into());
        info!("Uploading {:#?} to {} ({})", sketch_dir, port, fqbn);
        self.run(&list, Some(sketch_dir))
    }
}
