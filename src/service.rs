/* This is part of smartblock-agent - which is under the MIT License **********/

//! Request pipelines of the agent, independent of the HTTP layer.
//!
//! Every operation is synchronous and may block for a long time (download,
//! toolchain run). The server runs them on its blocking pool.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_derive::{Deserialize, Serialize};
use log::*;

use crate::arduino::ArduinoCli;
use crate::artifact::{self, BuildArtifact};
use crate::config::Config;
use crate::download::CurlTransport;
use crate::error::Result;
use crate::error;
use crate::process::{ProcessRunner, Runner};
use crate::toolchain::Toolchain;
use crate::workspace::Workspace;

/// Body of `/compile` and `/compile-upload`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SketchRequest {
    pub ino: Option<String>,
    pub fqbn: Option<String>,
    pub port: Option<String>,
}

/// Body of `/install-core`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CoreRequest {
    pub core: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Health {
    pub ok: bool,
    pub agent: &'static str,
    pub port: u16,
    pub platform: String,
    pub arch: String,
}

#[derive(Debug)]
pub struct CompileOutcome {
    pub artifact: BuildArtifact,
    /// Standard output of the compile
    pub log: String,
}

#[derive(Debug)]
pub struct UploadOutcome {
    pub compile_log: String,
    /// Standard output of the upload
    pub log: String,
}

pub struct Agent {
    toolchain: Toolchain,
    runner: Arc<dyn Runner>,
    port: u16,
    work_dir: Option<PathBuf>,
}

/// Values of the required fields, in order. Absent and empty fields are
/// all reported at once, e.g. "missing ino/fqbn".
fn required<'r>(fields: &[(&str, &'r Option<String>)]) -> Result<Vec<&'r str>> {
    let mut values = Vec::with_capacity(fields.len());
    let mut missing = Vec::new();
    for (name, value) in fields {
        match value.as_deref() {
            Some(value) if ! value.is_empty() => values.push(value),
            _ => missing.push(*name),
        }
    }
    if ! missing.is_empty() {
        return error::MissingRequiredField{ field: missing.join("/") }.fail();
    }
    Ok(values)
}

/// Operating system as the editor names it in `/health`
fn editor_os_name(os: &str) -> &str {
    match os {
        "macos" => "darwin",
        "windows" => "win32",
        other => other,
    }
}

/// CPU architecture as the editor names it in `/health`
fn editor_arch_name(arch: &str) -> &str {
    match arch {
        "x86_64" => "x64",
        "aarch64" => "arm64",
        "x86" => "ia32",
        other => other,
    }
}

impl Agent {
    pub fn new(config: &Config) -> Agent {
        let transport = Arc::new(CurlTransport::new(config.download_timeout));
        let runner = Arc::new(ProcessRunner::new(config.command_timeout));
        Agent::with_parts(
            Toolchain::new(config.toolchain_options(), transport),
            runner,
            config.port,
            config.work_dir.clone(),
        )
    }

    pub fn with_parts(toolchain: Toolchain, runner: Arc<dyn Runner>, port: u16,
                      work_dir: Option<PathBuf>) -> Agent {
        Agent {
            toolchain: toolchain,
            runner: runner,
            port: port,
            work_dir: work_dir,
        }
    }

    pub fn health(&self) -> Health {
        let profile = self.toolchain.profile();
        Health {
            ok: true,
            agent: "smartblock",
            port: self.port,
            platform: editor_os_name(&profile.os).to_string(),
            arch: editor_arch_name(&profile.arch).to_string(),
        }
    }

    /// Make sure the toolchain is available, installing it if needed
    pub fn prepare(&self) -> Result<PathBuf> {
        self.toolchain.locate()
    }

    pub fn version(&self) -> Result<String> {
        let bin = self.toolchain.locate()?;
        ArduinoCli::new(self.runner.as_ref(), &bin).version()
    }

    pub fn init(&self) -> Result<()> {
        let bin = self.toolchain.locate()?;
        ArduinoCli::new(self.runner.as_ref(), &bin).init()
    }

    /// Install a board core (e.g. "arduino:avr"). Returns the toolchain's
    /// output.
    pub fn install_core(&self, request: &CoreRequest) -> Result<String> {
        let core = required(&[("core", &request.core)])?[0];
        let bin = self.toolchain.locate()?;
        let out = ArduinoCli::new(self.runner.as_ref(), &bin).core_install(core)?;
        Ok(out.stdout)
    }

    pub fn boards(&self) -> Result<serde_json::Value> {
        let bin = self.toolchain.locate()?;
        ArduinoCli::new(self.runner.as_ref(), &bin).board_list()
    }

    /// Compile a sketch and return its firmware image
    pub fn compile(&self, request: &SketchRequest) -> Result<CompileOutcome> {
        let fields = required(&[("ino", &request.ino), ("fqbn", &request.fqbn)])?;
        let (ino, fqbn) = (fields[0], fields[1]);

        let bin = self.toolchain.locate()?;
        let workspace = Workspace::create(self.work_dir.as_deref(), true)?;
        let result = self.build(&bin, &workspace, ino, fqbn);
        workspace.destroy();
        result
    }

    /// Compile a sketch then upload it to the board on `port`
    pub fn compile_upload(&self, request: &SketchRequest) -> Result<UploadOutcome> {
        let fields = required(&[
            ("ino", &request.ino),
            ("fqbn", &request.fqbn),
            ("port", &request.port),
        ])?;
        let (ino, fqbn, port) = (fields[0], fields[1], fields[2]);

        let bin = self.toolchain.locate()?;
        let workspace = Workspace::create(self.work_dir.as_deref(), true)?;
        let result = self.flash(&bin, &workspace, ino, fqbn, port);
        workspace.destroy();
        result
    }

    fn build(&self, bin: &Path, workspace: &Workspace, ino: &str, fqbn: &str)
        -> Result<CompileOutcome>
    {
        let cli = ArduinoCli::new(self.runner.as_ref(), bin);
        workspace.write_sketch(ino)?;
        let out = cli.compile(fqbn, workspace.sketch_dir(), workspace.output_dir())?;
        let out_dir = workspace.output_dir().unwrap_or_else(|| workspace.root());
        let artifact = artifact::collect(out_dir)?;
        info!("Compiled a {} byte {} image for {}", artifact.bytes.len(), artifact.format, fqbn);
        Ok(CompileOutcome {
            artifact: artifact,
            log: out.stdout,
        })
    }

    fn flash(&self, bin: &Path, workspace: &Workspace, ino: &str, fqbn: &str, port: &str)
        -> Result<UploadOutcome>
    {
        let cli = ArduinoCli::new(self.runner.as_ref(), bin);
        workspace.write_sketch(ino)?;
        let compiled = cli.compile(fqbn, workspace.sketch_dir(), workspace.output_dir())?;
        let uploaded = cli.upload(port, fqbn, workspace.sketch_dir(), workspace.output_dir())?;
        info!("Uploaded sketch to {}", port);
        Ok(UploadOutcome {
            compile_log: compiled.stdout,
            log: uploaded.stdout,
        })
    }
}
