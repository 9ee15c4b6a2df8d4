/* This is part of smartblock-agent - which is under the MIT License **********/

use crate::error::Result;
use crate::error;
use log::*;

use snafu::{ResultExt, ensure};

use std::ffi::OsString;
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Interval between two checks of a running child when a timeout is set
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// How long the output of a killed child is still collected. A process
/// that escaped the kill may hold the pipes open forever.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Text captured from a toolchain process that exited successfully
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Output {
    pub stdout: String,
    pub stderr: String,
}

/// Runs external programs. Arguments are always handed over as a list and
/// never go through a shell, so sketch names, board identifiers and port
/// names cannot inject commands.
pub trait Runner: Send + Sync {
    /// Run `program` to completion. A nonzero exit status is an error that
    /// carries everything the program printed.
    fn run(&self, program: &Path, args: &[OsString], cwd: Option<&Path>) -> Result<Output>;
}

/// Runner spawning real child processes
pub struct ProcessRunner {
    timeout: Option<Duration>,
}

impl ProcessRunner {
    pub fn new(timeout: Option<Duration>) -> ProcessRunner {
        ProcessRunner {
            timeout: timeout,
        }
    }
}

/// Output of one pipe, read by a background thread
struct Capture {
    data: Arc<Mutex<Vec<u8>>>,
    reader: JoinHandle<()>,
}

impl Capture {
    fn start<R: Read + Send + 'static>(pipe: Option<R>) -> Capture {
        let data = Arc::new(Mutex::new(Vec::new()));
        let sink = data.clone();
        let reader = std::thread::spawn(move || {
            let mut pipe = match pipe {
                Some(pipe) => pipe,
                None => return,
            };
            let mut chunk = [0u8; 4096];
            loop {
                match pipe.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => sink.lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .extend_from_slice(&chunk[..n]),
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {},
                    Err(err) => {
                        debug!("Failed to read child output: {}", err);
                        break;
                    },
                }
            }
        });
        Capture {
            data: data,
            reader: reader,
        }
    }

    /// Wait for the pipe to close, or at most `limit` when given, and
    /// return what was read so far.
    fn finish(self, limit: Option<Duration>) -> String {
        match limit {
            None => {
                let _ = self.reader.join();
            },
            Some(limit) => {
                let deadline = Instant::now() + limit;
                while ! self.reader.is_finished() && Instant::now() < deadline {
                    std::thread::sleep(POLL_INTERVAL);
                }
                if self.reader.is_finished() {
                    let _ = self.reader.join();
                } else {
                    debug!("Child output still open after it was killed, leaving it");
                }
            },
        }
        let data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&data).into_owned()
    }
}

/// Put the child in its own process group, so that a timeout also reaches
/// whatever it started.
#[cfg(unix)]
fn isolate(command: &mut Command) {
    use std::os::unix::process::CommandExt;
    command.process_group(0);
}

#[cfg(not(unix))]
fn isolate(_command: &mut Command) {}

#[cfg(unix)]
fn kill_group(child: &Child) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Err(err) = killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL) {
        debug!("Failed to kill process group {}: {}", child.id(), err);
    }
}

#[cfg(not(unix))]
fn kill_group(_child: &Child) {}

/// Wait for `child`, killing it and its process group once `timeout` has
/// elapsed. Returns None when the child had to be killed.
fn wait(child: &mut Child, timeout: Option<Duration>) -> std::io::Result<Option<ExitStatus>> {
    let timeout = match timeout {
        Some(timeout) => timeout,
        None => return child.wait().map(Some),
    };
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            kill_group(child);
            // The group kill may already have taken the child down
            if let Err(err) = child.kill() {
                trace!("kill after group kill: {}", err);
            }
            child.wait()?;
            return Ok(None);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

impl Runner for ProcessRunner {
    fn run(&self, program: &Path, args: &[OsString], cwd: Option<&Path>) -> Result<Output> {
        let proc = program.display().to_string();
        debug!("Running {} {:?}", proc, args);

        let mut command = Command::new(program);
        command.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }
        if self.timeout.is_some() {
            isolate(&mut command);
        }
        let mut child = command.spawn()
            .context(error::ProgFailed{ proc: proc.clone() })?;
        let stdout = Capture::start(child.stdout.take());
        let stderr = Capture::start(child.stderr.take());

        let status = wait(&mut child, self.timeout)
            .context(error::ProgFailed{ proc: proc.clone() })?;
        let status = match status {
            Some(status) => status,
            None => return error::ProcessTimedOut{
                proc: proc,
                timeout: self.timeout.unwrap_or_default(),
                stdout: stdout.finish(Some(DRAIN_GRACE)),
                stderr: stderr.finish(Some(DRAIN_GRACE)),
            }.fail(),
        };
        let stdout = stdout.finish(None);
        let stderr = stderr.finish(None);
        ensure!(status.success(), error::ProcessFailed{
            proc: proc,
            code: status.code(),
            stdout: stdout,
            stderr: stderr,
        });
        trace!("{} succeeded", proc);
        Ok(Output {
            stdout: stdout,
            stderr: stderr,
        })
    }
}
