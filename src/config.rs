/* This is part of smartblock-agent - which is under the MIT License **********/

use std::path::{Path, PathBuf};
use std::time::Duration;
use snafu::{ResultExt, ensure};
use clap::{App, Arg, ArgMatches};
use serde_derive::Deserialize;
use log::*;

use crate::error::Result;
use crate::error;
use crate::platform::PlatformProfile;
use crate::toolchain::{InstallMode, ToolchainOptions};

pub const DEFAULT_PORT: u16 = 5055;

/// Origins of the editor allowed to call the agent from a browser
const DEFAULT_ORIGINS: [&str; 3] = [
    "http://localhost:5173",
    "http://localhost:3000",
    "https://smartblock.vercel.app",
];

const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Explicit arduino-cli binary
    pub cli_path: Option<PathBuf>,
    /// Per-user directory holding the installed toolchain
    pub install_dir: PathBuf,
    pub install_mode: InstallMode,
    pub allowed_origins: Vec<String>,
    /// Number of requests that may drive the toolchain at the same time
    pub jobs: usize,
    /// Where per-request workspaces are created. None is the system
    /// temporary directory.
    pub work_dir: Option<PathBuf>,
    pub download_timeout: Option<Duration>,
    pub command_timeout: Option<Duration>,
    pub prepare_on_start: bool,
    pub profile: PlatformProfile,
}

/// Optional TOML configuration file. Every key may be omitted.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    port: Option<u16>,
    cli_path: Option<PathBuf>,
    install_dir: Option<PathBuf>,
    auto_install: Option<bool>,
    allowed_origins: Option<Vec<String>>,
    jobs: Option<usize>,
    work_dir: Option<PathBuf>,
    download_timeout_secs: Option<u64>,
    command_timeout_secs: Option<u64>,
    prepare_on_start: Option<bool>,
}

impl Config {
    pub fn toolchain_options(&self) -> ToolchainOptions {
        ToolchainOptions {
            profile: self.profile.clone(),
            cli_path: self.cli_path.clone(),
            install_dir: self.install_dir.clone(),
            mode: self.install_mode,
            search_path: None,
        }
    }
}

/// Command line of the agent. Most options can also be given through the
/// environment, which is how the desktop shell configures it.
pub fn arguments<'a, 'b>() -> App<'a, 'b> {
    App::new("smartblock-agent")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Compile and upload SmartBlock sketches with arduino-cli")
        .arg(Arg::with_name("config")
            .short("c")
            .long("config")
            .value_name("FILE")
            .env("SMARTBLOCK_CONFIG")
            .help("Read settings from a TOML file")
            .takes_value(true))
        .arg(Arg::with_name("port")
            .short("p")
            .long("port")
            .value_name("PORT")
            .env("SMARTBLOCK_PORT")
            .help("Port to listen on (default 5055)")
            .takes_value(true))
        .arg(Arg::with_name("cli_path")
            .long("cli-path")
            .value_name("FILE")
            .env("SMARTBLOCK_CLI_PATH")
            .help("Use this arduino-cli binary instead of searching for one")
            .takes_value(true))
        .arg(Arg::with_name("install_dir")
            .long("install-dir")
            .value_name("DIR")
            .env("SMARTBLOCK_HOME")
            .help("Where arduino-cli is installed (default ~/.smartblock/arduino-cli)")
            .takes_value(true))
        .arg(Arg::with_name("no_install")
            .long("no-install")
            .help("Never download arduino-cli, only look for an existing one"))
        .arg(Arg::with_name("origin")
            .long("origin")
            .value_name("ORIGIN")
            .help("Allow browser requests from this origin (repeatable)")
            .multiple(true)
            .number_of_values(1)
            .takes_value(true))
        .arg(Arg::with_name("jobs")
            .short("j")
            .long("jobs")
            .value_name("JOBS")
            .help("Number of requests allowed to run the toolchain in parallel")
            .takes_value(true))
        .arg(Arg::with_name("work_dir")
            .long("work-dir")
            .value_name("DIR")
            .help("Create per-request workspaces in this directory")
            .takes_value(true))
        .arg(Arg::with_name("verbose")
            .short("v")
            .long("verbose")
            .multiple(true)
            .help("Increase verbosity (-v debug, -vv trace)"))
        .arg(Arg::with_name("quiet")
            .short("q")
            .long("quiet")
            .conflicts_with("verbose")
            .help("Only report warnings and errors"))
}

pub fn log_level(matches: &ArgMatches) -> log::LevelFilter {
    if matches.is_present("quiet") {
        return log::LevelFilter::Warn;
    }
    match matches.occurrences_of("verbose") {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    }
}

fn load_file_config(path: &Path) -> Result<FileConfig> {
    let file_contents = std::fs::read(path).context(error::FailedToRead {
        path: path.to_path_buf(),
    })?;
    let decoded: FileConfig = toml::from_slice(&file_contents)
        .context(error::FailedToDeser{ path: path.to_path_buf() })?;
    info!("Using configuration at path {:#?}", path);
    Ok(decoded)
}

/// Default install root: ~/.smartblock/arduino-cli, or relative to the
/// current directory when there is no home directory.
fn default_install_dir() -> PathBuf {
    let base = dirs::home_dir()
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));
    base.join(".smartblock").join("arduino-cli")
}

fn timeout(secs: Option<u64>, default: Option<u64>) -> Option<Duration> {
    match secs.or(default) {
        Some(0) | None => None,
        Some(secs) => Some(Duration::from_secs(secs)),
    }
}

pub fn new(matches: &ArgMatches) -> Result<Config> {
    let file = match matches.value_of("config") {
        Some(path) => load_file_config(Path::new(path))?,
        None => FileConfig::default(),
    };

    let port = match matches.value_of("port") {
        Some(val) => val.parse().context(error::InvalidPort{ value: val })?,
        None => file.port.unwrap_or(DEFAULT_PORT),
    };

    // Jobs - if no value was provided, use the number of CPUs + 2
    let jobs = match matches.value_of("jobs") {
        Some(val) => val.parse().context(error::InvalidJobNumber{ value: val })?,
        None => file.jobs.unwrap_or_else(|| num_cpus::get() + 2),
    };
    ensure!(jobs > 0, error::ZeroJob{});

    let allowed_origins = match matches.values_of("origin") {
        Some(values) => values.map(String::from).collect(),
        None => file.allowed_origins.unwrap_or_else(|| {
            DEFAULT_ORIGINS.iter().map(|origin| origin.to_string()).collect()
        }),
    };

    let install_mode = if matches.is_present("no_install") || file.auto_install == Some(false) {
        InstallMode::SearchOnly
    } else {
        InstallMode::Auto
    };

    let config = Config {
        port: port,
        cli_path: matches.value_of("cli_path").map(PathBuf::from).or(file.cli_path),
        install_dir: matches.value_of("install_dir").map(PathBuf::from)
            .or(file.install_dir)
            .unwrap_or_else(default_install_dir),
        install_mode: install_mode,
        allowed_origins: allowed_origins,
        jobs: jobs,
        work_dir: matches.value_of("work_dir").map(PathBuf::from).or(file.work_dir),
        download_timeout: timeout(file.download_timeout_secs, None),
        command_timeout: timeout(file.command_timeout_secs, Some(DEFAULT_COMMAND_TIMEOUT_SECS)),
        prepare_on_start: file.prepare_on_start.unwrap_or(true),
        profile: PlatformProfile::host(),
    };
    debug!("{:#?}", config);
    Ok(config)
}
