//! Command-line surface and the validated collector configuration.

use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::model::RepoId;

/// Extract static information from the images of a container registry.
#[derive(Parser, Debug, Clone)]
#[command(name = "image-collector", version, about)]
pub struct CollectorArgs {
    /// Registry host or URL; use index.docker.io for Docker Hub
    pub registry: String,

    /// Repositories to collect; when none are given (here or in the repo
    /// list file) every repository of the registry is collected
    pub repos: Vec<String>,

    /// Directory holding the ledger, repo list, output and log file
    #[arg(long, env = "BANYAN_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Output directory for the file sink
    #[arg(long)]
    pub out_dir: Option<PathBuf>,

    /// Ledger of previously collected images
    #[arg(long)]
    pub image_list: Option<PathBuf>,

    /// File containing the list of repos to process
    #[arg(short = 'r', long)]
    pub repo_list: Option<PathBuf>,

    /// Number of pulled images retained locally before the oldest are removed (0 keeps all)
    #[arg(long, default_value = "10")]
    pub remove_thresh: usize,

    /// Polling interval in seconds
    #[arg(short = 'p', long, default_value = "60")]
    pub poll: u64,

    /// Number of images extracted per batch
    #[arg(long, default_value = "5")]
    pub batch_size: usize,

    /// Attempts before an image that keeps failing is dropped
    #[arg(long, default_value = "3")]
    pub max_attempts: u32,

    /// Timeout in seconds for one batch extraction
    #[arg(long, default_value = "300")]
    pub extract_timeout: u64,

    /// Socket protocol of the Docker daemon ("unix" or "tcp")
    #[arg(long, default_value = "unix")]
    pub docker_proto: String,

    /// Address of the Docker daemon socket (file path or host:port)
    #[arg(long, default_value = "/var/run/docker.sock")]
    pub docker_addr: String,

    /// Docker CLI executable
    #[arg(long, default_value = "docker")]
    pub docker_bin: String,

    /// Directory of inspection scripts run inside every image
    #[arg(long, env = "COLLECTOR_SCRIPTS")]
    pub scripts_dir: Option<PathBuf>,

    /// Comma separated output destinations, e.g. "file" or "file,remote"
    #[arg(short = 'd', long, default_value = "file")]
    pub dests: String,

    /// Base URL of the remote collection service
    #[arg(long, env = "COLLECTOR_REMOTE")]
    pub remote_endpoint: Option<String>,

    /// Bearer token presented to the remote collection service
    #[arg(long, env = "COLLECTOR_ID", hide_env_values = true)]
    pub remote_token: Option<String>,

    /// Verbose log file
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DockerEndpoint {
    Unix(PathBuf),
    Tcp(String),
}

impl DockerEndpoint {
    pub fn parse(proto: &str, addr: &str) -> Result<Self, ConfigError> {
        match proto {
            "unix" => Ok(Self::Unix(PathBuf::from(addr))),
            "tcp" => Ok(Self::Tcp(addr.to_string())),
            other => Err(ConfigError::UnsupportedProtocol(other.to_string())),
        }
    }

    /// Value for `docker -H`.
    pub fn host_arg(&self) -> String {
        match self {
            Self::Unix(path) => format!("unix://{}", path.display()),
            Self::Tcp(addr) => format!("tcp://{}", addr),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    File,
    Remote,
}

impl SinkKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "file" => Some(Self::File),
            "remote" | "banyan" => Some(Self::Remote),
            _ => None,
        }
    }
}

/// Validated configuration, built once at startup.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub registry: String,
    pub cli_repos: Vec<RepoId>,
    pub state_dir: PathBuf,
    pub out_dir: PathBuf,
    pub image_list: PathBuf,
    pub repo_list: PathBuf,
    pub log_file: PathBuf,
    pub scripts_dir: PathBuf,
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub retention_threshold: usize,
    pub max_attempts: u32,
    pub extract_timeout: Duration,
    pub docker: DockerEndpoint,
    pub docker_bin: String,
    pub sinks: Vec<SinkKind>,

    /// Sink names that matched no known sink; reported once logging is up
    pub unknown_sinks: Vec<String>,
    pub remote_endpoint: Option<String>,
    pub remote_token: Option<String>,
}

impl CollectorConfig {
    pub fn from_args(args: CollectorArgs) -> Result<Self, ConfigError> {
        let state_dir = match args.state_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .ok_or(ConfigError::NoStateDir)?
                .join(".banyan")
                .join("hostcollector"),
        };

        if args.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                option: "--batch-size",
                message: "must be greater than zero".to_string(),
            });
        }
        if args.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                option: "--max-attempts",
                message: "must be greater than zero".to_string(),
            });
        }
        if args.registry.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                option: "REGISTRY",
                message: "must not be empty".to_string(),
            });
        }

        let docker = DockerEndpoint::parse(&args.docker_proto, &args.docker_addr)?;

        let mut sinks = Vec::new();
        let mut unknown_sinks = Vec::new();
        for name in args.dests.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            match SinkKind::from_name(name) {
                Some(kind) if !sinks.contains(&kind) => sinks.push(kind),
                Some(_) => {}
                None => unknown_sinks.push(name.to_string()),
            }
        }
        if sinks.contains(&SinkKind::Remote) && args.remote_endpoint.is_none() {
            return Err(ConfigError::InvalidValue {
                option: "--remote-endpoint",
                message: "required by the remote destination".to_string(),
            });
        }

        Ok(Self {
            registry: args.registry,
            cli_repos: args.repos.into_iter().map(RepoId::new).collect(),
            out_dir: args.out_dir.unwrap_or_else(|| state_dir.join("banyanout")),
            image_list: args.image_list.unwrap_or_else(|| state_dir.join("imagelist")),
            repo_list: args.repo_list.unwrap_or_else(|| state_dir.join("repolist")),
            log_file: args.log_file.unwrap_or_else(|| state_dir.join("collector.log")),
            scripts_dir: args.scripts_dir.unwrap_or_else(|| state_dir.join("scripts")),
            state_dir,
            poll_interval: Duration::from_secs(args.poll),
            batch_size: args.batch_size,
            retention_threshold: args.remove_thresh,
            max_attempts: args.max_attempts,
            extract_timeout: Duration::from_secs(args.extract_timeout),
            docker,
            docker_bin: args.docker_bin,
            sinks,
            unknown_sinks,
            remote_endpoint: args.remote_endpoint,
            remote_token: args.remote_token,
        })
    }

    /// Creates every directory the collector writes into.
    pub fn create_dirs(&self) -> Result<(), ConfigError> {
        let parents = [
            Some(self.state_dir.as_path()),
            self.image_list.parent(),
            self.repo_list.parent(),
            self.log_file.parent(),
            Some(self.out_dir.as_path()),
        ];
        for dir in parents.into_iter().flatten().filter(|d| !d.as_os_str().is_empty()) {
            create_dir(dir)?;
        }
        Ok(())
    }

    /// Fails unless the scripts directory holds at least one regular file.
    pub fn check_scripts_dir(&self) -> Result<(), ConfigError> {
        let no_scripts = || ConfigError::NoScripts {
            path: self.scripts_dir.clone(),
        };
        let entries = std::fs::read_dir(&self.scripts_dir).map_err(|_| no_scripts())?;
        let has_script = entries
            .filter_map(|entry| entry.ok())
            .any(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false));
        if has_script {
            Ok(())
        } else {
            Err(no_scripts())
        }
    }
}

fn create_dir(dir: &Path) -> Result<(), ConfigError> {
    std::fs::create_dir_all(dir).map_err(|source| ConfigError::Directory {
        path: dir.to_path_buf(),
        source,
    })
}
