use std::path::PathBuf;
use thiserror::Error;

use crate::harvest::LedgerError;

/// Invalid startup configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unsupported docker protocol '{0}' (expected \"unix\" or \"tcp\")")]
    UnsupportedProtocol(String),

    #[error("Invalid value for {option}: {message}")]
    InvalidValue {
        option: &'static str,
        message: String,
    },

    #[error("No usable home directory; set --state-dir or BANYAN_DIR")]
    NoStateDir,

    #[error("No inspection scripts in {path}; set --scripts-dir or COLLECTOR_SCRIPTS")]
    NoScripts { path: PathBuf },

    #[error("Failed to create directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors that stop the collector before (or instead of) entering the loop.
#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Logging setup failed: {0}")]
    Logging(String),
}

pub type Result<T> = std::result::Result<T, CollectorError>;
