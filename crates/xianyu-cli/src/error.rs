//! Error handling for the live session CLI

use std::path::PathBuf;

use thiserror::Error;
use xianyu_runtime::LiveError;

/// CLI-specific error types
#[derive(Error, Debug)]
pub enum CliError {
    #[error("Live session error: {0}")]
    Live(#[from] LiveError),

    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    #[error("Configuration file not found: {}", .0.display())]
    ConfigFileMissing(PathBuf),

    #[error("TOML serialization error: {0}")]
    TomlSerialization(#[from] toml::ser::Error),

    #[error("Session task failed: {0}")]
    Task(String),
}

impl From<figment::Error> for CliError {
    fn from(err: figment::Error) -> Self {
        CliError::Config(Box::new(err))
    }
}

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;
