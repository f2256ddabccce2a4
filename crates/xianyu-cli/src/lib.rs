//! Xianyu live session CLI library
//!
//! Argument parsing, layered configuration loading and the wiring that turns
//! a configuration into a running supervisor.

pub mod app;
pub mod cli;
pub mod config;
pub mod error;

pub use app::{LiveApp, LoggingReplyGenerator};
pub use cli::{Cli, Commands};
pub use error::{CliError, Result};
