//! Live Session Configuration Loading
//!
//! The effective [`LiveConfig`] is assembled with figment from these layers,
//! later layers overriding earlier ones:
//! 1. Built-in defaults
//! 2. `xianyu.toml` in the working directory (or a parent)
//! 3. The file passed with `--config`
//! 4. Environment variables with the `XIANYU_` prefix, `__` separating
//!    sections (`XIANYU_HEARTBEAT__INTERVAL_SECS=30`)
//! 5. The flat variable names of older deployments (`COOKIES_STR`,
//!    `HEARTBEAT_INTERVAL`, ...)

use std::path::Path;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use tracing::info;
use xianyu_runtime::LiveConfig;

use crate::error::{CliError, Result};

/// Default configuration file name
pub const CONFIG_FILE: &str = "xianyu.toml";

/// Flat environment names and the configuration keys they set
const LEGACY_ENV: &[(&str, &str)] = &[
    ("COOKIES_STR", "cookies"),
    ("HEARTBEAT_INTERVAL", "heartbeat.interval_secs"),
    ("HEARTBEAT_TIMEOUT", "heartbeat.timeout_secs"),
    ("TOKEN_REFRESH_INTERVAL", "token.refresh_interval_secs"),
    ("TOKEN_RETRY_INTERVAL", "token.retry_interval_secs"),
    ("MESSAGE_EXPIRE_TIME", "message.expire_time_ms"),
    ("MANUAL_MODE_TIMEOUT", "manual_mode.timeout_secs"),
    ("TOGGLE_KEYWORDS", "manual_mode.toggle_keywords"),
    ("LOG_LEVEL", "logging.level"),
    ("MESSAGE_BATCHING_ENABLED", "batching.enabled"),
    ("MAX_BATCH_SIZE", "batching.max_batch_size"),
    ("MAX_WAIT_TIME_MS", "batching.max_wait_time_ms"),
];

// ----------------------------------------------------------------------------
// Configuration Loading
// ----------------------------------------------------------------------------

/// The layered figment behind [`load`]
pub fn figment(explicit: Option<&Path>) -> Result<Figment> {
    let mut figment = Figment::new()
        .merge(Serialized::defaults(LiveConfig::default()))
        .merge(Toml::file(CONFIG_FILE));

    if let Some(path) = explicit {
        if !path.exists() {
            return Err(CliError::ConfigFileMissing(path.to_path_buf()));
        }
        info!("Loading configuration from: {}", path.display());
        figment = figment.merge(Toml::file(path));
    }

    Ok(figment
        .merge(Env::prefixed("XIANYU_").split("__"))
        .merge(legacy_env()))
}

fn legacy_env() -> Env {
    Env::raw().filter_map(|key| {
        LEGACY_ENV
            .iter()
            .find(|(name, _)| key == *name)
            .map(|(_, target)| (*target).into())
    })
}

/// Effective configuration without validation
pub fn extract(explicit: Option<&Path>) -> Result<LiveConfig> {
    Ok(figment(explicit)?.extract()?)
}

/// Effective configuration, validated
pub fn load(explicit: Option<&Path>) -> Result<LiveConfig> {
    let config = extract(explicit)?;
    config.validate()?;
    Ok(config)
}

/// Render a configuration the way `xianyu.toml` expects it
pub fn to_toml(config: &LiveConfig) -> Result<String> {
    Ok(toml::to_string_pretty(config)?)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
