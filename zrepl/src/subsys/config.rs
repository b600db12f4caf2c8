//! Process configuration.
//!
//! Partial config files are supported: serde fills in the default for
//! anything missing, so a YAML file only has to spell out what it wants
//! to change. The loaded config is stored once, process-wide; everything
//! after startup reads it through [`Config::get`].

use std::fmt::Display;
use std::fs;
use std::path::Path;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

/// Default port for client IO connections.
pub const IO_SERVER_PORT: u16 = 3232;
/// Default port for inbound rebuild connections.
pub const REBUILD_IO_SERVER_PORT: u16 = 3233;
/// Default size of one rebuild step range: 10 GiB.
pub const REBUILD_STEP_SIZE: u64 = 10 * 1024 * 1024 * 1024;
/// Default per-volume checkpoint interval in seconds.
pub const CHECKPOINT_INTERVAL_SECS: u64 = 600;
/// Default ceiling, in seconds, on how long the checkpoint timer sleeps
/// before re-examining the per-volume intervals.
pub const CHECKPOINT_SCAN_CEILING_SECS: u64 = 600;

static CONFIG: OnceCell<Config> = OnceCell::new();

#[derive(Debug, Snafu)]
#[snafu(visibility = "pub(crate)")]
pub enum ConfigError {
    #[snafu(display("failed to read config file {}: {}", path, source))]
    ReadFile {
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to parse config file {}: {}", path, source))]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Location of the config file this was loaded from, if any.
    pub source: Option<String>,
    /// Port the client IO listener binds.
    pub io_port: u16,
    /// Port the rebuild listener binds.
    pub rebuild_port: u16,
    /// Size in bytes of one rebuild step range.
    pub rebuild_step_size: u64,
    /// Default per-volume interval, in seconds, between checkpoint
    /// persists of the io sequence marker.
    pub checkpoint_interval: u64,
    /// Upper bound, in seconds, on the checkpoint timer's sleep between
    /// interval scans, whatever the per-volume settings say.
    pub checkpoint_scan_ceiling: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source: None,
            io_port: IO_SERVER_PORT,
            rebuild_port: REBUILD_IO_SERVER_PORT,
            rebuild_step_size: REBUILD_STEP_SIZE,
            checkpoint_interval: CHECKPOINT_INTERVAL_SECS,
            checkpoint_scan_ceiling: CHECKPOINT_SCAN_CEILING_SECS,
        }
    }
}

impl Config {
    /// Initialize the process config by executing F and return a
    /// reference to the initialized data.
    pub fn get_or_init<F>(f: F) -> &'static Self
    where
        F: FnOnce() -> Config,
    {
        CONFIG.get_or_init(f)
    }

    /// The process config; defaults apply if nothing was loaded.
    pub fn get() -> &'static Self {
        CONFIG.get_or_init(Config::default)
    }

    /// Read the config file from disk. An empty file yields the default
    /// config with only the source path filled in.
    pub fn read<P>(file: P) -> Result<Config, ConfigError>
    where
        P: AsRef<Path> + Display + ToString,
    {
        debug!("loading configuration file from {}", file);
        let raw = fs::read(&file).context(ReadFile {
            path: file.to_string(),
        })?;
        let mut config = if raw.is_empty() {
            info!("config file {} is empty, using the default config", file);
            Config::default()
        } else {
            serde_yaml::from_slice(&raw).context(Parse {
                path: file.to_string(),
            })?
        };
        config.source = Some(file.to_string());
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.io_port, 3232);
        assert_eq!(config.rebuild_port, 3233);
        assert_eq!(config.rebuild_step_size, 10 * 1024 * 1024 * 1024);
        assert_eq!(config.checkpoint_interval, 600);
        assert_eq!(config.checkpoint_scan_ceiling, 600);
    }

    #[test]
    fn partial_yaml_fills_in_defaults() {
        let config: Config =
            serde_yaml::from_str("rebuild_step_size: 65536").unwrap();
        assert_eq!(config.rebuild_step_size, 65536);
        assert_eq!(config.io_port, IO_SERVER_PORT);
        assert_eq!(config.checkpoint_interval, CHECKPOINT_INTERVAL_SECS);
        assert_eq!(
            config.checkpoint_scan_ceiling,
            CHECKPOINT_SCAN_CEILING_SECS
        );
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(serde_yaml::from_str::<Config>("no_such_option: 1").is_err());
    }
}
