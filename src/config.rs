use std::{
    collections::HashMap,
    fs::{self, File},
    io::prelude::*,
    path::Path,
    time::Duration,
};

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::HarnessError;

/// Top-level run configuration, loaded from a TOML file. Immutable for the
/// duration of a run.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LorisConfig {
    /// Target server as "host:port", e.g. "127.0.0.1:7878". IPv6 literals
    /// take brackets: "[::1]:7878".
    #[serde(default = "default_target")]
    pub target: String,

    /// Number of concurrent slow connections to ramp toward.
    #[serde(default = "default_target_count")]
    pub target_count: u32,

    /// Connections opened per second during ramp-up.
    #[serde(default = "default_ramp_rate")]
    pub ramp_rate: u32,

    /// Base interval between drips on one connection.
    #[serde(default = "default_drip_interval_ms")]
    pub drip_interval_ms: u64,

    /// Uniform jitter applied around the drip interval.
    #[serde(default = "default_drip_jitter_ms")]
    pub drip_jitter_ms: u64,

    /// Total run duration.
    #[serde(default = "default_duration_ms")]
    pub duration_ms: u64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Per-write bound so one unresponsive peer cannot stall the tick loop.
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    /// Grace period for shutdown_all before remaining sockets are dropped.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Control loop granularity.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    #[serde(default = "default_method")]
    pub method: String,

    #[serde(default = "default_path")]
    pub path: String,

    /// Header name of the drip lines; the value is a per-connection
    /// sequence number.
    #[serde(default = "default_drip_header")]
    pub drip_header: String,

    /// Abort the run if the very first connect is refused. Disable when a
    /// refusing target is itself the behavior under measurement.
    #[serde(default = "default_true")]
    pub fail_fast_first_connect: bool,

    /// Optional path for the machine-readable JSON report.
    #[serde(default)]
    pub report_path: Option<String>,

    #[serde(flatten)]
    pub other_fields: HashMap<String, toml::Value>,
}

fn default_target() -> String {
    "127.0.0.1:7878".to_string()
}

fn default_target_count() -> u32 {
    100
}

fn default_ramp_rate() -> u32 {
    50
}

fn default_drip_interval_ms() -> u64 {
    2000
}

fn default_drip_jitter_ms() -> u64 {
    250
}

fn default_duration_ms() -> u64 {
    30_000
}

fn default_connect_timeout_ms() -> u64 {
    3000
}

fn default_write_timeout_ms() -> u64 {
    1000
}

fn default_shutdown_grace_ms() -> u64 {
    2000
}

fn default_tick_ms() -> u64 {
    20
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_path() -> String {
    "/hello".to_string()
}

fn default_drip_header() -> String {
    "X-Slowloris-Chunk".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LorisConfig {
    fn default() -> Self {
        Self {
            target: default_target(),
            target_count: default_target_count(),
            ramp_rate: default_ramp_rate(),
            drip_interval_ms: default_drip_interval_ms(),
            drip_jitter_ms: default_drip_jitter_ms(),
            duration_ms: default_duration_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            tick_ms: default_tick_ms(),
            method: default_method(),
            path: default_path(),
            drip_header: default_drip_header(),
            fail_fast_first_connect: default_true(),
            report_path: None,
            other_fields: HashMap::new(),
        }
    }
}

impl LorisConfig {
    pub fn load(path: &Path) -> Result<Self, LorisConfigLoadError> {
        let raw = fs::read_to_string(path).map_err(LorisConfigLoadError::Io)?;
        let config: Self = toml::from_str(&raw).map_err(LorisConfigLoadError::Parse)?;

        for field in &config.other_fields {
            warn!("Unknown configuration '{}' with value {:?}", field.0, field.1);
        }

        Ok(config)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let config_str = toml::to_string(&self)?;
        let mut file = File::create(path)?;
        file.write_all(config_str.as_bytes())?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), HarnessError> {
        let bad = |msg: String| Err(HarnessError::Configuration(msg));
        match self.target.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                // A bare IPv6 literal would split at its last colon and
                // parse as a nonsense host.
                if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
                    return bad(format!(
                        "IPv6 host in target '{}' must be bracketed, e.g. \"[::1]:7878\"",
                        self.target
                    ));
                }
                if port.parse::<u16>().is_err() {
                    return bad(format!("invalid port in target '{}'", self.target));
                }
            }
            _ => return bad(format!("target '{}' is not host:port", self.target)),
        }
        if self.target_count == 0 {
            return bad("target_count must be at least 1".to_string());
        }
        if self.ramp_rate == 0 {
            return bad("ramp_rate must be at least 1".to_string());
        }
        if self.drip_interval_ms == 0 {
            return bad("drip_interval_ms must be at least 1".to_string());
        }
        if self.duration_ms == 0 {
            return bad("duration_ms must be at least 1".to_string());
        }
        if self.tick_ms == 0 {
            return bad("tick_ms must be at least 1".to_string());
        }
        if self.method.is_empty() || self.path.is_empty() || self.drip_header.is_empty() {
            return bad("method, path and drip_header must be non-empty".to_string());
        }
        Ok(())
    }

    /// Host part of the target, used for the Host header.
    pub fn host(&self) -> &str {
        self.target.rsplit_once(':').map_or(self.target.as_str(), |(host, _)| host)
    }

    pub fn drip_interval(&self) -> Duration {
        Duration::from_millis(self.drip_interval_ms)
    }

    pub fn drip_jitter(&self) -> Duration {
        Duration::from_millis(self.drip_jitter_ms)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LorisConfigLoadError {
    #[error("Could not open config")]
    Io(#[from] std::io::Error),
    #[error("Could not parse")]
    Parse(#[from] toml::de::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config: LorisConfig = toml::from_str("").expect("parse");
        assert_eq!(config.target, "127.0.0.1:7878");
        assert_eq!(config.target_count, 100);
        assert_eq!(config.drip_interval_ms, 2000);
        assert!(config.fail_fast_first_connect);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn unknown_keys_are_collected_not_rejected() {
        let config: LorisConfig =
            toml::from_str("target = \"10.0.0.1:80\"\nfrobnicate = 3\n").expect("parse");
        assert_eq!(config.target, "10.0.0.1:80");
        assert_eq!(config.host(), "10.0.0.1");
        assert!(config.other_fields.contains_key("frobnicate"));
    }

    #[test]
    fn validation_rejects_degenerate_runs() {
        let mut config = LorisConfig::default();
        config.target = "no-port-here".to_string();
        assert!(config.validate().is_err());

        let mut config = LorisConfig::default();
        config.target_count = 0;
        assert!(config.validate().is_err());

        let mut config = LorisConfig::default();
        config.drip_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn ipv6_targets_require_brackets() {
        let mut config = LorisConfig::default();
        config.target = "::1".to_string();
        assert!(config.validate().is_err());

        config.target = "2001:db8::1:7878".to_string();
        assert!(config.validate().is_err());

        config.target = "[::1]:7878".to_string();
        assert!(config.validate().is_ok());
        assert_eq!(config.host(), "[::1]");
    }

    #[test]
    fn save_load_round_trip() {
        let dir = std::env::temp_dir().join("loris-config-test");
        std::fs::create_dir_all(&dir).expect("tempdir");
        let path = dir.join("loris.toml");

        let mut config = LorisConfig::default();
        config.target = "192.0.2.1:8080".to_string();
        config.target_count = 7;
        config.save(&path).expect("save");

        let loaded = LorisConfig::load(&path).expect("load");
        assert_eq!(loaded.target, "192.0.2.1:8080");
        assert_eq!(loaded.target_count, 7);
        let _ = std::fs::remove_file(&path);
    }
}
