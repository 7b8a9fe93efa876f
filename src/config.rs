use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::NaiveTime;
use thiserror::Error;

use crate::limits::*;
use crate::scheduler::SchedulerConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key}: cannot parse {value:?}: {reason}")]
    Malformed {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("{key}: {reason}")]
    OutOfRange { key: &'static str, reason: String },
}

/// Runtime settings, read from `TABLEKEEP_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub expiry_interval: Duration,
    pub grace_minutes: u32,
    /// Local wall-clock time of the nightly reset.
    pub reset_at: NaiveTime,
    pub default_duration_minutes: u32,
    /// WAL appends since the last compaction that trigger a new one.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            expiry_interval: Duration::from_secs(30 * 60),
            grace_minutes: DEFAULT_GRACE_MINUTES,
            reset_at: NaiveTime::from_hms_opt(22, 0, 0).unwrap_or(NaiveTime::MIN),
            default_duration_minutes: DEFAULT_DURATION_MINUTES,
            compact_threshold: 1000,
            metrics_port: None,
        }
    }
}

fn parse<T>(key: &'static str, raw: Option<String>) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = raw else { return Ok(None) };
    let value = raw.trim();
    if value.is_empty() {
        return Ok(None);
    }
    value.parse().map(Some).map_err(|e: T::Err| ConfigError::Malformed {
        key,
        value: raw.clone(),
        reason: e.to_string(),
    })
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset or blank keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        if let Some(dir) = parse::<String>("TABLEKEEP_DATA_DIR", lookup("TABLEKEEP_DATA_DIR"))? {
            cfg.data_dir = PathBuf::from(dir);
        }
        if let Some(minutes) = parse::<u64>(
            "TABLEKEEP_EXPIRY_INTERVAL_MINUTES",
            lookup("TABLEKEEP_EXPIRY_INTERVAL_MINUTES"),
        )? {
            if minutes == 0 {
                return Err(ConfigError::OutOfRange {
                    key: "TABLEKEEP_EXPIRY_INTERVAL_MINUTES",
                    reason: "must be at least 1".into(),
                });
            }
            cfg.expiry_interval = Duration::from_secs(minutes * 60);
        }
        if let Some(grace) =
            parse::<u32>("TABLEKEEP_GRACE_MINUTES", lookup("TABLEKEEP_GRACE_MINUTES"))?
        {
            cfg.grace_minutes = grace;
        }
        if let Some(raw) = lookup("TABLEKEEP_RESET_AT").filter(|s| !s.trim().is_empty()) {
            cfg.reset_at = NaiveTime::parse_from_str(raw.trim(), "%H:%M").map_err(|e| {
                ConfigError::Malformed {
                    key: "TABLEKEEP_RESET_AT",
                    value: raw.clone(),
                    reason: e.to_string(),
                }
            })?;
        }
        if let Some(minutes) = parse::<u32>(
            "TABLEKEEP_DEFAULT_DURATION_MINUTES",
            lookup("TABLEKEEP_DEFAULT_DURATION_MINUTES"),
        )? {
            if !(MIN_DURATION_MINUTES..=MAX_DURATION_MINUTES).contains(&minutes) {
                return Err(ConfigError::OutOfRange {
                    key: "TABLEKEEP_DEFAULT_DURATION_MINUTES",
                    reason: format!(
                        "must be between {MIN_DURATION_MINUTES} and {MAX_DURATION_MINUTES}"
                    ),
                });
            }
            cfg.default_duration_minutes = minutes;
        }
        if let Some(n) = parse::<u64>(
            "TABLEKEEP_COMPACT_THRESHOLD",
            lookup("TABLEKEEP_COMPACT_THRESHOLD"),
        )? {
            cfg.compact_threshold = n;
        }
        cfg.metrics_port = parse::<u16>("TABLEKEEP_METRICS_PORT", lookup("TABLEKEEP_METRICS_PORT"))?;

        Ok(cfg)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("tablekeep.wal")
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            expiry_interval: self.expiry_interval,
            grace_minutes: self.grace_minutes,
            reset_at: self.reset_at,
            compact_threshold: self.compact_threshold,
            ..SchedulerConfig::default()
        }
    }
}
