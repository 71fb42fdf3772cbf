use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration loaded from `~/.foreman/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub personas: PersonasConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
}

impl Config {
    /// Load config from `~/.foreman/config.toml`, falling back to defaults
    /// when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            Ok(Config::default())
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".foreman")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_project_name")]
    pub project_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Subscriber output shape: "text" or "json".
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            project_name: default_project_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

fn default_project_name() -> String {
    "foreman".into()
}
fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "text".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Seconds a worker may hold a lease before the reaper reclaims it.
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_secs: u64,
    /// Lease reclaims before a job is failed outright.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Seconds pending before a job's effective priority climbs one tier.
    #[serde(default = "default_age_threshold")]
    pub age_threshold_secs: u64,
    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_ttl_secs: default_lease_ttl(),
            max_attempts: default_max_attempts(),
            age_threshold_secs: default_age_threshold(),
            reaper_interval_secs: default_reaper_interval(),
        }
    }
}

fn default_lease_ttl() -> u64 {
    300
}
fn default_max_attempts() -> u32 {
    3
}
fn default_age_threshold() -> u64 {
    60
}
fn default_reaper_interval() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Auditor-driven rewrite iterations inside one supervisor invocation.
    #[serde(default = "default_max_rewrites")]
    pub max_rewrites: u32,
    /// Per-role returned-to-predecessor cycles within one pipeline.
    #[serde(default = "default_max_rework_rounds")]
    pub max_rework_rounds: u32,
    #[serde(default = "default_backend_timeout")]
    pub backend_timeout_secs: u64,
    /// Whole-pipeline wall clock; expiry escalates the pipeline.
    #[serde(default = "default_pipeline_deadline")]
    pub pipeline_deadline_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_rewrites: default_max_rewrites(),
            max_rework_rounds: default_max_rework_rounds(),
            backend_timeout_secs: default_backend_timeout(),
            pipeline_deadline_secs: default_pipeline_deadline(),
        }
    }
}

fn default_max_rewrites() -> u32 {
    3
}
fn default_max_rework_rounds() -> u32 {
    2
}
fn default_backend_timeout() -> u64 {
    300
}
fn default_pipeline_deadline() -> u64 {
    3600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Directory holding the day-keyed JSONL stream.
    #[serde(default = "default_events_dir")]
    pub dir: String,
    /// Day files at least this old migrate to the archive subtree.
    #[serde(default = "default_archive_after_days")]
    pub archive_after_days: u32,
    /// Event content is truncated to this many bytes before persisting.
    #[serde(default = "default_max_content_bytes")]
    pub max_content_bytes: usize,
    #[serde(default = "default_archive_interval")]
    pub archive_interval_secs: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            dir: default_events_dir(),
            archive_after_days: default_archive_after_days(),
            max_content_bytes: default_max_content_bytes(),
            archive_interval_secs: default_archive_interval(),
        }
    }
}

fn default_events_dir() -> String {
    "~/.foreman/events/stream".into()
}
fn default_archive_after_days() -> u32 {
    7
}
fn default_max_content_bytes() -> usize {
    10_000
}
fn default_archive_interval() -> u64 {
    3600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonasConfig {
    /// Directory of persona bundles, one file per `{role}.{mode}`.
    #[serde(default = "default_personas_dir")]
    pub dir: String,
}

impl Default for PersonasConfig {
    fn default() -> Self {
        Self {
            dir: default_personas_dir(),
        }
    }
}

fn default_personas_dir() -> String {
    "~/.foreman/personas".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_bridge_host")]
    pub host: String,
    #[serde(default = "default_bridge_port")]
    pub port: u16,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: default_bridge_host(),
            port: default_bridge_port(),
        }
    }
}

fn default_bridge_host() -> String {
    "127.0.0.1".into()
}
fn default_bridge_port() -> u16 {
    7710
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_knobs() {
        let cfg = Config::default();
        assert_eq!(cfg.queue.lease_ttl_secs, 300);
        assert_eq!(cfg.queue.max_attempts, 3);
        assert_eq!(cfg.queue.age_threshold_secs, 60);
        assert_eq!(cfg.supervisor.max_rewrites, 3);
        assert_eq!(cfg.supervisor.max_rework_rounds, 2);
        assert_eq!(cfg.supervisor.backend_timeout_secs, 300);
        assert_eq!(cfg.events.archive_after_days, 7);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [queue]
            lease_ttl_secs = 60

            [supervisor]
            max_rewrites = 1
            "#,
        )
        .unwrap();
        assert_eq!(cfg.queue.lease_ttl_secs, 60);
        assert_eq!(cfg.queue.max_attempts, 3);
        assert_eq!(cfg.supervisor.max_rewrites, 1);
        assert_eq!(cfg.supervisor.max_rework_rounds, 2);
    }

    #[test]
    fn toml_round_trip() {
        let cfg = Config::default();
        let text = cfg.to_toml().unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back.bridge.port, cfg.bridge.port);
        assert_eq!(back.events.dir, cfg.events.dir);
    }

    #[test]
    fn load_from_missing_file_is_an_error() {
        let err = Config::load_from("/nonexistent/foreman.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn load_from_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[bridge]\nport = 9999\n").unwrap();
        let cfg = Config::load_from(&path).unwrap();
        assert_eq!(cfg.bridge.port, 9999);
        assert_eq!(cfg.bridge.host, "127.0.0.1");
    }
}
