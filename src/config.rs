use crate::signals::dead::DeadClickConfig;
use crate::signals::rage::RageConfig;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub ingest: IngestConfig,
    pub pipeline: PipelineConfig,
    pub retention: RetentionConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub alerting: AlertingConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Origin allowed to call the query and alert API from a browser.
    #[serde(default)]
    pub cors_origin: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub pool_size: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    pub max_payload_bytes: usize,
    pub max_metadata_bytes: usize,
    pub max_batch_size: usize,
    pub channel_capacity: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    pub flush_interval_secs: u64,
    pub flush_batch_size: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetentionConfig {
    pub raw_events_days: u64,
    pub prune_interval_secs: u64,
}

/// Defaults for the query-time detectors; each endpoint may override them per request.
#[derive(Debug, Deserialize, Clone)]
pub struct DetectionConfig {
    #[serde(default = "default_rage_window_ms")]
    pub rage_window_ms: i64,
    #[serde(default = "default_rage_threshold")]
    pub rage_threshold: usize,
    #[serde(default = "default_dead_idle_ms")]
    pub dead_idle_ms: i64,
    #[serde(default = "default_cluster_radius")]
    pub cluster_radius: f64,
    #[serde(default = "default_hours")]
    pub default_hours: i64,
    #[serde(default = "default_error_group_limit")]
    pub error_group_limit: usize,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            rage_window_ms: default_rage_window_ms(),
            rage_threshold: default_rage_threshold(),
            dead_idle_ms: default_dead_idle_ms(),
            cluster_radius: default_cluster_radius(),
            default_hours: default_hours(),
            error_group_limit: default_error_group_limit(),
        }
    }
}

impl DetectionConfig {
    pub fn rage(&self) -> RageConfig {
        RageConfig {
            window_ms: self.rage_window_ms,
            threshold: self.rage_threshold,
        }
    }

    pub fn dead(&self) -> DeadClickConfig {
        DeadClickConfig {
            idle_ms: self.dead_idle_ms,
        }
    }
}

fn default_rage_window_ms() -> i64 {
    3000
}
fn default_rage_threshold() -> usize {
    3
}
fn default_dead_idle_ms() -> i64 {
    2000
}
fn default_cluster_radius() -> f64 {
    crate::signals::heatmap::DEFAULT_RADIUS
}
fn default_hours() -> i64 {
    24
}
fn default_error_group_limit() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct AlertingConfig {
    #[serde(default = "default_alert_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_dispatch_timeout")]
    pub dispatch_timeout_secs: u64,
    #[serde(default = "default_rule_timeout")]
    pub rule_timeout_secs: u64,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_alert_interval(),
            dispatch_timeout_secs: default_dispatch_timeout(),
            rule_timeout_secs: default_rule_timeout(),
        }
    }
}

fn default_alert_interval() -> u64 {
    60
}
fn default_dispatch_timeout() -> u64 {
    10
}
fn default_rule_timeout() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl(),
        }
    }
}

fn default_cache_ttl() -> u64 {
    30
}

impl AppConfig {
    /// Reject settings that would stall loops or make detectors meaningless.
    pub fn validate(&self) -> Result<(), String> {
        if self.pipeline.flush_interval_secs == 0 {
            return Err("pipeline.flush_interval_secs must be greater than 0".to_string());
        }
        if self.retention.prune_interval_secs == 0 {
            return Err("retention.prune_interval_secs must be greater than 0".to_string());
        }
        if self.alerting.interval_secs == 0 {
            return Err("alerting.interval_secs must be greater than 0".to_string());
        }
        if self.detection.rage_threshold == 0 {
            return Err("detection.rage_threshold must be at least 1".to_string());
        }
        if self.detection.rage_window_ms <= 0 || self.detection.dead_idle_ms <= 0 {
            return Err("detection windows must be positive".to_string());
        }
        if self.detection.cluster_radius.is_nan() || self.detection.cluster_radius < 0.0 {
            return Err("detection.cluster_radius must be non-negative".to_string());
        }
        if self.ingest.channel_capacity == 0 {
            return Err("ingest.channel_capacity must be greater than 0".to_string());
        }
        Ok(())
    }

    pub fn load(config_path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 5380)?
            .set_default("database.path", "signalbox.db")?
            .set_default("database.pool_size", 4)?
            .set_default("ingest.max_payload_bytes", 1_048_576)?
            .set_default("ingest.max_metadata_bytes", 16_384)?
            .set_default("ingest.max_batch_size", 100)?
            .set_default("ingest.channel_capacity", 8192)?
            .set_default("pipeline.flush_interval_secs", 2)?
            .set_default("pipeline.flush_batch_size", 500)?
            .set_default("retention.raw_events_days", 30)?
            .set_default("retention.prune_interval_secs", 3600)?;

        // Load from config file
        let path = config_path.unwrap_or("config.toml");
        builder = builder.add_source(File::with_name(path).required(false));

        // Overlay with environment variables (SIGNALBOX__SERVER__PORT=3001, etc.)
        builder = builder.add_source(
            Environment::with_prefix("SIGNALBOX")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_defaults_without_file() {
        let config = AppConfig::load(Some("does-not-exist.toml")).unwrap();
        assert_eq!(config.detection.rage_threshold, 3);
        assert_eq!(config.detection.rage_window_ms, 3000);
        assert_eq!(config.detection.dead_idle_ms, 2000);
        assert_eq!(config.alerting.interval_secs, 60);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_threshold() {
        let mut config = AppConfig::load(Some("does-not-exist.toml")).unwrap();
        config.detection.rage_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_detection_converts_to_detector_configs() {
        let detection = DetectionConfig::default();
        assert_eq!(detection.rage(), RageConfig::default());
        assert_eq!(detection.dead(), DeadClickConfig::default());
    }
}
