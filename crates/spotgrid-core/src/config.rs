//! spotgrid.toml configuration parser.
//!
//! Every section and field has a default, so an empty file yields a
//! working single-node configuration. Durations are kept as strings in
//! the file and resolved through the accessor methods.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::duration::parse_duration;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid duration for {field}: {value:?}")]
    InvalidDuration { field: &'static str, value: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpotgridConfig {
    pub registry: RegistryConfig,
    pub engine: EngineConfig,
    pub predictor: PredictorConfig,
    pub approval: ApprovalConfig,
    pub dispatch: DispatchConfig,
    pub replica: ReplicaConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Active events in the window needed before a termination notice poisons.
    pub poison_threshold: u32,
    /// Event lifetime and poison window (e.g., "15d").
    pub cooldown: String,
    /// Housekeeping sweep interval.
    pub sweep_interval: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            poison_threshold: 1,
            cooldown: "15d".to_string(),
            sweep_interval: "5m".to_string(),
        }
    }
}

impl RegistryConfig {
    pub fn cooldown(&self) -> Duration {
        parse_duration(&self.cooldown).unwrap_or(Duration::from_secs(15 * 86_400))
    }

    pub fn sweep_interval(&self) -> Duration {
        parse_duration(&self.sweep_interval).unwrap_or(Duration::from_secs(300))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum concurrent evaluations.
    pub workers: usize,
    pub high_risk_threshold: f64,
    pub low_risk_threshold: f64,
    /// Predictor scores below this confidence fall back to rules.
    pub confidence_floor: f64,
    /// Risk added per active interruption event in the instance's pool.
    pub interruption_weight: f64,
    pub predictor_timeout: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 16,
            high_risk_threshold: 0.7,
            low_risk_threshold: 0.3,
            confidence_floor: 0.5,
            interruption_weight: 0.05,
            predictor_timeout: "2s".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn predictor_timeout(&self) -> Duration {
        parse_duration(&self.predictor_timeout).unwrap_or(Duration::from_secs(2))
    }
}

/// Which predictor implementation to wire in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictorKind {
    /// No predictor; the engine always uses the rule-based fallback.
    #[default]
    None,
    /// Fixed score from config.
    Static,
    /// Remote scoring service over HTTP.
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictorConfig {
    pub kind: PredictorKind,
    pub endpoint: Option<String>,
    pub static_risk: f64,
    pub static_confidence: f64,
    pub static_price_trend: f64,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            kind: PredictorKind::None,
            endpoint: None,
            static_risk: 0.1,
            static_confidence: 0.9,
            static_price_trend: 0.0,
        }
    }
}

/// A daily UTC window in which emergency switches are routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceWindow {
    pub start_hour: u8,
    pub end_hour: u8,
}

impl MaintenanceWindow {
    /// Whether the given unix timestamp falls inside the window.
    /// Windows with `start_hour > end_hour` wrap past midnight.
    pub fn contains(&self, unix_secs: u64) -> bool {
        let hour = ((unix_secs / 3600) % 24) as u8;
        if self.start_hour <= self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    /// Time a request may stay pending before it expires.
    pub ttl: String,
    pub sweep_interval: String,
    pub maintenance_windows: Vec<MaintenanceWindow>,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            ttl: "1h".to_string(),
            sweep_interval: "30s".to_string(),
            maintenance_windows: Vec::new(),
        }
    }
}

impl ApprovalConfig {
    pub fn ttl(&self) -> Duration {
        parse_duration(&self.ttl).unwrap_or(Duration::from_secs(3600))
    }

    pub fn sweep_interval(&self) -> Duration {
        parse_duration(&self.sweep_interval).unwrap_or(Duration::from_secs(30))
    }

    pub fn in_maintenance(&self, unix_secs: u64) -> bool {
        self.maintenance_windows
            .iter()
            .any(|w| w.contains(unix_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Address of the remote execution agent.
    pub agent_addr: String,
    pub command_timeout: String,
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_backoff: String,
    pub max_backoff: String,
    /// Hex-encoded Ed25519 seed used to sign commands.
    pub signing_key_file: Option<String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            agent_addr: "127.0.0.1:7400".to_string(),
            command_timeout: "30s".to_string(),
            max_retries: 3,
            base_backoff: "500ms".to_string(),
            max_backoff: "30s".to_string(),
            signing_key_file: None,
        }
    }
}

impl DispatchConfig {
    pub fn command_timeout(&self) -> Duration {
        parse_duration(&self.command_timeout).unwrap_or(Duration::from_secs(30))
    }

    pub fn base_backoff(&self) -> Duration {
        parse_duration(&self.base_backoff).unwrap_or(Duration::from_millis(500))
    }

    pub fn max_backoff(&self) -> Duration {
        parse_duration(&self.max_backoff).unwrap_or(Duration::from_secs(30))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicaConfig {
    /// Consecutive healthy probes before a replica is ready.
    pub healthy_threshold: u32,
    pub probe_interval: String,
    pub max_probe_attempts: u32,
    /// Path probed on the replica, same as the primary's health check.
    pub health_path: String,
    pub probe_timeout: String,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            healthy_threshold: 2,
            probe_interval: "1s".to_string(),
            max_probe_attempts: 10,
            health_path: "/healthz".to_string(),
            probe_timeout: "2s".to_string(),
        }
    }
}

impl ReplicaConfig {
    pub fn probe_interval(&self) -> Duration {
        parse_duration(&self.probe_interval).unwrap_or(Duration::from_secs(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        parse_duration(&self.probe_timeout).unwrap_or(Duration::from_secs(2))
    }
}

impl SpotgridConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: SpotgridConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject values the accessors would otherwise silently replace.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations: [(&'static str, &str); 10] = [
            ("registry.cooldown", &self.registry.cooldown),
            ("registry.sweep_interval", &self.registry.sweep_interval),
            ("engine.predictor_timeout", &self.engine.predictor_timeout),
            ("approval.ttl", &self.approval.ttl),
            ("approval.sweep_interval", &self.approval.sweep_interval),
            ("dispatch.command_timeout", &self.dispatch.command_timeout),
            ("dispatch.base_backoff", &self.dispatch.base_backoff),
            ("dispatch.max_backoff", &self.dispatch.max_backoff),
            ("replica.probe_interval", &self.replica.probe_interval),
            ("replica.probe_timeout", &self.replica.probe_timeout),
        ];
        for (field, value) in durations {
            if parse_duration(value).is_none() {
                return Err(ConfigError::InvalidDuration {
                    field,
                    value: value.to_string(),
                });
            }
        }

        if self.registry.poison_threshold == 0 {
            return Err(ConfigError::Invalid(
                "registry.poison_threshold must be at least 1".to_string(),
            ));
        }
        if self.engine.workers == 0 {
            return Err(ConfigError::Invalid(
                "engine.workers must be at least 1".to_string(),
            ));
        }
        if self.engine.low_risk_threshold > self.engine.high_risk_threshold {
            return Err(ConfigError::Invalid(format!(
                "engine.low_risk_threshold ({}) exceeds high_risk_threshold ({})",
                self.engine.low_risk_threshold, self.engine.high_risk_threshold
            )));
        }
        if self.predictor.kind == PredictorKind::Http && self.predictor.endpoint.is_none() {
            return Err(ConfigError::Invalid(
                "predictor.kind = \"http\" requires predictor.endpoint".to_string(),
            ));
        }
        for w in &self.approval.maintenance_windows {
            if w.start_hour > 23 || w.end_hour > 24 {
                return Err(ConfigError::Invalid(format!(
                    "maintenance window hours out of range: {}-{}",
                    w.start_hour, w.end_hour
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = SpotgridConfig::from_toml_str("").unwrap();
        assert_eq!(config.registry.poison_threshold, 1);
        assert_eq!(config.registry.cooldown(), Duration::from_secs(15 * 86_400));
        assert_eq!(config.engine.workers, 16);
        assert_eq!(config.approval.ttl(), Duration::from_secs(3600));
        assert_eq!(config.dispatch.max_retries, 3);
        assert_eq!(config.predictor.kind, PredictorKind::None);
    }

    #[test]
    fn parse_partial_sections() {
        let toml_str = r#"
[registry]
poison_threshold = 3

[predictor]
kind = "http"
endpoint = "http://predictor:8080/score"

[approval]
ttl = "2h"
maintenance_windows = [{ start_hour = 22, end_hour = 2 }]
"#;
        let config = SpotgridConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.registry.poison_threshold, 3);
        assert_eq!(config.registry.cooldown, "15d");
        assert_eq!(config.predictor.kind, PredictorKind::Http);
        assert_eq!(config.approval.ttl(), Duration::from_secs(7200));
        assert_eq!(config.approval.maintenance_windows.len(), 1);
    }

    #[test]
    fn invalid_duration_rejected() {
        let err = SpotgridConfig::from_toml_str("[approval]\nttl = \"whenever\"\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidDuration { field: "approval.ttl", .. }
        ));
    }

    #[test]
    fn http_predictor_requires_endpoint() {
        let err = SpotgridConfig::from_toml_str("[predictor]\nkind = \"http\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn zero_threshold_rejected() {
        let err =
            SpotgridConfig::from_toml_str("[registry]\npoison_threshold = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn maintenance_window_contains() {
        let w = MaintenanceWindow {
            start_hour: 2,
            end_hour: 4,
        };
        assert!(w.contains(2 * 3600));
        assert!(w.contains(3 * 3600 + 59 * 60));
        assert!(!w.contains(4 * 3600));
        assert!(!w.contains(86_400 + 3600));
    }

    #[test]
    fn maintenance_window_wraps_midnight() {
        let w = MaintenanceWindow {
            start_hour: 22,
            end_hour: 2,
        };
        assert!(w.contains(23 * 3600));
        assert!(w.contains(86_400 + 3600));
        assert!(!w.contains(12 * 3600));
    }

    #[test]
    fn roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spotgrid.toml");
        let config = SpotgridConfig::default();
        std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();

        let loaded = SpotgridConfig::from_file(&path).unwrap();
        assert_eq!(loaded.engine.high_risk_threshold, 0.7);
        assert_eq!(loaded.replica.healthy_threshold, 2);
    }
}
