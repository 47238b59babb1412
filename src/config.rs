use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cycle_estimator::DayClock;
use crate::error::ConfigError;
use crate::fusion::PredictionMode;
use crate::node_directory::DEFAULT_OVERPASS_URL;

pub const ENV_PREDICTION_MODE: &str = "TRAFFIC_PREDICTION_MODE";
pub const ENV_API_BASE_URL: &str = "TRAFFIC_API_BASE_URL";
pub const ENV_POLL_INTERVAL_SECS: &str = "TRAFFIC_POLL_INTERVAL_SECS";
pub const ENV_PATTERN_DIR: &str = "TRAFFIC_PATTERN_DIR";
pub const ENV_UTC_OFFSET_MINUTES: &str = "TRAFFIC_UTC_OFFSET_MINUTES";

/// Runtime configuration for the signal timing pipeline
///
/// Sources, lowest precedence first: defaults, JSON file, environment, CLI flags.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub prediction_mode: PredictionMode,
    pub backend_base_url: Option<String>,
    /// Below this, presentation should not show a trusted countdown
    pub low_confidence_threshold: f64,
    pub polling_interval_secs: f64,
    pub overpass_url: String,
    pub node_lookup_timeout_secs: f64,
    pub remote_timeout_secs: f64,
    /// Learned patterns are kept in memory only when unset
    pub pattern_dir: Option<PathBuf>,
    /// Offset used for day boundaries of cycle offsets
    pub utc_offset_minutes: i32,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            prediction_mode: PredictionMode::OnDevice,
            backend_base_url: None,
            low_confidence_threshold: 0.72,
            polling_interval_secs: 1.0,
            overpass_url: DEFAULT_OVERPASS_URL.to_string(),
            node_lookup_timeout_secs: 10.0,
            remote_timeout_secs: 3.0,
            pattern_dir: None,
            utc_offset_minutes: 0,
        }
    }
}

impl AppConfig {
    /// Defaults overlaid with the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        let config: AppConfig = serde_json::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay values found through `lookup` (normally `std::env::var`)
    ///
    /// An unknown prediction mode falls back to on-device with a warning;
    /// malformed numbers and URLs are errors.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_PREDICTION_MODE) {
            self.prediction_mode = match raw.parse() {
                Ok(mode) => mode,
                Err(e) => {
                    log::warn!("{}, using on-device predictions", e);
                    PredictionMode::OnDevice
                }
            };
        }

        if let Some(raw) = lookup(ENV_API_BASE_URL) {
            let trimmed = raw.trim();
            self.backend_base_url = if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            };
        }

        if let Some(raw) = lookup(ENV_POLL_INTERVAL_SECS) {
            self.polling_interval_secs = parse_number(ENV_POLL_INTERVAL_SECS, &raw)?;
        }

        if let Some(raw) = lookup(ENV_PATTERN_DIR) {
            if !raw.trim().is_empty() {
                self.pattern_dir = Some(PathBuf::from(raw.trim()));
            }
        }

        if let Some(raw) = lookup(ENV_UTC_OFFSET_MINUTES) {
            self.utc_offset_minutes = parse_number(ENV_UTC_OFFSET_MINUTES, &raw)?;
        }

        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(url) = &self.backend_base_url {
            reqwest::Url::parse(url).map_err(|e| ConfigError::InvalidUrl(format!("{}: {}", url, e)))?;
        }
        reqwest::Url::parse(&self.overpass_url)
            .map_err(|e| ConfigError::InvalidUrl(format!("{}: {}", self.overpass_url, e)))?;

        check_range("low_confidence_threshold", self.low_confidence_threshold, 0.0, 1.0)?;
        check_positive("polling_interval_secs", self.polling_interval_secs)?;
        check_positive("node_lookup_timeout_secs", self.node_lookup_timeout_secs)?;
        check_positive("remote_timeout_secs", self.remote_timeout_secs)?;
        self.day_clock().map(|_| ())
    }

    pub fn polling_interval(&self) -> Duration {
        secs_or(self.polling_interval_secs, Duration::from_secs(1))
    }

    pub fn node_lookup_timeout(&self) -> Duration {
        secs_or(self.node_lookup_timeout_secs, Duration::from_secs(10))
    }

    pub fn remote_timeout(&self) -> Duration {
        secs_or(self.remote_timeout_secs, Duration::from_secs(3))
    }

    pub fn day_clock(&self) -> Result<DayClock, ConfigError> {
        DayClock::with_offset_minutes(self.utc_offset_minutes).ok_or_else(|| ConfigError::InvalidNumber {
            key: "utc_offset_minutes".to_string(),
            value: self.utc_offset_minutes.to_string(),
        })
    }
}

fn secs_or(secs: f64, fallback: Duration) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(fallback)
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidNumber {
        key: key.to_string(),
        value: raw.to_string(),
    })
}

fn check_positive(key: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidNumber {
            key: key.to_string(),
            value: value.to_string(),
        })
    }
}

fn check_range(key: &str, value: f64, min: f64, max: f64) -> Result<(), ConfigError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::InvalidNumber {
            key: key.to_string(),
            value: value.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.prediction_mode, PredictionMode::OnDevice);
        assert_eq!(config.low_confidence_threshold, 0.72);
        assert_eq!(config.polling_interval(), Duration::from_secs(1));
        assert_eq!(config.remote_timeout(), Duration::from_secs(3));
        assert_eq!(config.node_lookup_timeout(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overlay() {
        let mut config = AppConfig::default();
        config
            .apply_env(lookup(&[
                (ENV_PREDICTION_MODE, "hybrid"),
                (ENV_API_BASE_URL, "https://signals.example.com"),
                (ENV_POLL_INTERVAL_SECS, "2.5"),
                (ENV_PATTERN_DIR, "/var/lib/signal_timing"),
                (ENV_UTC_OFFSET_MINUTES, "-300"),
            ]))
            .unwrap();

        assert_eq!(config.prediction_mode, PredictionMode::Hybrid);
        assert_eq!(config.backend_base_url.as_deref(), Some("https://signals.example.com"));
        assert_eq!(config.polling_interval(), Duration::from_millis(2500));
        assert_eq!(config.pattern_dir, Some(PathBuf::from("/var/lib/signal_timing")));
        assert_eq!(config.utc_offset_minutes, -300);
    }

    #[test]
    fn test_unknown_mode_falls_back() {
        let mut config = AppConfig {
            prediction_mode: PredictionMode::Backend,
            ..AppConfig::default()
        };
        config.apply_env(lookup(&[(ENV_PREDICTION_MODE, "turbo")])).unwrap();
        assert_eq!(config.prediction_mode, PredictionMode::OnDevice);
    }

    #[test]
    fn test_bad_values_rejected() {
        let mut config = AppConfig::default();
        assert!(matches!(
            config.apply_env(lookup(&[(ENV_POLL_INTERVAL_SECS, "soon")])),
            Err(ConfigError::InvalidNumber { .. })
        ));

        let mut config = AppConfig::default();
        assert!(matches!(
            config.apply_env(lookup(&[(ENV_API_BASE_URL, "not a url")])),
            Err(ConfigError::InvalidUrl(_))
        ));

        let mut config = AppConfig::default();
        assert!(config.apply_env(lookup(&[(ENV_UTC_OFFSET_MINUTES, "1440")])).is_err());
    }

    #[test]
    fn test_json_file() {
        let path = std::env::temp_dir().join(format!("signal_timing_config_{}.json", std::process::id()));
        std::fs::write(
            &path,
            r#"{"prediction_mode": "backend", "backend_base_url": "http://localhost:8080", "remote_timeout_secs": 1.5}"#,
        )
        .unwrap();

        let config = AppConfig::from_json_file(&path).unwrap();
        assert_eq!(config.prediction_mode, PredictionMode::Backend);
        assert_eq!(config.remote_timeout(), Duration::from_millis(1500));
        // Unset keys keep their defaults
        assert_eq!(config.low_confidence_threshold, 0.72);
        let _ = std::fs::remove_file(&path);
    }
}
