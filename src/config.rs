//! Configuration loading from a YAML file.
//!
//! A missing file is not an error: every field has a default suitable for a
//! Kubernetes DaemonSet deployment. An unreadable or invalid file fails
//! startup. Durations are expressed as integer seconds in the file; the
//! accessors convert to [`Duration`].

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Which container runtime the agent talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Docker,
    Containerd,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cleaner: CleanerConfig,
    pub metrics: MetricsConfig,
    pub logger: LoggerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CleanerConfig {
    /// Seconds between detection passes.
    pub check_interval: u64,
    /// Consecutive sightings required before a container is cleaned.
    pub confirm_count: u32,
    /// Seconds allowed for each container runtime operation.
    pub container_timeout: u64,
    /// Seconds allowed for the process-table scan.
    pub process_timeout: u64,
    /// Upper bound on concurrent per-container work.
    pub max_concurrent_containers: usize,
    /// Pod-name patterns that are never cleaned.
    pub whitelist_patterns: Vec<String>,
    /// Detect and log only; never remove anything.
    pub dry_run: bool,
    pub container_runtime: RuntimeKind,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    pub level: String,
    pub format: String,
    /// Append logs to this file instead of stderr.
    pub output_file: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cleaner: CleanerConfig::default(),
            metrics: MetricsConfig::default(),
            logger: LoggerConfig::default(),
        }
    }
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            check_interval: 300,
            confirm_count: 3,
            container_timeout: 30,
            process_timeout: 10,
            max_concurrent_containers: 10,
            whitelist_patterns: Vec::new(),
            dry_run: false,
            container_runtime: RuntimeKind::Docker,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 9090,
            path: "/metrics".to_string(),
        }
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
            output_file: None,
        }
    }
}

impl Config {
    /// Load configuration, falling back to defaults when the file is absent.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let cfg = if Path::new(path).exists() {
            let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
                path: path.to_string(),
                source: e,
            })?;
            serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse {
                path: path.to_string(),
                source: e,
            })?
        } else {
            Config::default()
        };

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.cleaner.check_interval == 0 {
            return Err(ConfigError::Invalid(
                "cleaner.check_interval must be greater than 0".to_string(),
            ));
        }
        if self.cleaner.confirm_count == 0 {
            return Err(ConfigError::Invalid(
                "cleaner.confirm_count must be at least 1".to_string(),
            ));
        }
        if self.cleaner.container_timeout == 0 {
            return Err(ConfigError::Invalid(
                "cleaner.container_timeout must be greater than 0".to_string(),
            ));
        }
        if self.cleaner.process_timeout == 0 {
            return Err(ConfigError::Invalid(
                "cleaner.process_timeout must be greater than 0".to_string(),
            ));
        }
        if self.cleaner.max_concurrent_containers == 0 {
            return Err(ConfigError::Invalid(
                "cleaner.max_concurrent_containers must be at least 1".to_string(),
            ));
        }
        if !self.metrics.path.starts_with('/') {
            return Err(ConfigError::Invalid(
                "metrics.path must start with '/'".to_string(),
            ));
        }
        match self.logger.format.as_str() {
            "json" | "text" => {}
            other => {
                return Err(ConfigError::Invalid(format!(
                    "logger.format must be 'json' or 'text', got '{other}'"
                )))
            }
        }
        Ok(())
    }
}

impl CleanerConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval)
    }

    pub fn container_timeout(&self) -> Duration {
        Duration::from_secs(self.container_timeout)
    }

    pub fn process_timeout(&self) -> Duration {
        Duration::from_secs(self.process_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_yields_defaults() {
        let cfg = Config::load("/nonexistent/zombie-sweeper.yaml").unwrap();
        assert_eq!(cfg.cleaner.check_interval, 300);
        assert_eq!(cfg.cleaner.confirm_count, 3);
        assert_eq!(cfg.cleaner.max_concurrent_containers, 10);
        assert_eq!(cfg.cleaner.container_runtime, RuntimeKind::Docker);
        assert!(cfg.metrics.enabled);
        assert_eq!(cfg.metrics.port, 9090);
        assert_eq!(cfg.logger.level, "info");
    }

    #[test]
    fn test_partial_file_keeps_defaults_for_rest() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            "cleaner:\n  check_interval: 60\n  confirm_count: 2\n  container_runtime: containerd\n  whitelist_patterns: [\"^kube-system-.*\"]\nmetrics:\n  port: 9100"
        )
        .unwrap();

        let cfg = Config::load(f.path().to_str().unwrap()).unwrap();
        assert_eq!(cfg.cleaner.check_interval, 60);
        assert_eq!(cfg.cleaner.confirm_count, 2);
        assert_eq!(cfg.cleaner.container_runtime, RuntimeKind::Containerd);
        assert_eq!(cfg.cleaner.whitelist_patterns, vec!["^kube-system-.*"]);
        // untouched sections keep their defaults
        assert_eq!(cfg.cleaner.container_timeout, 30);
        assert_eq!(cfg.metrics.port, 9100);
        assert_eq!(cfg.metrics.path, "/metrics");
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "cleaner:\n  check_interval: 0").unwrap();

        let err = Config::load(f.path().to_str().unwrap()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_unknown_runtime_rejected_at_parse() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "cleaner:\n  container_runtime: cri-o").unwrap();

        let err = Config::load(f.path().to_str().unwrap()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_bad_logger_format_rejected() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "logger:\n  format: xml").unwrap();

        let err = Config::load(f.path().to_str().unwrap()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_duration_accessors() {
        let cfg = Config::default();
        assert_eq!(cfg.cleaner.check_interval(), Duration::from_secs(300));
        assert_eq!(cfg.cleaner.container_timeout(), Duration::from_secs(30));
    }
}
