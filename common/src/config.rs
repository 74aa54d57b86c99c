// Configuration management with layered configuration (file, env)

use crate::errors::ValidationError;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub scheduler: SchedulerSettings,
    pub executor: ExecutorSettings,
    pub backchannel: BackChannelSettings,
    pub observability: ObservabilityConfig,
    pub storage: StorageSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Planned start times closer than this to now are never moved
    pub allow_changes_before_start_in_sec: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            allow_changes_before_start_in_sec: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    pub job_runner_executable: String,
    pub job_run_directory: PathBuf,
    pub max_concurrent_processes: usize,
    pub poll_interval_ms: u64,
    pub start_timeout_seconds: Option<u64>,
    pub omit_overdue_after_seconds: u64,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            job_runner_executable: "runner".to_string(),
            job_run_directory: std::env::temp_dir(),
            max_concurrent_processes: 4,
            poll_interval_ms: 500,
            start_timeout_seconds: Some(30),
            omit_overdue_after_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackChannelSettings {
    /// Loopback address to listen on; an ephemeral port is used when absent
    pub address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub json_logs: bool,
    pub metrics_port: Option<u16>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: true,
            metrics_port: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// JSON file with jobs and triggers loaded into the in-memory store
    pub seed_file: Option<PathBuf>,
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with default configuration
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Add local configuration (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), ValidationError> {
        let executor = &self.executor;

        if executor.job_runner_executable.trim().is_empty() {
            return Err(ValidationError::MissingField(
                "executor.job_runner_executable".to_string(),
            ));
        }
        let runner = Path::new(&executor.job_runner_executable);
        let found = if runner.components().count() > 1 {
            runner.exists()
        } else {
            // Bare names are looked up on PATH like the launcher does
            which::which(runner).is_ok()
        };
        if !found {
            return Err(ValidationError::PathNotFound {
                field: "executor.job_runner_executable".to_string(),
                path: executor.job_runner_executable.clone(),
            });
        }

        if executor.job_run_directory.as_os_str().is_empty() {
            return Err(ValidationError::MissingField(
                "executor.job_run_directory".to_string(),
            ));
        }
        if !executor.job_run_directory.exists() {
            return Err(ValidationError::PathNotFound {
                field: "executor.job_run_directory".to_string(),
                path: executor.job_run_directory.display().to_string(),
            });
        }

        if executor.max_concurrent_processes == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "executor.max_concurrent_processes".to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }

        if executor.poll_interval_ms == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "executor.poll_interval_ms".to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }

        if let Some(address) = &self.backchannel.address {
            if address.parse::<std::net::SocketAddr>().is_err() {
                return Err(ValidationError::InvalidFieldValue {
                    field: "backchannel.address".to_string(),
                    reason: format!("'{}' is not a socket address", address),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_settings(dir: &Path) -> Settings {
        let runner = dir.join("runner");
        std::fs::write(&runner, "").unwrap();

        let mut settings = Settings::default();
        settings.executor.job_runner_executable = runner.display().to_string();
        settings.executor.job_run_directory = dir.to_path_buf();
        settings
    }

    #[test]
    fn test_default_settings_are_valid_with_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(valid_settings(dir.path()).validate().is_ok());
    }

    #[test]
    fn test_validation_catches_empty_runner() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = valid_settings(dir.path());
        settings.executor.job_runner_executable = "  ".to_string();
        assert_eq!(
            settings.validate(),
            Err(ValidationError::MissingField(
                "executor.job_runner_executable".to_string()
            ))
        );
    }

    #[test]
    fn test_validation_catches_missing_runner_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = valid_settings(dir.path());
        settings.executor.job_runner_executable =
            dir.path().join("missing-runner").display().to_string();
        assert!(matches!(
            settings.validate(),
            Err(ValidationError::PathNotFound { .. })
        ));
    }

    #[test]
    fn test_validation_catches_bare_runner_name_not_on_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = valid_settings(dir.path());
        settings.executor.job_runner_executable = "no-such-job-runner-3f9c".to_string();
        assert_eq!(
            settings.validate(),
            Err(ValidationError::PathNotFound {
                field: "executor.job_runner_executable".to_string(),
                path: "no-such-job-runner-3f9c".to_string(),
            })
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_validation_resolves_bare_runner_name_on_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = valid_settings(dir.path());
        settings.executor.job_runner_executable = "sh".to_string();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validation_catches_missing_run_directory() {
        let dir = tempfile::tempdir().unwrap();
        let settings = valid_settings(&dir.path().join("nope"));
        assert!(matches!(
            settings.validate(),
            Err(ValidationError::PathNotFound { .. })
        ));
    }

    #[test]
    fn test_validation_catches_zero_concurrency() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = valid_settings(dir.path());
        settings.executor.max_concurrent_processes = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_catches_zero_poll_interval() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = valid_settings(dir.path());
        settings.executor.poll_interval_ms = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_catches_bad_backchannel_address() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = valid_settings(dir.path());
        settings.backchannel.address = Some("localhost".to_string());
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_load_from_path_reads_default_toml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("default.toml"),
            r#"
[scheduler]
allow_changes_before_start_in_sec = 15

[executor]
job_runner_executable = "/usr/local/bin/runner"
max_concurrent_processes = 8
"#,
        )
        .unwrap();

        let settings = Settings::load_from_path(dir.path()).unwrap();

        assert_eq!(settings.scheduler.allow_changes_before_start_in_sec, 15);
        assert_eq!(settings.executor.max_concurrent_processes, 8);
        assert_eq!(settings.executor.poll_interval_ms, 500);
        assert_eq!(settings.executor.start_timeout_seconds, Some(30));
        assert!(settings.backchannel.address.is_none());
    }
}
