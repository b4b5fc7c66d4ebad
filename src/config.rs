//! Configuration management for crabframe
//!
//! Provides loading, saving and validation of provider settings, the error
//! classifier's expected codes, device selection and the stream
//! configuration applied when a session is opened.

use crate::errors::{ConfigError, DeviceErrorCode};
use crate::provider::{CodeClassifier, ProviderSettings, MAX_RESTART_RETRIES};
use crate::types::StreamConfiguration;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix for environment overrides, e.g. `CRABFRAME__PROVIDER__RESTART_DELAY_MS`.
pub const ENV_PREFIX: &str = "CRABFRAME";

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrabFrameConfig {
    pub provider: ProviderConfig,
    pub classifier: ClassifierConfig,
    pub device: DeviceConfig,
    pub stream: StreamConfiguration,
}

/// Restart policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Consecutive failed restarts before the provider gives up
    pub max_restart_retries: u32,
    /// Pause between closing a session and reopening it, in milliseconds
    pub restart_delay_ms: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            max_restart_retries: MAX_RESTART_RETRIES,
            restart_delay_ms: 2000,
        }
    }
}

/// Which device error codes trigger an automatic restart
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub expected_codes: Vec<DeviceErrorCode>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            expected_codes: CodeClassifier::DEFAULT_EXPECTED.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// In-process scripted device, see [`crate::testing::ScriptedBackend`]
    Scripted,
    /// Video4Linux2 capture node (requires the `v4l2` feature)
    V4l2,
}

/// Device selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub backend: BackendKind,
    /// Device node, used by the V4L2 backend
    pub path: PathBuf,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Scripted,
            path: PathBuf::from("/dev/video0"),
        }
    }
}

impl CrabFrameConfig {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)?;
        let config: CrabFrameConfig = toml::from_str(&contents)?;
        config.validate()?;

        log::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Load the TOML file at `path` (optional) with `CRABFRAME__SECTION__KEY`
    /// environment overrides on top.
    pub fn load_layered<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let layered = config::Config::builder()
            .add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: CrabFrameConfig = layered.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let toml_string = toml::to_string_pretty(self)?;
        fs::write(path, toml_string)?;

        log::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Get default config file path
    pub fn default_path() -> PathBuf {
        PathBuf::from("crabframe.toml")
    }

    /// Load from default location, falling back to defaults
    pub fn load_or_default() -> Self {
        Self::load_from_file(Self::default_path()).unwrap_or_else(|e| {
            log::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.provider.max_restart_retries == 0 {
            return Err(ConfigError::Invalid(
                "max_restart_retries must be at least 1".to_string(),
            ));
        }
        if self.provider.restart_delay_ms > 60_000 {
            return Err(ConfigError::Invalid(
                "restart_delay_ms must not exceed 60000".to_string(),
            ));
        }
        if self.device.backend == BackendKind::V4l2 && self.device.path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "device path is required for the v4l2 backend".to_string(),
            ));
        }
        self.stream.validate().map_err(ConfigError::Invalid)
    }

    pub fn provider_settings(&self) -> ProviderSettings {
        ProviderSettings {
            max_restart_retries: self.provider.max_restart_retries,
            restart_delay: Duration::from_millis(self.provider.restart_delay_ms),
        }
    }

    pub fn classifier(&self) -> CodeClassifier {
        CodeClassifier::new(self.classifier.expected_codes.iter().copied())
    }
}
