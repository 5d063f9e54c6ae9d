//! Configuration management infrastructure.
//!
//! Host-side preferences (timeouts, retry budget, display options) stored as
//! TOML. Protocol constants are not configurable here.

use crate::domain::constants::{CCID_DEFAULT_READ_RETRIES, CCID_DEFAULT_TIME_EXTENSION_MS};
use crate::infra::error::{OathError, OathResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OathConfiguration {
    /// Bulk transfer timeout for USB CCID
    pub usb_timeout_ms: u64,

    /// ISO-DEP transceive timeout for NFC
    pub nfc_timeout_ms: u64,

    /// Stale CCID replies tolerated per transaction
    pub ccid_read_retries: usize,

    /// Longest a card may keep requesting CCID time extensions
    pub ccid_time_extension_ms: u64,

    /// Period assumed by calculate-all
    pub default_period_secs: u32,

    /// Whether `_hidden:` credentials are listed
    pub show_hidden_credentials: bool,

    /// Where remembered lock-code secrets live (defaults next to the config)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_store_path: Option<PathBuf>,
}

impl Default for OathConfiguration {
    fn default() -> Self {
        Self {
            usb_timeout_ms: 10_000,
            nfc_timeout_ms: 3_000,
            ccid_read_retries: CCID_DEFAULT_READ_RETRIES,
            ccid_time_extension_ms: CCID_DEFAULT_TIME_EXTENSION_MS,
            default_period_secs: 30,
            show_hidden_credentials: false,
            secret_store_path: None,
        }
    }
}

impl OathConfiguration {
    #[must_use]
    pub fn usb_timeout(&self) -> Duration {
        Duration::from_millis(self.usb_timeout_ms)
    }

    #[must_use]
    pub fn nfc_timeout(&self) -> Duration {
        Duration::from_millis(self.nfc_timeout_ms)
    }

    #[must_use]
    pub fn ccid_time_extension_budget(&self) -> Duration {
        Duration::from_millis(self.ccid_time_extension_ms)
    }
}

/// Configuration export formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Toml,
    Json,
}

/// Configuration manager for handling config files
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new configuration manager with default path
    ///
    /// # Errors
    ///
    /// Currently infallible; kept fallible for platforms without a config dir.
    pub fn new() -> OathResult<Self> {
        let config_path = Self::default_config_path()?;
        Ok(Self { config_path })
    }

    /// Create a configuration manager with custom path
    pub fn with_path<P: AsRef<Path>>(path: P) -> Self {
        Self {
            config_path: path.as_ref().to_path_buf(),
        }
    }

    /// Get the default configuration file path
    ///
    /// # Errors
    ///
    /// Currently infallible.
    pub fn default_config_path() -> OathResult<PathBuf> {
        if let Some(config_dir) = dirs::config_dir() {
            Ok(config_dir.join("yubikey-oath").join("config.toml"))
        } else {
            Ok(PathBuf::from("yubikey-oath-config.toml"))
        }
    }

    /// Load configuration from file, creating default if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns [`OathError::Configuration`] if reading or writing fails.
    pub fn load_or_create_default(&self) -> OathResult<OathConfiguration> {
        if self.config_path.exists() {
            self.load()
        } else {
            log::info!(
                "Configuration file not found, creating default: {}",
                self.config_path.display()
            );
            let default_config = OathConfiguration::default();
            self.save(&default_config)?;
            Ok(default_config)
        }
    }

    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns [`OathError::Configuration`] for unreadable, malformed or
    /// invalid files.
    pub fn load(&self) -> OathResult<OathConfiguration> {
        log::debug!("Loading configuration from: {}", self.config_path.display());

        let content = fs::read_to_string(&self.config_path).map_err(|e| {
            OathError::Configuration(format!(
                "Failed to read config file {}: {e}",
                self.config_path.display()
            ))
        })?;

        let config: OathConfiguration = toml::from_str(&content)
            .map_err(|e| OathError::Configuration(format!("Failed to parse config file: {e}")))?;

        validate_config(&config)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns [`OathError::Configuration`] if the file cannot be written.
    pub fn save(&self, config: &OathConfiguration) -> OathResult<()> {
        validate_config(config)?;

        if let Some(parent) = self.config_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    OathError::Configuration(format!(
                        "Failed to create config directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }

        let content = toml::to_string_pretty(config)
            .map_err(|e| OathError::Configuration(format!("Failed to serialize config: {e}")))?;

        fs::write(&self.config_path, content).map_err(|e| {
            OathError::Configuration(format!(
                "Failed to write config file {}: {e}",
                self.config_path.display()
            ))
        })?;

        log::info!("Configuration saved to: {}", self.config_path.display());
        Ok(())
    }

    /// Update a specific configuration value
    ///
    /// # Errors
    ///
    /// Returns [`OathError::Configuration`] for unknown keys or unparsable
    /// values.
    pub fn update_value(&self, key: &str, value: &str) -> OathResult<()> {
        let mut config = self.load_or_create_default()?;

        match key {
            "usb_timeout_ms" => config.usb_timeout_ms = parse_value(key, value)?,
            "nfc_timeout_ms" => config.nfc_timeout_ms = parse_value(key, value)?,
            "ccid_read_retries" => config.ccid_read_retries = parse_value(key, value)?,
            "ccid_time_extension_ms" => {
                config.ccid_time_extension_ms = parse_value(key, value)?;
            }
            "default_period_secs" => config.default_period_secs = parse_value(key, value)?,
            "show_hidden_credentials" => {
                config.show_hidden_credentials = parse_value(key, value)?;
            }
            "secret_store_path" => {
                config.secret_store_path = if value.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                };
            }
            _ => {
                return Err(OathError::Configuration(format!(
                    "Unknown configuration key: {key}"
                )));
            }
        }

        self.save(&config)
    }

    /// Get the configuration file path
    #[must_use]
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Location of the remembered-secret file for `config`.
    #[must_use]
    pub fn secret_store_path(&self, config: &OathConfiguration) -> PathBuf {
        config.secret_store_path.clone().unwrap_or_else(|| {
            self.config_path
                .parent()
                .map_or_else(|| PathBuf::from("secrets.toml"), |dir| dir.join("secrets.toml"))
        })
    }

    /// Render the current configuration
    ///
    /// # Errors
    ///
    /// Returns [`OathError::Configuration`] if loading or serializing fails.
    pub fn export_config(&self, format: ExportFormat) -> OathResult<String> {
        let config = self.load_or_create_default()?;
        match format {
            ExportFormat::Toml => toml::to_string_pretty(&config)
                .map_err(|e| OathError::Configuration(format!("TOML export failed: {e}"))),
            ExportFormat::Json => serde_json::to_string_pretty(&config)
                .map_err(|e| OathError::Configuration(format!("JSON export failed: {e}"))),
        }
    }
}

fn validate_config(config: &OathConfiguration) -> OathResult<()> {
    if config.usb_timeout_ms == 0 {
        return Err(OathError::Configuration(
            "USB timeout must be greater than 0".to_string(),
        ));
    }
    if config.nfc_timeout_ms == 0 {
        return Err(OathError::Configuration(
            "NFC timeout must be greater than 0".to_string(),
        ));
    }
    if config.default_period_secs == 0 {
        return Err(OathError::Configuration(
            "Default period must be greater than 0".to_string(),
        ));
    }
    Ok(())
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> OathResult<T> {
    value
        .parse()
        .map_err(|_| OathError::Configuration(format!("Invalid value for {key}: {value}")))
}
