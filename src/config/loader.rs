//! Configuration loading
//!
//! Loads configuration from a JSON file, then applies `TETHERD_*`
//! environment overrides.

use std::path::Path;

use tracing::{debug, info};

use super::types::Config;
use crate::error::ConfigError;

/// Load configuration from a JSON file.
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read or parsed.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;

    let config: Config = serde_json::from_str(&contents)
        .map_err(|e| ConfigError::ParseError(format!("Failed to parse JSON: {e} at {path:?}")))?;

    config.validate()?;

    info!(
        "Configuration loaded: supported={}, auto_select={}",
        config.tethering.supported, config.upstream.auto_select
    );

    Ok(config)
}

/// Load configuration from a JSON string.
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<Config, ConfigError> {
    let config: Config =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config.validate()?;

    Ok(config)
}

/// Load configuration with environment variable overrides.
///
/// Environment variables:
/// - `TETHERD_LOG_LEVEL`: Override log level
/// - `TETHERD_IPC_SOCKET`: Override IPC socket path
/// - `TETHERD_SUPPORTED`: Override the master tethering switch (0/1)
/// - `TETHERD_FORCE_USB_NCM`: Override the USB NCM function switch (0/1)
///
/// # Errors
///
/// Returns `ConfigError` if loading or parsing fails.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let mut config = load_config(path)?;

    if let Ok(level) = std::env::var("TETHERD_LOG_LEVEL") {
        config.log.level = level;
        debug!("Log level overridden to {}", config.log.level);
    }

    if let Ok(socket) = std::env::var("TETHERD_IPC_SOCKET") {
        config.ipc.socket_path = socket.into();
        debug!("IPC socket path overridden to {:?}", config.ipc.socket_path);
    }

    if let Ok(value) = std::env::var("TETHERD_SUPPORTED") {
        config.tethering.supported = parse_bool("TETHERD_SUPPORTED", &value)?;
        debug!("Tethering supported overridden to {}", config.tethering.supported);
    }

    if let Ok(value) = std::env::var("TETHERD_FORCE_USB_NCM") {
        config.tethering.force_usb_ncm = parse_bool("TETHERD_FORCE_USB_NCM", &value)?;
        debug!("USB NCM function overridden to {}", config.tethering.force_usb_ncm);
    }

    config.validate()?;

    Ok(config)
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        _ => Err(ConfigError::EnvError {
            name: name.into(),
            reason: format!("Expected 0/1/true/false, got {value}"),
        }),
    }
}

/// Create a default configuration file at the given path.
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be written.
pub fn create_default_config(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let config = Config::default_config();
    let json = serde_json::to_string_pretty(&config)
        .map_err(|e| ConfigError::ParseError(format!("Failed to serialize config: {e}")))?;

    std::fs::write(path.as_ref(), json)?;

    info!("Default configuration written to {:?}", path.as_ref());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_is_reported() {
        let err = load_config("/nonexistent/tetherd.json").unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn roundtrip_default_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        create_default_config(&path).unwrap();
        let config = load_config(&path).unwrap();
        assert!(config.tethering.supported);
        assert!(config.upstream.auto_select);
    }

    #[test]
    fn parse_error_on_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();

        let err = load_config(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn partial_config_uses_defaults() {
        let config = load_config_str(r#"{"tethering": {"force_usb_ncm": true}}"#).unwrap();
        assert!(config.tethering.force_usb_ncm);
        assert!(config.tethering.supported);
        assert_eq!(config.dhcp.lease_time_secs, 3600);
    }

    #[test]
    fn bool_env_parsing() {
        assert!(parse_bool("X", "1").unwrap());
        assert!(!parse_bool("X", "false").unwrap());
        assert!(parse_bool("X", "yes").is_err());
    }
}
