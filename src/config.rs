//! Client configuration.
//!
//! Settings live in `$CONFIG_DIR/vboxctl/config.toml`. A missing file means
//! defaults; command-line flags override individual fields.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application name for config file storage.
const APP_NAME: &str = "vboxctl";

/// Config file name inside the application directory.
const CONFIG_FILE: &str = "config.toml";

/// Global vboxctl configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    /// Configuration format version.
    pub version: u8,

    /// Web-service endpoint used with `-w`.
    pub endpoint: String,

    /// Logon user name.
    pub username: String,

    /// Logon password.
    pub password: String,

    /// Timeout for one HTTP request, in seconds. Calls that wait server-side
    /// get their wait added on top.
    pub request_timeout_secs: u64,

    /// Bytes requested per log chunk.
    pub log_chunk_size: u64,

    /// Remote wait slice used while tracking progress, in milliseconds.
    pub progress_poll_ms: u64,

    /// Remote wait slice used while polling events, in milliseconds.
    pub event_poll_ms: u64,

    /// Session type used by `startvm` when none is given.
    pub start_type: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            version: 1,
            endpoint: format!("http://localhost:{}", vboxctl_protocol::DEFAULT_PORT),
            username: String::new(),
            password: String::new(),
            request_timeout_secs: 30,
            log_chunk_size: 4096,
            progress_poll_ms: 200,
            event_poll_ms: 500,
            start_type: "gui".to_string(),
        }
    }
}

impl ClientConfig {
    /// Default location of the configuration file.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Load configuration from the default location.
    ///
    /// If the configuration file doesn't exist, returns the default configuration.
    pub fn load() -> Result<Self> {
        match Self::default_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load configuration from `path`.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigLoad(format!("{}: {}", path.display(), e)))?;
        let config: Self = toml::from_str(&text)
            .map_err(|e| Error::ConfigLoad(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        if !(self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://")) {
            return Err(Error::Config(format!(
                "endpoint must be an http(s) URL, got '{}'",
                self.endpoint
            )));
        }
        if self.log_chunk_size == 0 {
            return Err(Error::Config("log_chunk_size must be positive".into()));
        }
        if self.progress_poll_ms == 0 || self.event_poll_ms == 0 {
            return Err(Error::Config("poll intervals must be positive".into()));
        }
        Ok(())
    }

    /// HTTP request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Progress wait slice.
    pub fn progress_poll(&self) -> Duration {
        Duration::from_millis(self.progress_poll_ms)
    }

    /// Event poll slice.
    pub fn event_poll(&self) -> Duration {
        Duration::from_millis(self.event_poll_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, ClientConfig::default());
        assert_eq!(config.endpoint, "http://localhost:18083");
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "username = \"admin\"\nlog_chunk_size = 512").unwrap();

        let config = ClientConfig::load_from(file.path()).unwrap();
        assert_eq!(config.username, "admin");
        assert_eq!(config.log_chunk_size, 512);
        assert_eq!(config.progress_poll(), Duration::from_millis(200));
        assert_eq!(config.start_type, "gui");
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "log_chunk_size = 0").unwrap();
        assert!(matches!(
            ClientConfig::load_from(file.path()),
            Err(Error::Config(_))
        ));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "endpoint = \"localhost:18083\"").unwrap();
        assert!(matches!(
            ClientConfig::load_from(file.path()),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_garbage_is_load_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "this is = = not toml").unwrap();
        assert!(matches!(
            ClientConfig::load_from(file.path()),
            Err(Error::ConfigLoad(_))
        ));
    }
}
