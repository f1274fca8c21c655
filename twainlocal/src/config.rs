//! Configuration
//!
//! Read from a JSON file with camelCase keys; every key is optional.
//!
//! ```json
//! {
//!     "httpTimeoutCommand": 10000,
//!     "httpTimeoutData": 30000,
//!     "httpTimeoutEvent": 30000,
//!     "sessionTimeout": 300000,
//!     "usePort": 55555,
//!     "registerFile": "register.txt",
//!     "driverPath": "/usr/lib/twainlocal/driver"
//! }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use twainlocal_core::DEFAULT_PORT;
use twainlocal_core::constants::{
    DEFAULT_COMMAND_TIMEOUT, DEFAULT_DATA_TIMEOUT, DEFAULT_EVENT_TIMEOUT, DEFAULT_RETRIES,
    DEFAULT_SESSION_TIMEOUT, MIN_SESSION_TIMEOUT,
};
use twainlocal_core::method::{Method, TimeoutClass};

use crate::error::{Error, Result};

/// Settings shared by the device and client roles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Milliseconds, never below the default
    pub http_timeout_command: u64,
    pub http_timeout_data: u64,
    pub http_timeout_event: u64,
    /// Milliseconds a device session may sit without a command
    pub session_timeout: u64,
    /// Attempts after the first one for retryable statuses
    pub retries: u32,
    pub use_port: u16,
    pub use_https: bool,
    /// Host name reported in `/privet/info`
    pub advertised_host: String,
    /// Where the scan loop writes images
    pub images_folder: PathBuf,
    pub register_file: PathBuf,
    pub driver_path: String,
    pub driver_args: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_timeout_command: DEFAULT_COMMAND_TIMEOUT.as_millis() as u64,
            http_timeout_data: DEFAULT_DATA_TIMEOUT.as_millis() as u64,
            http_timeout_event: DEFAULT_EVENT_TIMEOUT.as_millis() as u64,
            session_timeout: DEFAULT_SESSION_TIMEOUT.as_millis() as u64,
            retries: DEFAULT_RETRIES,
            use_port: DEFAULT_PORT,
            use_https: false,
            advertised_host: "localhost".to_string(),
            images_folder: PathBuf::from("images"),
            register_file: PathBuf::from("register.txt"),
            driver_path: String::new(),
            driver_args: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load from `path`, falling back to defaults when the file is missing
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts::from_millis(
            self.http_timeout_command,
            self.http_timeout_data,
            self.http_timeout_event,
        )
    }

    /// Session inactivity timeout; values under ten seconds mean the default
    pub fn session_timeout(&self) -> Duration {
        let timeout = Duration::from_millis(self.session_timeout);
        if timeout < MIN_SESSION_TIMEOUT {
            DEFAULT_SESSION_TIMEOUT
        } else {
            timeout
        }
    }

    /// Base URL the device advertises for itself
    pub fn base_url(&self) -> String {
        let scheme = if self.use_https { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.advertised_host, self.use_port)
    }
}

/// The three timeout classes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub command: Duration,
    pub data: Duration,
    pub event: Duration,
}

impl Timeouts {
    /// Build from milliseconds, clamping each class up to its default
    pub fn from_millis(command: u64, data: u64, event: u64) -> Self {
        Self {
            command: Duration::from_millis(command).max(DEFAULT_COMMAND_TIMEOUT),
            data: Duration::from_millis(data).max(DEFAULT_DATA_TIMEOUT),
            event: Duration::from_millis(event).max(DEFAULT_EVENT_TIMEOUT),
        }
    }

    pub fn for_method(&self, method: Method) -> Duration {
        match method.timeout_class() {
            TimeoutClass::Command => self.command,
            TimeoutClass::Data => self.data,
            TimeoutClass::Event => self.event,
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            command: DEFAULT_COMMAND_TIMEOUT,
            data: DEFAULT_DATA_TIMEOUT,
            event: DEFAULT_EVENT_TIMEOUT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_from_empty_object() {
        let config = Config::from_json("{}").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.timeouts(), Timeouts::default());
        assert_eq!(config.base_url(), "http://localhost:55555");
    }

    #[test]
    fn test_timeouts_clamped_to_defaults() {
        let config = Config::from_json(
            r#"{"httpTimeoutCommand": 500, "httpTimeoutData": 60000, "httpTimeoutEvent": 0}"#,
        )
        .unwrap();
        let timeouts = config.timeouts();
        assert_eq!(timeouts.command, Duration::from_secs(10));
        assert_eq!(timeouts.data, Duration::from_secs(60));
        assert_eq!(timeouts.event, Duration::from_secs(30));
    }

    #[test]
    fn test_timeout_for_method() {
        let timeouts = Timeouts::default();
        assert_eq!(timeouts.for_method(Method::ReadImageBlock), timeouts.data);
        assert_eq!(timeouts.for_method(Method::GetSession), timeouts.command);
        assert_eq!(timeouts.for_method(Method::WaitForEvents), timeouts.event);
    }

    #[test]
    fn test_session_timeout() {
        assert_eq!(Config::default().session_timeout(), Duration::from_secs(300));

        let config = Config::from_json(r#"{"sessionTimeout": 60000}"#).unwrap();
        assert_eq!(config.session_timeout(), Duration::from_secs(60));

        let config = Config::from_json(r#"{"sessionTimeout": 500}"#).unwrap();
        assert_eq!(config.session_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_bad_config_is_error() {
        assert!(matches!(
            Config::from_json(r#"{"usePort": "eighty"}"#),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path().join("missing.json")).unwrap();
        assert_eq!(config.use_port, 55555);
    }
}
