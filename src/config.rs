//! Network engine configuration.
//!
//! Every knob has a default, so an empty JSON object is a valid config file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bandwidth::GalleryQueryType;

/// Errors from loading or validating a [`NetworkConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid config value for `{field}`: {value}. Expected range: {expected}")]
    OutOfRange {
        field: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("Invalid proxy URL `{url}`: {reason}")]
    InvalidProxy { url: String, reason: String },
}

impl ConfigError {
    fn out_of_range(field: &'static str, value: impl ToString, expected: &'static str) -> Self {
        Self::OutOfRange {
            field,
            value: value.to_string(),
            expected,
        }
    }
}

/// Minimum delay between gallery queries of each class to one domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolitenessDelays {
    pub downloader_page_secs: u64,
    pub subscription_secs: u64,
    pub watcher_secs: u64,
}

impl Default for PolitenessDelays {
    fn default() -> Self {
        Self {
            downloader_page_secs: 15,
            subscription_secs: 60,
            watcher_secs: 5,
        }
    }
}

impl PolitenessDelays {
    #[must_use]
    pub fn delay_for(&self, query_type: GalleryQueryType) -> Duration {
        Duration::from_secs(match query_type {
            GalleryQueryType::DownloaderPage => self.downloader_page_secs,
            GalleryQueryType::Subscription => self.subscription_secs,
            GalleryQueryType::Watcher => self.watcher_secs,
        })
    }
}

/// Outbound proxy. Applied to every session and connection.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySettings {
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl std::fmt::Debug for ProxySettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxySettings")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl ProxySettings {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: None,
            password: None,
        }
    }

    /// Builds the reqwest proxy for all schemes.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidProxy`] when the URL does not parse.
    pub fn to_reqwest(&self) -> Result<reqwest::Proxy, ConfigError> {
        let proxy = reqwest::Proxy::all(&self.url).map_err(|e| ConfigError::InvalidProxy {
            url: self.url.clone(),
            reason: e.to_string(),
        })?;
        Ok(match (&self.username, &self.password) {
            (Some(user), Some(pass)) => proxy.basic_auth(user, pass),
            (Some(user), None) => proxy.basic_auth(user, ""),
            _ => proxy,
        })
    }
}

/// Tunables for the engine, sessions, pool and bandwidth manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Maximum simultaneous downloading jobs across all contexts.
    pub max_jobs: usize,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Session-only cookies are wiped after a session sits unused this long.
    pub session_idle_timeout_secs: u64,
    pub politeness_delays: PolitenessDelays,
    pub proxy: Option<ProxySettings>,
    pub max_redirects: usize,
    /// Pooled connections idle this long are closed by the reaper.
    pub stale_connection_timeout_secs: u64,
    pub engine_tick_ms: u64,
    pub login_poll_secs: u64,
    pub login_cooldown_secs: u64,
    pub chunk_size: usize,
    /// How often a 429/503 with `Retry-After` is waited out before giving up.
    pub max_server_backoff_retries: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            max_jobs: 10,
            request_timeout_secs: 30,
            connect_timeout_secs: 30,
            session_idle_timeout_secs: 3_600,
            politeness_delays: PolitenessDelays::default(),
            proxy: None,
            max_redirects: 8,
            stale_connection_timeout_secs: 120,
            engine_tick_ms: 1_000,
            login_poll_secs: 5,
            login_cooldown_secs: 30,
            chunk_size: 64 * 1024,
            max_server_backoff_retries: 2,
        }
    }
}

impl NetworkConfig {
    /// Loads and validates a JSON config file.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be read, is not valid JSON, or holds an
    /// out-of-range value.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every value against its supported range.
    ///
    /// # Errors
    ///
    /// Returns the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=100).contains(&self.max_jobs) {
            return Err(ConfigError::out_of_range("max_jobs", self.max_jobs, "1..=100"));
        }
        validate_secs("request_timeout_secs", self.request_timeout_secs)?;
        validate_secs("connect_timeout_secs", self.connect_timeout_secs)?;
        validate_secs("stale_connection_timeout_secs", self.stale_connection_timeout_secs)?;
        validate_secs("login_poll_secs", self.login_poll_secs)?;
        if self.session_idle_timeout_secs == 0 {
            return Err(ConfigError::out_of_range(
                "session_idle_timeout_secs",
                0,
                "1..",
            ));
        }
        if self.login_cooldown_secs > 86_400 {
            return Err(ConfigError::out_of_range(
                "login_cooldown_secs",
                self.login_cooldown_secs,
                "0..=86400",
            ));
        }
        if self.max_redirects > 50 {
            return Err(ConfigError::out_of_range(
                "max_redirects",
                self.max_redirects,
                "0..=50",
            ));
        }
        if !(10..=60_000).contains(&self.engine_tick_ms) {
            return Err(ConfigError::out_of_range(
                "engine_tick_ms",
                self.engine_tick_ms,
                "10..=60000",
            ));
        }
        if !(1024..=16 * 1024 * 1024).contains(&self.chunk_size) {
            return Err(ConfigError::out_of_range(
                "chunk_size",
                self.chunk_size,
                "1024..=16777216",
            ));
        }
        if self.max_server_backoff_retries > 10 {
            return Err(ConfigError::out_of_range(
                "max_server_backoff_retries",
                self.max_server_backoff_retries,
                "0..=10",
            ));
        }
        if let Some(proxy) = &self.proxy {
            proxy.to_reqwest()?;
        }
        Ok(())
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    #[must_use]
    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs)
    }

    #[must_use]
    pub fn stale_connection_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_connection_timeout_secs)
    }

    #[must_use]
    pub fn engine_tick(&self) -> Duration {
        Duration::from_millis(self.engine_tick_ms)
    }

    #[must_use]
    pub fn login_poll(&self) -> Duration {
        Duration::from_secs(self.login_poll_secs)
    }

    #[must_use]
    pub fn login_cooldown(&self) -> Duration {
        Duration::from_secs(self.login_cooldown_secs)
    }
}

fn validate_secs(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if !(1..=3600).contains(&value) {
        return Err(ConfigError::out_of_range(field, value, "1..=3600"));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = NetworkConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_jobs, 10);
        assert_eq!(config.session_idle_timeout(), Duration::from_secs(3_600));
        assert_eq!(
            config
                .politeness_delays
                .delay_for(GalleryQueryType::Subscription),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn test_validate_rejects_zero_max_jobs() {
        let config = NetworkConfig {
            max_jobs: 0,
            ..NetworkConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid config value for `max_jobs`: 0. Expected range: 1..=100"
        );
    }

    #[test]
    fn test_validate_rejects_bad_proxy() {
        let config = NetworkConfig {
            proxy: Some(ProxySettings::new("::not a url::")),
            ..NetworkConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidProxy { .. })
        ));
    }

    #[test]
    fn test_load_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"max_jobs": 4, "politeness_delays": {{"watcher_secs": 9}}}}"#
        )
        .unwrap();

        let config = NetworkConfig::load(file.path()).unwrap();
        assert_eq!(config.max_jobs, 4);
        assert_eq!(config.politeness_delays.watcher_secs, 9);
        assert_eq!(config.politeness_delays.subscription_secs, 60);
        assert_eq!(config.request_timeout_secs, 30);
    }

    #[test]
    fn test_load_invalid_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(
            NetworkConfig::load(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_proxy_debug_redacts_password() {
        let proxy = ProxySettings {
            url: "http://proxy:3128".to_string(),
            username: Some("user".to_string()),
            password: Some("hunter2".to_string()),
        };
        let debug = format!("{proxy:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("[REDACTED]"));
    }
}
