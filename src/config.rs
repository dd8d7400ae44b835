use crate::defaults;
use crate::error::{Result, ScribeError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub media: MediaConfig,
    pub bus: BusConfig,
    pub stream: StreamConfig,
    pub session: SessionConfig,
    pub publish: PublishConfig,
    pub providers: Vec<ProviderConfig>,
}

/// UDP media plane configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MediaConfig {
    pub host: String,
    pub port: u16,
    /// Swap every 16-bit sample (static per deployment).
    pub swap16: bool,
}

/// Message bus configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BusConfig {
    pub prefix: String,
    /// Unix socket of the bus broker. `None` uses the runtime-dir default.
    pub socket: Option<PathBuf>,
    pub publish_retries: u32,
    #[serde(with = "duration_str")]
    pub publish_backoff: Duration,
}

/// Per-call audio stream configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamConfig {
    /// Unconsumed bytes each consumer may hold before dropping oldest chunks.
    pub buffer_bytes: usize,
}

/// Provider session lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    pub max_restart_attempts: u32,
    #[serde(with = "duration_str")]
    pub restart_backoff: Duration,
    #[serde(with = "duration_str")]
    pub end_timeout: Duration,
}

/// Result publisher configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PublishConfig {
    pub queue_capacity: usize,
}

/// Provider connector kind
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Websocket,
    Loopback,
}

/// One speech-to-text provider
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProviderConfig {
    /// Provider id, published as `platform`.
    pub id: String,
    pub kind: ProviderKind,
    pub enabled: bool,
    /// Maximum duration of one underlying session.
    #[serde(with = "duration_str")]
    pub session_limit: Duration,
    pub url: Option<String>,
    pub credentials: Option<String>,
    pub region: Option<String>,
    pub encoding: String,
    pub sample_rate: u32,
    pub language: String,
    #[serde(with = "duration_str")]
    pub interim_every: Duration,
    #[serde(with = "duration_str")]
    pub final_every: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            media: MediaConfig::default(),
            bus: BusConfig::default(),
            stream: StreamConfig::default(),
            session: SessionConfig::default(),
            publish: PublishConfig::default(),
            providers: vec![ProviderConfig::default()],
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            host: defaults::MEDIA_HOST.to_string(),
            port: defaults::MEDIA_PORT,
            swap16: defaults::SWAP16,
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            prefix: defaults::BUS_PREFIX.to_string(),
            socket: None,
            publish_retries: defaults::PUBLISH_RETRIES,
            publish_backoff: Duration::from_millis(defaults::PUBLISH_BACKOFF_MS),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer_bytes: defaults::STREAM_BUFFER_BYTES,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_restart_attempts: defaults::MAX_RESTART_ATTEMPTS,
            restart_backoff: Duration::from_millis(defaults::RESTART_BACKOFF_MS),
            end_timeout: Duration::from_millis(defaults::END_TIMEOUT_MS),
        }
    }
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            queue_capacity: defaults::PUBLISH_QUEUE_CAPACITY,
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            id: "loopback".to_string(),
            kind: ProviderKind::Loopback,
            enabled: true,
            session_limit: Duration::from_millis(defaults::SESSION_LIMIT_MS),
            url: None,
            credentials: None,
            region: None,
            encoding: defaults::ENCODING.to_string(),
            sample_rate: defaults::SAMPLE_RATE,
            language: defaults::LANGUAGE.to_string(),
            interim_every: Duration::from_millis(defaults::LOOPBACK_INTERIM_MS),
            final_every: Duration::from_millis(defaults::LOOPBACK_FINAL_MS),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Missing fields use default values.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ScribeError::ConfigFileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                ScribeError::Io(e)
            }
        })?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from a file, or defaults if the file doesn't exist.
    ///
    /// Invalid TOML is still an error.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(ScribeError::ConfigFileNotFound { .. }) => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - RTPSCRIBE_MEDIA_HOST → media.host
    /// - RTPSCRIBE_MEDIA_PORT → media.port
    /// - RTPSCRIBE_BUS_PREFIX → bus.prefix
    /// - RTPSCRIBE_BUS_SOCKET → bus.socket
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(host) = non_empty_env("RTPSCRIBE_MEDIA_HOST") {
            self.media.host = host;
        }

        if let Some(port) = non_empty_env("RTPSCRIBE_MEDIA_PORT") {
            match port.parse::<u16>() {
                Ok(port) => self.media.port = port,
                Err(e) => {
                    tracing::warn!(value = %port, error = %e, "ignoring invalid RTPSCRIBE_MEDIA_PORT")
                }
            }
        }

        if let Some(prefix) = non_empty_env("RTPSCRIBE_BUS_PREFIX") {
            self.bus.prefix = prefix;
        }

        if let Some(socket) = non_empty_env("RTPSCRIBE_BUS_SOCKET") {
            self.bus.socket = Some(PathBuf::from(socket));
        }

        self
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.bus.prefix.is_empty() {
            return Err(invalid("bus.prefix", "must not be empty"));
        }
        if self.bus.prefix.contains(['+', '#']) {
            return Err(invalid("bus.prefix", "must not contain topic wildcards"));
        }
        if self.stream.buffer_bytes == 0 {
            return Err(invalid("stream.buffer_bytes", "must be positive"));
        }
        if self.publish.queue_capacity == 0 {
            return Err(invalid("publish.queue_capacity", "must be positive"));
        }

        let mut seen = HashSet::new();
        for provider in &self.providers {
            let key = format!("providers.{}", provider.id);
            if provider.id.is_empty() {
                return Err(invalid("providers.id", "must not be empty"));
            }
            if !seen.insert(provider.id.as_str()) {
                return Err(invalid(&key, "duplicate provider id"));
            }
            if provider.session_limit.is_zero() {
                return Err(invalid(&key, "session_limit must be positive"));
            }
            if provider.sample_rate == 0 {
                return Err(invalid(&key, "sample_rate must be positive"));
            }
            if provider.kind == ProviderKind::Websocket && provider.url.is_none() {
                return Err(invalid(&key, "websocket providers need a url"));
            }
            if provider.kind == ProviderKind::Loopback
                && (provider.interim_every.is_zero() || provider.final_every.is_zero())
            {
                return Err(invalid(&key, "loopback intervals must be positive"));
            }
        }

        Ok(())
    }

    /// Providers that take part in new calls.
    pub fn enabled_providers(&self) -> impl Iterator<Item = &ProviderConfig> {
        self.providers.iter().filter(|p| p.enabled)
    }

    /// Get the default configuration file path
    ///
    /// Returns ~/.config/rtpscribe/config.toml on Linux
    #[cfg(feature = "cli")]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("rtpscribe")
            .join("config.toml")
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn invalid(key: &str, message: &str) -> ScribeError {
    ScribeError::ConfigInvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

/// Serde adapter for humantime duration strings ("290s", "250ms").
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(s.trim()).map_err(serde::de::Error::custom)
    }
}
