use crate::framer::DEFAULT_MAX_FRAME_LEN;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const ENV_HOST: &str = "E4_SERVER_HOST";
pub const ENV_PORT: &str = "E4_SERVER_PORT";
pub const ENV_MAX_CONNECT_ATTEMPTS: &str = "E4_MAX_CONNECT_ATTEMPTS";
pub const ENV_RETRY_BACKOFF_MS: &str = "E4_RETRY_BACKOFF_MS";
pub const ENV_STREAM_BUFFER: &str = "E4_STREAM_BUFFER";

pub const DEFAULT_PORT: u16 = 28000;
pub const DEFAULT_MAX_CONNECT_ATTEMPTS: u32 = 20;
pub const DEFAULT_STREAM_CAPACITY: usize = 4096;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {var}: '{value}' ({reason})")]
    InvalidValue {
        var: String,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(var: &str, value: &str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            var: var.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Delivery policy of per-stream sample channels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamBuffer {
    /// Keep every sample until it is consumed
    Unbounded,
    /// Keep at most this many samples, dropping the oldest when full
    Bounded(usize),
}

impl Default for StreamBuffer {
    fn default() -> Self {
        StreamBuffer::Bounded(DEFAULT_STREAM_CAPACITY)
    }
}

impl FromStr for StreamBuffer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("unbounded") {
            return Ok(StreamBuffer::Unbounded);
        }
        match s.parse::<usize>() {
            Ok(0) => Err("capacity must be at least 1".to_string()),
            Ok(capacity) => Ok(StreamBuffer::Bounded(capacity)),
            Err(_) => Err("expected 'unbounded' or a capacity".to_string()),
        }
    }
}

impl fmt::Display for StreamBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamBuffer::Unbounded => f.write_str("unbounded"),
            StreamBuffer::Bounded(capacity) => write!(f, "{}", capacity),
        }
    }
}

/// Settings for one client session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Total number of connection attempts before giving up
    pub max_connect_attempts: u32,
    /// Pause between failed connection attempts
    pub retry_backoff: Duration,
    pub stream_buffer: StreamBuffer,
    /// Size of each socket read
    pub read_chunk_size: usize,
    /// Longest accepted line, in bytes
    pub max_frame_len: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            max_connect_attempts: DEFAULT_MAX_CONNECT_ATTEMPTS,
            retry_backoff: Duration::from_millis(10),
            stream_buffer: StreamBuffer::default(),
            read_chunk_size: 1024,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn with_max_connect_attempts(mut self, attempts: u32) -> Self {
        self.max_connect_attempts = attempts.max(1);
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_stream_buffer(mut self, stream_buffer: StreamBuffer) -> Self {
        self.stream_buffer = stream_buffer;
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Load configuration from the environment, reading `.env` if present
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Build configuration from a variable lookup; unset variables keep defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(host) = lookup(ENV_HOST) {
            if host.trim().is_empty() {
                return Err(ConfigError::invalid(ENV_HOST, &host, "host cannot be empty"));
            }
            config.host = host.trim().to_string();
        }

        if let Some(port) = lookup(ENV_PORT) {
            config.port = port
                .trim()
                .parse()
                .map_err(|_| ConfigError::invalid(ENV_PORT, &port, "expected a port number"))?;
        }

        if let Some(attempts) = lookup(ENV_MAX_CONNECT_ATTEMPTS) {
            config.max_connect_attempts = match attempts.trim().parse::<u32>() {
                Ok(0) | Err(_) => {
                    return Err(ConfigError::invalid(
                        ENV_MAX_CONNECT_ATTEMPTS,
                        &attempts,
                        "expected a positive number",
                    ))
                }
                Ok(attempts) => attempts,
            };
        }

        if let Some(backoff) = lookup(ENV_RETRY_BACKOFF_MS) {
            let millis: u64 = backoff.trim().parse().map_err(|_| {
                ConfigError::invalid(ENV_RETRY_BACKOFF_MS, &backoff, "expected milliseconds")
            })?;
            config.retry_backoff = Duration::from_millis(millis);
        }

        if let Some(buffer) = lookup(ENV_STREAM_BUFFER) {
            config.stream_buffer = buffer
                .trim()
                .parse()
                .map_err(|reason: String| {
                    ConfigError::invalid(ENV_STREAM_BUFFER, &buffer, reason)
                })?;
        }

        Ok(config)
    }
}

/// Load configuration with helpful error messages
pub fn load_config() -> Result<ClientConfig, ConfigError> {
    match ClientConfig::from_env() {
        Ok(config) => {
            log::info!(
                "Loaded client configuration for {} ({} connect attempts, stream buffer {})",
                config.address(),
                config.max_connect_attempts,
                config.stream_buffer
            );
            Ok(config)
        }
        Err(e) => {
            log::error!("Configuration error: {}", e);
            log::error!(
                "Set {}, {}, {}, {} or {} in the environment or a .env file",
                ENV_HOST,
                ENV_PORT,
                ENV_MAX_CONNECT_ATTEMPTS,
                ENV_RETRY_BACKOFF_MS,
                ENV_STREAM_BUFFER
            );
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = ClientConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, ClientConfig::default());
        assert_eq!(config.address(), "127.0.0.1:28000");
        assert_eq!(config.stream_buffer, StreamBuffer::Bounded(DEFAULT_STREAM_CAPACITY));
    }

    #[test]
    fn test_values_from_lookup() {
        let config = ClientConfig::from_lookup(lookup(&[
            (ENV_HOST, "192.168.56.101"),
            (ENV_PORT, "28001"),
            (ENV_MAX_CONNECT_ATTEMPTS, "3"),
            (ENV_RETRY_BACKOFF_MS, "250"),
            (ENV_STREAM_BUFFER, "unbounded"),
        ]))
        .unwrap();

        assert_eq!(config.address(), "192.168.56.101:28001");
        assert_eq!(config.max_connect_attempts, 3);
        assert_eq!(config.retry_backoff, Duration::from_millis(250));
        assert_eq!(config.stream_buffer, StreamBuffer::Unbounded);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        for vars in [
            [(ENV_PORT, "not-a-port")],
            [(ENV_PORT, "70000")],
            [(ENV_MAX_CONNECT_ATTEMPTS, "0")],
            [(ENV_STREAM_BUFFER, "0")],
            [(ENV_HOST, "  ")],
        ] {
            assert!(
                ClientConfig::from_lookup(lookup(&vars)).is_err(),
                "{:?} should be rejected",
                vars
            );
        }
    }

    #[test]
    fn test_builder_clamps_attempts() {
        let config = ClientConfig::new("localhost", 1).with_max_connect_attempts(0);
        assert_eq!(config.max_connect_attempts, 1);
    }

    #[test]
    #[serial]
    fn test_from_env_reads_process_environment() {
        env::set_var(ENV_PORT, "29000");
        env::set_var(ENV_STREAM_BUFFER, "128");
        let config = ClientConfig::from_env();
        env::remove_var(ENV_PORT);
        env::remove_var(ENV_STREAM_BUFFER);

        let config = config.unwrap();
        assert_eq!(config.port, 29000);
        assert_eq!(config.stream_buffer, StreamBuffer::Bounded(128));
    }

    #[test]
    #[serial]
    fn test_load_config_reports_errors() {
        env::set_var(ENV_MAX_CONNECT_ATTEMPTS, "many");
        let result = load_config();
        env::remove_var(ENV_MAX_CONNECT_ATTEMPTS);

        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }
}
