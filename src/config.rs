use std::env;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Environment variable holding the full YAML configuration.
pub const CONFIG_ENV: &str = "SFU_CONFIG";
/// Environment variable holding a path to the YAML configuration file.
pub const CONFIG_FILE_ENV: &str = "SFU_CONFIG_FILE";
const DEFAULT_CONFIG_FILE: &str = "config.yaml";

/// Application configuration, loaded from `SFU_CONFIG` (inline YAML) or a
/// YAML file. Validation failures are fatal to process start.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub matrix: MatrixConfig,
    #[serde(default)]
    pub conference: ConferenceConfig,
    /// Logging level (e.g., "info", "debug").
    #[serde(default = "default_log")]
    pub log: String,
    #[serde(default)]
    pub telemetry: Option<TelemetryConfig>,
    #[serde(default)]
    pub webrtc: WebRtcConfig,
    /// Port for the HTTP metrics endpoint (Prometheus).
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatrixConfig {
    /// The user the SFU acts as (`@sfu:example.org`).
    pub user_id: String,
    pub homeserver_url: String,
    /// Access token for `user_id`. Ownership is verified against the
    /// homeserver by the signaling layer when it connects.
    pub access_token: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConferenceConfig {
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatConfig {
    /// Seconds between data-channel pings. Valid range 5..=30.
    #[serde(default = "default_heartbeat_interval")]
    pub interval: u64,
    /// Seconds without a pong before the participant is dropped.
    /// Valid range 30..=120.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout: u64,
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: default_heartbeat_interval(),
            timeout: default_heartbeat_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryConfig {
    pub endpoint: String,
    #[serde(default = "default_telemetry_protocol")]
    pub protocol: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebRtcConfig {
    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: default_stun_servers(),
        }
    }
}

fn default_log() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    3030
}

fn default_heartbeat_interval() -> u64 {
    5
}

fn default_heartbeat_timeout() -> u64 {
    30
}

fn default_telemetry_protocol() -> String {
    "grpc".to_string()
}

fn default_stun_servers() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string()]
}

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("neither {CONFIG_ENV} nor a readable config file at {0} is available")]
    Missing(String),
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid YAML: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("{0} is required and must not be empty")]
    EmptyField(&'static str),
    #[error("{field} must be between {min} and {max} seconds (got {value})")]
    OutOfRange {
        field: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },
}

/// Loads and validates the configuration.
///
/// `SFU_CONFIG` (inline YAML) wins over `SFU_CONFIG_FILE`, which defaults
/// to `config.yaml`.
pub fn load() -> Result<Config, ConfigError> {
    let yaml = match env::var(CONFIG_ENV) {
        Ok(inline) if !inline.trim().is_empty() => inline,
        _ => {
            let path =
                env::var(CONFIG_FILE_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
            if !Path::new(&path).exists() {
                return Err(ConfigError::Missing(path));
            }
            std::fs::read_to_string(&path).map_err(|source| ConfigError::Io { path, source })?
        }
    };
    parse(&yaml)
}

/// Parses and validates a YAML document.
pub fn parse(yaml: &str) -> Result<Config, ConfigError> {
    let config: Config = serde_yaml::from_str(yaml)?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.matrix.user_id.trim().is_empty() {
        return Err(ConfigError::EmptyField("matrix.userId"));
    }
    if config.matrix.homeserver_url.trim().is_empty() {
        return Err(ConfigError::EmptyField("matrix.homeserverUrl"));
    }
    if config.matrix.access_token.trim().is_empty() {
        return Err(ConfigError::EmptyField("matrix.accessToken"));
    }

    let heartbeat = &config.conference.heartbeat;
    if !(5..=30).contains(&heartbeat.interval) {
        return Err(ConfigError::OutOfRange {
            field: "conference.heartbeat.interval",
            value: heartbeat.interval,
            min: 5,
            max: 30,
        });
    }
    if !(30..=120).contains(&heartbeat.timeout) {
        return Err(ConfigError::OutOfRange {
            field: "conference.heartbeat.timeout",
            value: heartbeat.timeout,
            min: 30,
            max: 120,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    lazy_static::lazy_static! {
        static ref ENV_MUTEX: Mutex<()> = Mutex::new(());
    }

    // Helper to set up and tear down environment variables for tests
    struct EnvGuard<'a> {
        vars: Vec<String>,
        _guard: std::sync::MutexGuard<'a, ()>,
    }

    impl<'a> EnvGuard<'a> {
        fn new() -> Self {
            let guard = ENV_MUTEX.lock().unwrap();
            EnvGuard {
                vars: Vec::new(),
                _guard: guard,
            }
        }

        fn set(&mut self, key: &str, value: &str) {
            env::set_var(key, value);
            self.vars.push(key.to_string());
        }

        fn unset(&mut self, key: &str) {
            env::remove_var(key);
            self.vars.push(key.to_string());
        }
    }

    impl<'a> Drop for EnvGuard<'a> {
        fn drop(&mut self) {
            for var in &self.vars {
                env::remove_var(var);
            }
        }
    }

    const VALID_YAML: &str = r#"
matrix:
  userId: "@sfu:example.org"
  homeserverUrl: "https://matrix.example.org"
  accessToken: "syt_secret"
conference:
  heartbeat:
    interval: 10
    timeout: 60
log: debug
"#;

    #[test]
    fn test_parse_valid_configuration() {
        let config = parse(VALID_YAML).expect("Expected valid configuration");
        assert_eq!(config.matrix.user_id, "@sfu:example.org");
        assert_eq!(config.conference.heartbeat.interval, 10);
        assert_eq!(config.conference.heartbeat.timeout(), Duration::from_secs(60));
        assert_eq!(config.log, "debug");
        assert_eq!(config.metrics_port, 3030);
        assert!(config.telemetry.is_none());
        assert_eq!(config.webrtc.stun_servers.len(), 1);
    }

    #[test]
    fn test_defaults_apply() {
        let yaml = r#"
matrix:
  userId: "@sfu:example.org"
  homeserverUrl: "https://matrix.example.org"
  accessToken: "syt_secret"
"#;
        let config = parse(yaml).unwrap();
        assert_eq!(config.conference.heartbeat.interval, 5);
        assert_eq!(config.conference.heartbeat.timeout, 30);
        assert_eq!(config.log, "info");
    }

    #[test]
    fn test_empty_matrix_field_is_rejected() {
        let yaml = r#"
matrix:
  userId: ""
  homeserverUrl: "https://matrix.example.org"
  accessToken: "syt_secret"
"#;
        let err = parse(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyField("matrix.userId")));
        assert!(err.to_string().contains("matrix.userId"));
    }

    #[test]
    fn test_heartbeat_bounds_are_enforced() {
        let yaml = r#"
matrix:
  userId: "@sfu:example.org"
  homeserverUrl: "https://matrix.example.org"
  accessToken: "syt_secret"
conference:
  heartbeat:
    interval: 2
"#;
        let err = parse(yaml).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::OutOfRange {
                field: "conference.heartbeat.interval",
                value: 2,
                ..
            }
        ));

        let yaml = r#"
matrix:
  userId: "@sfu:example.org"
  homeserverUrl: "https://matrix.example.org"
  accessToken: "syt_secret"
conference:
  heartbeat:
    timeout: 600
"#;
        assert!(parse(yaml).is_err());
    }

    #[test]
    fn test_telemetry_section_is_optional() {
        let yaml = r#"
matrix:
  userId: "@sfu:example.org"
  homeserverUrl: "https://matrix.example.org"
  accessToken: "syt_secret"
telemetry:
  endpoint: "http://otel:4317"
"#;
        let config = parse(yaml).unwrap();
        let telemetry = config.telemetry.unwrap();
        assert_eq!(telemetry.endpoint, "http://otel:4317");
        assert_eq!(telemetry.protocol, "grpc");
    }

    #[test]
    fn test_load_from_env_var() {
        let mut guard = EnvGuard::new();
        guard.set(CONFIG_ENV, VALID_YAML);
        let config = load().expect("Expected valid configuration");
        assert_eq!(config.matrix.homeserver_url, "https://matrix.example.org");
    }

    #[test]
    fn test_load_missing_everything() {
        let mut guard = EnvGuard::new();
        guard.unset(CONFIG_ENV);
        guard.set(CONFIG_FILE_ENV, "/definitely/not/here.yaml");
        let err = load().unwrap_err();
        assert!(matches!(err, ConfigError::Missing(_)));
    }

    #[test]
    fn test_invalid_yaml_is_rejected() {
        assert!(matches!(parse("not: [valid"), Err(ConfigError::Parse(_))));
    }
}
