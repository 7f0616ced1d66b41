//! Configuration management for sipp-sync
//!
//! This module handles loading, parsing, and validating application configuration
//! from YAML files and environment variables.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// HTTP server configuration (status/history API)
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// SIPP API client configuration
    #[serde(default)]
    pub sipp: SippConfig,

    /// Retry configuration for SIPP API calls
    #[serde(default)]
    pub retry: RetryConfig,

    /// Sync scheduler configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::FileRead(format!("Failed to read config file: {}", e)))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        // First, expand environment variables in the YAML string
        let expanded = expand_env_vars(yaml);
        serde_yaml::from_str(&expanded)
            .map_err(|e| ConfigError::Parse(format!("Failed to parse YAML: {}", e)))
    }

    /// Load configuration from environment variables with prefix SIPP_SYNC_
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        // Server config from env
        if let Ok(host) = std::env::var("SIPP_SYNC_SERVER_HOST") {
            config.server.host = host;
        }
        if let Some(port) = parse_env("SIPP_SYNC_SERVER_PORT")? {
            config.server.port = port;
        }

        // Database config from env
        if let Ok(path) = std::env::var("SIPP_SYNC_DATABASE_PATH") {
            config.database.path = path;
        }

        // SIPP client config from env
        if let Ok(base_url) = std::env::var("SIPP_SYNC_SIPP_BASE_URL") {
            config.sipp.base_url = base_url;
        }
        if let Ok(token) = std::env::var("SIPP_SYNC_SIPP_API_TOKEN") {
            config.sipp.api_token = Some(token);
        }
        if let Ok(username) = std::env::var("SIPP_SYNC_SIPP_USERNAME") {
            config.sipp.username = Some(username);
        }
        if let Ok(password) = std::env::var("SIPP_SYNC_SIPP_PASSWORD") {
            config.sipp.password = Some(password);
        }
        if let Some(timeout) = parse_env("SIPP_SYNC_SIPP_REQUEST_TIMEOUT_SECS")? {
            config.sipp.request_timeout_secs = timeout;
        }

        // Retry config from env
        if let Some(max_attempts) = parse_env("SIPP_SYNC_RETRY_MAX_ATTEMPTS")? {
            config.retry.max_attempts = max_attempts;
        }

        // Scheduler config from env
        if let Ok(enabled) = std::env::var("SIPP_SYNC_SCHEDULER_ENABLED") {
            config.scheduler.enabled = enabled.parse().unwrap_or(true);
        }
        if let Some(interval) = parse_env("SIPP_SYNC_SCHEDULER_INTERVAL_SECS")? {
            config.scheduler.interval_secs = interval;
        }
        if let Ok(node_id) = std::env::var("SIPP_SYNC_SCHEDULER_NODE_ID") {
            config.scheduler.node_id = node_id;
        }

        // Logging config from env
        if let Ok(level) = std::env::var("SIPP_SYNC_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Ok(format) = std::env::var("SIPP_SYNC_LOG_FORMAT") {
            config.logging.format = format;
        }

        Ok(config)
    }

    /// Reject values the sync core cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sipp.base_url.trim().is_empty() {
            return Err(ConfigError::MissingRequired("sipp.base_url".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if !self.retry.backoff_multiplier.is_finite() || self.retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidValue(format!(
                "retry.backoff_multiplier must be a finite number of at least 1.0, got {}",
                self.retry.backoff_multiplier
            )));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(ConfigError::InvalidValue(
                "retry.initial_backoff_ms must not exceed retry.max_backoff_ms".to_string(),
            ));
        }
        if self.scheduler.interval_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "scheduler.interval_secs must be at least 1".to_string(),
            ));
        }
        // The lease is never renewed, so it must outlive the longest run
        if self.scheduler.lock_ttl_secs <= self.scheduler.run_timeout_secs {
            return Err(ConfigError::InvalidValue(
                "scheduler.lock_ttl_secs must be greater than scheduler.run_timeout_secs"
                    .to_string(),
            ));
        }
        if self.sipp.page_size == 0 {
            return Err(ConfigError::InvalidValue(
                "sipp.page_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Parse(format!("Invalid value for {}: {}", name, value))),
        Err(_) => Ok(None),
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Host address to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    #[serde(default = "default_database_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

fn default_database_path() -> String {
    "/data/db/sipp-sync.db".to_string()
}

/// SIPP API client configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SippConfig {
    /// Base URL of the SIPP API, without trailing slash
    #[serde(default)]
    pub base_url: String,

    /// Token endpoint used when no static token is configured
    #[serde(default = "default_auth_endpoint")]
    pub auth_endpoint: String,

    /// Static bearer token; takes precedence over username/password
    #[serde(default)]
    pub api_token: Option<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Minimum interval between requests in milliseconds
    #[serde(default = "default_min_interval")]
    pub min_interval_ms: u64,

    /// Records requested per page
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Upper bound on pages fetched per record kind in one run
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,

    #[serde(default = "default_cases_endpoint")]
    pub cases_endpoint: String,

    #[serde(default = "default_schedules_endpoint")]
    pub schedules_endpoint: String,
}

impl Default for SippConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            auth_endpoint: default_auth_endpoint(),
            api_token: None,
            username: None,
            password: None,
            request_timeout_secs: default_request_timeout(),
            min_interval_ms: default_min_interval(),
            page_size: default_page_size(),
            max_pages: default_max_pages(),
            cases_endpoint: default_cases_endpoint(),
            schedules_endpoint: default_schedules_endpoint(),
        }
    }
}

fn default_auth_endpoint() -> String {
    "/api/v1/auth/token".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_min_interval() -> u64 {
    250
}

fn default_page_size() -> u32 {
    100
}

fn default_max_pages() -> u32 {
    1000
}

fn default_cases_endpoint() -> String {
    "/api/v1/cases".to_string()
}

fn default_schedules_endpoint() -> String {
    "/api/v1/schedules".to_string()
}

/// Retry configuration for SIPP API calls
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Attempt budget per logical operation, including the first call
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff before the second attempt in milliseconds
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Backoff ceiling in milliseconds
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    /// Backoff multiplier
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Whether to add jitter to backoff
    #[serde(default = "default_jitter")]
    pub jitter: bool,

    /// Whether the retry after a token refresh counts against `max_attempts`
    #[serde(default = "default_auth_refresh_consumes_attempt")]
    pub auth_refresh_consumes_attempt: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: default_jitter(),
            auth_refresh_consumes_attempt: default_auth_refresh_consumes_attempt(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff() -> u64 {
    1000
}

fn default_max_backoff() -> u64 {
    60_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> bool {
    true
}

fn default_auth_refresh_consumes_attempt() -> bool {
    true
}

/// Sync scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    /// Whether the periodic trigger runs at all (manual triggers still work)
    #[serde(default = "default_scheduler_enabled")]
    pub enabled: bool,

    /// Interval between scheduled runs in seconds
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Initial delay before the first run (seconds) - for startup load distribution
    #[serde(default = "default_initial_delay")]
    pub initial_delay_secs: u64,

    /// Jitter range (seconds) added to the first run
    #[serde(default)]
    pub jitter_secs: u64,

    /// Every Nth scheduled run is a full sync; 0 disables
    #[serde(default)]
    pub full_sync_every: u64,

    /// Whole-run timeout in seconds
    #[serde(default = "default_run_timeout")]
    pub run_timeout_secs: u64,

    /// Lifetime of the single-run lock in seconds
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: u64,

    /// Lock owner identity of this node
    #[serde(default = "default_node_id")]
    pub node_id: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_scheduler_enabled(),
            interval_secs: default_interval(),
            initial_delay_secs: default_initial_delay(),
            jitter_secs: 0,
            full_sync_every: 0,
            run_timeout_secs: default_run_timeout(),
            lock_ttl_secs: default_lock_ttl(),
            node_id: default_node_id(),
        }
    }
}

fn default_scheduler_enabled() -> bool {
    true
}

fn default_interval() -> u64 {
    300 // 5 minutes
}

fn default_initial_delay() -> u64 {
    5
}

fn default_run_timeout() -> u64 {
    900
}

fn default_lock_ttl() -> u64 {
    1800
}

fn default_node_id() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| format!("sipp-sync-{}", std::process::id()))
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (`json` or `pretty`)
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

/// Configuration error types
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum ConfigError {
    /// Error reading configuration file
    #[error("Failed to read configuration file: {0}")]
    FileRead(String),

    /// Error parsing configuration
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// Invalid configuration value
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    /// Missing required configuration
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),
}

/// Expand environment variables in a string
///
/// Supports `${VAR_NAME}` syntax
fn expand_env_vars(input: &str) -> String {
    let re = regex_lite::Regex::new(r"\$\{([^}]+)\}")
        .expect("Invalid regex pattern for environment variable expansion");

    re.replace_all(input, |caps: &regex_lite::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_else(|_| caps[0].to_string())
    })
    .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test 1: Parse complete configuration from YAML
    #[test]
    fn test_parse_complete_yaml_config() {
        let yaml = r#"
server:
  host: "127.0.0.1"
  port: 9090

database:
  path: "/tmp/sipp.db"

sipp:
  base_url: "https://sipp.example.go.id"
  auth_endpoint: "/api/login"
  username: "sync"
  password: "secret"
  request_timeout_secs: 10
  min_interval_ms: 0
  page_size: 50
  cases_endpoint: "/api/perkara"
  schedules_endpoint: "/api/jadwal-sidang"

retry:
  max_attempts: 5
  initial_backoff_ms: 200
  max_backoff_ms: 5000
  jitter: false
  auth_refresh_consumes_attempt: false

scheduler:
  interval_secs: 600
  full_sync_every: 12
  node_id: "node-a"

logging:
  level: "debug"
  format: "pretty"
"#;

        let config = Config::from_yaml(yaml).unwrap();

        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.database.path, "/tmp/sipp.db");

        assert_eq!(config.sipp.base_url, "https://sipp.example.go.id");
        assert_eq!(config.sipp.auth_endpoint, "/api/login");
        assert_eq!(config.sipp.username, Some("sync".to_string()));
        assert_eq!(config.sipp.page_size, 50);
        assert_eq!(config.sipp.cases_endpoint, "/api/perkara");
        assert_eq!(config.sipp.schedules_endpoint, "/api/jadwal-sidang");

        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.initial_backoff_ms, 200);
        assert_eq!(config.retry.max_backoff_ms, 5000);
        assert!(!config.retry.jitter);
        assert!(!config.retry.auth_refresh_consumes_attempt);

        assert_eq!(config.scheduler.interval_secs, 600);
        assert_eq!(config.scheduler.full_sync_every, 12);
        assert_eq!(config.scheduler.node_id, "node-a");

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "pretty");
    }

    // Test 2: Default values are applied for missing fields
    #[test]
    fn test_default_values_applied() {
        let yaml = r#"
sipp:
  base_url: "http://localhost:8000"
"#;

        let config = Config::from_yaml(yaml).unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.sipp.request_timeout_secs, 30);
        assert_eq!(config.sipp.page_size, 100);
        assert_eq!(config.sipp.cases_endpoint, "/api/v1/cases");
        assert_eq!(config.scheduler.interval_secs, 300);
        assert_eq!(config.scheduler.run_timeout_secs, 900);
        assert!(config.scheduler.enabled);
        assert_eq!(config.logging.format, "json");
    }

    // Test 3: Environment variables are expanded in YAML
    #[test]
    fn test_env_var_expansion() {
        std::env::set_var("SIPP_SYNC_TEST_TOKEN", "tok-123");

        let yaml = r#"
sipp:
  base_url: "http://localhost"
  api_token: "${SIPP_SYNC_TEST_TOKEN}"
  password: "${SIPP_SYNC_TEST_UNSET_VAR}"
"#;

        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.sipp.api_token, Some("tok-123".to_string()));
        // Unset variables are left as-is
        assert_eq!(
            config.sipp.password,
            Some("${SIPP_SYNC_TEST_UNSET_VAR}".to_string())
        );

        std::env::remove_var("SIPP_SYNC_TEST_TOKEN");
    }

    // Test 4: from_env loads config from environment variables
    #[test]
    fn test_from_env() {
        std::env::set_var("SIPP_SYNC_SERVER_PORT", "9999");
        std::env::set_var("SIPP_SYNC_DATABASE_PATH", "/env/sipp.db");
        std::env::set_var("SIPP_SYNC_SIPP_BASE_URL", "https://sipp.env");
        std::env::set_var("SIPP_SYNC_RETRY_MAX_ATTEMPTS", "7");
        std::env::set_var("SIPP_SYNC_SCHEDULER_INTERVAL_SECS", "120");

        let config = Config::from_env().unwrap();

        assert_eq!(config.server.port, 9999);
        assert_eq!(config.database.path, "/env/sipp.db");
        assert_eq!(config.sipp.base_url, "https://sipp.env");
        assert_eq!(config.retry.max_attempts, 7);
        assert_eq!(config.scheduler.interval_secs, 120);

        // Clean up
        std::env::remove_var("SIPP_SYNC_SERVER_PORT");
        std::env::remove_var("SIPP_SYNC_DATABASE_PATH");
        std::env::remove_var("SIPP_SYNC_SIPP_BASE_URL");
        std::env::remove_var("SIPP_SYNC_RETRY_MAX_ATTEMPTS");
        std::env::remove_var("SIPP_SYNC_SCHEDULER_INTERVAL_SECS");
    }

    // Test 5: Parse error for invalid YAML
    #[test]
    fn test_parse_error_invalid_yaml() {
        let yaml = r#"
server:
  port: "not_a_number"
"#;

        let result = Config::from_yaml(yaml);
        match result {
            Err(ConfigError::Parse(msg)) => {
                assert!(msg.contains("Failed to parse YAML"));
            }
            _ => panic!("Expected ConfigError::Parse"),
        }
    }

    // Test 6: RetryConfig default values
    #[test]
    fn test_retry_config_defaults() {
        let config = RetryConfig::default();

        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.initial_backoff_ms, 1000);
        assert_eq!(config.max_backoff_ms, 60_000);
        assert!((config.backoff_multiplier - 2.0).abs() < f64::EPSILON);
        assert!(config.jitter);
        assert!(config.auth_refresh_consumes_attempt);
    }

    // Test 7: Validation rejects unusable values
    #[test]
    fn test_validate() {
        let mut config = Config::default();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingRequired(_))
        ));

        config.sipp.base_url = "http://localhost".to_string();
        assert!(config.validate().is_ok());

        config.retry.max_attempts = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue(_))));

        config.retry.max_attempts = 1;
        config.scheduler.interval_secs = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue(_))));
    }

    // Test 8: Empty YAML results in defaults
    #[test]
    fn test_empty_yaml_defaults() {
        let yaml = "{}";
        let config = Config::from_yaml(yaml).unwrap();

        assert_eq!(config.server, ServerConfig::default());
        assert_eq!(config.retry, RetryConfig::default());
        assert_eq!(config.sipp, SippConfig::default());
    }

    // Test 9: Backoff settings that would break the retry loop are rejected
    #[test]
    fn test_validate_backoff() {
        let mut config = Config::default();
        config.sipp.base_url = "http://localhost".to_string();

        for multiplier in [-2.0, 0.5, f64::NAN, f64::INFINITY] {
            config.retry.backoff_multiplier = multiplier;
            assert!(matches!(config.validate(), Err(ConfigError::InvalidValue(_))));
        }

        config.retry.backoff_multiplier = 1.0;
        assert!(config.validate().is_ok());

        config.retry.initial_backoff_ms = 5_000;
        config.retry.max_backoff_ms = 1_000;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue(_))));
    }

    // Test 10: The run lock must outlive the run timeout
    #[test]
    fn test_validate_lock_ttl() {
        let mut config = Config::default();
        config.sipp.base_url = "http://localhost".to_string();

        config.scheduler.run_timeout_secs = 600;
        config.scheduler.lock_ttl_secs = 600;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue(_))));

        config.scheduler.lock_ttl_secs = 300;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue(_))));

        config.scheduler.lock_ttl_secs = 601;
        assert!(config.validate().is_ok());
    }
}
