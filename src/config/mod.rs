//! Configuration management.
//!
//! Supports configuration from:
//! - TOML config files (default: `<config dir>/codeguard/config.toml`)
//! - Environment variables (`CODEGUARD_*`)
//!
//! Precedence is defaults < file < environment.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::analysis::Discipline;
use crate::client::ClientConfig;
use crate::error::{GuardError, Result};
use crate::realtime::RealtimeConfig;
use crate::security::{CustomPattern, IntegrationConfig, LayerConfig, SecurityConfig, ThreatLevel};
use crate::server::{BroadcastConfig, ServerConfig};

/// Main configuration struct
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// HTTP and real-time server
    #[serde(default)]
    pub server: ServerSection,

    /// Threat detection and circuit breaker
    #[serde(default)]
    pub security: SecuritySection,

    /// Session broadcasts and client reconnection
    #[serde(default)]
    pub realtime: RealtimeSection,

    /// Log output
    #[serde(default)]
    pub logging: LoggingSection,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|e| {
            GuardError::Config(format!("Failed to read config file {}: {e}", path.display()))
        })?;

        toml::from_str(&content)
            .map_err(|e| GuardError::Config(format!("Failed to parse config: {e}")))
    }

    /// Defaults overridden by environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Defaults < file < environment.
    ///
    /// Without an explicit path the default location is used if it exists.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(p) => Self::from_file(p)?,
                None => Self::default(),
            },
        };
        config.apply_env();
        Ok(config)
    }

    /// `<config dir>/codeguard/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("codeguard").join("config.toml"))
    }

    /// Apply `CODEGUARD_*` overrides in place
    pub fn apply_env(&mut self) {
        if let Ok(host) = std::env::var("CODEGUARD_HOST") {
            self.server.host = host;
        }
        env_parse("CODEGUARD_PORT", &mut self.server.port);
        env_parse("CODEGUARD_MAX_CONNECTIONS", &mut self.server.max_connections);
        env_parse(
            "CODEGUARD_HEARTBEAT_TIMEOUT_SECS",
            &mut self.server.heartbeat_timeout_secs,
        );

        env_parse("CODEGUARD_SECURITY_ENABLED", &mut self.security.enabled);
        env_parse("CODEGUARD_THREAT_THRESHOLD", &mut self.security.threat_threshold);
        env_parse(
            "CODEGUARD_QUARANTINE_THRESHOLD",
            &mut self.security.quarantine_threshold,
        );
        env_parse(
            "CODEGUARD_EMERGENCY_THRESHOLD",
            &mut self.security.emergency_shutdown_threshold,
        );
        env_parse(
            "CODEGUARD_SHUTDOWN_COOLDOWN_SECS",
            &mut self.security.shutdown_cooldown_secs,
        );

        env_parse(
            "CODEGUARD_PROGRESS_INTERVAL_MS",
            &mut self.realtime.progress_interval_ms,
        );

        if let Ok(level) = std::env::var("CODEGUARD_LOG_LEVEL") {
            self.logging.level = level;
        }
        env_parse("CODEGUARD_LOG_JSON", &mut self.logging.json);
    }

    /// Server settings
    pub fn server_config(&self) -> Result<ServerConfig> {
        let addr: SocketAddr = format!("{}:{}", self.server.host, self.server.port)
            .parse()
            .map_err(|e| GuardError::Config(format!("Invalid listen address: {e}")))?;

        Ok(ServerConfig {
            addr,
            max_body_size: self.server.max_body_size,
            logging: true,
            cors_enabled: self.server.cors,
            broadcast: BroadcastConfig {
                max_connections: self.server.max_connections,
                max_payload_bytes: self.server.max_payload_bytes,
                heartbeat_timeout: Duration::from_secs(self.server.heartbeat_timeout_secs),
                heartbeat_sweep_interval: period_secs(
                    "server.heartbeat_sweep_secs",
                    self.server.heartbeat_sweep_secs,
                )?,
                cleanup_interval: period_secs(
                    "server.cleanup_interval_secs",
                    self.server.cleanup_interval_secs,
                )?,
            },
        })
    }

    /// Security integration settings
    pub fn integration_config(&self) -> Result<IntegrationConfig> {
        let s = &self.security;
        let scanner = SecurityConfig {
            enabled: s.enabled,
            threat_threshold: s.threat_threshold,
            auto_sanitize: s.auto_sanitize,
            logging: s.log_threats,
            max_content_length: s.max_content_length,
            custom_patterns: s.custom_patterns.clone(),
        };

        Ok(IntegrationConfig {
            layer: LayerConfig {
                security: scanner.clone(),
                quarantine_threshold: s.quarantine_threshold,
                max_quarantine_time: chrono_secs(
                    "security.max_quarantine_secs",
                    s.max_quarantine_secs,
                )?,
                suspicious_score: s.suspicious_perfect_score,
                max_files_limit: s.max_files_limit,
            },
            global: scanner.with_max_content_length(s.global_max_content_length),
            emergency_shutdown_threshold: s.emergency_shutdown_threshold,
            shutdown_cooldown: chrono_secs(
                "security.shutdown_cooldown_secs",
                s.shutdown_cooldown_secs,
            )?,
            ..IntegrationConfig::default()
        })
    }

    /// Session coordinator settings. Unknown discipline keys are an error.
    pub fn realtime_config(&self) -> Result<RealtimeConfig> {
        if self.realtime.progress_interval_ms == 0 {
            return Err(GuardError::Config(
                "realtime.progress_interval_ms must be non-zero".to_string(),
            ));
        }
        let factor = self.realtime.overhead_factor;
        if !factor.is_finite() || factor < 0.0 {
            return Err(GuardError::Config(format!(
                "realtime.overhead_factor must be a non-negative number, got {factor}"
            )));
        }

        let mut config = RealtimeConfig::default()
            .with_progress_interval(Duration::from_millis(self.realtime.progress_interval_ms));
        for (key, secs) in &self.realtime.duration_estimates_secs {
            let discipline = Discipline::from_str(key)?;
            config
                .duration_estimates
                .insert(discipline, Duration::from_secs(*secs));
        }
        config.overhead_factor = factor;
        Ok(config)
    }

    /// Client connector settings for `url`
    pub fn client_config(&self, url: impl Into<String>) -> Result<ClientConfig> {
        Ok(ClientConfig::new(url)
            .with_base_interval(Duration::from_millis(self.realtime.reconnect_base_interval_ms))
            .with_max_attempts(self.realtime.max_reconnect_attempts)
            .with_heartbeat_interval(period_secs(
                "realtime.client_heartbeat_secs",
                self.realtime.client_heartbeat_secs,
            )?))
    }
}

/// Timer periods must be non-zero
fn period_secs(key: &str, secs: u64) -> Result<Duration> {
    if secs == 0 {
        return Err(GuardError::Config(format!("{key} must be non-zero")));
    }
    Ok(Duration::from_secs(secs))
}

/// Longest cool-down or quarantine accepted, 100 years
const MAX_WINDOW_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Windows are added to timestamps, so keep them well inside chrono's range
fn chrono_secs(key: &str, secs: u64) -> Result<chrono::Duration> {
    if secs > MAX_WINDOW_SECS {
        return Err(GuardError::Config(format!("{key} is out of range: {secs}")));
    }
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .ok_or_else(|| GuardError::Config(format!("{key} is out of range: {secs}")))
}

fn env_parse<T: FromStr>(key: &str, target: &mut T) {
    if let Ok(raw) = std::env::var(key) {
        match raw.parse() {
            Ok(value) => *target = value,
            Err(_) => tracing::warn!(key, value = %raw, "Ignoring invalid environment override"),
        }
    }
}

/// `[server]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Maximum HTTP body size in bytes
    pub max_body_size: usize,
    /// Permissive CORS
    pub cors: bool,
    /// Real-time connection capacity
    pub max_connections: usize,
    /// Real-time frame size cap in bytes
    pub max_payload_bytes: usize,
    /// Close connections silent for this long
    pub heartbeat_timeout_secs: u64,
    /// Liveness sweep period
    pub heartbeat_sweep_secs: u64,
    /// Empty index cleanup period
    pub cleanup_interval_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            max_body_size: 2 * 1024 * 1024,
            cors: true,
            max_connections: 1000,
            max_payload_bytes: 1024 * 1024,
            heartbeat_timeout_secs: 60,
            heartbeat_sweep_secs: 30,
            cleanup_interval_secs: 300,
        }
    }
}

impl ServerSection {
    /// `host:port`
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// `[security]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecuritySection {
    /// Scanning on/off
    pub enabled: bool,
    /// Redact HIGH/CRITICAL spans
    pub auto_sanitize: bool,
    /// Log every finding
    pub log_threats: bool,
    /// Levels at or above this are insecure
    pub threat_threshold: ThreatLevel,
    /// Levels at or above this quarantine the project
    pub quarantine_threshold: ThreatLevel,
    /// Per-layer content cap in bytes
    pub max_content_length: usize,
    /// Global engine content cap in bytes
    pub global_max_content_length: usize,
    /// Completed results with exactly this score are flagged
    pub suspicious_perfect_score: Option<f64>,
    /// `maxFiles` above this is treated as resource exhaustion
    pub max_files_limit: u32,
    /// CRITICAL events that trip the emergency shutdown
    pub emergency_shutdown_threshold: u32,
    /// Emergency shutdown lifts automatically after this long
    pub shutdown_cooldown_secs: u64,
    /// Quarantine entries expire after this long
    pub max_quarantine_secs: u64,
    /// Extra detection patterns
    pub custom_patterns: Vec<CustomPattern>,
}

impl Default for SecuritySection {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_sanitize: true,
            log_threats: true,
            threat_threshold: ThreatLevel::Medium,
            quarantine_threshold: ThreatLevel::High,
            max_content_length: 50_000,
            global_max_content_length: 100_000,
            suspicious_perfect_score: Some(100.0),
            max_files_limit: 1000,
            emergency_shutdown_threshold: 5,
            shutdown_cooldown_secs: 30 * 60,
            max_quarantine_secs: 24 * 60 * 60,
            custom_patterns: vec![],
        }
    }
}

/// `[realtime]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeSection {
    /// Periodic session broadcast interval
    pub progress_interval_ms: u64,
    /// Expected seconds per discipline key
    pub duration_estimates_secs: BTreeMap<String, u64>,
    /// Multiplier applied to summed estimates
    pub overhead_factor: f64,
    /// Client reconnect base interval
    pub reconnect_base_interval_ms: u64,
    /// Client reconnect attempts before giving up
    pub max_reconnect_attempts: u32,
    /// Client heartbeat period
    pub client_heartbeat_secs: u64,
}

impl Default for RealtimeSection {
    fn default() -> Self {
        Self {
            progress_interval_ms: 2000,
            duration_estimates_secs: Discipline::ALL
                .iter()
                .zip([120, 90, 60, 150])
                .map(|(d, secs)| (d.key().to_string(), secs))
                .collect(),
            overhead_factor: 1.2,
            reconnect_base_interval_ms: 1000,
            max_reconnect_attempts: 5,
            client_heartbeat_secs: 30,
        }
    }
}

/// `[logging]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Default filter directive (`RUST_LOG` wins)
    pub level: String,
    /// Emit JSON lines
    pub json: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.security.emergency_shutdown_threshold, 5);
        assert_eq!(config.security.quarantine_threshold, ThreatLevel::High);
        assert_eq!(config.realtime.progress_interval_ms, 2000);
        assert_eq!(config.server.listen_addr(), "127.0.0.1:8080");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let toml = r#"
            [server]
            port = 9090

            [security]
            quarantine_threshold = "CRITICAL"
            max_files_limit = 200

            [[security.custom_patterns]]
            pattern = "grade\\s+on\\s+a\\s+curve"
            threatType = "OUTPUT_MANIPULATION"

            [realtime.duration_estimates_secs]
            innovation = 30
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.security.quarantine_threshold, ThreatLevel::Critical);
        assert_eq!(config.security.custom_patterns.len(), 1);
        assert_eq!(config.realtime.duration_estimates_secs["innovation"], 30);
        // Table replaced, not merged; missing disciplines keep built-in estimates
        assert_eq!(config.realtime.duration_estimates_secs.len(), 1);
        let realtime = config.realtime_config().unwrap();
        assert_eq!(
            realtime.duration_estimates[&Discipline::Innovation],
            Duration::from_secs(30)
        );
        assert_eq!(
            realtime.duration_estimates[&Discipline::CodeQuality],
            Duration::from_secs(120)
        );

        let integration = config.integration_config().unwrap();
        assert_eq!(integration.layer.max_files_limit, 200);
        assert_eq!(integration.global.max_content_length, 100_000);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[logging]\nlevel = \"debug\"\njson = true").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);
    }

    #[test]
    fn test_bad_file_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nport = \"not a number\"").unwrap();
        assert!(matches!(
            Config::from_file(file.path()),
            Err(GuardError::Config(_))
        ));
        assert!(matches!(
            Config::from_file("/nonexistent/codeguard.toml"),
            Err(GuardError::Config(_))
        ));
    }

    #[test]
    fn test_server_config_conversion() {
        let mut config = Config::default();
        config.server.max_connections = 3;
        let server = config.server_config().unwrap();
        assert_eq!(server.addr.port(), 8080);
        assert_eq!(server.broadcast.max_connections, 3);

        config.server.host = "not a host".to_string();
        assert!(config.server_config().is_err());
    }

    #[test]
    fn test_realtime_conversion() {
        let config = Config::default().realtime_config().unwrap();
        assert_eq!(config.progress_interval, Duration::from_secs(2));
        assert_eq!(
            config.duration_estimates[&Discipline::BlockchainUsage],
            Duration::from_secs(150)
        );

        let mut bad = Config::default();
        bad.realtime
            .duration_estimates_secs
            .insert("vibes".to_string(), 10);
        assert!(matches!(
            bad.realtime_config(),
            Err(GuardError::Configuration(_))
        ));
    }

    #[test]
    fn test_zero_periods_rejected() {
        let mut config = Config::default();
        config.realtime.progress_interval_ms = 0;
        assert!(matches!(config.realtime_config(), Err(GuardError::Config(_))));

        let mut config = Config::default();
        config.server.heartbeat_sweep_secs = 0;
        assert!(matches!(config.server_config(), Err(GuardError::Config(_))));

        let mut config = Config::default();
        config.server.cleanup_interval_secs = 0;
        assert!(matches!(config.server_config(), Err(GuardError::Config(_))));

        let mut config = Config::default();
        config.realtime.client_heartbeat_secs = 0;
        assert!(matches!(
            config.client_config("ws://127.0.0.1:8080/ws"),
            Err(GuardError::Config(_))
        ));
    }

    #[test]
    fn test_bad_overhead_factor_rejected() {
        for factor in [-1.0, f64::NAN, f64::INFINITY] {
            let mut config = Config::default();
            config.realtime.overhead_factor = factor;
            assert!(matches!(config.realtime_config(), Err(GuardError::Config(_))));
        }

        let mut config = Config::default();
        config.realtime.overhead_factor = 0.0;
        assert!(config.realtime_config().is_ok());
    }

    #[test]
    fn test_out_of_range_durations_rejected() {
        let mut config = Config::default();
        config.security.max_quarantine_secs = u64::MAX;
        assert!(matches!(config.integration_config(), Err(GuardError::Config(_))));

        let mut config = Config::default();
        config.security.shutdown_cooldown_secs = MAX_WINDOW_SECS + 1;
        assert!(matches!(config.integration_config(), Err(GuardError::Config(_))));

        let integration = Config::default().integration_config().unwrap();
        assert_eq!(integration.shutdown_cooldown, chrono::Duration::minutes(30));
    }

    #[test]
    fn test_invalid_config_fails_app_state() {
        let mut config = Config::default();
        config.realtime.progress_interval_ms = 0;
        assert!(crate::server::AppState::new(&config).is_err());
    }
}
