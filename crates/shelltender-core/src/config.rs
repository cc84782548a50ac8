//! Server configuration
//!
//! Built either from environment variables (each with a single effect) or
//! from a caller-supplied [`ServerConfig`]. Validation coerces the common
//! mistakes instead of failing, and reports each coercion as a warning.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const ENV_PORT: &str = "SHELLTENDER_PORT";
pub const ENV_WS_PATH: &str = "SHELLTENDER_WS_PATH";
pub const ENV_DATA_DIR: &str = "SHELLTENDER_DATA_DIR";
pub const ENV_MONITOR_AUTH_KEY: &str = "SHELLTENDER_MONITOR_AUTH_KEY";
pub const ENV_ENVIRONMENT: &str = "SHELLTENDER_ENV";

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_WS_PATH: &str = "/ws";
const DEFAULT_MAX_SESSIONS: usize = 10;
const DEFAULT_BUFFER_CAP: usize = 10_000;
const DEFAULT_OUTBOUND_QUEUE: usize = 256;
const PRODUCTION_IDLE_TIMEOUT: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Production,
}

/// What to do when a client's outbound queue hits its high-water mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Close the connection with WebSocket code 1009; the client reconnects
    /// with incremental replay.
    Close,
    /// Drop the frame for that client only; the gap is recovered on the next
    /// incremental connect.
    DropFrames,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub port: u16,
    pub ws_path: String,
    pub data_dir: PathBuf,
    pub environment: Environment,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor_auth_key: Option<String>,
    pub enable_security: bool,
    pub enable_rate_limit: bool,
    pub enable_pipeline: bool,
    pub max_sessions: usize,
    /// Ring buffer capacity in bytes, per session.
    pub buffer_cap: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cors_origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_idle_timeout_ms: Option<u64>,
    /// High-water mark of the per-connection outbound queue, in frames.
    pub outbound_queue_limit: usize,
    pub overflow_policy: OverflowPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::defaults_for(Environment::Development)
    }
}

impl ServerConfig {
    pub fn defaults_for(environment: Environment) -> Self {
        let production = environment == Environment::Production;
        Self {
            port: DEFAULT_PORT,
            ws_path: DEFAULT_WS_PATH.to_string(),
            data_dir: default_data_dir(),
            environment,
            monitor_auth_key: None,
            enable_security: true,
            enable_rate_limit: production,
            enable_pipeline: true,
            max_sessions: DEFAULT_MAX_SESSIONS,
            buffer_cap: DEFAULT_BUFFER_CAP,
            cors_origin: None,
            session_idle_timeout_ms: production.then(|| PRODUCTION_IDLE_TIMEOUT.as_millis() as u64),
            outbound_queue_limit: DEFAULT_OUTBOUND_QUEUE,
            overflow_policy: OverflowPolicy::Close,
        }
    }

    /// Load from environment variables, then validate. Returns the config
    /// and any coercion warnings for the caller to log.
    pub fn from_env() -> (Self, Vec<String>) {
        let environment = match std::env::var(ENV_ENVIRONMENT).ok().as_deref() {
            Some("production") | Some("prod") => Environment::Production,
            _ => Environment::Development,
        };
        let mut config = Self::defaults_for(environment);
        let mut warnings = Vec::new();

        if let Ok(raw) = std::env::var(ENV_PORT) {
            match raw.trim().parse::<u16>() {
                Ok(port) => config.port = port,
                Err(_) => warnings.push(format!(
                    "{ENV_PORT}={raw:?} is not a valid port, using {}",
                    config.port
                )),
            }
        }
        if let Ok(path) = std::env::var(ENV_WS_PATH) {
            config.ws_path = path;
        }
        if let Ok(dir) = std::env::var(ENV_DATA_DIR) {
            config.data_dir = PathBuf::from(dir);
        }
        if let Ok(key) = std::env::var(ENV_MONITOR_AUTH_KEY) {
            if !key.is_empty() {
                config.monitor_auth_key = Some(key);
            }
        }

        let more = config.validate();
        warnings.extend(more);
        (config, warnings)
    }

    /// Coerce common mistakes in place and return one warning per fix.
    pub fn validate(&mut self) -> Vec<String> {
        let mut warnings = Vec::new();

        if !self.ws_path.starts_with('/') {
            let fixed = format!("/{}", self.ws_path);
            warnings.push(format!(
                "wsPath {:?} is missing a leading slash, using {:?}",
                self.ws_path, fixed
            ));
            self.ws_path = fixed;
        }
        if self.max_sessions == 0 {
            warnings.push(format!(
                "maxSessions must be positive, using {DEFAULT_MAX_SESSIONS}"
            ));
            self.max_sessions = DEFAULT_MAX_SESSIONS;
        }
        if self.buffer_cap == 0 {
            warnings.push(format!(
                "bufferCap must be positive, using {DEFAULT_BUFFER_CAP}"
            ));
            self.buffer_cap = DEFAULT_BUFFER_CAP;
        }
        if self.outbound_queue_limit == 0 {
            warnings.push(format!(
                "outbound queue limit must be positive, using {DEFAULT_OUTBOUND_QUEUE}"
            ));
            self.outbound_queue_limit = DEFAULT_OUTBOUND_QUEUE;
        }
        if self.session_idle_timeout_ms == Some(0) {
            warnings.push("sessionIdleTimeoutMs of 0 disables the idle reaper".to_string());
            self.session_idle_timeout_ms = None;
        }

        warnings
    }

    /// Accept loosely-typed caller input (e.g. a JSON config file where the
    /// port arrived as a string or maxSessions as a negative number).
    pub fn from_value(value: serde_json::Value) -> (Self, Vec<String>) {
        let mut warnings = Vec::new();
        let mut config = Self::default();

        if let serde_json::Value::Object(map) = value {
            for (key, raw) in map {
                match key.as_str() {
                    "port" => match coerce_u64(&raw) {
                        Some(port) if port > 0 && port <= u16::MAX as u64 => {
                            config.port = port as u16;
                            if raw.is_string() {
                                warnings.push(format!("port {raw} coerced to number"));
                            }
                        }
                        _ => warnings.push(format!("port {raw} is invalid, using {}", config.port)),
                    },
                    "wsPath" => {
                        if let Some(path) = raw.as_str() {
                            config.ws_path = path.to_string();
                        }
                    }
                    "dataDir" => {
                        if let Some(dir) = raw.as_str() {
                            config.data_dir = PathBuf::from(dir);
                        }
                    }
                    "enableSecurity" => config.enable_security = raw.as_bool().unwrap_or(true),
                    "enableRateLimit" => config.enable_rate_limit = raw.as_bool().unwrap_or(false),
                    "enablePipeline" => config.enable_pipeline = raw.as_bool().unwrap_or(true),
                    "maxSessions" => match raw.as_i64() {
                        Some(n) if n > 0 => config.max_sessions = n as usize,
                        Some(n) => {
                            warnings.push(format!(
                                "maxSessions {n} is not positive, using {DEFAULT_MAX_SESSIONS}"
                            ));
                            config.max_sessions = DEFAULT_MAX_SESSIONS;
                        }
                        None => match coerce_u64(&raw) {
                            Some(n) if n > 0 => config.max_sessions = n as usize,
                            _ => warnings.push(format!("maxSessions {raw} is invalid")),
                        },
                    },
                    "bufferCap" => {
                        if let Some(n) = coerce_u64(&raw) {
                            config.buffer_cap = n as usize;
                        }
                    }
                    "corsOrigin" => config.cors_origin = raw.as_str().map(str::to_string),
                    "sessionIdleTimeoutMs" => {
                        config.session_idle_timeout_ms = coerce_u64(&raw);
                    }
                    other => warnings.push(format!("unknown config key {other:?} ignored")),
                }
            }
        }

        let more = config.validate();
        warnings.extend(more);
        (config, warnings)
    }

    pub fn session_idle_timeout(&self) -> Option<Duration> {
        self.session_idle_timeout_ms.map(Duration::from_millis)
    }
}

fn coerce_u64(value: &serde_json::Value) -> Option<u64> {
    match value {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("shelltender")
        .join("sessions")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn string_port_is_coerced_with_warning() {
        let (config, warnings) = ServerConfig::from_value(json!({"port": "3000"}));
        assert_eq!(config.port, 3000);
        assert!(warnings.iter().any(|w| w.contains("coerced")));
    }

    #[test]
    fn ws_path_gets_leading_slash() {
        let (config, warnings) = ServerConfig::from_value(json!({"wsPath": "ws"}));
        assert_eq!(config.ws_path, "/ws");
        assert!(warnings.iter().any(|w| w.contains("leading slash")));
    }

    #[test]
    fn negative_max_sessions_falls_back_to_ten() {
        let (config, warnings) = ServerConfig::from_value(json!({"maxSessions": -5}));
        assert_eq!(config.max_sessions, 10);
        assert!(!warnings.is_empty());
    }

    #[test]
    fn production_defaults_enable_rate_limit_and_idle_timeout() {
        let config = ServerConfig::defaults_for(Environment::Production);
        assert!(config.enable_rate_limit);
        assert_eq!(config.session_idle_timeout_ms, Some(3_600_000));

        let dev = ServerConfig::defaults_for(Environment::Development);
        assert!(!dev.enable_rate_limit);
        assert_eq!(dev.session_idle_timeout_ms, None);
    }
}
