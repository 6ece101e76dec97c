//! Bridge Configuration
//!
//! Configuration loaded from environment variables. Credentials are
//! required; everything else has defaults. The worker treats credential and
//! endpoint configuration as environment; any absence is fatal at startup.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Trading mode selecting the upstream account context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradingMode {
    /// Simulation account (default).
    #[default]
    Simulation,
    /// Live account (real money).
    Live,
}

impl TradingMode {
    /// Parse mode from string, defaulting to simulation.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "live" => Self::Live,
            _ => Self::Simulation,
        }
    }

    /// Check if this is the live mode.
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Live)
    }

    /// Whether commands in this mode carry `simulation = true`.
    #[must_use]
    pub const fn is_simulation(self) -> bool {
        !self.is_live()
    }

    /// Get the mode name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Simulation => "simulation",
            Self::Live => "live",
        }
    }
}

/// Upstream API credentials.
#[derive(Clone)]
pub struct Credentials {
    api_key: String,
    secret_key: String,
}

impl Credentials {
    /// Create new credentials.
    #[must_use]
    pub const fn new(api_key: String, secret_key: String) -> Self {
        Self {
            api_key,
            secret_key,
        }
    }

    /// Get the API key.
    #[must_use]
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Get the secret key.
    #[must_use]
    pub fn secret_key(&self) -> &str {
        &self.secret_key
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"[REDACTED]")
            .field("secret_key", &"[REDACTED]")
            .finish()
    }
}

/// HTTP server settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Port the facade and streaming socket listen on.
    pub http_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { http_port: 8080 }
    }
}

/// Correlation bus settings.
#[derive(Debug, Clone)]
pub struct BusSettings {
    /// Work queue depth; submissions beyond it are rejected.
    pub queue_depth: usize,
    /// How long a completed reply stays readable.
    pub response_ttl: Duration,
    /// How long the facade waits for a correlated reply.
    pub await_timeout: Duration,
    /// Quote broadcast channel capacity.
    pub quote_capacity: usize,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            queue_depth: 256,
            response_ttl: Duration::from_secs(30),
            await_timeout: Duration::from_secs(10),
            quote_capacity: 4096,
        }
    }
}

/// Session lifecycle settings.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Backoff multiplier.
    pub reconnect_delay_multiplier: f64,
    /// Bounded login attempts per incident before entering degraded state.
    pub max_login_attempts: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            reconnect_delay_initial: Duration::from_millis(500),
            reconnect_delay_max: Duration::from_secs(60),
            reconnect_delay_multiplier: 2.0,
            max_login_attempts: 10,
        }
    }
}

/// Streaming hub settings.
#[derive(Debug, Clone)]
pub struct HubSettings {
    /// Close a socket when no frame arrives for this long.
    pub idle_timeout: Duration,
    /// How long the hub waits for worker replies to subscription commands.
    pub command_timeout: Duration,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            command_timeout: Duration::from_secs(5),
        }
    }
}

/// Complete bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Trading mode.
    pub mode: TradingMode,
    /// Upstream credentials.
    pub credentials: Credentials,
    /// Shared secret expected in `X-Auth-Key`.
    pub auth_key: String,
    /// HTTP server settings.
    pub server: ServerSettings,
    /// Bus settings.
    pub bus: BusSettings,
    /// Session settings.
    pub session: SessionSettings,
    /// Streaming hub settings.
    pub hub: HubSettings,
    /// Futures product families served from the catalog.
    pub supported_futures: Vec<String>,
    /// Options product families served from the catalog.
    pub supported_options: Vec<String>,
}

impl BridgeConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required credentials are missing or empty.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("TRADING_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("TRADING_API_KEY".to_string()))?;
        let secret_key = std::env::var("TRADING_SECRET_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("TRADING_SECRET_KEY".to_string()))?;

        if api_key.is_empty() {
            return Err(ConfigError::EmptyValue("TRADING_API_KEY".to_string()));
        }
        if secret_key.is_empty() {
            return Err(ConfigError::EmptyValue("TRADING_SECRET_KEY".to_string()));
        }

        let mode = std::env::var("TRADING_MODE")
            .map(|s| TradingMode::from_str_case_insensitive(&s))
            .unwrap_or_default();

        let auth_key = std::env::var("AUTH_KEY").unwrap_or_else(|_| "changeme".to_string());

        let server = ServerSettings {
            http_port: parse_env_u16("BRIDGE_HTTP_PORT", ServerSettings::default().http_port),
        };

        let bus = BusSettings {
            queue_depth: parse_env_usize("BRIDGE_QUEUE_DEPTH", BusSettings::default().queue_depth),
            response_ttl: parse_env_duration_secs(
                "BRIDGE_RESPONSE_TTL_SECS",
                BusSettings::default().response_ttl,
            ),
            await_timeout: parse_env_duration_secs(
                "BRIDGE_AWAIT_TIMEOUT_SECS",
                BusSettings::default().await_timeout,
            ),
            quote_capacity: parse_env_usize(
                "BRIDGE_QUOTE_CAPACITY",
                BusSettings::default().quote_capacity,
            ),
        };

        let session = SessionSettings {
            reconnect_delay_initial: parse_env_duration_millis(
                "BRIDGE_RECONNECT_DELAY_INITIAL_MS",
                SessionSettings::default().reconnect_delay_initial,
            ),
            reconnect_delay_max: parse_env_duration_secs(
                "BRIDGE_RECONNECT_DELAY_MAX_SECS",
                SessionSettings::default().reconnect_delay_max,
            ),
            reconnect_delay_multiplier: parse_env_f64(
                "BRIDGE_RECONNECT_DELAY_MULTIPLIER",
                SessionSettings::default().reconnect_delay_multiplier,
            ),
            max_login_attempts: parse_env_u32(
                "BRIDGE_MAX_LOGIN_ATTEMPTS",
                SessionSettings::default().max_login_attempts,
            ),
        };

        let hub = HubSettings {
            idle_timeout: parse_env_duration_secs(
                "BRIDGE_WS_IDLE_TIMEOUT_SECS",
                HubSettings::default().idle_timeout,
            ),
            command_timeout: parse_env_duration_secs(
                "BRIDGE_WS_COMMAND_TIMEOUT_SECS",
                HubSettings::default().command_timeout,
            ),
        };

        let supported_futures = parse_env_list("SUPPORTED_FUTURES", &["TXF", "MXF", "TMF"]);
        let supported_options = parse_env_list("SUPPORTED_OPTIONS", &["TXO"]);

        Ok(Self {
            mode,
            credentials: Credentials::new(api_key, secret_key),
            auth_key,
            server,
            bus,
            session,
            hub,
            supported_futures,
            supported_options,
        })
    }

    /// All product families the catalog should retain.
    #[must_use]
    pub fn supported_families(&self) -> Vec<String> {
        let mut families = self.supported_futures.clone();
        families.extend(self.supported_options.iter().cloned());
        families
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
}

fn parse_env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_duration_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_env_duration_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}

fn parse_env_list(key: &str, default: &[&str]) -> Vec<String> {
    std::env::var(key).map_or_else(
        |_| default.iter().map(ToString::to_string).collect(),
        |v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
                .collect()
        },
    )
}
