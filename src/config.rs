use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, error};

use crate::ws::lifecycle::SessionPolicy;

/// Application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Environment (dev, staging, prod)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// CORS allowed origins, comma separated
    pub cors_origins: Option<String>,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Database URL. Without it sessions are only kept in memory.
    pub db_url: Option<String>,

    /// HS256 secret used to verify client credentials
    pub auth_jwt_secret: Option<String>,

    /// Reject websocket upgrades whose credential does not verify
    #[serde(default)]
    pub auth_required: bool,

    // Session lifetime policy
    #[serde(default = "default_session_duration_minutes")]
    pub session_duration_minutes: u64,
    #[serde(default = "default_session_extension_minutes")]
    pub session_extension_minutes: u64,
    #[serde(default = "default_session_max_extensions")]
    pub session_max_extensions: u32,
    #[serde(default = "default_session_warning_lead_minutes")]
    pub session_warning_lead_minutes: u64,
    #[serde(default = "default_session_idle_timeout_minutes")]
    pub session_idle_timeout_minutes: u64,

    /// Coalescing window for document write-through
    #[serde(default = "default_code_save_debounce_ms")]
    pub code_save_debounce_ms: u64,

    /// How long an unreachable video peer stays suppressed
    #[serde(default = "default_stale_peer_ttl_secs")]
    pub stale_peer_ttl_secs: u64,
}

impl Config {
    /// Load configuration from environment variables or app.env file
    pub fn load() -> Result<Self, ConfigError> {
        // Try to load from app.env file first
        if std::path::Path::new("app.env").exists() {
            dotenvy::from_filename("app.env").ok();
        } else {
            // Fallback to .env file
            dotenvy::dotenv().ok();
        }

        match envy::from_env::<Config>() {
            Ok(config) => {
                info!("✅ Configuration loaded successfully");
                Ok(config)
            }
            Err(e) => {
                error!("❌ Failed to load configuration: {}", e);
                Err(ConfigError::EnvError(e))
            }
        }
    }

    /// Get the full server address
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if running in development mode
    pub fn is_development(&self) -> bool {
        self.environment.to_lowercase() == "dev" || self.environment.to_lowercase() == "development"
    }

    /// Lifetime policy applied to every session
    pub fn session_policy(&self) -> SessionPolicy {
        SessionPolicy {
            duration: Duration::from_secs(self.session_duration_minutes * 60),
            extension: Duration::from_secs(self.session_extension_minutes * 60),
            max_extensions: self.session_max_extensions,
            warning_lead: Duration::from_secs(self.session_warning_lead_minutes * 60),
            idle_timeout: Duration::from_secs(self.session_idle_timeout_minutes * 60),
            save_debounce: Duration::from_millis(self.code_save_debounce_ms),
            stale_peer_ttl: Duration::from_secs(self.stale_peer_ttl_secs),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            environment: default_environment(),
            log_level: default_log_level(),
            cors_origins: None,
            db_url: None,
            auth_jwt_secret: None,
            auth_required: false,
            session_duration_minutes: default_session_duration_minutes(),
            session_extension_minutes: default_session_extension_minutes(),
            session_max_extensions: default_session_max_extensions(),
            session_warning_lead_minutes: default_session_warning_lead_minutes(),
            session_idle_timeout_minutes: default_session_idle_timeout_minutes(),
            code_save_debounce_ms: default_code_save_debounce_ms(),
            stale_peer_ttl_secs: default_stale_peer_ttl_secs(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Environment variable error: {0}")]
    EnvError(#[from] envy::Error),
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_session_duration_minutes() -> u64 {
    30
}

fn default_session_extension_minutes() -> u64 {
    15
}

fn default_session_max_extensions() -> u32 {
    2
}

fn default_session_warning_lead_minutes() -> u64 {
    5
}

fn default_session_idle_timeout_minutes() -> u64 {
    10
}

fn default_code_save_debounce_ms() -> u64 {
    2_000
}

fn default_stale_peer_ttl_secs() -> u64 {
    300
}
