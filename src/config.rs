//! # Configuration Management
//!
//! Loads the relay configuration from several sources, lowest priority first:
//! - Built-in defaults (the `Default` impl below)
//! - An optional `config.toml` in the working directory
//! - Environment variables with the `APP_` prefix (`__` separates sections,
//!   e.g. `APP_PLAYBACK__LEAD_TIME_SECS=0.25`)
//! - The well-known deployment variables (`HOST`, `PORT`, `PYTHON_CMD`,
//!   `AWS_REGION`, `COGNITO_USER_POOL_ID`, ...) that the container platform sets
//!
//! ## Sections:
//! - **server**: bind address
//! - **auth**: identity provider coordinates used for token verification and
//!   credential exchange
//! - **voice**: how the voice subprocess is launched and what it is told
//! - **chat**: the text-generation service behind the text chat
//! - **playback**: jitter-buffer tuning shared with clients
//! - **performance**: connection limits

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub voice: VoiceConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    pub playback: PlaybackConfig,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (containers)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Identity provider settings.
///
/// The user pool signs the bearer tokens clients present; the identity pool
/// turns those tokens into short-lived cloud credentials for the voice process.
/// `jwks_url`, `issuer` and `identity_endpoint` are derived from `region` and
/// the pool ids unless set explicitly (useful for local mocks).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub region: String,
    pub user_pool_id: String,
    pub client_id: String,
    pub identity_pool_id: String,
    pub jwks_url: Option<String>,
    pub issuer: Option<String>,
    pub identity_endpoint: Option<String>,
}

/// Voice subprocess launch settings.
///
/// ## Fields:
/// - `command`: interpreter tried first (`python3`)
/// - `fallback_command`: interpreter tried once if `command` is not found
/// - `args`: arguments passed to either interpreter (the script path)
/// - `callback_url`: endpoint the subprocess reports results to
/// - `db_credentials` / `proxy_endpoint`: secrets forwarded unchanged
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceConfig {
    pub command: String,
    pub fallback_command: String,
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    pub callback_url: String,
    pub db_credentials: String,
    pub proxy_endpoint: String,
}

/// Text chat settings.
///
/// `text_generation_endpoint` is the base URL of the service that streams
/// chat replies; the chat is unavailable while it is empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatConfig {
    pub text_generation_endpoint: String,
}

/// Jitter-buffer constants.
///
/// `lead_time_secs` is the fixed lookahead added whenever the schedule is
/// (re)anchored; `max_queue_secs` is the most scheduling slack tolerated
/// before the schedule is pulled back to `now + lead_time_secs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    pub lead_time_secs: f64,
    pub max_queue_secs: f64,
    pub sample_rate: u32,
}

/// Performance tuning configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Maximum number of simultaneously open WebSocket connections
    pub max_concurrent_sessions: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 80,
            },
            auth: AuthConfig {
                region: "us-east-1".to_string(),
                user_pool_id: String::new(),
                client_id: String::new(),
                identity_pool_id: String::new(),
                jwks_url: None,
                issuer: None,
                identity_endpoint: None,
            },
            voice: VoiceConfig {
                command: "python3".to_string(),
                fallback_command: "python".to_string(),
                args: vec!["nova_sonic.py".to_string()],
                working_dir: None,
                callback_url: String::new(),
                db_credentials: String::new(),
                proxy_endpoint: String::new(),
            },
            chat: ChatConfig::default(),
            playback: PlaybackConfig::default(),
            performance: PerformanceConfig {
                max_concurrent_sessions: 100,
            },
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            lead_time_secs: 0.2,
            max_queue_secs: 0.5,
            sample_rate: 24_000,
        }
    }
}

impl AuthConfig {
    /// Issuer the user pool stamps into its tokens.
    pub fn issuer(&self) -> String {
        self.issuer.clone().unwrap_or_else(|| {
            format!(
                "https://cognito-idp.{}.amazonaws.com/{}",
                self.region, self.user_pool_id
            )
        })
    }

    /// Where the user pool publishes its signing keys.
    pub fn jwks_url(&self) -> String {
        self.jwks_url
            .clone()
            .unwrap_or_else(|| format!("{}/.well-known/jwks.json", self.issuer()))
    }

    /// Identity-pool service endpoint.
    pub fn identity_endpoint(&self) -> String {
        self.identity_endpoint
            .clone()
            .unwrap_or_else(|| format!("https://cognito-identity.{}.amazonaws.com/", self.region))
    }

    /// Login-map key naming the user pool as identity provider.
    pub fn login_provider(&self) -> String {
        format!(
            "cognito-idp.{}.amazonaws.com/{}",
            self.region, self.user_pool_id
        )
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Override with the plain deployment variables the container sets
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        // Deployment platforms set these without any prefix
        let overrides = [
            ("HOST", "server.host"),
            ("PORT", "server.port"),
            ("PYTHON_CMD", "voice.command"),
            ("AWS_REGION", "auth.region"),
            ("COGNITO_USER_POOL_ID", "auth.user_pool_id"),
            ("COGNITO_CLIENT_ID", "auth.client_id"),
            ("IDENTITY_POOL_ID", "auth.identity_pool_id"),
            ("APPSYNC_GRAPHQL_URL", "voice.callback_url"),
            ("SM_DB_CREDENTIALS", "voice.db_credentials"),
            ("RDS_PROXY_ENDPOINT", "voice.proxy_endpoint"),
            ("TEXT_GENERATION_ENDPOINT", "chat.text_generation_endpoint"),
        ];
        for (var, key) in overrides {
            if let Ok(value) = env::var(var) {
                settings = settings.set_override(key, value)?;
            }
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - At least one concurrent session is allowed
    /// - A launch command is configured
    /// - The jitter-buffer window is well formed (positive lead time that fits
    ///   inside the maximum queue depth)
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.voice.command.trim().is_empty() {
            return Err(anyhow::anyhow!("Voice command cannot be empty"));
        }

        if self.playback.lead_time_secs <= 0.0 {
            return Err(anyhow::anyhow!("Playback lead time must be positive"));
        }

        if self.playback.max_queue_secs < self.playback.lead_time_secs {
            return Err(anyhow::anyhow!(
                "Playback max queue ({}s) must not be shorter than the lead time ({}s)",
                self.playback.max_queue_secs,
                self.playback.lead_time_secs
            ));
        }

        if self.playback.sample_rate == 0 {
            return Err(anyhow::anyhow!("Playback sample rate must be greater than 0"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 80);
        assert_eq!(config.voice.command, "python3");
        assert_eq!(config.voice.fallback_command, "python");
        assert_eq!(config.playback.lead_time_secs, 0.2);
        assert_eq!(config.playback.max_queue_secs, 0.5);
        // Chat is optional; an empty endpoint only fails text generation
        assert!(config.chat.text_generation_endpoint.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.playback.max_queue_secs = 0.1;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.voice.command = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_derived_auth_endpoints() {
        let mut config = AppConfig::default();
        config.auth.region = "ca-central-1".to_string();
        config.auth.user_pool_id = "ca-central-1_abc".to_string();

        assert_eq!(
            config.auth.issuer(),
            "https://cognito-idp.ca-central-1.amazonaws.com/ca-central-1_abc"
        );
        assert_eq!(
            config.auth.jwks_url(),
            "https://cognito-idp.ca-central-1.amazonaws.com/ca-central-1_abc/.well-known/jwks.json"
        );
        assert_eq!(
            config.auth.login_provider(),
            "cognito-idp.ca-central-1.amazonaws.com/ca-central-1_abc"
        );

        config.auth.jwks_url = Some("http://localhost:9999/keys".to_string());
        assert_eq!(config.auth.jwks_url(), "http://localhost:9999/keys");
    }
}
