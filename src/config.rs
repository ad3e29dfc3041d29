//! # Configuration Management
//!
//! This module handles loading and managing application configuration from
//! multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER_HOST, APP_TELEPHONY_ACCOUNT_ID, ...)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)
//!
//! ## Sections:
//! - **server**: bind address and the externally reachable base URL used in
//!   webhook markup responses
//! - **telephony**: provider credentials and REST API location
//! - **agent**: AI voice-agent WebSocket endpoint and audio format
//! - **bridge**: per-call timing, buffering, and recovery knobs
//! - **performance**: process-wide capacity limits

use crate::audio::AudioFormat;
use crate::call::session::{ExecutionMode, SessionConfig};
use crate::resilience::supervisor::RetryPolicy;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub telephony: TelephonyConfig,
    pub agent: AgentConfig,
    pub bridge: BridgeConfig,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
///
/// `external_url` is the public base URL the telephony provider can reach;
/// the incoming-call webhook derives the media-stream WebSocket URL from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub external_url: String,
}

/// Telephony control-API settings.
///
/// `account_id` and `secret` are validated for exact length and charset (and
/// sanitized of invisible characters) before any provider request is made -
/// see `telephony::client::TelephonyCredentials`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelephonyConfig {
    pub account_id: String,
    pub secret: String,
    pub api_base_url: String,
    /// Verify the HMAC signature on inbound call-control webhooks.
    pub validate_signatures: bool,
}

/// AI voice-agent connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// WebSocket endpoint of the conversational agent service.
    pub ws_url: String,
    /// Agent identifier sent in the session-initiation handshake.
    pub agent_id: String,
    /// Audio format spoken on the agent socket. The telephony leg is always
    /// 8kHz mu-law; the transcoder converts when this differs.
    pub audio_format: AudioFormat,
}

/// Per-call bridge behavior.
///
/// ## Tuning guidelines:
/// - `queue_expiration_ms`: stale buffered audio is worse than silence, so
///   this should stay in the low seconds.
/// - `recovery_budget_ms`: total wall-clock allowance across all reconnect
///   attempts for one call before the call is handed to a human conference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// How calls are routed: bridged to the AI agent or dialed straight
    /// into a plain conference.
    pub execution_mode: ExecutionMode,

    /// Application-level ping cadence on the agent socket.
    pub heartbeat_interval_ms: u64,
    /// Consecutive unanswered pings before the connection is forced down.
    pub heartbeat_miss_limit: u32,

    /// No inbound telephony audio for this long ends the call as abandoned.
    pub inactivity_timeout_ms: u64,
    /// Agent must report ready within this window or the call ends as a
    /// timeout failure.
    pub connect_timeout_ms: u64,

    /// Outbound buffer bounds while the agent connection is down.
    pub queue_max_depth: usize,
    pub queue_expiration_ms: u64,

    /// Reconnection policy for the agent socket.
    pub reconnect_max_attempts: u32,
    pub reconnect_initial_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub recovery_budget_ms: u64,

    /// Process-wide circuit breaker.
    pub breaker_threshold: u32,
    pub breaker_cooldown_ms: u64,

    /// Staleness sweep of the session registry.
    pub session_max_age_ms: u64,
    pub sweep_interval_ms: u64,
}

/// Performance tuning configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Maximum number of live calls to bridge simultaneously.
    pub max_concurrent_calls: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                external_url: "http://127.0.0.1:8080".to_string(),
            },
            telephony: TelephonyConfig {
                // Placeholder credentials; real values come from config.toml
                // or APP_TELEPHONY_* environment variables.
                account_id: format!("AC{}", "0".repeat(32)),
                secret: "0".repeat(32),
                api_base_url: "https://api.twilio.com/2010-04-01".to_string(),
                validate_signatures: false,
            },
            agent: AgentConfig {
                ws_url: "wss://agent.example.com/v1/convai/conversation".to_string(),
                agent_id: "default-agent".to_string(),
                audio_format: AudioFormat::Ulaw8000,
            },
            bridge: BridgeConfig {
                execution_mode: ExecutionMode::AiPowered,
                heartbeat_interval_ms: 5_000,
                heartbeat_miss_limit: 3,
                inactivity_timeout_ms: 30_000,
                connect_timeout_ms: 10_000,
                queue_max_depth: 100,
                queue_expiration_ms: 5_000,
                reconnect_max_attempts: 5,
                reconnect_initial_delay_ms: 500,
                reconnect_max_delay_ms: 8_000,
                recovery_budget_ms: 30_000,
                breaker_threshold: 5,
                breaker_cooldown_ms: 60_000,
                session_max_age_ms: 3_600_000,
                sweep_interval_ms: 60_000,
            },
            performance: PerformanceConfig {
                max_concurrent_calls: 50,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Handle special cases for HOST and PORT environment variables
    ///    (used by deployment platforms)
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// Catching configuration errors early prevents runtime failures mid-call
    /// and provides clear error messages about what's wrong.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.server.external_url.is_empty() {
            return Err(anyhow::anyhow!("External URL must be set"));
        }

        if self.performance.max_concurrent_calls == 0 {
            return Err(anyhow::anyhow!("Max concurrent calls must be greater than 0"));
        }

        if self.bridge.queue_max_depth == 0 {
            return Err(anyhow::anyhow!("Queue depth must be greater than 0"));
        }

        if self.bridge.heartbeat_miss_limit == 0 {
            return Err(anyhow::anyhow!("Heartbeat miss limit must be greater than 0"));
        }

        if self.bridge.reconnect_max_attempts == 0 {
            return Err(anyhow::anyhow!("Reconnect attempts must be greater than 0"));
        }

        if self.agent.ws_url.is_empty() {
            return Err(anyhow::anyhow!("Agent WebSocket URL must be set"));
        }

        Ok(())
    }

    /// Build the per-call session configuration from the bridge settings.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            agent_audio_format: self.agent.audio_format,
            mode: self.bridge.execution_mode,
            heartbeat_interval: Duration::from_millis(self.bridge.heartbeat_interval_ms),
            heartbeat_miss_limit: self.bridge.heartbeat_miss_limit,
            inactivity_timeout: Duration::from_millis(self.bridge.inactivity_timeout_ms),
            connect_timeout: Duration::from_millis(self.bridge.connect_timeout_ms),
            queue_max_depth: self.bridge.queue_max_depth,
            queue_expiration: Duration::from_millis(self.bridge.queue_expiration_ms),
            retry: RetryPolicy {
                max_attempts: self.bridge.reconnect_max_attempts,
                initial_delay: Duration::from_millis(self.bridge.reconnect_initial_delay_ms),
                max_delay: Duration::from_millis(self.bridge.reconnect_max_delay_ms),
                recovery_budget: Duration::from_millis(self.bridge.recovery_budget_ms),
            },
        }
    }

    /// Update configuration from a JSON string (used for runtime config
    /// updates through the API).
    ///
    /// ## Partial updates:
    /// Only the fields present in the JSON are changed. Credentials are
    /// deliberately not updatable at runtime; they require a restart.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = port as u16;
            }
            if let Some(url) = server.get("external_url").and_then(|v| v.as_str()) {
                self.server.external_url = url.to_string();
            }
        }

        if let Some(bridge) = partial_config.get("bridge") {
            if let Some(v) = bridge.get("heartbeat_interval_ms").and_then(|v| v.as_u64()) {
                self.bridge.heartbeat_interval_ms = v;
            }
            if let Some(v) = bridge.get("inactivity_timeout_ms").and_then(|v| v.as_u64()) {
                self.bridge.inactivity_timeout_ms = v;
            }
            if let Some(v) = bridge.get("connect_timeout_ms").and_then(|v| v.as_u64()) {
                self.bridge.connect_timeout_ms = v;
            }
            if let Some(v) = bridge.get("queue_max_depth").and_then(|v| v.as_u64()) {
                self.bridge.queue_max_depth = v as usize;
            }
            if let Some(v) = bridge.get("queue_expiration_ms").and_then(|v| v.as_u64()) {
                self.bridge.queue_expiration_ms = v;
            }
            if let Some(v) = bridge.get("recovery_budget_ms").and_then(|v| v.as_u64()) {
                self.bridge.recovery_budget_ms = v;
            }
        }

        if let Some(performance) = partial_config.get("performance") {
            if let Some(calls) = performance
                .get("max_concurrent_calls")
                .and_then(|v| v.as_u64())
            {
                self.performance.max_concurrent_calls = calls as usize;
            }
        }

        self.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The default configuration must be valid and carry the documented
    /// buffering defaults.
    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.bridge.queue_max_depth, 100);
        assert_eq!(config.bridge.queue_expiration_ms, 5_000);
        assert_eq!(config.bridge.heartbeat_miss_limit, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.bridge.queue_max_depth = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"bridge": {"queue_expiration_ms": 2500}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.bridge.queue_expiration_ms, 2500);
        // Other fields should remain unchanged
        assert_eq!(config.server.host, "127.0.0.1");
    }

    #[test]
    fn test_session_config_conversion() {
        let config = AppConfig::default();
        let session = config.session_config();
        assert_eq!(session.queue_max_depth, 100);
        assert_eq!(session.retry.recovery_budget, Duration::from_secs(30));
        assert_eq!(session.heartbeat_miss_limit, 3);
    }
}
