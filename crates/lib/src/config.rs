//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.handoff/config.json`) and environment.
//! Secrets (gateway token, webhook verification secret, messaging token) can be supplied
//! through env vars so they never need to live in the file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::credentials::{AgentCredentials, CredentialSource, DEFAULT_SURVEY_THRESHOLD_MINUTES};

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Gateway server settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Outbound delivery and webhook verification.
    #[serde(default)]
    pub messaging: MessagingConfig,

    /// NLU backend and where agent credentials come from.
    #[serde(default)]
    pub nlu: NluConfig,

    /// Inactivity survey sweep.
    #[serde(default)]
    pub survey: SurveyConfig,

    /// Conversation store persistence.
    #[serde(default)]
    pub store: StoreConfig,
}

/// Gateway bind, port, and auth settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for HTTP and WebSocket (default 8080).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,

    /// Auth for the live-agent endpoints. When absent, defaults to no auth for loopback bind.
    #[serde(default)]
    pub auth: GatewayAuthConfig,
}

/// Gateway auth: token or none (loopback-only when none).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayAuthConfig {
    /// "none" = no shared secret (only safe when bind is loopback). "token" = require a bearer token.
    #[serde(default)]
    pub mode: GatewayAuthMode,

    /// Shared secret for live-agent REST and WebSocket connect. Overridden by HANDOFF_GATEWAY_TOKEN env.
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayAuthMode {
    /// No auth; allow only when bind is loopback.
    #[default]
    None,

    /// Require the configured token.
    Token,
}

fn default_gateway_port() -> u16 {
    8080
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
            auth: GatewayAuthConfig::default(),
        }
    }
}

/// Business Messages delivery and webhook settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagingConfig {
    /// API base URL (default https://businessmessages.googleapis.com/v1).
    pub base_url: Option<String>,
    /// Bearer token for outbound calls. Overridden by HANDOFF_MESSAGING_TOKEN env.
    pub access_token: Option<String>,
    /// Secret for X-Goog-Signature verification. Overridden by HANDOFF_VERIFICATION_SECRET env.
    pub verification_secret: Option<String>,
    /// Client token expected on the one-time webhook verification request.
    pub client_token: Option<String>,
}

/// NLU backend settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NluConfig {
    /// API base URL (default https://dialogflow.googleapis.com/v2).
    pub base_url: Option<String>,
    /// Query language (default "en").
    pub language_code: Option<String>,
    /// "store" (default) reads per-agent credentials from the conversation store; "config" reads `agents`.
    #[serde(default)]
    pub credential_source: CredentialSource,
    /// Static per-agent credentials, keyed by agent id. Used when credentialSource is "config".
    #[serde(default)]
    pub agents: HashMap<String, AgentCredentials>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SurveyConfig {
    /// Seconds between sweeps (default 300). Keep at or below the smallest threshold.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Threshold for agents with none configured (default 15 minutes).
    #[serde(default = "default_threshold_minutes")]
    pub default_threshold_minutes: u64,
}

fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_threshold_minutes() -> u64 {
    DEFAULT_SURVEY_THRESHOLD_MINUTES
}

impl Default for SurveyConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
            default_threshold_minutes: default_threshold_minutes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreConfig {
    /// Snapshot file. Relative paths resolve against the config file's parent. Default: conversations.json next to the config.
    pub path: Option<PathBuf>,
    /// Seconds between snapshot flushes when something changed (default 5).
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
}

fn default_flush_interval_secs() -> u64 {
    5
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            flush_interval_secs: default_flush_interval_secs(),
        }
    }
}

fn env_or(var: &str, fallback: Option<&String>) -> Option<String> {
    std::env::var(var)
        .ok()
        .and_then(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .or_else(|| {
            fallback
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
}

/// Resolve the gateway token: env HANDOFF_GATEWAY_TOKEN overrides config.
pub fn resolve_gateway_token(config: &Config) -> Option<String> {
    env_or("HANDOFF_GATEWAY_TOKEN", config.gateway.auth.token.as_ref())
}

/// Resolve the webhook verification secret: env HANDOFF_VERIFICATION_SECRET overrides config.
pub fn resolve_verification_secret(config: &Config) -> Option<String> {
    env_or(
        "HANDOFF_VERIFICATION_SECRET",
        config.messaging.verification_secret.as_ref(),
    )
}

/// Resolve the outbound messaging token: env HANDOFF_MESSAGING_TOKEN overrides config.
pub fn resolve_messaging_token(config: &Config) -> Option<String> {
    env_or("HANDOFF_MESSAGING_TOKEN", config.messaging.access_token.as_ref())
}

/// True if the bind address is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("HANDOFF_CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|h| h.join(".handoff").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    })
}

fn config_parent(config_path: &Path) -> &Path {
    config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Resolve the store snapshot path: `store.path` if set (relative to the config file's parent),
/// otherwise `conversations.json` next to the config file.
pub fn resolve_store_path(config: &Config, config_path: &Path) -> PathBuf {
    let parent = config_parent(config_path);
    match &config.store.path {
        Some(p) if !p.as_os_str().is_empty() => {
            if p.is_absolute() {
                p.clone()
            } else {
                parent.join(p)
            }
        }
        _ => parent.join("conversations.json"),
    }
}

/// Load config from the default path (or HANDOFF_CONFIG_PATH). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}
