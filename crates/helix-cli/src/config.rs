//! Configuration file support
//!
//! Loads configuration from ~/.helix/approvals.toml

use anyhow::{Context, Result, bail};
use helix_gateway::{BackoffConfig, HandshakeConfig, SessionConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::paths;

/// Environment variable consulted for the gateway token.
pub const GATEWAY_TOKEN_ENV: &str = "HELIX_GATEWAY_TOKEN";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    #[serde(default)]
    pub policy: PolicySection,
}

/// Gateway connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySection {
    pub url: String,
    /// Shared token; `HELIX_GATEWAY_TOKEN` wins when set
    pub token: Option<String>,
    pub client_id: String,
    /// Reported client version; defaults to the gateway crate version
    pub client_version: Option<String>,
    pub role: String,
    pub scopes: Vec<String>,
    pub challenge_grace_ms: u64,
    pub request_timeout_ms: Option<u64>,
}

impl Default for GatewaySection {
    fn default() -> Self {
        let handshake = HandshakeConfig::default();
        let session = SessionConfig::default();
        Self {
            url: session.url,
            token: None,
            client_id: handshake.client_id,
            client_version: None,
            role: handshake.role,
            scopes: handshake.scopes,
            challenge_grace_ms: session.challenge_grace.as_millis() as u64,
            request_timeout_ms: None,
        }
    }
}

/// Reconnect backoff settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSection {
    pub floor_ms: u64,
    pub factor: f64,
    pub ceiling_ms: u64,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        let backoff = BackoffConfig::default();
        Self {
            floor_ms: backoff.floor_ms,
            factor: backoff.factor,
            ceiling_ms: backoff.ceiling_ms,
        }
    }
}

/// Policy document settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySection {
    /// Policy document path; defaults to ~/.helix/exec-approvals.json
    pub path: Option<PathBuf>,
    /// Resolve allow/deny matches without asking a human
    pub auto_resolve: bool,
}

impl Default for PolicySection {
    fn default() -> Self {
        Self {
            path: None,
            auto_resolve: true,
        }
    }
}

impl AppConfig {
    /// Load configuration.
    ///
    /// An explicit path must exist. The default path falls back to defaults
    /// when the file is missing.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => {
                if !path.exists() {
                    bail!("Config file not found: {}", path.display());
                }
                Self::load_from_path(path)
            }
            None => {
                let path = paths::config_path()?;
                if !path.exists() {
                    return Ok(Self::default());
                }
                Self::load_from_path(&path)
            }
        }
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Resolved policy document path
    pub fn policy_path(&self) -> Result<PathBuf> {
        match &self.policy.path {
            Some(path) => Ok(path.clone()),
            None => paths::policy_path(),
        }
    }

    /// Gateway token: environment first, then the config file.
    pub fn gateway_token(&self) -> Option<String> {
        std::env::var(GATEWAY_TOKEN_ENV)
            .ok()
            .filter(|token| !token.trim().is_empty())
            .or_else(|| self.gateway.token.clone())
    }

    pub fn session_config(&self) -> SessionConfig {
        let defaults = HandshakeConfig::default();
        let handshake = HandshakeConfig {
            client_id: self.gateway.client_id.clone(),
            client_version: self
                .gateway
                .client_version
                .clone()
                .unwrap_or(defaults.client_version.clone()),
            role: self.gateway.role.clone(),
            scopes: self.gateway.scopes.clone(),
            token: self.gateway_token(),
            ..defaults
        };

        SessionConfig {
            url: self.gateway.url.clone(),
            handshake,
            backoff: BackoffConfig {
                floor_ms: self.reconnect.floor_ms,
                factor: self.reconnect.factor,
                ceiling_ms: self.reconnect.ceiling_ms,
            },
            challenge_grace: Duration::from_millis(self.gateway.challenge_grace_ms),
            request_timeout: self.gateway.request_timeout_ms.map(Duration::from_millis),
            ..SessionConfig::default()
        }
    }
}
