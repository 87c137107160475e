//! Agent configuration, loadable from a JSON file.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use rapport_types::{RapportError, Result};

/// Runtime settings for one agent. Every field has a default, so a config
/// file only needs the fields it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Id stamped on outbound messages and matched against inbound `to`.
    pub agent_id: String,
    /// Sender id prefixes to accept. Empty accepts everyone.
    pub allowlist: Vec<String>,
    pub control_token: String,
    /// Start in listening mode, waiting for the control token.
    pub start_listening: bool,
    /// How long periodic senders sleep while listening.
    pub idle_interval_ms: u64,
    /// Default period for periodic senders.
    pub send_interval_ms: u64,
    pub event_capacity: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_id: "agent".into(),
            allowlist: Vec::new(),
            control_token: "/travel".into(),
            start_listening: false,
            idle_interval_ms: 1_000,
            send_interval_ms: 3_000,
            event_capacity: 256,
        }
    }
}

impl AgentConfig {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            ..Self::default()
        }
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }

    pub fn send_interval(&self) -> Duration {
        Duration::from_millis(self.send_interval_ms)
    }

    pub fn check(&self) -> Result<()> {
        if self.agent_id.trim().is_empty() {
            return Err(RapportError::Validation("agent_id must not be empty".into()));
        }
        if self.control_token.is_empty() {
            return Err(RapportError::Validation(
                "control_token must not be empty".into(),
            ));
        }
        if self.idle_interval_ms == 0 || self.send_interval_ms == 0 {
            return Err(RapportError::Validation(
                "send and idle intervals must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: AgentConfig = serde_json::from_str(json)?;
        config.check()?;
        Ok(config)
    }

    /// Load and check a config file.
    pub async fn load(path: &Path) -> Result<Self> {
        let json = tokio::fs::read_to_string(path).await?;
        let config = Self::from_json(&json)?;
        tracing::debug!(path = %path.display(), agent = %config.agent_id, "config loaded");
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }
}
