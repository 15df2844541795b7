//! Configuration for the broker and the agent runtime

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;

/// Broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Identifier agents use as the token audience
    pub broker_id: String,

    /// Directory holding one public key PEM per issuer
    pub public_keys_dir: PathBuf,

    /// Seconds between agent heartbeats; an agent is online while its last
    /// heartbeat is younger than twice this
    pub heartbeat_interval: u64,

    /// Timeout for POSTs to recipient callbacks, in seconds
    pub callback_timeout: u64,

    /// Reject tokens whose `aud` is not `broker_id`
    pub enforce_audience: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            broker_id: "mcp-server".to_string(),
            public_keys_dir: PathBuf::from("keys/public"),
            heartbeat_interval: 30,
            callback_timeout: 10,
            enforce_audience: true,
        }
    }
}

impl BrokerConfig {
    /// Build from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(v) = std::env::var("BROKER_ID") {
            config.broker_id = v;
        }
        if let Ok(v) = std::env::var("PUBLIC_KEYS_DIR") {
            config.public_keys_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("HEARTBEAT_INTERVAL") {
            if let Ok(secs) = v.parse() {
                config.heartbeat_interval = secs;
            }
        }
        config
    }

    /// Load configuration from a file
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Self> {
        from_config_file(path)
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.broker_id.is_empty() {
            return Err(anyhow::anyhow!("broker_id cannot be empty"));
        }
        if self.heartbeat_interval == 0 {
            return Err(anyhow::anyhow!("heartbeat_interval must be greater than 0"));
        }
        Ok(())
    }
}

/// Agent runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRuntimeConfig {
    /// Logical role name; also the token issuer
    pub logical_name: String,

    /// Broker base URL
    pub broker_url: String,

    /// This agent's own inbox URL, advertised at registration
    pub callback_url: String,

    /// Capabilities advertised at registration (`role`, `tool`, ...)
    #[serde(default)]
    pub capabilities: HashMap<String, Value>,

    /// Fixed identity override; the broker mints an id when absent
    #[serde(default)]
    pub fixed_agent_id: Option<String>,

    /// Service looked up in discovery when orchestrating a query
    pub target_service: String,

    /// Base URL of the external query endpoint
    pub tool_url: String,

    /// PEM file with this agent's private signing key
    pub private_key_path: PathBuf,

    /// Directory holding peer public keys, for inbox verification
    pub public_keys_dir: PathBuf,

    /// Audience claim stamped into outgoing tokens
    pub broker_id: String,

    /// Seconds between heartbeats
    pub heartbeat_interval: u64,

    /// Milliseconds before the first retransmission of an unacknowledged
    /// envelope; doubles each attempt
    pub base_ack_timeout_ms: u64,

    /// Maximum transmissions per envelope
    pub max_ack_attempts: u32,

    /// Seconds a client-facing query waits for the correlated reply
    pub reply_timeout_secs: u64,

    /// Registration attempts before giving up (backoff doubles from 1 s)
    pub register_attempts: u32,

    /// Seconds to wait before the first registration attempt
    pub register_grace_secs: u64,

    /// Timeout for POSTs to `/agent/send`, in seconds
    pub send_timeout_secs: u64,
}

impl Default for AgentRuntimeConfig {
    fn default() -> Self {
        Self {
            logical_name: "llm_agent".to_string(),
            broker_url: "http://mcp-server:8000".to_string(),
            callback_url: "http://llm-agent:8003/inbox".to_string(),
            capabilities: HashMap::new(),
            fixed_agent_id: None,
            target_service: "sales".to_string(),
            tool_url: "http://mcp-server:8000".to_string(),
            private_key_path: PathBuf::from("keys/private.pem"),
            public_keys_dir: PathBuf::from("keys/public"),
            broker_id: "mcp-server".to_string(),
            heartbeat_interval: 30,
            base_ack_timeout_ms: 5_000,
            max_ack_attempts: 3,
            reply_timeout_secs: 30,
            register_attempts: 5,
            register_grace_secs: 5,
            send_timeout_secs: 20,
        }
    }
}

impl AgentRuntimeConfig {
    /// Build from environment variables for the given logical name.
    ///
    /// The fixed-identity override is read from `<NAME>_ID` with the logical
    /// name uppercased (`llm_agent` → `LLM_AGENT_ID`).
    pub fn from_env(logical_name: &str) -> Self {
        let mut config = Self {
            logical_name: logical_name.to_string(),
            ..Self::default()
        };
        if let Ok(v) = std::env::var("MCP_URL") {
            config.broker_url = v.clone();
            config.tool_url = v;
        }
        if let Ok(v) = std::env::var("CALLBACK_URL") {
            config.callback_url = v;
        }
        if let Ok(v) = std::env::var(format!("{}_ID", logical_name.to_uppercase())) {
            config.fixed_agent_id = Some(v);
        }
        if let Ok(v) = std::env::var("HEARTBEAT_INTERVAL") {
            if let Ok(secs) = v.parse() {
                config.heartbeat_interval = secs;
            }
        }
        if let Ok(v) = std::env::var("PRIVATE_KEY_PATH") {
            config.private_key_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("PUBLIC_KEYS_DIR") {
            config.public_keys_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("BROKER_ID") {
            config.broker_id = v;
        }
        config
    }

    /// Load configuration from a file
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Self> {
        from_config_file(path)
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.logical_name.is_empty() {
            return Err(anyhow::anyhow!("logical_name cannot be empty"));
        }
        if !self.broker_url.starts_with("http") {
            return Err(anyhow::anyhow!("Invalid broker URL: {}", self.broker_url));
        }
        if !self.callback_url.starts_with("http") {
            return Err(anyhow::anyhow!(
                "Invalid callback URL: {}",
                self.callback_url
            ));
        }
        if self.max_ack_attempts == 0 {
            return Err(anyhow::anyhow!("max_ack_attempts must be greater than 0"));
        }
        if self.heartbeat_interval == 0 {
            return Err(anyhow::anyhow!("heartbeat_interval must be greater than 0"));
        }
        Ok(())
    }
}

fn from_config_file<T, P>(path: P) -> anyhow::Result<T>
where
    T: serde::de::DeserializeOwned,
    P: AsRef<std::path::Path>,
{
    let content = std::fs::read_to_string(&path)?;
    let config = match path.as_ref().extension().and_then(|s| s.to_str()) {
        Some("json") => serde_json::from_str(&content)?,
        Some("toml") => toml::from_str(&content)?,
        Some("yaml") | Some("yml") => serde_yml::from_str(&content)?,
        _ => return Err(anyhow::anyhow!("Unsupported config file format")),
    };
    Ok(config)
}
