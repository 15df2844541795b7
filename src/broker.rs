//! Central broker: agent registry, capability discovery, liveness tracking,
//! and store-and-forward envelope routing
//!
//! The broker owns a single in-memory registry behind a [`tokio::sync::RwLock`].
//! Routing is fire-and-forget: the broker verifies the token, forwards it
//! unchanged to the recipient's callback, and reports failures to the sender;
//! delivery guarantees belong to the agent-layer ACK protocol.

use crate::config::BrokerConfig;
use crate::error::{FabricError, Result};
use crate::protocol::{fresh_id, AgentInfo, MessageType, CAPABILITY_ROLE, CAPABILITY_TOOL};
use crate::signature::TokenVerifier;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};
use utoipa::ToSchema;

/// Registry entry: the advertised info plus broker-tracked liveness
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub info: AgentInfo,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// Discovery result entry
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DiscoveredAgent {
    pub name: String,
    #[schema(value_type = Object)]
    pub capabilities: HashMap<String, Value>,
    pub callback_url: String,
    pub online: bool,
}

/// Full agent card, including liveness timestamps
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AgentCard {
    pub name: String,
    #[schema(value_type = Object)]
    pub capabilities: HashMap<String, Value>,
    pub callback_url: String,
    pub online: bool,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
}

/// Liveness-only summary entry
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AgentLiveness {
    pub name: String,
    pub online: bool,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// What the router did with a verified envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Forwarded to the recipient's callback
    Sent,
    /// Self-addressed heartbeat, absorbed as a liveness update
    HeartbeatAbsorbed,
}

/// An agent is online while its last heartbeat is younger than twice the
/// heartbeat interval. Offline is computed, never stored.
pub fn is_online(
    last_heartbeat: Option<DateTime<Utc>>,
    heartbeat_interval: u64,
    now: DateTime<Utc>,
) -> bool {
    match last_heartbeat {
        Some(seen) => {
            now.signed_duration_since(seen)
                < chrono::Duration::seconds(2 * heartbeat_interval as i64)
        }
        None => false,
    }
}

/// The central registry, discovery index, liveness tracker, and router
pub struct Broker {
    config: BrokerConfig,
    verifier: TokenVerifier,
    http: reqwest::Client,
    registry: RwLock<HashMap<String, AgentRecord>>,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Result<Self> {
        let audience = config.enforce_audience.then(|| config.broker_id.clone());
        let verifier = TokenVerifier::new(&config.public_keys_dir, audience.as_deref());
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.callback_timeout))
            .build()?;
        Ok(Self {
            config,
            verifier,
            http,
            registry: RwLock::new(HashMap::new()),
        })
    }

    /// Register an agent, honoring a caller-supplied id or minting a fresh
    /// one. Re-registration with the same id replaces the record.
    pub async fn register(&self, mut info: AgentInfo) -> Result<String> {
        if info.name.is_empty() {
            return Err(FabricError::Validation("agent name cannot be empty".to_string()));
        }
        if !info.callback_url.starts_with("http") {
            return Err(FabricError::Validation(format!(
                "invalid callback_url: {}",
                info.callback_url
            )));
        }

        let agent_id = info.agent_id.clone().unwrap_or_else(fresh_id);
        info.agent_id = Some(agent_id.clone());

        let record = AgentRecord {
            info,
            registered_at: Utc::now(),
            last_heartbeat: None,
        };
        let mut registry = self.registry.write().await;
        let replaced = registry.insert(agent_id.clone(), record).is_some();
        info!(agent_id = %agent_id, replaced, "agent registered");
        Ok(agent_id)
    }

    /// Process a signed heartbeat: verify, check the envelope type, and stamp
    /// the sender's liveness. Unknown senders are rejected.
    pub async fn heartbeat(&self, token: &str) -> Result<String> {
        let envelope = self.verifier.verify(token)?;
        if envelope.kind != MessageType::Heartbeat {
            return Err(FabricError::Validation(format!(
                "expected heartbeat envelope, got '{}'",
                envelope.kind
            )));
        }
        if !self.mark_heartbeat(&envelope.sender).await {
            return Err(FabricError::UnknownAgent(envelope.sender));
        }
        Ok(envelope.sender)
    }

    /// Verify a token and forward it, unchanged, to the recipient's callback.
    ///
    /// Self-addressed heartbeats short-circuit into a liveness update and are
    /// never forwarded. Pass-through forwarding preserves end-to-end
    /// authenticity: the recipient verifies the original sender's signature,
    /// not the broker's.
    pub async fn route(&self, token: &str) -> Result<RouteOutcome> {
        let envelope = self.verifier.verify(token)?;

        if envelope.kind == MessageType::Heartbeat && envelope.sender == envelope.recipient {
            if !self.mark_heartbeat(&envelope.sender).await {
                return Err(FabricError::UnknownAgent(envelope.sender));
            }
            return Ok(RouteOutcome::HeartbeatAbsorbed);
        }

        let callback_url = {
            let registry = self.registry.read().await;
            registry
                .get(&envelope.recipient)
                .map(|record| record.info.callback_url.clone())
                .ok_or_else(|| FabricError::UnknownAgent(envelope.recipient.clone()))?
        };

        info!(
            message_id = %envelope.message_id,
            kind = %envelope.kind,
            recipient = %envelope.recipient,
            "routing envelope"
        );
        let response = self
            .http
            .post(&callback_url)
            .json(&json!({ "jwt": token }))
            .send()
            .await
            .map_err(|e| FabricError::Callback(e.to_string()))?;
        if !response.status().is_success() {
            warn!(
                status = %response.status(),
                recipient = %envelope.recipient,
                "recipient callback rejected envelope"
            );
            return Err(FabricError::Callback(format!(
                "callback returned {}",
                response.status()
            )));
        }
        Ok(RouteOutcome::Sent)
    }

    /// Conjunctive discovery over the reserved `role` and `tool` capability
    /// keys; a missing filter matches everything.
    pub async fn discover(
        &self,
        role: Option<&str>,
        tool: Option<&str>,
    ) -> HashMap<String, DiscoveredAgent> {
        let now = Utc::now();
        let registry = self.registry.read().await;
        registry
            .iter()
            .filter(|(_, record)| {
                capability_matches(&record.info, CAPABILITY_ROLE, role)
                    && capability_matches(&record.info, CAPABILITY_TOOL, tool)
            })
            .map(|(id, record)| (id.clone(), self.discovered(record, now)))
            .collect()
    }

    /// Agents whose capabilities declare `tool == service` or `role == service`
    pub async fn services(&self, service: &str) -> HashMap<String, DiscoveredAgent> {
        let now = Utc::now();
        let registry = self.registry.read().await;
        registry
            .iter()
            .filter(|(_, record)| {
                capability_equals(&record.info, CAPABILITY_TOOL, service)
                    || capability_equals(&record.info, CAPABILITY_ROLE, service)
            })
            .map(|(id, record)| (id.clone(), self.discovered(record, now)))
            .collect()
    }

    /// All full cards
    pub async fn cards(&self) -> HashMap<String, AgentCard> {
        let now = Utc::now();
        let registry = self.registry.read().await;
        registry
            .iter()
            .map(|(id, record)| (id.clone(), self.card_of(record, now)))
            .collect()
    }

    /// One full card
    pub async fn card(&self, agent_id: &str) -> Result<AgentCard> {
        let registry = self.registry.read().await;
        registry
            .get(agent_id)
            .map(|record| self.card_of(record, Utc::now()))
            .ok_or_else(|| FabricError::UnknownAgent(agent_id.to_string()))
    }

    /// Liveness-only summary
    pub async fn status(&self) -> HashMap<String, AgentLiveness> {
        let now = Utc::now();
        let registry = self.registry.read().await;
        registry
            .iter()
            .map(|(id, record)| {
                (
                    id.clone(),
                    AgentLiveness {
                        name: record.info.name.clone(),
                        online: is_online(record.last_heartbeat, self.config.heartbeat_interval, now),
                        last_heartbeat: record.last_heartbeat,
                    },
                )
            })
            .collect()
    }

    async fn mark_heartbeat(&self, agent_id: &str) -> bool {
        let mut registry = self.registry.write().await;
        match registry.get_mut(agent_id) {
            Some(record) => {
                record.last_heartbeat = Some(Utc::now());
                true
            }
            None => false,
        }
    }

    fn discovered(&self, record: &AgentRecord, now: DateTime<Utc>) -> DiscoveredAgent {
        DiscoveredAgent {
            name: record.info.name.clone(),
            capabilities: record.info.capabilities.clone(),
            callback_url: record.info.callback_url.clone(),
            online: is_online(record.last_heartbeat, self.config.heartbeat_interval, now),
        }
    }

    fn card_of(&self, record: &AgentRecord, now: DateTime<Utc>) -> AgentCard {
        AgentCard {
            name: record.info.name.clone(),
            capabilities: record.info.capabilities.clone(),
            callback_url: record.info.callback_url.clone(),
            online: is_online(record.last_heartbeat, self.config.heartbeat_interval, now),
            last_heartbeat: record.last_heartbeat,
            registered_at: record.registered_at,
        }
    }
}

fn capability_matches(info: &AgentInfo, key: &str, wanted: Option<&str>) -> bool {
    match wanted {
        Some(value) => capability_equals(info, key, value),
        None => true,
    }
}

fn capability_equals(info: &AgentInfo, key: &str, value: &str) -> bool {
    info.capabilities
        .get(key)
        .and_then(Value::as_str)
        .is_some_and(|v| v == value)
}
