//! Agent-side messaging runtime
//!
//! One long-lived value per agent process, shared between the inbox HTTP
//! handlers and background tasks. It drives three concurrent activities:
//! registration with retry, periodic heartbeats, and reliable envelope
//! delivery with ACK-driven retransmission.

use crate::broker::DiscoveredAgent;
use crate::config::AgentRuntimeConfig;
use crate::error::{FabricError, Result};
use crate::protocol::{fresh_id, A2AMessage, AgentInfo, Envelope, MessageBody, MessageType};
use crate::signature::{EnvelopeSigner, TokenVerifier};
use crate::tools::{QueryExecutor, Translator};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};

/// Retransmission state for one in-flight envelope
#[derive(Debug, Clone)]
pub struct PendingAck {
    pub envelope: Envelope,
    pub attempts: u32,
    pub backoff: Duration,
}

/// What the inbox did with a verified envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxOutcome {
    HeartbeatReceived,
    AckProcessed,
    ResponseResolved,
    ResponseIgnored,
    QueryAccepted,
}

/// Result of a client-facing question
#[derive(Debug, Clone)]
pub struct QueryAnswer {
    pub sql: String,
    pub answer: String,
}

/// The agent messaging runtime
pub struct AgentRuntime {
    config: AgentRuntimeConfig,
    signer: EnvelopeSigner,
    verifier: TokenVerifier,
    http: reqwest::Client,
    translator: Arc<dyn Translator>,
    executor: Arc<dyn QueryExecutor>,
    agent_id: RwLock<Option<String>>,
    /// broker-assigned id → logical name; tokens are always issued under the
    /// logical name, since public keys are indexed by it
    names: RwLock<HashMap<String, String>>,
    pending_acks: Mutex<HashMap<String, PendingAck>>,
    pending_replies: Mutex<HashMap<String, oneshot::Sender<Vec<Value>>>>,
    /// Handle back to our own Arc, for spawning background work from handlers
    weak_self: Weak<AgentRuntime>,
}

impl AgentRuntime {
    /// Build the runtime. A missing signing key is fatal here, before any
    /// server starts.
    pub fn new(
        config: AgentRuntimeConfig,
        translator: Arc<dyn Translator>,
        executor: Arc<dyn QueryExecutor>,
    ) -> Result<Arc<Self>> {
        config
            .validate()
            .map_err(|e| FabricError::Config(e.to_string()))?;
        let signer = EnvelopeSigner::from_pem_file(&config.private_key_path, &config.broker_id)?;
        // Tokens arriving at the inbox are addressed to the broker and passed
        // through unchanged, so the audience check stays off here.
        let verifier = TokenVerifier::new(&config.public_keys_dir, None);
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.send_timeout_secs))
            .build()?;
        Ok(Arc::new_cyclic(|weak_self| Self {
            config,
            signer,
            verifier,
            http,
            translator,
            executor,
            agent_id: RwLock::new(None),
            names: RwLock::new(HashMap::new()),
            pending_acks: Mutex::new(HashMap::new()),
            pending_replies: Mutex::new(HashMap::new()),
            weak_self: weak_self.clone(),
        }))
    }

    pub fn config(&self) -> &AgentRuntimeConfig {
        &self.config
    }

    /// The broker-assigned identity, once registered
    pub async fn agent_id(&self) -> Option<String> {
        self.agent_id.read().await.clone()
    }

    /// Verify an inbound token and extract its envelope
    pub fn verify_token(&self, token: &str) -> Result<Envelope> {
        self.verifier.verify(token)
    }

    /// Issuer for outgoing tokens: the logical name behind our id
    async fn issuer(&self) -> String {
        let id = self.agent_id.read().await.clone();
        match id {
            Some(id) => self.names.read().await.get(&id).cloned().unwrap_or(id),
            None => self.config.logical_name.clone(),
        }
    }

    /// Register with the broker after a short grace period, retrying with
    /// exponential backoff. Exhaustion is fatal: the agent cannot serve.
    pub async fn register(&self) -> Result<String> {
        sleep(Duration::from_secs(self.config.register_grace_secs)).await;

        let info = AgentInfo {
            name: self.config.logical_name.clone(),
            callback_url: self.config.callback_url.clone(),
            capabilities: self.config.capabilities.clone(),
            agent_id: self.config.fixed_agent_id.clone(),
        };

        for attempt in 0..self.config.register_attempts {
            match self.try_register(&info).await {
                Ok(agent_id) => {
                    *self.agent_id.write().await = Some(agent_id.clone());
                    self.names
                        .write()
                        .await
                        .insert(agent_id.clone(), self.config.logical_name.clone());
                    info!(
                        "[{}] registered with id {}",
                        self.config.logical_name, agent_id
                    );
                    return Ok(agent_id);
                }
                Err(e) => {
                    let wait = 2u64.pow(attempt);
                    warn!(
                        "[{}] registration attempt {} failed ({}), retry in {}s",
                        self.config.logical_name,
                        attempt + 1,
                        e,
                        wait
                    );
                    sleep(Duration::from_secs(wait)).await;
                }
            }
        }

        Err(FabricError::Registration(format!(
            "could not register with broker after {} attempts",
            self.config.register_attempts
        )))
    }

    async fn try_register(&self, info: &AgentInfo) -> Result<String> {
        let response = self
            .http
            .post(format!("{}/agent/register", self.config.broker_url))
            .timeout(Duration::from_secs(3))
            .json(info)
            .send()
            .await?
            .error_for_status()?;
        let body: Value = response.json().await?;
        body.get("agent_id")
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| {
                FabricError::Registration("register response missing agent_id".to_string())
            })
    }

    /// Register, then keep heartbeating in the background
    pub async fn start(&self) -> Result<String> {
        let agent_id = self.register().await?;
        if let Some(runtime) = self.weak_self.upgrade() {
            tokio::spawn(async move { runtime.heartbeat_loop().await });
        }
        Ok(agent_id)
    }

    /// Emit a signed self-addressed heartbeat every interval; network
    /// failures are logged and ignored
    pub async fn heartbeat_loop(&self) {
        let interval = Duration::from_secs(self.config.heartbeat_interval);
        loop {
            sleep(interval).await;
            let Some(agent_id) = self.agent_id.read().await.clone() else {
                continue;
            };
            if let Err(e) = self.send_heartbeat(&agent_id).await {
                warn!("[{}] heartbeat failed: {}", self.config.logical_name, e);
            }
        }
    }

    async fn send_heartbeat(&self, agent_id: &str) -> Result<()> {
        let envelope = Envelope::heartbeat(agent_id);
        let token = self.signer.sign(&envelope, &self.issuer().await)?;
        self.http
            .post(format!("{}/agent/heartbeat", self.config.broker_url))
            .timeout(Duration::from_secs(3))
            .json(&json!({ "jwt": token }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Reliable send: transmit, wait, and retransmit with doubled backoff
    /// until the matching ACK clears the pending entry or attempts run out.
    ///
    /// The retry loop lives at the application layer: a 200 from the broker
    /// only proves the broker accepted the envelope, not that the recipient
    /// processed it. Each attempt re-signs so retransmits carry a fresh `exp`.
    pub async fn send_with_retries(&self, envelope: Envelope) -> Result<()> {
        let message_id = envelope.message_id.clone();
        let mut backoff = Duration::from_millis(self.config.base_ack_timeout_ms);
        {
            let mut acks = self.pending_acks.lock().await;
            acks.insert(
                message_id.clone(),
                PendingAck {
                    envelope: envelope.clone(),
                    attempts: 0,
                    backoff,
                },
            );
        }

        let issuer = self.issuer().await;
        for attempt in 1..=self.config.max_ack_attempts {
            match self.signer.sign(&envelope, &issuer) {
                Ok(token) => match self.post_send(&token).await {
                    Ok(()) => info!(
                        message_id = %message_id,
                        attempt,
                        "envelope submitted to broker"
                    ),
                    Err(e) => warn!(
                        message_id = %message_id,
                        attempt,
                        "submission failed: {}", e
                    ),
                },
                Err(e) => error!(message_id = %message_id, "signing failed: {}", e),
            }

            sleep(backoff).await;

            // The inbox removes the entry when the ACK arrives
            let mut acks = self.pending_acks.lock().await;
            match acks.get_mut(&message_id) {
                None => return Ok(()),
                Some(pending) => {
                    backoff *= 2;
                    pending.attempts = attempt;
                    pending.backoff = backoff;
                }
            }
        }

        self.pending_acks.lock().await.remove(&message_id);
        Err(FabricError::Delivery(format!(
            "no ACK for {} after {} attempts",
            message_id, self.config.max_ack_attempts
        )))
    }

    async fn post_send(&self, token: &str) -> Result<()> {
        self.http
            .post(format!("{}/agent/send", self.config.broker_url))
            .json(&json!({ "jwt": token }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Dispatch a verified inbound envelope; the core of `/inbox`.
    ///
    /// Queries and responses are ACKed immediately and unconditionally;
    /// everything after the ACK runs on its own merits.
    pub async fn handle_envelope(&self, envelope: Envelope) -> Result<InboxOutcome> {
        match envelope.kind {
            MessageType::Heartbeat => {
                info!(sender = %envelope.sender, "heartbeat received");
                Ok(InboxOutcome::HeartbeatReceived)
            }
            MessageType::Ack => {
                // Malformed ACKs are logged and swallowed
                match envelope.message().and_then(|m| m.typed_body()) {
                    Ok(MessageBody::Ack { correlation_id, .. }) => {
                        if self
                            .pending_acks
                            .lock()
                            .await
                            .remove(&correlation_id)
                            .is_some()
                        {
                            info!(
                                correlation_id = %correlation_id,
                                "ACK received, cancelling retransmissions"
                            );
                        }
                    }
                    Ok(_) => warn!("ack envelope carried a non-ack body"),
                    Err(e) => warn!("malformed ACK: {}", e),
                }
                Ok(InboxOutcome::AckProcessed)
            }
            MessageType::Response => {
                self.spawn_ack(&envelope);
                let body = envelope.message()?.typed_body()?;
                let MessageBody::Response {
                    rows,
                    correlation_id,
                } = body
                else {
                    return Err(FabricError::Validation(
                        "response envelope with mismatched body".to_string(),
                    ));
                };
                match self.pending_replies.lock().await.remove(&correlation_id) {
                    Some(tx) => {
                        // The waiter may have timed out already; that is fine
                        let _ = tx.send(rows);
                        Ok(InboxOutcome::ResponseResolved)
                    }
                    None => {
                        info!(correlation_id = %correlation_id, "duplicate response ignored");
                        Ok(InboxOutcome::ResponseIgnored)
                    }
                }
            }
            MessageType::Query => {
                self.spawn_ack(&envelope);
                let message = envelope.message()?;
                let body = message.typed_body()?;
                let MessageBody::Query {
                    sql,
                    correlation_id,
                } = body
                else {
                    return Err(FabricError::Validation(
                        "query envelope with mismatched body".to_string(),
                    ));
                };
                if let Some(runtime) = self.weak_self.upgrade() {
                    let requester = message.sender.clone();
                    tokio::spawn(async move {
                        runtime.answer_query(requester, sql, correlation_id).await;
                    });
                }
                Ok(InboxOutcome::QueryAccepted)
            }
        }
    }

    /// Fire-and-forget ACK back to the sender, correlated to the received
    /// envelope's message id. Its own failure is only logged, and ACKs are
    /// never themselves ACKed.
    fn spawn_ack(&self, received: &Envelope) {
        let Some(runtime) = self.weak_self.upgrade() else {
            return;
        };
        let sender = received.sender.clone();
        let acked_id = received.message_id.clone();
        tokio::spawn(async move {
            if let Err(e) = runtime.send_ack(&sender, &acked_id).await {
                error!(message_id = %acked_id, "ACK emission failed: {}", e);
            }
        });
    }

    async fn send_ack(&self, recipient: &str, acked_message_id: &str) -> Result<()> {
        let agent_id = self
            .agent_id
            .read()
            .await
            .clone()
            .ok_or(FabricError::NotRegistered)?;
        let body = MessageBody::Ack {
            status: "received".to_string(),
            correlation_id: acked_message_id.to_string(),
        };
        let message = A2AMessage::new(MessageType::Ack, &agent_id, recipient, body);
        let envelope = Envelope::wrap(&message)?;
        let token = self.signer.sign(&envelope, &self.issuer().await)?;
        self.post_send(&token).await
    }

    /// Execute a received query and deliver the correlated response through
    /// reliable send. Runs detached from the inbox handler.
    async fn answer_query(&self, requester: String, sql: String, correlation_id: String) {
        info!(correlation_id = %correlation_id, "executing query: {}", sql);
        let rows = match self.executor.execute(&sql).await {
            Ok(rows) => rows,
            Err(e) => {
                error!(correlation_id = %correlation_id, "query execution failed: {}", e);
                return;
            }
        };

        let Some(agent_id) = self.agent_id.read().await.clone() else {
            error!("cannot reply before registration");
            return;
        };
        let body = MessageBody::Response {
            rows,
            correlation_id: correlation_id.clone(),
        };
        let message = A2AMessage::new(MessageType::Response, &agent_id, &requester, body);
        let envelope = match Envelope::wrap(&message) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(correlation_id = %correlation_id, "could not build response: {}", e);
                return;
            }
        };
        if let Err(e) = self.send_with_retries(envelope).await {
            error!(correlation_id = %correlation_id, "response delivery failed: {}", e);
        }
    }

    /// Client-facing orchestration: translate the question, resolve a target
    /// agent, reliable-send the query, and await the correlated reply.
    pub async fn ask(&self, question: &str) -> Result<QueryAnswer> {
        let agent_id = self
            .agent_id
            .read()
            .await
            .clone()
            .ok_or(FabricError::NotRegistered)?;

        let translator = Arc::clone(&self.translator);
        let asked = question.to_string();
        let sql = tokio::task::spawn_blocking(move || translator.translate(&asked))
            .await
            .map_err(|e| FabricError::Translator(e.to_string()))??;
        info!("[{}] translated question into: {}", self.config.logical_name, sql);

        let recipient = self.resolve_target().await?;

        let correlation_id = fresh_id();
        let body = MessageBody::Query {
            sql: sql.clone(),
            correlation_id: correlation_id.clone(),
        };
        let message = A2AMessage::with_id(
            &correlation_id,
            MessageType::Query,
            &agent_id,
            &recipient,
            body,
        );
        let envelope = Envelope::wrap(&message)?;

        let (tx, rx) = oneshot::channel();
        self.pending_replies
            .lock()
            .await
            .insert(correlation_id.clone(), tx);

        // A failed reliable send still surfaces as the reply timing out;
        // the reply may arrive even when the ACK never did.
        if let Err(e) = self.send_with_retries(envelope).await {
            warn!(correlation_id = %correlation_id, "reliable send gave up: {}", e);
        }

        let rows = match timeout(Duration::from_secs(self.config.reply_timeout_secs), rx).await {
            Ok(Ok(rows)) => rows,
            Ok(Err(_)) | Err(_) => {
                self.pending_replies.lock().await.remove(&correlation_id);
                return Err(FabricError::ReplyTimeout);
            }
        };

        let translator = Arc::clone(&self.translator);
        let asked = question.to_string();
        let answer = tokio::task::spawn_blocking(move || translator.format(&asked, &rows))
            .await
            .map_err(|e| FabricError::Translator(e.to_string()))??;

        Ok(QueryAnswer { sql, answer })
    }

    /// First online candidate advertising the target service
    async fn resolve_target(&self) -> Result<String> {
        let service = &self.config.target_service;
        let response = self
            .http
            .get(format!("{}/agent/services", self.config.broker_url))
            .timeout(Duration::from_secs(5))
            .query(&[("service", service)])
            .send()
            .await?
            .error_for_status()?;
        let candidates: HashMap<String, DiscoveredAgent> = response.json().await?;
        candidates
            .iter()
            .find(|(_, card)| card.online)
            .map(|(id, _)| id.clone())
            .ok_or_else(|| FabricError::NoCandidates(service.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::PassthroughTranslator;

    struct NoopExecutor;

    #[async_trait::async_trait]
    impl QueryExecutor for NoopExecutor {
        async fn execute(&self, _sql: &str) -> Result<Vec<Value>> {
            Ok(vec![])
        }
    }

    #[test]
    fn test_missing_signing_key_is_fatal() {
        let mut config = AgentRuntimeConfig::default();
        config.private_key_path = "/nonexistent/private.pem".into();
        let result = AgentRuntime::new(
            config,
            Arc::new(PassthroughTranslator),
            Arc::new(NoopExecutor),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = AgentRuntimeConfig::default();
        config.max_ack_attempts = 0;
        let result = AgentRuntime::new(
            config,
            Arc::new(PassthroughTranslator),
            Arc::new(NoopExecutor),
        );
        assert!(matches!(result, Err(FabricError::Config(_))));
    }
}
