//! End-to-end tests for the agent HTTP surface: /inbox, /query, and /ping,
//! with a wiremock broker and a scripted peer agent

use a2a_fabric::inbox::{create_router, AgentState};
use a2a_fabric::*;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn keys_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/keys")
}

fn agent_config(broker_url: &str) -> AgentRuntimeConfig {
    AgentRuntimeConfig {
        logical_name: "llm_agent".to_string(),
        broker_url: broker_url.to_string(),
        callback_url: "http://127.0.0.1:9/inbox".to_string(),
        capabilities: HashMap::from([("role".to_string(), json!("sql_to_text"))]),
        fixed_agent_id: None,
        target_service: "sales".to_string(),
        tool_url: broker_url.to_string(),
        private_key_path: keys_dir().join("llm_agent_private.pem"),
        public_keys_dir: keys_dir(),
        broker_id: "mcp-server".to_string(),
        heartbeat_interval: 30,
        base_ack_timeout_ms: 100,
        max_ack_attempts: 3,
        reply_timeout_secs: 2,
        register_attempts: 1,
        register_grace_secs: 0,
        send_timeout_secs: 2,
    }
}

struct StubExecutor(Vec<Value>);

#[async_trait::async_trait]
impl QueryExecutor for StubExecutor {
    async fn execute(&self, _sql: &str) -> Result<Vec<Value>> {
        Ok(self.0.clone())
    }
}

/// The peer agent's signer, for envelopes arriving at our inbox
fn ventas_signer() -> EnvelopeSigner {
    EnvelopeSigner::from_pem_file(keys_dir().join("ventas_agent_private.pem"), "mcp-server")
        .unwrap()
}

async fn spawn_agent(runtime: Arc<AgentRuntime>) -> String {
    let state = AgentState { runtime };
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, create_router(state)).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn registered_runtime(
    broker: &MockServer,
    rows: Vec<Value>,
) -> Arc<AgentRuntime> {
    Mock::given(method("POST"))
        .and(path("/agent/register"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "agent_id": "agent-a" })))
        .mount(broker)
        .await;
    let runtime = AgentRuntime::new(
        agent_config(&broker.uri()),
        Arc::new(PassthroughTranslator),
        Arc::new(StubExecutor(rows)),
    )
    .unwrap();
    runtime.register().await.unwrap();
    runtime
}

/// Find the first query envelope submitted to the mock broker
async fn wait_for_query(broker: &MockServer) -> Envelope {
    for _ in 0..150 {
        let query = broker
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|request| request.url.path() == "/agent/send")
            .map(|request| {
                let body: Value = serde_json::from_slice(&request.body).unwrap();
                let token = body["jwt"].as_str().unwrap();
                let payload = token.split('.').nth(1).unwrap();
                let claims: Value =
                    serde_json::from_slice(&URL_SAFE_NO_PAD.decode(payload).unwrap()).unwrap();
                serde_json::from_value::<Envelope>(claims["env"].clone()).unwrap()
            })
            .find(|envelope| envelope.kind == MessageType::Query);
        if let Some(envelope) = query {
            return envelope;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("no query envelope reached the broker");
}

#[tokio::test]
async fn ping_and_bad_requests() {
    let broker = MockServer::start().await;
    let runtime = registered_runtime(&broker, vec![]).await;
    let base = spawn_agent(runtime).await;
    let client = reqwest::Client::new();

    let response = client.get(format!("{}/ping", base)).send().await.unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["pong"], json!(true));

    // /query validates its shape
    let response = client
        .post(format!("{}/query", base))
        .json(&json!({ "wrong": "field" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    // /inbox rejects garbage tokens
    let response = client
        .post(format!("{}/inbox", base))
        .json(&json!({ "jwt": "garbage" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    // and token submissions without a jwt field
    let response = client
        .post(format!("{}/inbox", base))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn inbox_accepts_a_signed_query_with_202() {
    let broker = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/agent/send"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&broker)
        .await;
    let runtime = registered_runtime(&broker, vec![json!({"s": 42})]).await;
    let base = spawn_agent(runtime).await;

    let body = MessageBody::Query {
        sql: "SELECT SUM(qty) FROM t;".to_string(),
        correlation_id: "c1".to_string(),
    };
    let message = A2AMessage::with_id("c1", MessageType::Query, "agent-b", "agent-a", body);
    let envelope = Envelope::wrap(&message).unwrap();
    let token = ventas_signer().sign(&envelope, "ventas_agent").unwrap();

    let response = reqwest::Client::new()
        .post(format!("{}/inbox", base))
        .json(&json!({ "jwt": token }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], json!("accepted"));
}

#[tokio::test]
async fn query_round_trips_over_http() {
    let broker = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/agent/send"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&broker)
        .await;
    Mock::given(method("GET"))
        .and(path("/agent/services"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "agent-b": {
                "name": "ventas_agent",
                "capabilities": { "tool": "sales" },
                "callback_url": "http://ventas:8002/inbox",
                "online": true
            }
        })))
        .mount(&broker)
        .await;
    let runtime = registered_runtime(&broker, vec![]).await;
    let base = spawn_agent(runtime).await;
    let client = reqwest::Client::new();

    let asking = {
        let client = client.clone();
        let base = base.clone();
        tokio::spawn(async move {
            client
                .post(format!("{}/query", base))
                .json(&json!({ "pregunta": "sum sales" }))
                .send()
                .await
                .unwrap()
        })
    };

    // Act as the ventas agent: ACK the query, then answer it, both through
    // the real /inbox endpoint
    let query = wait_for_query(&broker).await;
    let signer = ventas_signer();

    let ack_body = MessageBody::Ack {
        status: "received".to_string(),
        correlation_id: query.message_id.clone(),
    };
    let ack = A2AMessage::new(MessageType::Ack, "agent-b", "agent-a", ack_body);
    let token = signer
        .sign(&Envelope::wrap(&ack).unwrap(), "ventas_agent")
        .unwrap();
    let response = client
        .post(format!("{}/inbox", base))
        .json(&json!({ "jwt": token }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let reply_body = MessageBody::Response {
        rows: vec![json!({"s": 42})],
        correlation_id: query.message_id.clone(),
    };
    let reply = A2AMessage::new(MessageType::Response, "agent-b", "agent-a", reply_body);
    let reply_envelope = Envelope::wrap(&reply).unwrap();
    let token = signer.sign(&reply_envelope, "ventas_agent").unwrap();
    let response = client
        .post(format!("{}/inbox", base))
        .json(&json!({ "jwt": token }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let answer = asking.await.unwrap();
    assert_eq!(answer.status(), 200);
    let body: Value = answer.json().await.unwrap();
    assert_eq!(body["sql"], json!("sum sales"));
    assert_eq!(body["respuesta"], json!(r#"[{"s":42}]"#));

    // A retransmit of the same response is acknowledged but ignored
    let token = signer.sign(&reply_envelope, "ventas_agent").unwrap();
    let response = client
        .post(format!("{}/inbox", base))
        .json(&json!({ "jwt": token }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], json!("ignored"));
}

#[tokio::test]
async fn query_without_candidates_is_bad_gateway() {
    let broker = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/agent/services"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&broker)
        .await;
    let runtime = registered_runtime(&broker, vec![]).await;
    let base = spawn_agent(runtime).await;

    let response = reqwest::Client::new()
        .post(format!("{}/query", base))
        .json(&json!({ "pregunta": "sum sales" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 502);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], json!("no online agents for service 'sales'"));
}

#[tokio::test]
async fn unanswered_query_is_gateway_timeout() {
    let broker = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/agent/send"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&broker)
        .await;
    Mock::given(method("GET"))
        .and(path("/agent/services"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "agent-b": {
                "name": "ventas_agent",
                "capabilities": {},
                "callback_url": "http://ventas:8002/inbox",
                "online": true
            }
        })))
        .mount(&broker)
        .await;
    let runtime = registered_runtime(&broker, vec![]).await;
    let base = spawn_agent(runtime).await;

    let response = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
        .post(format!("{}/query", base))
        .json(&json!({ "pregunta": "sum sales" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 504);
}
