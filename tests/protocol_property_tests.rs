//! Property-based tests for envelope construction, body parsing, and the
//! liveness threshold

use a2a_fabric::*;
use chrono::{Duration as ChronoDuration, Utc};
use proptest::prelude::*;
use serde_json::json;
use std::collections::HashMap;

fn id_strategy() -> impl Strategy<Value = String> {
    "[a-z0-9]{1,24}"
}

proptest! {
    #[test]
    fn envelope_header_always_agrees_with_inner_message(
        sender in id_strategy(),
        recipient in id_strategy(),
        corr in id_strategy(),
        sql in "[ -~]{1,80}",
    ) {
        let body = MessageBody::Query { sql, correlation_id: corr.clone() };
        let message = A2AMessage::with_id(&corr, MessageType::Query, &sender, &recipient, body);
        let envelope = Envelope::wrap(&message).unwrap();

        prop_assert_eq!(envelope.version.as_str(), PROTOCOL_VERSION);
        prop_assert_eq!(&envelope.message_id, &message.message_id);
        prop_assert_eq!(envelope.kind, message.kind);
        prop_assert_eq!(&envelope.sender, &message.sender);
        prop_assert_eq!(&envelope.recipient, &message.recipient);

        let inner = envelope.message().unwrap();
        let inner_body = inner.typed_body().unwrap();
        prop_assert_eq!(inner.message_id.clone(), message.message_id);
        prop_assert_eq!(inner_body.correlation_id(), Some(corr.as_str()));
    }

    #[test]
    fn bodies_roundtrip_through_the_wire_format(
        corr in id_strategy(),
        sql in "[ -~]{1,80}",
        values in proptest::collection::vec(any::<i64>(), 0..8),
    ) {
        let query = MessageBody::Query { sql, correlation_id: corr.clone() };
        prop_assert_eq!(
            MessageBody::parse(MessageType::Query, &query.to_value()).unwrap(),
            query
        );

        let rows = values.iter().map(|v| json!({ "v": v })).collect::<Vec<_>>();
        let response = MessageBody::Response { rows, correlation_id: corr.clone() };
        prop_assert_eq!(
            MessageBody::parse(MessageType::Response, &response.to_value()).unwrap(),
            response
        );

        let ack = MessageBody::Ack { status: "received".to_string(), correlation_id: corr };
        prop_assert_eq!(
            MessageBody::parse(MessageType::Ack, &ack.to_value()).unwrap(),
            ack
        );
    }

    #[test]
    fn bodies_without_correlation_are_rejected(sql in "[ -~]{1,80}") {
        let bare = json!({ "sql": sql });
        prop_assert!(MessageBody::parse(MessageType::Query, &bare).is_err());
        prop_assert!(MessageBody::parse(MessageType::Ack, &json!({})).is_err(), "expected error");
    }

    #[test]
    fn online_iff_heartbeat_within_twice_the_interval(
        offset_secs in 0i64..7200,
        interval in 1u64..1800,
    ) {
        let now = Utc::now();
        let seen = now - ChronoDuration::seconds(offset_secs);
        let online = is_online(Some(seen), interval, now);
        prop_assert_eq!(online, offset_secs < 2 * interval as i64);
    }

    #[test]
    fn cold_agents_are_never_online(interval in 1u64..1800) {
        prop_assert!(!is_online(None, interval, Utc::now()));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn registration_yields_discoverable_agents(
        name in id_strategy(),
        role in id_strategy(),
    ) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let broker = Broker::new(BrokerConfig::default()).unwrap();
            let info = AgentInfo {
                name: name.clone(),
                callback_url: "http://agent:9000/inbox".to_string(),
                capabilities: HashMap::from([("role".to_string(), json!(role.clone()))]),
                agent_id: None,
            };

            let agent_id = broker.register(info).await.unwrap();
            assert!(!agent_id.is_empty());

            let found = broker.discover(Some(&role), None).await;
            assert!(found.contains_key(&agent_id));
            assert_eq!(found[&agent_id].name, name);
        });
    }
}
