use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tungstenite::protocol::Message as WsMessage;

use super::BrokerState;
use super::connection::Connection;
use super::local_bus::{LocalBus, topic_matches};
use super::message::{Envelope, MessageMetadata, TypedMessage, batch_type};
use super::topic::Topic;
use crate::transport::message::ServerMessage;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct OrderCreated {
    order_id: u64,
}

impl TypedMessage for OrderCreated {}

fn connect(broker: &BrokerState) -> (String, mpsc::UnboundedReceiver<WsMessage>) {
    let (tx, rx) = mpsc::unbounded_channel::<WsMessage>();
    let connection = Connection::new(tx);
    let id = connection.id.clone();
    assert!(broker.attach(connection));
    (id, rx)
}

fn drain(rx: &mut mpsc::UnboundedReceiver<WsMessage>) -> Vec<ServerMessage> {
    let mut frames = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        if let WsMessage::Text(text) = msg {
            frames.push(serde_json::from_str(&text).unwrap());
        }
    }
    frames
}

fn received_topics(frames: &[ServerMessage]) -> Vec<String> {
    frames
        .iter()
        .filter_map(|f| match f {
            ServerMessage::MessageReceived { topic, .. } => Some(topic.clone()),
            _ => None,
        })
        .collect()
}

fn envelope(topic: &str, payload: &str) -> Envelope {
    Envelope {
        topic: topic.to_string(),
        message_type: OrderCreated::message_type().to_string(),
        message_payload: payload.to_string(),
        metadata: None,
    }
}

#[test]
fn test_topic_new() {
    let topic = Topic::new("test_topic");
    assert_eq!(topic.name, "test_topic");
    assert!(topic.is_empty());
}

#[test]
fn test_topic_subscribe_and_unsubscribe() {
    let mut topic = Topic::new("test_topic");
    topic.subscribe("client1".to_string());
    topic.subscribe("client1".to_string());
    assert_eq!(topic.subscribers.len(), 1);

    topic.unsubscribe("client1");
    assert!(topic.is_empty());
}

#[test]
fn test_broker_new() {
    let broker = BrokerState::default();
    assert_eq!(broker.connection_count(), 0);
    assert_eq!(broker.topic_count(), 0);
}

#[test]
fn test_attach_and_detach() {
    let broker = BrokerState::new();
    let (id, _rx) = connect(&broker);
    assert_eq!(broker.connection_count(), 1);

    broker.detach(&id);
    assert_eq!(broker.connection_count(), 0);
}

#[test]
fn test_attach_refused_at_capacity() {
    let broker = BrokerState::new().with_max_connections(1);
    let (_id, _rx) = connect(&broker);

    let (tx, _rx2) = mpsc::unbounded_channel::<WsMessage>();
    assert!(!broker.attach(Connection::new(tx)));
    assert_eq!(broker.connection_count(), 1);
}

#[test]
fn test_register_service_acknowledges() {
    let broker = BrokerState::new();
    let (id, mut rx) = connect(&broker);

    broker.register_service(&id, "orders");

    assert_eq!(broker.service_name(&id).as_deref(), Some("orders"));
    assert_eq!(
        drain(&mut rx),
        vec![ServerMessage::ServiceRegistered {
            service_name: "orders".to_string()
        }]
    );
}

#[test]
fn test_register_service_latest_name_wins() {
    let broker = BrokerState::new();
    let (id, _rx) = connect(&broker);

    assert_eq!(broker.register_service(&id, "orders"), None);
    assert_eq!(
        broker.register_service(&id, "billing").as_deref(),
        Some("orders")
    );

    assert_eq!(broker.service_name(&id).as_deref(), Some("billing"));
    assert!(broker.connections_for_service("orders").is_empty());
    assert_eq!(broker.connections_for_service("billing"), vec![id]);
}

#[test]
fn test_service_may_have_many_connections() {
    let broker = BrokerState::new();
    let (a, _rx_a) = connect(&broker);
    let (b, _rx_b) = connect(&broker);
    broker.register_service(&a, "orders");
    broker.register_service(&b, "orders");

    let mut ids = broker.connections_for_service("orders");
    ids.sort();
    let mut expected = vec![a, b];
    expected.sort();
    assert_eq!(ids, expected);
}

#[test]
fn test_subscribe_and_unsubscribe() {
    let broker = BrokerState::new();
    let (id, mut rx) = connect(&broker);

    assert_eq!(broker.subscribe(&id, "test_topic"), 1);
    assert!(broker.has_topic("test_topic"));
    assert_eq!(broker.subscribers("test_topic"), vec![id.clone()]);
    assert_eq!(
        drain(&mut rx),
        vec![ServerMessage::TopicSubscribed {
            topic: "test_topic".to_string()
        }]
    );

    broker.unsubscribe(&id, "test_topic");
    assert!(!broker.has_topic("test_topic"));
}

#[test]
fn test_unsubscribe_keeps_topic_with_other_subscribers() {
    let broker = BrokerState::new();
    let (a, _rx_a) = connect(&broker);
    let (b, _rx_b) = connect(&broker);
    broker.subscribe(&a, "t");
    broker.subscribe(&b, "t");

    broker.unsubscribe(&a, "t");
    assert_eq!(broker.subscribers("t"), vec![b]);
}

#[test]
fn test_publish_delivers_to_subscriber() {
    let broker = BrokerState::new();
    let (publisher, mut pub_rx) = connect(&broker);
    let (subscriber, mut sub_rx) = connect(&broker);
    broker.register_service(&publisher, "orders");
    broker.subscribe(&subscriber, "test_topic");
    drain(&mut sub_rx);
    drain(&mut pub_rx);

    let delivered = broker
        .publish(&publisher, envelope("test_topic", r#"{"order_id":7}"#))
        .unwrap();
    assert_eq!(delivered, 1);

    let frames = drain(&mut sub_rx);
    match &frames[..] {
        [
            ServerMessage::MessageReceived {
                topic,
                message_type,
                message_payload,
                metadata,
            },
        ] => {
            assert_eq!(topic, "test_topic");
            assert_eq!(message_type, OrderCreated::message_type());
            assert_eq!(message_payload, r#"{"order_id":7}"#);
            // defaulted from the caller's registration
            assert_eq!(metadata.source_service, "orders");
            assert!(!metadata.correlation_id.is_empty());
        }
        other => panic!("unexpected frames: {other:?}"),
    }

    // publisher is not subscribed, so it gets nothing back
    assert!(drain(&mut pub_rx).is_empty());
}

#[test]
fn test_publish_keeps_supplied_metadata() {
    let broker = BrokerState::new();
    let (publisher, _pub_rx) = connect(&broker);
    let (subscriber, mut sub_rx) = connect(&broker);
    broker.subscribe(&subscriber, "t");
    drain(&mut sub_rx);

    let metadata = MessageMetadata::new("catalog").with_correlation_id("corr-1");
    let mut env = envelope("t", "{}");
    env.metadata = Some(metadata.clone());
    broker.publish(&publisher, env).unwrap();

    match drain(&mut sub_rx).pop() {
        Some(ServerMessage::MessageReceived { metadata: got, .. }) => assert_eq!(got, metadata),
        other => panic!("unexpected frame: {other:?}"),
    }
}

#[test]
fn test_unregistered_publisher_is_unknown() {
    let broker = BrokerState::new();
    let (publisher, _pub_rx) = connect(&broker);
    let (subscriber, mut sub_rx) = connect(&broker);
    broker.subscribe(&subscriber, "t");
    drain(&mut sub_rx);

    broker.publish(&publisher, envelope("t", "{}")).unwrap();

    match drain(&mut sub_rx).pop() {
        Some(ServerMessage::MessageReceived { metadata, .. }) => {
            assert_eq!(metadata.source_service, "unknown")
        }
        other => panic!("unexpected frame: {other:?}"),
    }
}

#[test]
fn test_publish_to_nonexistent_topic_is_noop() {
    let broker = BrokerState::new();
    let (publisher, mut pub_rx) = connect(&broker);

    let delivered = broker
        .publish(&publisher, envelope("nonexistent_topic", "{}"))
        .unwrap();

    assert_eq!(delivered, 0);
    assert!(drain(&mut pub_rx).is_empty());
    assert!(!broker.has_topic("nonexistent_topic"));
}

#[test]
fn test_publish_to_client_with_closed_channel() {
    let broker = BrokerState::new();
    let (publisher, _pub_rx) = connect(&broker);
    let (gone, gone_rx) = connect(&broker);
    let (alive, mut alive_rx) = connect(&broker);
    broker.subscribe(&gone, "t");
    broker.subscribe(&alive, "t");
    drain(&mut alive_rx);

    drop(gone_rx);

    let delivered = broker.publish(&publisher, envelope("t", "{}")).unwrap();
    assert_eq!(delivered, 1);
    assert_eq!(received_topics(&drain(&mut alive_rx)), vec!["t".to_string()]);
}

#[test]
fn test_topic_isolation() {
    let broker = BrokerState::new();
    let (publisher, _pub_rx) = connect(&broker);
    let (on_t1, mut rx_t1) = connect(&broker);
    let (on_t2, mut rx_t2) = connect(&broker);
    broker.subscribe(&on_t1, "t1");
    broker.subscribe(&on_t2, "t2");
    drain(&mut rx_t1);
    drain(&mut rx_t2);

    broker.publish(&publisher, envelope("t1", "{}")).unwrap();

    assert_eq!(received_topics(&drain(&mut rx_t1)), vec!["t1".to_string()]);
    assert!(drain(&mut rx_t2).is_empty());
}

#[test]
fn test_broadcast_fan_out_scenario() {
    let broker = BrokerState::new();
    let mut subscribers = Vec::new();
    for _ in 0..3 {
        let (id, mut rx) = connect(&broker);
        broker.subscribe(&id, "orders.created");
        drain(&mut rx);
        subscribers.push(rx);
    }
    let (publisher, mut pub_rx) = connect(&broker);
    broker.register_service(&publisher, "checkout");
    drain(&mut pub_rx);

    let delivered = broker
        .publish(&publisher, envelope("orders.created", r#"{"order_id":1}"#))
        .unwrap();
    assert_eq!(delivered, 3);
    broker
        .publish(&publisher, envelope("orders.cancelled", r#"{"order_id":1}"#))
        .unwrap();

    for rx in subscribers.iter_mut() {
        assert_eq!(
            received_topics(&drain(rx)),
            vec!["orders.created".to_string()]
        );
    }
    assert!(drain(&mut pub_rx).is_empty());
}

#[test]
fn test_detach_cleans_subscriptions_and_empty_topics() {
    let broker = BrokerState::new();
    let (leaving, _rx) = connect(&broker);
    let (staying, _rx2) = connect(&broker);
    broker.register_service(&leaving, "orders");
    broker.subscribe(&leaving, "only_leaving");
    broker.subscribe(&leaving, "shared");
    broker.subscribe(&staying, "shared");

    assert_eq!(broker.detach(&leaving).as_deref(), Some("orders"));

    assert!(!broker.has_topic("only_leaving"));
    assert_eq!(broker.subscribers("shared"), vec![staying]);
    assert_eq!(broker.service_name(&leaving), None);
    assert_eq!(broker.topic_count(), 1);
}

#[test]
fn test_close_connection_queues_close_frame() {
    let broker = BrokerState::new();
    let (id, mut rx) = connect(&broker);

    assert!(broker.close_connection(&id));
    assert!(matches!(rx.try_recv(), Ok(WsMessage::Close(None))));
    assert!(!broker.close_connection("missing"));
}

#[test]
fn test_close_all() {
    let broker = BrokerState::new();
    let (_a, _rx_a) = connect(&broker);
    let (_b, _rx_b) = connect(&broker);
    assert_eq!(broker.close_all(), 2);
}

#[test]
fn test_publish_reaches_local_bus() {
    let bus = Arc::new(LocalBus::new());
    let seen = Arc::new(AtomicUsize::new(0));
    let seen_in_handler = seen.clone();
    bus.subscribe::<OrderCreated, _>("orders.*", move |order, metadata| {
        assert_eq!(order.order_id, 42);
        assert_eq!(metadata.source_service, "checkout");
        seen_in_handler.fetch_add(1, Ordering::SeqCst);
        true
    });

    let broker = BrokerState::new_with_local_bus(bus);
    let (publisher, _rx) = connect(&broker);
    broker.register_service(&publisher, "checkout");

    broker
        .publish(&publisher, envelope("orders.created", r#"{"order_id":42}"#))
        .unwrap();

    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[test]
fn test_local_bus_failure_does_not_abort_broadcast() {
    let bus = Arc::new(LocalBus::new());
    bus.subscribe::<OrderCreated, _>("t", |_, _| true);
    let broker = BrokerState::new_with_local_bus(bus);
    let (publisher, mut pub_rx) = connect(&broker);
    let (subscriber, mut sub_rx) = connect(&broker);
    broker.subscribe(&subscriber, "t");
    drain(&mut sub_rx);

    // payload does not decode as OrderCreated
    let delivered = broker
        .publish(&publisher, envelope("t", r#"{"nope":true}"#))
        .unwrap();
    assert_eq!(delivered, 1);

    // unknown type on a locally subscribed topic
    let mut unknown = envelope("t", "{}");
    unknown.message_type = "some::Unknown".to_string();
    assert_eq!(broker.publish(&publisher, unknown).unwrap(), 1);

    assert_eq!(drain(&mut sub_rx).len(), 2);
    assert!(drain(&mut pub_rx).is_empty());
}

#[test]
fn test_panicking_local_handler_does_not_abort_broadcast() {
    let bus = Arc::new(LocalBus::new());
    bus.subscribe::<OrderCreated, _>("t", |_, _| panic!("handler bug"));
    let broker = BrokerState::new_with_local_bus(bus);
    let (publisher, _pub_rx) = connect(&broker);
    let (subscriber, mut sub_rx) = connect(&broker);
    broker.subscribe(&subscriber, "t");
    drain(&mut sub_rx);

    let delivered = broker
        .publish(&publisher, envelope("t", r#"{"order_id":1}"#))
        .unwrap();
    assert_eq!(delivered, 1);
    assert_eq!(received_topics(&drain(&mut sub_rx)), vec!["t".to_string()]);
}

#[test]
fn test_local_bus_batch_delivery() {
    let bus = LocalBus::new();
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    bus.subscribe::<OrderCreated, _>("orders", move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        true
    });

    let delivered = bus
        .publish(
            "orders",
            &batch_type(OrderCreated::message_type()),
            r#"[{"order_id":1},{"order_id":2},{"order_id":3}]"#,
            &MessageMetadata::new("checkout"),
        )
        .unwrap();

    assert_eq!(delivered, 3);
    assert_eq!(seen.load(Ordering::SeqCst), 3);
}

#[test]
fn test_local_bus_skips_decoding_without_subscribers() {
    let bus = LocalBus::new();
    let delivered = bus
        .publish("t", "never::Registered", "not json", &MessageMetadata::new("x"))
        .unwrap();
    assert_eq!(delivered, 0);
}

#[test]
fn test_registry_knows_single_and_batch_types() {
    let bus = LocalBus::new();
    bus.registry().register::<OrderCreated>();
    assert!(bus.registry().contains(OrderCreated::message_type()));
    assert!(bus.registry().contains(&batch_type(OrderCreated::message_type())));
    assert!(!bus.registry().contains("other"));
}

#[test]
fn test_topic_matches() {
    assert!(topic_matches("orders.created", "orders.created"));
    assert!(topic_matches("orders.*", "orders.created"));
    assert!(topic_matches("*.created", "orders.created"));
    assert!(!topic_matches("orders.*", "orders.created.eu"));
    assert!(!topic_matches("orders.created", "orders.cancelled"));
    assert!(!topic_matches("orders", "orders.created"));
}
