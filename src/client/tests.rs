use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, oneshot};
use tungstenite::protocol::Message as WsMessage;

use super::connection::{BrokerConnection, ConnectionEvent, ConnectionState};
use super::consumer::MessageConsumer;
use super::publisher::{MessagePublisher, PublishResult};
use crate::broker::BrokerState;
use crate::broker::message::{MessageMetadata, TypedMessage};
use crate::transport::message::{Invocation, ServerMessage};
use crate::transport::websocket::serve;
use crate::utils::error::ClientError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct OrderCreated {
    order_id: u32,
}

impl TypedMessage for OrderCreated {}

async fn start_broker(broker: Arc<BrokerState>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve(listener, broker));
    format!("ws://{addr}")
}

async fn unused_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("ws://{addr}")
}

fn connection(url: &str) -> BrokerConnection {
    BrokerConnection::with_options(
        url,
        vec![Duration::ZERO, Duration::from_millis(50), Duration::from_millis(100)],
        Duration::from_secs(2),
    )
}

/// A broker that completes every invocation on the first socket until
/// `drop_first` fires, then accepts one more handshake, drops that socket at
/// once and stops listening.
async fn flaky_broker() -> (String, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (drop_first, mut dropped) = oneshot::channel::<()>();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        loop {
            tokio::select! {
                _ = &mut dropped => break,
                frame = ws.next() => {
                    let Some(Ok(WsMessage::Text(text))) = frame else { break };
                    let invocation: Invocation = serde_json::from_str(text.as_str()).unwrap();
                    if let Some(invocation_id) = invocation.invocation_id {
                        let done = ServerMessage::Completion { invocation_id, error: None };
                        let _ = ws.send(WsMessage::text(serde_json::to_string(&done).unwrap())).await;
                    }
                }
            }
        }
        let _ = ws.send(WsMessage::Close(None)).await;
        drop(ws);

        let (stream, _) = listener.accept().await.unwrap();
        drop(tokio_tungstenite::accept_async(stream).await);
        drop(listener);
    });

    (format!("ws://{addr}"), drop_first)
}

async fn next_event(lifecycle: &mut broadcast::Receiver<ConnectionEvent>) -> ConnectionEvent {
    tokio::time::timeout(Duration::from_secs(5), lifecycle.recv())
        .await
        .expect("no lifecycle event")
        .unwrap()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..150 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

#[test]
fn test_publish_result_wire_format() {
    let result = PublishResult::ok_with_count("m-1", 3);
    assert_eq!(
        serde_json::to_value(&result).unwrap(),
        json!({ "success": true, "messageId": "m-1", "subscriberCount": 3 })
    );

    let failed = PublishResult::fail("boom");
    assert!(!failed.success);
    assert_eq!(failed.message_id, None);
    assert_eq!(failed.error.as_deref(), Some("boom"));
}

#[test]
fn test_connection_state_ready() {
    assert!(ConnectionState::Connected.ready().unwrap());
    assert!(!ConnectionState::Disconnected.ready().unwrap());
    assert!(matches!(
        ConnectionState::Reconnecting.ready(),
        Err(ClientError::Reconnecting)
    ));
    assert!(matches!(ConnectionState::Closed.ready(), Err(ClientError::Closed)));
}

#[tokio::test]
async fn test_publish_without_broker_returns_failure() {
    let url = unused_url().await;
    let publisher = MessagePublisher::with_connection(connection(&url), "orders");

    let result = publisher
        .publish(&OrderCreated { order_id: 1 }, "orders.created", None)
        .await;

    assert!(!result.success);
    assert!(result.error.is_some());
    assert_eq!(publisher.connection().state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_publish_registers_service_and_succeeds_without_subscribers() {
    let broker = Arc::new(BrokerState::new());
    let url = start_broker(broker.clone()).await;
    let publisher = MessagePublisher::with_connection(connection(&url), "orders");

    let result = publisher
        .publish(&OrderCreated { order_id: 1 }, "nobody.listens", None)
        .await;

    assert!(result.success, "{result:?}");
    assert!(result.message_id.is_some());
    assert_eq!(broker.connections_for_service("orders").len(), 1);
    assert!(!broker.has_topic("nobody.listens"));
}

#[tokio::test]
async fn test_consumer_receives_published_message() {
    let broker = Arc::new(BrokerState::new());
    let url = start_broker(broker.clone()).await;

    let consumer = MessageConsumer::with_connection(connection(&url), "billing");
    let (tx, mut rx) = mpsc::unbounded_channel();
    consumer
        .subscribe("orders.created", move |order: OrderCreated, metadata: MessageMetadata| {
            let tx = tx.clone();
            async move { tx.send((order, metadata)).is_ok() }
        })
        .await
        .expect("subscribe");
    assert_eq!(broker.connections_for_service("billing").len(), 1);

    let publisher = MessagePublisher::with_connection(connection(&url), "orders");
    let metadata = MessageMetadata::new("orders").with_correlation_id("corr-7");
    let result = publisher
        .publish(&OrderCreated { order_id: 7 }, "orders.created", Some(metadata))
        .await;
    assert!(result.success);

    let (order, metadata) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("message not delivered")
        .unwrap();
    assert_eq!(order, OrderCreated { order_id: 7 });
    assert_eq!(metadata.source_service, "orders");
    assert_eq!(metadata.correlation_id, "corr-7");
}

#[tokio::test]
async fn test_publish_batch_reports_batch_size() {
    let broker = Arc::new(BrokerState::new());
    let url = start_broker(broker.clone()).await;

    let consumer = MessageConsumer::with_connection(connection(&url), "billing");
    let (tx, mut rx) = mpsc::unbounded_channel();
    consumer
        .subscribe("orders.batch", move |orders: Vec<OrderCreated>, _| {
            let tx = tx.clone();
            async move { tx.send(orders.len()).is_ok() }
        })
        .await
        .expect("subscribe");

    let publisher = MessagePublisher::with_connection(connection(&url), "orders");
    let batch: Vec<_> = (1..=3).map(|order_id| OrderCreated { order_id }).collect();
    let result = publisher.publish_batch(&batch, "orders.batch", None).await;

    assert!(result.success);
    assert_eq!(result.subscriber_count, Some(3));
    let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("batch not delivered");
    assert_eq!(received, Some(3));
}

#[tokio::test]
async fn test_reregisters_after_broker_closes_connection() {
    let broker = Arc::new(BrokerState::new());
    let url = start_broker(broker.clone()).await;
    let publisher = MessagePublisher::with_connection(connection(&url), "orders");
    let mut lifecycle = publisher.lifecycle();

    assert!(publisher.publish(&OrderCreated { order_id: 1 }, "t", None).await.success);
    let first = broker.connections_for_service("orders");
    assert_eq!(first.len(), 1);

    broker.close_all();

    let event = tokio::time::timeout(Duration::from_secs(2), lifecycle.recv())
        .await
        .expect("no lifecycle event")
        .unwrap();
    assert_eq!(event, ConnectionEvent::Reconnecting);

    wait_until(|| {
        let current = broker.connections_for_service("orders");
        publisher.connection().is_connected() && current.len() == 1 && current != first
    })
    .await;

    // registered again before being reported as connected
    assert!(publisher.publish(&OrderCreated { order_id: 2 }, "t", None).await.success);
}

#[tokio::test]
async fn test_close_is_final() {
    let broker = Arc::new(BrokerState::new());
    let url = start_broker(broker.clone()).await;
    let publisher = MessagePublisher::with_connection(connection(&url), "orders");
    let mut lifecycle = publisher.lifecycle();

    assert!(publisher.publish(&OrderCreated { order_id: 1 }, "t", None).await.success);
    publisher.close();
    publisher.close();

    assert_eq!(lifecycle.recv().await.unwrap(), ConnectionEvent::Closed);
    assert_eq!(publisher.connection().state(), ConnectionState::Closed);

    let result = publisher.publish(&OrderCreated { order_id: 2 }, "t", None).await;
    assert!(!result.success);
    wait_until(|| broker.connection_count() == 0).await;
}

#[tokio::test]
async fn test_socket_lost_during_reconnect_is_not_reported_connected() {
    let (url, drop_first) = flaky_broker().await;
    let publisher = MessagePublisher::with_connection(connection(&url), "orders");
    let mut lifecycle = publisher.lifecycle();

    publisher.ensure_connected().await.expect("first connect");
    drop_first.send(()).unwrap();

    let mut events = Vec::new();
    loop {
        let event = next_event(&mut lifecycle).await;
        events.push(event.clone());
        if event == ConnectionEvent::Closed {
            break;
        }
    }

    assert_eq!(events, vec![ConnectionEvent::Reconnecting, ConnectionEvent::Closed]);
    assert_eq!(publisher.connection().state(), ConnectionState::Disconnected);

    let result = publisher.publish(&OrderCreated { order_id: 1 }, "t", None).await;
    assert!(!result.success);
    assert_eq!(publisher.connection().state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_consumer_resubscribes_after_reconnect() {
    let broker = Arc::new(BrokerState::new());
    let url = start_broker(broker.clone()).await;

    let consumer = MessageConsumer::with_connection(connection(&url), "billing");
    let mut lifecycle = consumer.connection().lifecycle();
    let (tx, mut rx) = mpsc::unbounded_channel();
    consumer
        .subscribe("orders.created", move |order: OrderCreated, _| {
            let tx = tx.clone();
            async move { tx.send(order.order_id).is_ok() }
        })
        .await
        .expect("subscribe");
    let first = broker.subscribers("orders.created");
    assert_eq!(first.len(), 1);

    broker.close_all();
    assert_eq!(next_event(&mut lifecycle).await, ConnectionEvent::Reconnecting);
    assert_eq!(next_event(&mut lifecycle).await, ConnectionEvent::Reconnected);

    // the old socket is detached asynchronously; the new one is subscribed
    wait_until(|| {
        let current = broker.connections_for_service("billing");
        current.len() == 1 && current != first && broker.subscribers("orders.created") == current
    })
    .await;

    let publisher = MessagePublisher::with_connection(connection(&url), "orders");
    let result = publisher
        .publish(&OrderCreated { order_id: 9 }, "orders.created", None)
        .await;
    assert!(result.success);

    let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("message not delivered after reconnect");
    assert_eq!(received, Some(9));
}

#[tokio::test]
async fn test_concurrent_publishes_share_one_connect() {
    let broker = Arc::new(BrokerState::new());
    let url = start_broker(broker.clone()).await;
    let publisher = MessagePublisher::with_connection(connection(&url), "orders");

    let orders: Vec<_> = (1..=8).map(|order_id| OrderCreated { order_id }).collect();
    let results = join_all(orders.iter().map(|order| publisher.publish(order, "t", None))).await;

    assert!(results.iter().all(|result| result.success), "{results:?}");
    assert_eq!(broker.connections_for_service("orders").len(), 1);
    assert_eq!(broker.connection_count(), 1);
}
