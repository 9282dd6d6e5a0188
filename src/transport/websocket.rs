//! WebSocket transport
//!
//! This file implements the broker's WebSocket server. Responsibilities:
//! - Accept TCP/WebSocket connections and attach each one to the `BrokerState`
//! - Run one writer task per connection that drains the connection's channel
//! - Decode client frames and translate them into broker operations
//! - Answer invocations with a `completion` frame
//! - Detach the connection exactly once when the socket closes
//!
//! A malformed frame or a failing operation is reported back to the client and
//! never closes the connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::spawn;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::connection::Connection;
use crate::broker::engine::BrokerState;
use crate::broker::message::Envelope;
use crate::transport::message::{ClientMessage, Invocation, ServerMessage};

/// Bind `addr` and serve until the listener fails.
pub async fn start_websocket_server(addr: &str, broker: Arc<BrokerState>) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("WebSocket server listening on ws://{}", listener.local_addr()?);
    serve(listener, broker).await
}

/// Accept connections on an already bound listener.
pub async fn serve(listener: TcpListener, broker: Arc<BrokerState>) -> std::io::Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                spawn(handle_connection(stream, peer, broker.clone()));
            }
            Err(e) => {
                // accept errors (e.g. fd exhaustion) are transient
                error!("accept failed: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, broker: Arc<BrokerState>) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%peer, "WebSocket handshake error: {e}");
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    let connection = Connection::new(tx);
    let connection_id = connection.id.clone();

    if !broker.attach(connection) {
        let refusal = ServerMessage::Error {
            message: "broker at connection limit".to_string(),
        };
        if let Ok(text) = serde_json::to_string(&refusal) {
            let _ = ws_sender.send(WsMessage::text(text)).await;
        }
        let _ = ws_sender.send(WsMessage::Close(None)).await;
        return;
    }
    debug!(%peer, connection_id, "connection attached");

    {
        let connection_id = connection_id.clone();
        spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = msg.is_close();
                if let Err(e) = ws_sender.send(msg).await {
                    debug!(connection_id, "failed to send frame: {e}");
                    break;
                }
                if closing {
                    break;
                }
            }
            debug!(connection_id, "send loop closed");
        });
    }

    while let Some(frame) = ws_receiver.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => handle_text(&broker, &connection_id, &text),
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(connection_id, "read error: {e}");
                break;
            }
        }
    }

    // dropping the registration also drops the channel sender, ending the send loop
    broker.detach(&connection_id);
}

/// Decode one text frame and run it against the broker.
pub fn handle_text(broker: &BrokerState, connection_id: &str, text: &str) {
    let invocation = match serde_json::from_str::<Invocation>(text) {
        Ok(invocation) => invocation,
        Err(err) => {
            warn!(
                connection_id,
                "invalid client message: {err} | {}",
                text.chars().take(100).collect::<String>()
            );
            broker.notify_or_log(
                connection_id,
                &ServerMessage::Error {
                    message: format!("invalid message: {err}"),
                },
            );
            return;
        }
    };

    let Invocation {
        invocation_id,
        message,
    } = invocation;
    let outcome = dispatch(broker, connection_id, message);

    if let Some(invocation_id) = invocation_id {
        broker.complete(connection_id, invocation_id, outcome.err());
    }
}

fn dispatch(broker: &BrokerState, connection_id: &str, message: ClientMessage) -> Result<(), String> {
    match message {
        ClientMessage::RegisterService { service_name } => {
            broker.register_service(connection_id, &service_name);
            Ok(())
        }
        ClientMessage::SubscribeToTopic { topic } => {
            broker.subscribe(connection_id, &topic);
            Ok(())
        }
        ClientMessage::UnsubscribeFromTopic { topic } => {
            broker.unsubscribe(connection_id, &topic);
            Ok(())
        }
        ClientMessage::PublishMessage {
            topic,
            message_type,
            message_payload,
            metadata,
        } => broker
            .publish(
                connection_id,
                Envelope {
                    topic,
                    message_type,
                    message_payload,
                    metadata,
                },
            )
            .map(|_| ())
            .map_err(|e| e.to_string()),
    }
}
