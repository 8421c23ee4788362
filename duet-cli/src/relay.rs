//! WebSocket signaling relay
//!
//! Each connection registers one identity with its first frame. Signal
//! frames are forwarded to the connection registered under the message's
//! `to` identity; if nobody is registered the sender gets an error frame.

use anyhow::Result;
use duet_core::{PeerIdentity, RelayFrame, SignalingMessage, UserId};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message as WsMessage};

type Outbox = mpsc::UnboundedSender<String>;
type Routes = Arc<RwLock<HashMap<String, Outbox>>>;

/// Bind `addr` and serve until the process exits
pub async fn run(addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve(listener).await
}

/// Serve relay connections on an already bound listener
pub async fn serve(listener: TcpListener) -> Result<()> {
    let routes: Routes = Arc::new(RwLock::new(HashMap::new()));
    tracing::info!(addr = %listener.local_addr()?, "Signaling relay listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        let routes = Arc::clone(&routes);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, routes).await {
                tracing::debug!(%peer, error = %e, "Relay connection ended with error");
            }
        });
    }
}

fn error_frame(message: impl Into<String>) -> Option<String> {
    RelayFrame::<UserId>::Error {
        message: message.into(),
    }
    .encode()
    .ok()
}

async fn handle_connection(stream: TcpStream, routes: Routes) -> Result<()> {
    let ws = accept_async(stream).await?;
    let (mut write, mut read) = ws.split();

    let user = loop {
        match read.next().await {
            Some(Ok(WsMessage::Text(text))) => match RelayFrame::<UserId>::decode(&text) {
                Ok(RelayFrame::Register { user }) => break user,
                Ok(_) | Err(_) => {
                    if let Some(frame) = error_frame("register before sending signals") {
                        write.send(WsMessage::Text(frame)).await?;
                    }
                }
            },
            Some(Ok(WsMessage::Close(_))) | None => return Ok(()),
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
        }
    };

    let key = user.unique_id();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    if routes.write().insert(key.clone(), tx.clone()).is_some() {
        tracing::info!(%user, "Identity re-registered; previous connection replaced");
    } else {
        tracing::info!(%user, "Identity registered");
    }

    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if write.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = read.next().await {
        match msg {
            Ok(WsMessage::Text(text)) => match RelayFrame::<UserId>::decode(&text) {
                Ok(RelayFrame::Signal(message)) => forward(&routes, &user, message, &tx),
                Ok(_) => {
                    if let Some(frame) = error_frame("unexpected frame") {
                        let _ = tx.send(frame);
                    }
                }
                Err(e) => {
                    if let Some(frame) = error_frame(e.to_string()) {
                        let _ = tx.send(frame);
                    }
                }
            },
            Ok(WsMessage::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    {
        let mut routes = routes.write();
        if routes.get(&key).is_some_and(|current| current.same_channel(&tx)) {
            routes.remove(&key);
        }
    }
    writer.abort();
    tracing::info!(%user, "Identity unregistered");
    Ok(())
}

fn forward(routes: &Routes, sender: &UserId, message: SignalingMessage<UserId>, reply: &Outbox) {
    if &message.from != sender {
        if let Some(frame) = error_frame(format!("sender mismatch: registered as {sender}")) {
            let _ = reply.send(frame);
        }
        return;
    }

    let recipient = message.to.clone();
    let kind = message.payload.kind();
    let delivered = match RelayFrame::Signal(message).encode() {
        Ok(text) => routes
            .read()
            .get(&recipient.unique_id())
            .is_some_and(|route| route.send(text).is_ok()),
        Err(e) => {
            tracing::warn!(error = %e, "Dropping unencodable signal");
            false
        }
    };

    if delivered {
        tracing::debug!(from = %sender, to = %recipient, kind, "Signal forwarded");
    } else {
        tracing::debug!(from = %sender, to = %recipient, kind, "Recipient offline");
        if let Some(frame) = error_frame(format!("recipient offline: {recipient}")) {
            let _ = reply.send(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duet_core::{CallId, EndReason, SignalPayload, SignalingTransport, WebSocketTransport};
    use std::time::Duration;

    async fn start_relay() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener));
        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn relay_forwards_between_registered_clients() {
        let url = start_relay().await;
        let alice = WebSocketTransport::connect(&url, UserId::new("alice")).await.unwrap();
        let bob = WebSocketTransport::connect(&url, UserId::new("bob")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let message = SignalingMessage::new(
            UserId::new("alice"),
            UserId::new("bob"),
            SignalPayload::end(CallId::new(), EndReason::Hangup),
        );
        alice.send_message(&UserId::new("bob"), message.clone()).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(2), bob.receive_message())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, message);
    }

    #[tokio::test]
    async fn relay_drops_spoofed_sender() {
        let url = start_relay().await;
        let mallory = WebSocketTransport::connect(&url, UserId::new("mallory")).await.unwrap();
        let bob = WebSocketTransport::connect(&url, UserId::new("bob")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let spoofed = SignalingMessage::new(
            UserId::new("alice"),
            UserId::new("bob"),
            SignalPayload::end(CallId::new(), EndReason::Hangup),
        );
        mallory.send_message(&UserId::new("bob"), spoofed).await.unwrap();

        let received =
            tokio::time::timeout(Duration::from_millis(300), bob.receive_message()).await;
        assert!(received.is_err());
    }

    #[tokio::test]
    async fn offline_recipient_keeps_sender_connected() {
        let url = start_relay().await;
        let alice = WebSocketTransport::connect(&url, UserId::new("alice")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let message = SignalingMessage::new(
            UserId::new("alice"),
            UserId::new("bob"),
            SignalPayload::end(CallId::new(), EndReason::Cancelled),
        );
        alice.send_message(&UserId::new("bob"), message).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(alice.is_connected());
    }
}
