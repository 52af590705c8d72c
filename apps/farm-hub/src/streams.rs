//! WebSocket pass-through from UI clients to a provider's live screen streams.

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::error::GridError;

pub type Upstream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// `http://host/…` → `ws://host/…`, `https` → `wss`.
pub fn websocket_url(http_url: &str) -> String {
    if let Some(rest) = http_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = http_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        http_url.to_string()
    }
}

/// Dials the provider before the client upgrade completes, so an unreachable
/// stream is reported as a normal error response.
pub async fn connect(url: &str) -> Result<Upstream, GridError> {
    let (upstream, _) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|err| GridError::Stream(format!("{url}: {err}")))?;
    Ok(upstream)
}

/// Copies data frames both ways until either side closes.
pub async fn pump(client: WebSocket, upstream: Upstream) {
    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    let to_client = async {
        while let Some(Ok(message)) = upstream_rx.next().await {
            let message = match message {
                UpstreamMessage::Binary(data) => Message::Binary(data.to_vec()),
                UpstreamMessage::Text(text) => Message::Text(text.as_str().to_owned()),
                UpstreamMessage::Close(_) => break,
                _ => continue,
            };
            if client_tx.send(message).await.is_err() {
                return;
            }
        }
        let _ = client_tx.send(Message::Close(None)).await;
    };
    let to_upstream = async {
        while let Some(Ok(message)) = client_rx.next().await {
            let message = match message {
                Message::Binary(data) => UpstreamMessage::Binary(data.into()),
                Message::Text(text) => UpstreamMessage::Text(text.into()),
                Message::Close(_) => break,
                _ => continue,
            };
            if upstream_tx.send(message).await.is_err() {
                return;
            }
        }
        let _ = upstream_tx.close().await;
    };

    tokio::select! {
        _ = to_client => debug!("device stream ended upstream"),
        _ = to_upstream => debug!("device stream closed by client"),
    }
}
