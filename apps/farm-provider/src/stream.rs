//! Screen stream relays: WebSocket passthrough and MJPEG over HTTP.

use std::convert::Infallible;
use std::net::{Ipv4Addr, SocketAddr};

use axum::body::Body;
use axum::extract::ws::{Message, WebSocket};
use axum::http::{header, HeaderValue};
use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use futures_util::{stream, StreamExt};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::jpeg::{multipart_content_type, multipart_part, JpegFramer};

/// Frames buffered between the source reader and the client writer.
pub const FRAME_BUFFER: usize = 15;

/// Where a device's frames come from.
#[derive(Debug, Clone)]
pub enum StreamSource {
    /// Android stream agent, forwarded by adb and spoken to over WebSocket.
    WebSocket { port: u16 },
    /// iOS broadcast stream, forwarded as raw TCP.
    Tcp { port: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Pass source chunks through untouched.
    Raw,
    /// Cut the byte stream into whole JPEG images.
    Jpeg { max_frame: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("upstream websocket: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("upstream tcp: {0}")]
    Io(#[from] std::io::Error),
}

/// Starts reading `source` into a bounded channel. The reader stops when the
/// device scope ends, the client goes away, or the source closes.
pub fn open(source: StreamSource, framing: Framing, scope: CancellationToken) -> mpsc::Receiver<Bytes> {
    let (tx, rx) = mpsc::channel(FRAME_BUFFER);
    tokio::spawn(async move {
        let outcome = tokio::select! {
            _ = scope.cancelled() => Ok(()),
            outcome = pump(source.clone(), framing, tx) => outcome,
        };
        match outcome {
            Ok(()) => debug!(?source, "stream source closed"),
            Err(err) => info!(?source, error = %err, "stream source failed"),
        }
    });
    rx
}

async fn pump(source: StreamSource, framing: Framing, tx: mpsc::Sender<Bytes>) -> Result<(), StreamError> {
    let mut framer = match framing {
        Framing::Raw => None,
        Framing::Jpeg { max_frame } => Some(JpegFramer::new(max_frame)),
    };
    match source {
        StreamSource::WebSocket { port } => {
            let (mut upstream, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}")).await?;
            while let Some(message) = upstream.next().await {
                let data = match message? {
                    UpstreamMessage::Binary(data) => data,
                    UpstreamMessage::Close(_) => break,
                    _ => continue,
                };
                if !deliver(&mut framer, data, &tx).await {
                    let _ = upstream.close(None).await;
                    break;
                }
            }
        }
        StreamSource::Tcp { port } => {
            let mut upstream = TcpStream::connect(SocketAddr::from((Ipv4Addr::LOCALHOST, port))).await?;
            let mut buf = BytesMut::with_capacity(64 * 1024);
            loop {
                buf.reserve(64 * 1024);
                if upstream.read_buf(&mut buf).await? == 0 {
                    break;
                }
                if !deliver(&mut framer, buf.split().freeze(), &tx).await {
                    break;
                }
            }
        }
    }
    Ok(())
}

/// False once the client side is gone.
async fn deliver(framer: &mut Option<JpegFramer>, chunk: Bytes, tx: &mpsc::Sender<Bytes>) -> bool {
    match framer {
        None => tx.send(chunk).await.is_ok(),
        Some(framer) => {
            for frame in framer.push(&chunk) {
                if tx.send(frame).await.is_err() {
                    return false;
                }
            }
            true
        }
    }
}

/// Writes every frame to the client as a binary message.
pub async fn relay_to_socket(mut socket: WebSocket, mut frames: mpsc::Receiver<Bytes>) {
    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Some(frame) => {
                    if socket.send(Message::Binary(frame.to_vec())).await.is_err() {
                        return;
                    }
                }
                None => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                Some(Ok(_)) => {}
            },
        }
    }
    let _ = socket.send(Message::Close(None)).await;
}

/// Streams frames as `multipart/x-mixed-replace` JPEG parts.
pub fn mjpeg_response(frames: mpsc::Receiver<Bytes>) -> Response {
    let parts = stream::unfold(frames, |mut frames| async move {
        let frame = frames.recv().await?;
        Some((Ok::<_, Infallible>(multipart_part(&frame)), frames))
    });
    let mut response = Body::from_stream(parts).into_response();
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&multipart_content_type()) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}
