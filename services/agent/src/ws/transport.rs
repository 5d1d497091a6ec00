//! The socket to the voice agent service.
//!
//! The session engine works against [`FrameSink`] and [`FrameStream`] rather
//! than a concrete websocket, so the protocol can be exercised in memory.

use super::protocol::OutboundMessage;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use secrecy::{ExposeSecret, SecretString};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{self, client::IntoClientRequest, protocol::Message},
};
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("Failed to encode message: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Invalid header value: {0}")]
    InvalidHeader(String),
    #[error("Connection is closed")]
    Closed,
    #[error("Timed out waiting for the connection to close")]
    CloseTimeout,
}

/// One message on the socket.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;
    async fn close(&mut self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait FrameStream: Send {
    /// The next text or binary message. `None` once the peer has closed.
    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>>;
}

/// Opens the socket to the agent service.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        url: &str,
        api_key: &SecretString,
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>), TransportError>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects with `tokio-tungstenite`, authenticating with `Authorization: Token <key>`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(
        &self,
        url: &str,
        api_key: &SecretString,
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>), TransportError> {
        let mut request = url.into_client_request()?;
        let authorization = format!("Token {}", api_key.expose_secret())
            .parse::<tungstenite::http::HeaderValue>()
            .map_err(|e| TransportError::InvalidHeader(e.to_string()))?;
        request.headers_mut().insert("Authorization", authorization);

        let (ws_stream, _) = connect_async(request).await?;
        info!(%url, "Connected to voice agent");
        let (sink, stream) = ws_stream.split();
        Ok((Box::new(WsSink { inner: sink }), Box::new(WsFrames { inner: stream })))
    }
}

struct WsSink {
    inner: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let message = match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Binary(data) => Message::Binary(data.into()),
        };
        self.inner.send(message).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self.inner.close().await {
            Ok(())
            | Err(tungstenite::Error::ConnectionClosed)
            | Err(tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

struct WsFrames {
    inner: SplitStream<WsStream>,
}

#[async_trait]
impl FrameStream for WsFrames {
    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>> {
        loop {
            match self.inner.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(Frame::Text(text.to_string()))),
                Ok(Message::Binary(data)) => return Some(Ok(Frame::Binary(Bytes::from(data)))),
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "Received close frame");
                    return None;
                }
                // tungstenite answers pings itself.
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => continue,
                Err(tungstenite::Error::ConnectionClosed) => return None,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

/// The write half of the socket, shared by the sender task, the receiver
/// task and the session controller.
///
/// Writes are serialized by a mutex so that a multi-message exchange (for
/// example a function response followed by an injected message) is never
/// interleaved with another writer's message. `close` only runs once; later
/// calls succeed without touching the socket.
pub struct Outbound {
    sink: Mutex<Box<dyn FrameSink>>,
    closed: AtomicBool,
}

impl Outbound {
    pub fn new(sink: Box<dyn FrameSink>) -> Self {
        Self {
            sink: Mutex::new(sink),
            closed: AtomicBool::new(false),
        }
    }

    pub async fn send_message(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        let serialized = serde_json::to_string(message)?;
        self.send(Frame::Text(serialized)).await
    }

    pub async fn send_audio(&self, frame: Bytes) -> Result<(), TransportError> {
        self.send(Frame::Binary(frame)).await
    }

    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.sink.lock().await.send(frame).await
    }

    /// Closes the socket, giving up after `timeout`. A timeout is reported
    /// but the connection is treated as closed either way.
    pub async fn close(&self, timeout: Duration) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let close = async { self.sink.lock().await.close().await };
        match tokio::time::timeout(timeout, close).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::CloseTimeout),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
