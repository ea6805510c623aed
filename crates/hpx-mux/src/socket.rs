//! The socket seam.
//!
//! The manager never touches a WebSocket library directly: it asks a
//! [`Connector`] for a [`SocketParts`] pair and drives the halves from a
//! per-socket task. [`TungsteniteConnector`] is the production connector;
//! tests plug in an in-memory one.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{SinkExt, Stream, StreamExt, stream::SplitSink};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream,
    tungstenite::{
        Message,
        client::IntoClientRequest,
        http::HeaderValue,
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};
use tracing::debug;
use url::Url;

use crate::{
    error::{TransportError, TransportResult},
    frame::Inbound,
    types::ConnectionId,
};

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Close frame without a status code.
pub const CLOSE_NO_STATUS: u16 = 1005;
/// The socket went away without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Everything a connector needs to dial one socket.
#[derive(Clone, Debug)]
pub struct SocketRequest {
    /// Logical connection being dialled.
    pub connection_id: ConnectionId,
    /// Fully resolved URL, including query parameters.
    pub url: Url,
    /// Sub-protocols to offer.
    pub protocols: Vec<String>,
}

/// One item read from a socket.
#[derive(Clone, Debug)]
pub enum SocketInput {
    /// Application data.
    Message(Inbound),
    /// The peer sent a close frame.
    Close {
        /// Close status code.
        code: u16,
        /// Close reason.
        reason: String,
    },
}

/// Write half of a socket.
#[async_trait]
pub trait SocketWriter: Send {
    /// Write one text frame.
    async fn send_text(&mut self, text: String) -> TransportResult<()>;

    /// Send a close frame.
    async fn close(&mut self, code: u16, reason: &str) -> TransportResult<()>;
}

/// Read half of a socket. Ends when the transport is gone.
pub type SocketReader = Pin<Box<dyn Stream<Item = TransportResult<SocketInput>> + Send>>;

/// An open socket.
pub struct SocketParts {
    /// Write half.
    pub writer: Box<dyn SocketWriter>,
    /// Read half.
    pub reader: SocketReader,
}

/// Opens sockets.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Complete the handshake for `request`.
    async fn connect(&self, request: SocketRequest) -> TransportResult<SocketParts>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connector backed by `tokio-tungstenite`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TungsteniteConnector;

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, request: SocketRequest) -> TransportResult<SocketParts> {
        let mut client_request = request
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::websocket(e.to_string()))?;

        if !request.protocols.is_empty() {
            let value = HeaderValue::from_str(&request.protocols.join(", "))
                .map_err(|e| TransportError::config(format!("Invalid sub-protocol: {e}")))?;
            client_request
                .headers_mut()
                .insert("Sec-WebSocket-Protocol", value);
        }

        debug!(connection_id = %request.connection_id, url = %request.url, "Dialling WebSocket");
        let (stream, _response) = tokio_tungstenite::connect_async(client_request)
            .await
            .map_err(|e| TransportError::websocket(e.to_string()))?;

        let (write, read) = stream.split();
        let reader = read.filter_map(|item| async move {
            match item {
                Ok(Message::Text(text)) => Some(Ok(SocketInput::Message(Inbound::Text(
                    text.as_str().to_owned(),
                )))),
                Ok(Message::Binary(data)) => {
                    Some(Ok(SocketInput::Message(Inbound::Binary(data.to_vec()))))
                }
                Ok(Message::Close(frame)) => Some(Ok(match frame {
                    Some(frame) => SocketInput::Close {
                        code: u16::from(frame.code),
                        reason: frame.reason.as_str().to_owned(),
                    },
                    None => SocketInput::Close {
                        code: CLOSE_NO_STATUS,
                        reason: String::new(),
                    },
                })),
                // Ping replies are queued by tungstenite itself.
                Ok(_) => None,
                Err(e) => Some(Err(TransportError::websocket(e.to_string()))),
            }
        });

        Ok(SocketParts {
            writer: Box::new(TungsteniteWriter { sink: write }),
            reader: Box::pin(reader),
        })
    }
}

struct TungsteniteWriter {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl SocketWriter for TungsteniteWriter {
    async fn send_text(&mut self, text: String) -> TransportResult<()> {
        self.sink
            .send(Message::text(text))
            .await
            .map_err(|e| TransportError::websocket(e.to_string()))
    }

    async fn close(&mut self, code: u16, reason: &str) -> TransportResult<()> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.into(),
        };
        self.sink
            .send(Message::Close(Some(frame)))
            .await
            .map_err(|e| TransportError::websocket(e.to_string()))
    }
}
