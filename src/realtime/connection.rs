//! One live WebSocket session.

use std::net::SocketAddr;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::http::Request;

/// Identifies a connection inside the broadcast registry.
pub type ConnectionId = Uuid;

/// Outbound half shared between a [`Connection`] and the registry.
pub type Outbound = mpsc::UnboundedSender<Message>;

/// Data frames forwarded by the reader task.
pub(crate) type Inbound = mpsc::UnboundedReceiver<Message>;

/// The connection's writer task has ended; the peer is gone.
#[derive(Debug, Error)]
#[error("connection {0} is closed")]
pub struct DeliveryError(pub ConnectionId);

/// A WebSocket session handed to an endpoint's connect callback.
///
/// Frames sent with [`send`](Self::send) are queued on an unbounded channel
/// and written by a dedicated writer task, so sending never blocks the
/// caller. Once the peer disappears the writer task exits and every further
/// send fails with [`DeliveryError`].
///
/// The socket is read by the engine whether or not the callback ever calls
/// [`recv`](Self::recv); data frames wait in a queue until it does.
pub struct Connection {
    id: ConnectionId,
    path: String,
    request: Request,
    outbound: Outbound,
    inbound: Inbound,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        path: String,
        request: Request,
        outbound: Outbound,
        inbound: Inbound,
    ) -> Self {
        Self {
            id,
            path,
            request,
            outbound,
            inbound,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The endpoint path that accepted this connection.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.request.peer_addr()
    }

    /// The upgrade request, for headers and query parameters.
    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn send(&self, text: impl Into<String>) -> Result<(), DeliveryError> {
        self.send_message(Message::text(text.into()))
    }

    pub fn send_binary(&self, data: impl Into<Vec<u8>>) -> Result<(), DeliveryError> {
        self.send_message(Message::binary(data.into()))
    }

    pub fn send_message(&self, message: Message) -> Result<(), DeliveryError> {
        self.outbound
            .send(message)
            .map_err(|_| DeliveryError(self.id))
    }

    /// Waits for the next text or binary message.
    ///
    /// Returns `None` once the peer closes or the socket fails. Control frames
    /// are handled by the protocol layer and never surface here.
    pub async fn recv(&mut self) -> Option<Message> {
        self.inbound.recv().await
    }

    /// Like [`recv`](Self::recv) but yields text only; binary frames are skipped.
    pub async fn recv_text(&mut self) -> Option<String> {
        loop {
            match self.recv().await? {
                Message::Text(text) => return Some(text.as_str().to_owned()),
                _ => continue,
            }
        }
    }

    /// Sends a close frame. The writer task exits after flushing it.
    pub fn close(&self) {
        let _ = self.outbound.send(Message::Close(None));
    }
}

/// Reads the socket until the peer closes or a read fails, forwarding text and
/// binary frames to `inbound`. Keeps reading after the receiver is gone so
/// pings are still answered.
pub(crate) async fn read_loop(
    id: ConnectionId,
    mut stream: SplitStream<WebSocketStream<TcpStream>>,
    inbound: mpsc::UnboundedSender<Message>,
) {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(message @ (Message::Text(_) | Message::Binary(_))) => {
                let _ = inbound.send(message);
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(connection = %id, error = %e, "websocket read failed");
                break;
            }
        }
    }
    tracing::debug!(connection = %id, "reader task finished");
}

/// Drains `outbound` into the socket until the channel closes, a close frame
/// has been written, or a write fails.
pub(crate) async fn write_loop(
    id: ConnectionId,
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(message) = outbound.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(e) = sink.send(message).await {
            tracing::debug!(connection = %id, error = %e, "websocket write failed");
            break;
        }
        if closing {
            break;
        }
    }
    outbound.close();
    let _ = sink.close().await;
    tracing::debug!(connection = %id, "writer task finished");
}
