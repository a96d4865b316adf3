//! Upgrade multiplexing: many WebSocket endpoints on one listener.
//!
//! The HTTP server hands every upgrade request here instead of to the
//! router. Endpoints are matched by exact path (query string already
//! stripped, trailing slash significant) in registration order; the first
//! match performs the RFC 6455 handshake and receives the connection. An
//! upgrade nobody claims is shut down immediately so the peer does not wait
//! for a handshake that will never come.

use std::{future::Future, pin::Pin, sync::Arc};

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use uuid::Uuid;

use super::UpgradeError;
use super::connection::{Connection, read_loop, write_loop};
use super::registry::BroadcastRegistry;
use crate::http::{Method, Request, Response, StatusCode};

/// Type-erased connect callback.
pub type ConnectHandler =
    Arc<dyn Fn(Connection) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync + 'static>;

/// Conversion trait for async connect callbacks, mirroring
/// [`IntoHandler`](crate::middleware::IntoHandler).
pub trait IntoConnectHandler: Send + Sync + 'static {
    fn call(&self, connection: Connection) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

impl<T, F> IntoConnectHandler for T
where
    T: Fn(Connection) -> F + Send + Sync + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    fn call(&self, connection: Connection) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin((self)(connection))
    }
}

/// A path accepting upgrades, paired with its connect callback.
pub struct UpgradeEndpoint {
    path: String,
    on_connect: ConnectHandler,
}

impl UpgradeEndpoint {
    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Routing table for upgrade requests, separate from the HTTP router.
pub struct Multiplexer {
    endpoints: Vec<UpgradeEndpoint>,
    registry: BroadcastRegistry,
}

impl Multiplexer {
    /// Accepted connections are tracked in `registry`.
    pub fn new(registry: BroadcastRegistry) -> Self {
        Self {
            endpoints: Vec::new(),
            registry,
        }
    }

    /// Registers `on_connect` for upgrades to exactly `path`.
    ///
    /// # Errors
    ///
    /// [`UpgradeError::InvalidPath`] if `path` does not start with `/` or
    /// carries a query string; [`UpgradeError::DuplicateEndpoint`] if `path`
    /// is already taken, since a second registration could never match.
    pub fn register(
        &mut self,
        path: &str,
        on_connect: impl IntoConnectHandler,
    ) -> Result<(), UpgradeError> {
        if !path.starts_with('/') || path.contains('?') {
            return Err(UpgradeError::InvalidPath(path.to_owned()));
        }
        if self.find(path).is_some() {
            return Err(UpgradeError::DuplicateEndpoint(path.to_owned()));
        }

        let on_connect: ConnectHandler = Arc::new(move |conn| on_connect.call(conn));
        self.endpoints.push(UpgradeEndpoint {
            path: path.to_owned(),
            on_connect,
        });
        tracing::debug!(path, "websocket endpoint registered");
        Ok(())
    }

    /// The endpoint claiming `path`, if any.
    pub fn find(&self, path: &str) -> Option<&UpgradeEndpoint> {
        self.endpoints.iter().find(|e| e.path == path)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Handles one upgrade request on `stream`.
    ///
    /// `buffered` holds any bytes already read past the request head; they are
    /// the first WebSocket frames. Returns `Ok(true)` once the handshake is
    /// done and the session task is spawned, `Ok(false)` when no endpoint
    /// matched and the socket was shut down.
    ///
    /// # Errors
    ///
    /// [`UpgradeError::Handshake`] when the request is not a valid WebSocket
    /// opening handshake (the client gets a 400 and the socket is closed), or
    /// [`UpgradeError::Io`] if writing the handshake response fails.
    pub async fn handle_upgrade(
        &self,
        request: Request,
        mut stream: TcpStream,
        buffered: Vec<u8>,
    ) -> Result<bool, UpgradeError> {
        let path = request.path().to_owned();

        let Some(endpoint) = self.find(&path) else {
            tracing::warn!(path = %path, peer = ?request.peer_addr(), "no websocket endpoint, closing");
            let _ = stream.shutdown().await;
            return Ok(false);
        };

        let accept = match accept_key(&request) {
            Ok(accept) => accept,
            Err((status, reason)) => {
                let response = Response::new(status)
                    .header("Sec-WebSocket-Version", "13")
                    .body(reason)
                    .keep_alive(false);
                stream.write_all(&response.into_bytes()).await?;
                let _ = stream.shutdown().await;
                return Err(UpgradeError::Handshake(reason));
            }
        };

        let response = Response::new(StatusCode::SwitchingProtocols)
            .header("Upgrade", "websocket")
            .header("Connection", "Upgrade")
            .header("Sec-WebSocket-Accept", accept);
        stream.write_all(&response.into_bytes()).await?;
        stream.flush().await?;

        let socket = WebSocketStream::from_partially_read(stream, buffered, Role::Server, None).await;
        let (sink, stream) = socket.split();
        let (outbound, queue) = mpsc::unbounded_channel();
        let (forward, inbound) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();

        self.registry.on_connect(&path, id, outbound.clone());
        let writer = tokio::spawn(write_loop(id, sink, queue));
        let reader = tokio::spawn(read_loop(id, stream, forward));
        tracing::info!(path = %path, connection = %id, peer = ?request.peer_addr(), "websocket connected");

        // The peer going away unregisters the connection even if the callback
        // never reads from it.
        let registry = self.registry.clone();
        let watched = path.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = reader => {}
                _ = writer => {}
            }
            if registry.on_close(&watched, id) {
                tracing::info!(path = %watched, connection = %id, "websocket peer gone");
            }
        });

        let connection = Connection::new(id, path.clone(), request, outbound, inbound);
        let on_connect = Arc::clone(&endpoint.on_connect);
        let registry = self.registry.clone();

        tokio::spawn(async move {
            on_connect(connection).await;
            registry.on_close(&path, id);
            tracing::info!(path = %path, connection = %id, "websocket session ended");
        });

        Ok(true)
    }
}

// Validates the opening handshake and derives `Sec-WebSocket-Accept`.
fn accept_key(request: &Request) -> Result<String, (StatusCode, &'static str)> {
    if request.method() != &Method::Get {
        return Err((StatusCode::BadRequest, "websocket upgrade must use GET"));
    }
    if request.headers().get("sec-websocket-version").map(str::trim) != Some("13") {
        return Err((StatusCode::BadRequest, "unsupported websocket version"));
    }
    let key = request
        .headers()
        .get("sec-websocket-key")
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .ok_or((StatusCode::BadRequest, "missing Sec-WebSocket-Key"))?;
    Ok(derive_accept_key(key.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handshake(version: &str, key: Option<&str>) -> Request {
        let mut req = Request::new(Method::Get, "/chat")
            .header("Upgrade", "websocket")
            .header("Connection", "Upgrade")
            .header("Sec-WebSocket-Version", version);
        if let Some(key) = key {
            req = req.header("Sec-WebSocket-Key", key);
        }
        req
    }

    #[test]
    fn accept_key_matches_rfc_sample() {
        let req = handshake("13", Some("dGhlIHNhbXBsZSBub25jZQ=="));
        assert_eq!(accept_key(&req).unwrap(), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn handshake_failures() {
        assert_eq!(accept_key(&handshake("8", Some("x"))).unwrap_err().1, "unsupported websocket version");
        assert_eq!(accept_key(&handshake("13", None)).unwrap_err().0, StatusCode::BadRequest);
        let post = Request::new(Method::Post, "/chat").header("Sec-WebSocket-Version", "13");
        assert_eq!(accept_key(&post).unwrap_err().0, StatusCode::BadRequest);
    }

    #[test]
    fn exact_match_first_registration() {
        let mut mux = Multiplexer::new(BroadcastRegistry::new());
        mux.register("/chat", |_conn| async {}).unwrap();
        mux.register("/metrics", |_conn| async {}).unwrap();
        assert_eq!(mux.find("/chat").map(UpgradeEndpoint::path), Some("/chat"));
        assert!(mux.find("/chat/").is_none());
        assert!(mux.find("/other").is_none());
        assert_eq!(mux.len(), 2);
    }

    #[test]
    fn registration_errors() {
        let mut mux = Multiplexer::new(BroadcastRegistry::new());
        mux.register("/chat", |_conn| async {}).unwrap();
        assert!(matches!(
            mux.register("/chat", |_conn| async {}),
            Err(UpgradeError::DuplicateEndpoint(p)) if p == "/chat"
        ));
        assert!(matches!(mux.register("chat", |_conn| async {}), Err(UpgradeError::InvalidPath(_))));
        assert!(matches!(mux.register("/chat?x=1", |_conn| async {}), Err(UpgradeError::InvalidPath(_))));
    }
}
