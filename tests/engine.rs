//! End-to-end tests against a real listener on 127.0.0.1:0.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use arunika::app::App;
use arunika::http::{Response, StatusCode};
use arunika::middleware::Pipeline;
use arunika::realtime::Connection;
use arunika::security::{Claims, FieldType, RateLimiter, Schema, TokenAuth, token};
use arunika::server::Server;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SECRET: &[u8] = b"supersecret";

async fn spawn(app: App) -> SocketAddr {
    let server = Server::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr();
    tokio::spawn(server.serve(app));
    addr
}

/// Sends raw request bytes and reads until the server closes the connection.
async fn exchange(addr: SocketAddr, raw: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();
    let mut buf = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut buf))
        .await
        .expect("server did not close the connection")
        .unwrap();
    String::from_utf8(buf).unwrap()
}

async fn get(addr: SocketAddr, path: &str, extra_headers: &str) -> (u16, String) {
    let raw = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n{extra_headers}Connection: close\r\n\r\n");
    let text = exchange(addr, &raw).await;
    (text[9..12].parse().unwrap(), text)
}

fn body(text: &str) -> serde_json::Value {
    let (_, body) = text.split_once("\r\n\r\n").unwrap();
    serde_json::from_str(body).unwrap()
}

async fn next_text(client: &mut Client) -> String {
    loop {
        let frame = timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for a message")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(text) = frame {
            return text.as_str().to_owned();
        }
    }
}

fn ok() -> Pipeline {
    Pipeline::new(|_ctx| async { Response::json(StatusCode::Ok, &serde_json::json!([])) })
}

#[tokio::test]
async fn unmatched_route_is_404_json() {
    let addr = spawn(App::new()).await;
    let (status, text) = get(addr, "/nope", "").await;
    assert_eq!(status, 404);
    assert_eq!(body(&text), serde_json::json!({ "error": "Not found" }));
}

#[tokio::test]
async fn scoped_token_auth() {
    let mut app = App::new();
    app.guard(TokenAuth::new(SECRET).scope("/api"));
    app.get("/api/v1/todos", ok()).unwrap();
    app.get("/open", ok()).unwrap();
    let addr = spawn(app).await;

    let (status, text) = get(addr, "/api/v1/todos", "").await;
    assert_eq!(status, 401);
    assert_eq!(body(&text)["error"], "Unauthorized");

    let (status, text) = get(addr, "/api/v1/todos", "Authorization: Bearer not.a.token\r\n").await;
    assert_eq!(status, 401);
    assert_eq!(body(&text)["error"], "Invalid token");

    let issued = token::sign(&Claims::new().with("user", "admin"), SECRET, Some(Duration::from_secs(60))).unwrap();
    let (status, _) = get(addr, "/api/v1/todos", &format!("Authorization: Bearer {issued}\r\n")).await;
    assert_eq!(status, 200);

    let (status, _) = get(addr, "/open", "").await;
    assert_eq!(status, 200);
}

#[tokio::test]
async fn rate_limit_rejects_with_retry_after() {
    let mut app = App::new();
    app.guard(RateLimiter::new(3, Duration::from_secs(60)));
    app.get("/api/v1/todos", ok()).unwrap();
    let addr = spawn(app).await;

    for remaining in ["2", "1", "0"] {
        let (status, text) = get(addr, "/api/v1/todos", "").await;
        assert_eq!(status, 200);
        assert!(text.contains(&format!("RateLimit-Remaining: {remaining}\r\n")));
    }
    let (status, text) = get(addr, "/api/v1/todos", "").await;
    assert_eq!(status, 429);
    assert!(text.contains("Retry-After: "));
    assert_eq!(body(&text)["error"], "Too many requests, please try again later.");
}

#[tokio::test]
async fn validation_failure_lists_every_error() {
    let mut app = App::new();
    app.post(
        "/api/v1/todos",
        ok().guard(
            Schema::new()
                .require("title")
                .field("title", FieldType::String)
                .field("done", FieldType::Boolean),
        ),
    )
    .unwrap();
    let addr = spawn(app).await;

    let payload = r#"{"done":"yes"}"#;
    let raw = format!(
        "POST /api/v1/todos HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{payload}",
        payload.len()
    );
    let text = exchange(addr, &raw).await;
    assert!(text.starts_with("HTTP/1.1 400 "));
    assert_eq!(
        body(&text),
        serde_json::json!({ "errors": ["title is required", "done must be boolean"] })
    );
}

#[tokio::test]
async fn pipelined_requests_on_one_connection() {
    let mut app = App::new();
    app.get("/a", ok()).unwrap();
    let addr = spawn(app).await;

    let raw = "GET /a HTTP/1.1\r\nHost: localhost\r\n\r\nGET /a HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n";
    let text = exchange(addr, raw).await;
    assert_eq!(text.matches("HTTP/1.1 200 OK\r\n").count(), 2);
}

fn counting_endpoints(chat: &Arc<AtomicUsize>, metrics: &Arc<AtomicUsize>) -> App {
    let mut app = App::new();
    let chat = Arc::clone(chat);
    app.ws("/chat", move |mut conn: Connection| {
        chat.fetch_add(1, Ordering::SeqCst);
        async move {
            let _ = conn.send("welcome:chat");
            while conn.recv().await.is_some() {}
        }
    })
    .unwrap();
    let metrics = Arc::clone(metrics);
    app.ws("/metrics", move |mut conn: Connection| {
        metrics.fetch_add(1, Ordering::SeqCst);
        async move {
            let _ = conn.send("welcome:metrics");
            while conn.recv().await.is_some() {}
        }
    })
    .unwrap();
    app
}

#[tokio::test]
async fn upgrades_reach_only_the_matching_endpoint() {
    let chat = Arc::new(AtomicUsize::new(0));
    let metrics = Arc::new(AtomicUsize::new(0));
    let addr = spawn(counting_endpoints(&chat, &metrics)).await;

    let (mut client, _) = connect_async(format!("ws://{addr}/chat")).await.unwrap();
    assert_eq!(next_text(&mut client).await, "welcome:chat");
    assert_eq!(chat.load(Ordering::SeqCst), 1);
    assert_eq!(metrics.load(Ordering::SeqCst), 0);

    let (mut client, _) = connect_async(format!("ws://{addr}/metrics?interval=5")).await.unwrap();
    assert_eq!(next_text(&mut client).await, "welcome:metrics");
    assert_eq!(metrics.load(Ordering::SeqCst), 1);

    for path in ["/other", "/chat/"] {
        let attempt = timeout(Duration::from_secs(5), connect_async(format!("ws://{addr}{path}")))
            .await
            .expect("unmatched upgrade was left open");
        assert!(attempt.is_err(), "{path} was accepted");
    }
    assert_eq!(chat.load(Ordering::SeqCst), 1);
}

const UPGRADE_HEAD: &str =
    "GET /echo HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n";

fn echo_app() -> App {
    let mut app = App::new();
    app.ws("/echo", |mut conn: Connection| async move {
        while let Some(text) = conn.recv_text().await {
            let _ = conn.send(text);
        }
    })
    .unwrap();
    app
}

#[tokio::test]
async fn frame_sent_with_the_handshake_is_not_lost() {
    let addr = spawn(echo_app()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    // Handshake and a masked text frame "hi" (zero mask) in one write.
    let mut raw = format!(
        "{UPGRADE_HEAD}Sec-WebSocket-Version: 13\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n"
    )
    .into_bytes();
    raw.extend_from_slice(&[0x81, 0x82, 0, 0, 0, 0, b'h', b'i']);
    stream.write_all(&raw).await.unwrap();

    let echoed = [0x81, 0x02, b'h', b'i'];
    let mut buf = Vec::new();
    timeout(Duration::from_secs(5), async {
        let mut chunk = [0u8; 1024];
        while !buf.ends_with(&echoed) {
            let n = stream.read(&mut chunk).await.unwrap();
            assert_ne!(n, 0, "server closed before echoing");
            buf.extend_from_slice(&chunk[..n]);
        }
    })
    .await
    .expect("buffered frame was never echoed");

    let text = String::from_utf8_lossy(&buf);
    assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
    assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
}

#[tokio::test]
async fn bad_handshakes_get_400_and_close() {
    let addr = spawn(echo_app()).await;

    let text = exchange(addr, &format!("{UPGRADE_HEAD}Sec-WebSocket-Version: 13\r\n\r\n")).await;
    assert!(text.starts_with("HTTP/1.1 400 "));
    assert!(text.ends_with("missing Sec-WebSocket-Key"));

    let text = exchange(
        addr,
        &format!("{UPGRADE_HEAD}Sec-WebSocket-Version: 8\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n"),
    )
    .await;
    assert!(text.starts_with("HTTP/1.1 400 "));
    assert!(text.contains("Sec-WebSocket-Version: 13\r\n"));
}

#[tokio::test]
async fn oversized_request_gets_413() {
    let mut app = App::new();
    app.post("/upload", ok()).unwrap();
    let addr = spawn(app).await;

    let raw = "POST /upload HTTP/1.1\r\nHost: localhost\r\nContent-Length: 9000000\r\n\r\n";
    let text = exchange(addr, raw).await;
    assert!(text.starts_with("HTTP/1.1 413 Payload Too Large\r\n"));
    assert!(text.contains("Connection: close\r\n"));
}

#[tokio::test]
async fn malformed_request_gets_400() {
    let addr = spawn(App::new()).await;
    let text = exchange(addr, "NOT A VALID REQUEST\r\n\r\n").await;
    assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert!(text.contains("Connection: close\r\n"));
}

#[tokio::test]
async fn panicking_handler_still_answers() {
    let mut app = App::new();
    app.get(
        "/boom",
        Pipeline::new(|_ctx| async {
            if true {
                panic!("handler bug");
            }
            Response::new(StatusCode::Ok)
        }),
    )
    .unwrap();
    let addr = spawn(app).await;

    let (status, text) = get(addr, "/boom", "").await;
    assert_eq!(status, 500);
    assert_eq!(body(&text)["error"], "Internal Server Error");
}

#[tokio::test]
async fn push_only_endpoint_drops_closed_peers() {
    let mut app = App::new();
    let registry = app.registry();
    app.ws("/metrics", |conn: Connection| async move {
        let _ = conn.send("ready");
        // Never reads; only the engine notices the peer leaving.
        std::future::pending::<()>().await;
    })
    .unwrap();
    let addr = spawn(app).await;

    let mut client = connect_async(format!("ws://{addr}/metrics")).await.unwrap().0;
    assert_eq!(next_text(&mut client).await, "ready");
    assert_eq!(registry.len("/metrics"), 1);

    client.close(None).await.unwrap();
    timeout(Duration::from_secs(5), async {
        while registry.len("/metrics") != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("closed peer stayed registered");
    assert_eq!(registry.broadcast("/metrics", "cpu=3"), 0);
}

#[tokio::test]
async fn broadcast_reaches_every_client_on_the_endpoint() {
    let mut app = App::new();
    let registry = app.registry();
    let relay = registry.clone();
    app.ws("/chat", move |mut conn: Connection| {
        let relay = relay.clone();
        async move {
            let _ = conn.send("Welcome to Arunika Chat!");
            while let Some(text) = conn.recv_text().await {
                relay.broadcast(conn.path(), text);
            }
        }
    })
    .unwrap();
    app.ws("/metrics", |mut conn: Connection| async move {
        let _ = conn.send("ready");
        while conn.recv().await.is_some() {}
    })
    .unwrap();
    let addr = spawn(app).await;

    let mut a = connect_async(format!("ws://{addr}/chat")).await.unwrap().0;
    let mut b = connect_async(format!("ws://{addr}/chat")).await.unwrap().0;
    let mut m = connect_async(format!("ws://{addr}/metrics")).await.unwrap().0;
    assert_eq!(next_text(&mut a).await, "Welcome to Arunika Chat!");
    assert_eq!(next_text(&mut b).await, "Welcome to Arunika Chat!");
    assert_eq!(next_text(&mut m).await, "ready");

    assert_eq!(registry.len("/chat"), 2);
    assert_eq!(registry.broadcast("/chat", "M"), 2);
    assert_eq!(next_text(&mut a).await, "M");
    assert_eq!(next_text(&mut b).await, "M");

    a.send(Message::text("hello from a")).await.unwrap();
    assert_eq!(next_text(&mut a).await, "hello from a");
    assert_eq!(next_text(&mut b).await, "hello from a");
    assert!(timeout(Duration::from_millis(200), m.next()).await.is_err());

    a.close(None).await.unwrap();
    timeout(Duration::from_secs(5), async {
        while registry.len("/chat") != 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("closed connection was never unregistered");
    assert_eq!(registry.broadcast("/chat", "after close"), 1);
    assert_eq!(next_text(&mut b).await, "after close");
}
