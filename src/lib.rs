//! # arunika
//!
//! A minimal async HTTP/1.1 engine: guard pipelines in front of handlers, a
//! parameterized router, and any number of WebSocket endpoints multiplexed on
//! the same listener with per-endpoint broadcast.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use arunika::app::{App, Health};
//! use arunika::http::{Response, StatusCode};
//! use arunika::middleware::Pipeline;
//! use arunika::realtime::Connection;
//! use arunika::security::{FieldType, RateLimiter, Schema};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut app = App::new();
//!     app.guard(RateLimiter::new(60, Duration::from_secs(60)));
//!     app.plugin(Health::new())?;
//!
//!     app.post(
//!         "/todos",
//!         Pipeline::new(|_ctx| async { Response::new(StatusCode::Created) })
//!             .guard(Schema::new().require("title").field("title", FieldType::String)),
//!     )?;
//!
//!     let registry = app.registry();
//!     app.ws("/chat", move |mut conn: Connection| {
//!         let registry = registry.clone();
//!         async move {
//!             while let Some(text) = conn.recv_text().await {
//!                 registry.broadcast(conn.path(), text);
//!             }
//!         }
//!     })?;
//!
//!     app.listen("127.0.0.1:3000").await?;
//!     Ok(())
//! }
//! ```

pub mod app;
pub mod config;
pub mod context;
pub mod http;
pub mod middleware;
pub mod realtime;
pub mod router;
pub mod security;
pub mod server;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use app::{App, AppError, Health, Plugin};
pub use config::{ConfigError, EngineConfig};
pub use context::Context;
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use middleware::{Outcome, Pipeline, Rejection, Stage};
pub use realtime::{BroadcastRegistry, Connection, Message};
pub use router::{Router, RouterError};
pub use server::{Server, ServerError};
