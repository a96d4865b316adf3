//! The application facade.
//!
//! An [`App`] owns everything a running server consults per request:
//!
//! 1. app-wide guards, run for every HTTP request before routing;
//! 2. the [`Router`] with each route's own [`Pipeline`];
//! 3. the upgrade [`Multiplexer`] and its [`BroadcastRegistry`].
//!
//! Routes and endpoints are registered while the app is being built. Once it
//! is handed to [`Server::serve`] the tables are shared read-only across
//! connection tasks.

use std::time::Instant;

use serde_json::json;
use thiserror::Error;
use tracing::info;

use crate::config::EngineConfig;
use crate::context::Context;
use crate::http::{Method, Request, Response, StatusCode};
use crate::middleware::{Pipeline, Stage, run_stages};
use crate::realtime::{BroadcastRegistry, IntoConnectHandler, Multiplexer, UpgradeError};
use crate::router::{Router, RouterError};
use crate::server::{Server, ServerError};

/// Errors from building an [`App`].
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Router(#[from] RouterError),

    #[error(transparent)]
    Upgrade(#[from] UpgradeError),
}

/// A bundle of routes, endpoints or guards installed in one call.
pub trait Plugin {
    /// Installs the plugin into `app`.
    ///
    /// # Errors
    ///
    /// Whatever registration error the plugin hits, e.g. a route that is
    /// already taken.
    fn register(self, app: &mut App) -> Result<(), AppError>;
}

/// Liveness endpoint answering `{"status":"ok","uptime":<seconds>}`.
#[derive(Debug, Clone)]
pub struct Health {
    path: String,
}

impl Default for Health {
    fn default() -> Self {
        Self::at("/status")
    }
}

impl Health {
    /// Serves the health check on `GET /status`.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn at(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

impl Plugin for Health {
    fn register(self, app: &mut App) -> Result<(), AppError> {
        let started = app.started;
        app.get(
            &self.path,
            Pipeline::new(move |_ctx| async move {
                Response::json(
                    StatusCode::Ok,
                    &json!({ "status": "ok", "uptime": started.elapsed().as_secs_f64() }),
                )
            }),
        )?;
        Ok(())
    }
}

/// An HTTP application: guards, routes and WebSocket endpoints.
///
/// # Examples
///
/// ```rust,no_run
/// use arunika::app::{App, Health};
/// use arunika::http::{Response, StatusCode};
/// use arunika::middleware::Pipeline;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut app = App::new();
///     app.plugin(Health::new())?;
///     app.get("/hello", Pipeline::new(|_ctx| async {
///         Response::new(StatusCode::Ok).body("Hello!")
///     }))?;
///     app.ws("/chat", |conn: arunika::realtime::Connection| async move {
///         let _ = conn.send("Welcome!");
///     })?;
///
///     app.listen("127.0.0.1:3000").await?;
///     Ok(())
/// }
/// ```
pub struct App {
    guards: Vec<Stage>,
    router: Router,
    upgrades: Multiplexer,
    registry: BroadcastRegistry,
    started: Instant,
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

impl App {
    pub fn new() -> Self {
        let registry = BroadcastRegistry::new();
        Self {
            guards: Vec::new(),
            router: Router::new(),
            upgrades: Multiplexer::new(registry.clone()),
            registry,
            started: Instant::now(),
        }
    }

    /// An app with the app-wide guards `config` enables already installed.
    pub fn from_config(config: &EngineConfig) -> Self {
        let mut app = Self::new();
        app.guards = config.guards();
        app
    }

    /// Appends an app-wide guard. App-wide guards run for every HTTP request,
    /// matched or not, before the route's own guards.
    pub fn guard(&mut self, stage: impl Into<Stage>) -> &mut Self {
        self.guards.push(stage.into());
        self
    }

    /// Registers `pipeline` for `method` requests matching `pattern`.
    ///
    /// # Errors
    ///
    /// [`AppError::Router`] for an invalid or already registered pattern.
    pub fn route(
        &mut self,
        method: Method,
        pattern: &str,
        pipeline: Pipeline,
    ) -> Result<&mut Self, AppError> {
        self.router.add(method, pattern, pipeline)?;
        Ok(self)
    }

    pub fn get(&mut self, pattern: &str, pipeline: Pipeline) -> Result<&mut Self, AppError> {
        self.route(Method::Get, pattern, pipeline)
    }

    pub fn post(&mut self, pattern: &str, pipeline: Pipeline) -> Result<&mut Self, AppError> {
        self.route(Method::Post, pattern, pipeline)
    }

    pub fn put(&mut self, pattern: &str, pipeline: Pipeline) -> Result<&mut Self, AppError> {
        self.route(Method::Put, pattern, pipeline)
    }

    pub fn delete(&mut self, pattern: &str, pipeline: Pipeline) -> Result<&mut Self, AppError> {
        self.route(Method::Delete, pattern, pipeline)
    }

    pub fn patch(&mut self, pattern: &str, pipeline: Pipeline) -> Result<&mut Self, AppError> {
        self.route(Method::Patch, pattern, pipeline)
    }

    /// Accepts WebSocket upgrades on exactly `path`, handing each accepted
    /// connection to `on_connect`. The connection stays in the broadcast
    /// registry until the callback returns.
    ///
    /// # Errors
    ///
    /// [`AppError::Upgrade`] if `path` is malformed or already taken.
    pub fn ws(&mut self, path: &str, on_connect: impl IntoConnectHandler) -> Result<&mut Self, AppError> {
        self.upgrades.register(path, on_connect)?;
        Ok(self)
    }

    /// Sends `message` to every connection on the endpoint `path`.
    /// Returns the number of connections that accepted it.
    pub fn broadcast(&self, path: &str, message: impl Into<String>) -> usize {
        self.registry.broadcast(path, message)
    }

    /// A handle on the live connection sets, usable from handlers and
    /// background tasks after the app has been moved into the server.
    pub fn registry(&self) -> BroadcastRegistry {
        self.registry.clone()
    }

    /// Installs `plugin`.
    ///
    /// # Errors
    ///
    /// Propagates the plugin's registration error.
    pub fn plugin(&mut self, plugin: impl Plugin) -> Result<&mut Self, AppError> {
        plugin.register(self)?;
        Ok(self)
    }

    /// Time since the app was created.
    pub fn uptime(&self) -> std::time::Duration {
        self.started.elapsed()
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn upgrades(&self) -> &Multiplexer {
        &self.upgrades
    }

    /// Handles one HTTP request: app-wide guards, then the matched route's
    /// pipeline, or `404` when nothing matches.
    pub async fn dispatch(&self, request: Request) -> Response {
        let started = Instant::now();
        let method = request.method().clone();
        let path = request.path().to_owned();

        let mut ctx = Context::new(request);
        let response = match run_stages(&self.guards, &mut ctx) {
            Some(stopped) => stopped,
            None => self.router.dispatch(ctx).await,
        };

        info!(
            "{method} {path} - {} ({:?})",
            response.status().as_u16(),
            started.elapsed()
        );
        response
    }

    /// Binds `addr` and serves this app until the process exits.
    ///
    /// # Errors
    ///
    /// [`ServerError::Bind`] if the address cannot be bound.
    pub async fn listen(self, addr: impl AsRef<str>) -> Result<(), ServerError> {
        Server::bind(addr).await?.serve(self).await
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddr};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::security::{RateLimiter, SecureHeaders};

    fn ok() -> Pipeline {
        Pipeline::new(|_ctx| async { Response::new(StatusCode::Ok) })
    }

    #[tokio::test]
    async fn unmatched_route_is_404() {
        let app = App::new();
        let res = app.dispatch(Request::new(Method::Get, "/nope")).await;
        assert_eq!(res.status(), StatusCode::NotFound);
        assert_eq!(res.json_body().unwrap(), json!({ "error": "Not found" }));
    }

    #[tokio::test]
    async fn app_guards_run_before_routing() {
        let mut app = App::new();
        app.guard(Stage::from_fn("deny", |_ctx| {
            crate::middleware::Outcome::Stop(Response::new(StatusCode::Forbidden))
        }));
        app.get("/open", ok()).unwrap();

        let res = app.dispatch(Request::new(Method::Get, "/open")).await;
        assert_eq!(res.status(), StatusCode::Forbidden);
        let res = app.dispatch(Request::new(Method::Get, "/missing")).await;
        assert_eq!(res.status(), StatusCode::Forbidden);
    }

    #[tokio::test]
    async fn staged_headers_reach_404_and_handler_responses() {
        let mut app = App::new();
        app.guard(SecureHeaders::new());
        app.get("/todos", ok()).unwrap();

        let found = app.dispatch(Request::new(Method::Get, "/todos")).await;
        assert_eq!(found.headers().get("x-content-type-options"), Some("nosniff"));
        let missing = app.dispatch(Request::new(Method::Get, "/nope")).await;
        assert_eq!(missing.headers().get("x-content-type-options"), Some("nosniff"));
    }

    #[tokio::test(start_paused = true)]
    async fn app_wide_rate_limit_covers_every_route() {
        let mut app = App::new();
        app.guard(RateLimiter::new(2, Duration::from_secs(60)));
        app.get("/a", ok()).unwrap();

        let peer = "10.0.0.9:4000".parse().unwrap();
        for _ in 0..2 {
            let res = app.dispatch(Request::new(Method::Get, "/a").remote_addr(peer)).await;
            assert_eq!(res.status(), StatusCode::Ok);
        }
        let res = app.dispatch(Request::new(Method::Get, "/b").remote_addr(peer)).await;
        assert_eq!(res.status(), StatusCode::TooManyRequests);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_rate_limit_windows_are_reclaimed() {
        let limiter = Arc::new(RateLimiter::new(5, Duration::from_secs(60)));
        let mut app = App::new();
        app.guard(Arc::clone(&limiter));
        app.get("/a", ok()).unwrap();

        for i in 0..2_000u32 {
            let peer = SocketAddr::from((Ipv4Addr::from(0x0a00_0000 + i), 4000));
            app.dispatch(Request::new(Method::Get, "/a").remote_addr(peer)).await;
        }
        assert_eq!(limiter.tracked_clients(), 2_000);

        tokio::time::advance(Duration::from_secs(3600)).await;
        let peer = SocketAddr::from(([192, 168, 0, 1], 4000));
        let res = app.dispatch(Request::new(Method::Get, "/a").remote_addr(peer)).await;
        assert_eq!(res.status(), StatusCode::Ok);
        assert_eq!(limiter.tracked_clients(), 1);
    }

    #[tokio::test]
    async fn panicking_handler_answers_500() {
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
        app.get("/ok", ok()).unwrap();

        let res = app.dispatch(Request::new(Method::Get, "/boom")).await;
        assert_eq!(res.status(), StatusCode::InternalServerError);
        assert_eq!(res.json_body().unwrap(), json!({ "error": "Internal Server Error" }));
        let res = app.dispatch(Request::new(Method::Get, "/ok")).await;
        assert_eq!(res.status(), StatusCode::Ok);
    }

    #[tokio::test]
    async fn health_plugin_reports_uptime() {
        let mut app = App::new();
        app.plugin(Health::new()).unwrap();

        let res = app.dispatch(Request::new(Method::Get, "/status")).await;
        assert_eq!(res.status(), StatusCode::Ok);
        let body = res.json_body().unwrap();
        assert_eq!(body["status"], "ok");
        assert!(body["uptime"].is_number());
    }

    #[test]
    fn registration_errors_surface() {
        let mut app = App::new();
        app.get("/todos/:id", ok()).unwrap();
        assert!(matches!(app.get("/todos/:key", ok()), Err(AppError::Router(_))));
        app.ws("/chat", |_conn| async {}).unwrap();
        assert!(matches!(app.ws("/chat", |_conn| async {}), Err(AppError::Upgrade(_))));
        assert!(matches!(app.plugin(Health::at("/todos/:id")), Err(AppError::Router(_))));
    }

    #[test]
    fn from_config_installs_guards() {
        let config = EngineConfig::from_toml_str("[auth]\nsecret = \"s\"").unwrap();
        let app = App::from_config(&config);
        assert_eq!(app.guards.len(), 4);
        assert_eq!(app.broadcast("/chat", "nobody home"), 0);
    }
}
