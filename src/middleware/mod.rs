//! Guard pipelines: ordered request checks in front of a terminal handler.
//!
//! A [`Pipeline`] is an ordered list of [`Stage`]s plus one [`Handler`]. The
//! dispatch loop in [`Pipeline::run`] visits the stages in registration order:
//!
//! - a stage returning [`Outcome::Continue`] hands the [`Context`] to the next
//!   stage;
//! - a stage returning [`Outcome::Stop`] supplies the terminal response, and
//!   nothing after it runs, the handler included;
//! - when every stage continues, the handler produces the response.
//!
//! Stages talk to later stages only through the context (value bag, typed
//! extensions, staged response headers). Staged headers are merged into the
//! terminal response whichever stage produced it.
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use arunika::http::{Response, StatusCode};
//! use arunika::middleware::Pipeline;
//! use arunika::security::{RateLimiter, Schema, FieldType};
//!
//! let pipeline = Pipeline::new(|_ctx| async { Response::new(StatusCode::Created) })
//!     .guard(RateLimiter::new(60, Duration::from_secs(60)))
//!     .guard(Schema::new().require("title").field("title", FieldType::String));
//! ```

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::{future::Future, pin::Pin, sync::Arc};

use futures_util::FutureExt;

use crate::context::Context;
use crate::http::Response;
use crate::security::{Cors, RateLimiter, Schema, SecureHeaders, TokenAuth};

pub mod rejection;

pub use rejection::Rejection;

/// Type-erased async handler that turns a [`Context`] into a [`Response`].
///
/// Stored behind `Arc<dyn Fn(…)>` so routes can be shared across connection
/// tasks without copying the closure. Build one through [`Pipeline::new`].
pub type Handler =
    Arc<dyn Fn(Context) -> Pin<Box<dyn Future<Output = Response> + Send>> + Send + Sync + 'static>;

/// Conversion trait for async handler functions.
///
/// Any `Fn(Context) -> impl Future<Output = Response> + Send` that is also
/// `Send + Sync + 'static` implements this through the blanket impl below.
pub trait IntoHandler: Send + Sync + 'static {
    fn call(&self, ctx: Context) -> Pin<Box<dyn Future<Output = Response> + Send>>;
}

impl<T, F> IntoHandler for T
where
    T: Fn(Context) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    fn call(&self, ctx: Context) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        Box::pin((self)(ctx))
    }
}

/// Result of one guard: keep going, or answer now.
#[derive(Debug)]
pub enum Outcome {
    Continue,
    Stop(Response),
}

impl From<Rejection> for Outcome {
    fn from(rejection: Rejection) -> Self {
        Outcome::Stop(rejection.into_response())
    }
}

/// A pipeline stage supplied by the application.
///
/// Guard logic is synchronous: it inspects or decorates the context and
/// decides. Implementations must be `Send + Sync` because pipelines are shared
/// by every connection task.
pub trait Guard: Send + Sync {
    fn check(&self, ctx: &mut Context) -> Outcome;

    /// Name used in logs when this guard stops a request.
    fn name(&self) -> &'static str {
        "custom"
    }
}

/// Adapter turning a closure into a [`Guard`]. See [`Stage::from_fn`].
pub struct FnGuard<F> {
    name: &'static str,
    f: F,
}

impl<F> Guard for FnGuard<F>
where
    F: Fn(&mut Context) -> Outcome + Send + Sync,
{
    fn check(&self, ctx: &mut Context) -> Outcome {
        (self.f)(ctx)
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// One tagged pipeline stage.
#[derive(Clone)]
pub enum Stage {
    RateLimit(Arc<RateLimiter>),
    Validate(Arc<Schema>),
    Authenticate(Arc<TokenAuth>),
    Cors(Arc<Cors>),
    SecureHeaders(SecureHeaders),
    Custom(Arc<dyn Guard>),
}

impl Stage {
    /// Wraps a closure as a custom stage.
    pub fn from_fn<F>(name: &'static str, f: F) -> Self
    where
        F: Fn(&mut Context) -> Outcome + Send + Sync + 'static,
    {
        Stage::Custom(Arc::new(FnGuard { name, f }))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Stage::RateLimit(g) => g.name(),
            Stage::Validate(g) => g.name(),
            Stage::Authenticate(g) => g.name(),
            Stage::Cors(g) => g.name(),
            Stage::SecureHeaders(g) => g.name(),
            Stage::Custom(g) => g.name(),
        }
    }

    pub fn check(&self, ctx: &mut Context) -> Outcome {
        match self {
            Stage::RateLimit(g) => g.check(ctx),
            Stage::Validate(g) => g.check(ctx),
            Stage::Authenticate(g) => g.check(ctx),
            Stage::Cors(g) => g.check(ctx),
            Stage::SecureHeaders(g) => g.check(ctx),
            Stage::Custom(g) => g.check(ctx),
        }
    }
}

impl From<RateLimiter> for Stage {
    fn from(limiter: RateLimiter) -> Self {
        Stage::RateLimit(Arc::new(limiter))
    }
}

impl From<Arc<RateLimiter>> for Stage {
    fn from(limiter: Arc<RateLimiter>) -> Self {
        Stage::RateLimit(limiter)
    }
}

impl From<Schema> for Stage {
    fn from(schema: Schema) -> Self {
        Stage::Validate(Arc::new(schema))
    }
}

impl From<TokenAuth> for Stage {
    fn from(auth: TokenAuth) -> Self {
        Stage::Authenticate(Arc::new(auth))
    }
}

impl From<Cors> for Stage {
    fn from(cors: Cors) -> Self {
        Stage::Cors(Arc::new(cors))
    }
}

impl From<SecureHeaders> for Stage {
    fn from(headers: SecureHeaders) -> Self {
        Stage::SecureHeaders(headers)
    }
}

/// Runs `stages` in order against `ctx`.
///
/// Returns the terminal response of the first stage that stops, with staged
/// headers already merged, or `None` when every stage continued.
pub fn run_stages(stages: &[Stage], ctx: &mut Context) -> Option<Response> {
    for stage in stages {
        match stage.check(ctx) {
            Outcome::Continue => {}
            Outcome::Stop(mut response) => {
                tracing::debug!(
                    guard = stage.name(),
                    path = %ctx.request().path(),
                    status = response.status().as_u16(),
                    "guard stopped request"
                );
                response.merge_headers(ctx.take_response_headers());
                return Some(response);
            }
        }
    }
    None
}

/// Ordered guards plus a terminal handler, bound to a route.
pub struct Pipeline {
    stages: Vec<Stage>,
    handler: Handler,
}

impl Pipeline {
    /// A pipeline with no guards.
    pub fn new(handler: impl IntoHandler) -> Self {
        let handler: Handler = Arc::new(move |ctx| handler.call(ctx));
        Self {
            stages: Vec::new(),
            handler,
        }
    }

    /// Appends a guard. Guards run in the order they are appended.
    #[must_use]
    pub fn guard(mut self, stage: impl Into<Stage>) -> Self {
        self.stages.push(stage.into());
        self
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Executes the guards, then the handler if none stopped.
    ///
    /// A handler that panics is answered with `500 {"error":"Internal Server
    /// Error"}`; the connection stays usable.
    pub async fn run(&self, mut ctx: Context) -> Response {
        if let Some(response) = run_stages(&self.stages, &mut ctx) {
            return response;
        }
        let staged = ctx.take_response_headers();
        let path = ctx.request().path().to_owned();
        let mut response = match AssertUnwindSafe((self.handler)(ctx)).catch_unwind().await {
            Ok(response) => response,
            Err(panic) => {
                tracing::error!(path = %path, panic = panic_message(&*panic), "handler panicked");
                Rejection::Internal.into_response()
            }
        };
        response.merge_headers(staged);
        response
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
