//! Response-hardening guards: CORS and security headers.
//!
//! Neither guard rejects a request outright. They stage headers on the
//! [`Context`] so the pipeline writes them into whatever response is
//! produced; [`Cors`] additionally answers `OPTIONS` preflights itself.

use crate::context::Context;
use crate::http::{Method, Response, StatusCode};
use crate::middleware::{Guard, Outcome};

/// CORS guard. Answers preflight requests and stages `Access-Control-*`
/// headers for allowed origins.
///
/// # Behavior
///
/// - If no `Origin` header is present the request passes through unmodified.
/// - If the origin is not in the allow-list the request passes through unmodified.
/// - `OPTIONS` preflight requests stop the pipeline with `204 No Content` and
///   the `Access-Control-*` headers; the handler is **not** called.
/// - For all other requests the CORS headers are staged for the response.
/// - For a specific (non-wildcard) origin a `Vary: Origin` header is added.
///
/// # Examples
///
/// ```rust
/// use arunika::security::Cors;
///
/// let cors = Cors::new()
///     .allow_origin("https://example.com")
///     .allow_method("PATCH")
///     .allow_header("X-Custom-Header");
/// ```
#[derive(Debug, Clone)]
pub struct Cors {
    allowed_origins: Vec<String>,
    allowed_methods: Vec<String>,
    allowed_headers: Vec<String>,
}

impl Default for Cors {
    fn default() -> Self {
        Self::permissive()
    }
}

impl Cors {
    /// No allowed origins; common methods and headers.
    ///
    /// | Setting          | Default value                          |
    /// |------------------|----------------------------------------|
    /// | Allowed origins  | *(none)*                               |
    /// | Allowed methods  | `GET`, `POST`, `PUT`, `DELETE`         |
    /// | Allowed headers  | `Content-Type`, `Authorization`        |
    pub fn new() -> Self {
        Self {
            allowed_origins: Vec::new(),
            allowed_methods: ["GET", "POST", "PUT", "DELETE"].map(String::from).to_vec(),
            allowed_headers: ["Content-Type", "Authorization"].map(String::from).to_vec(),
        }
    }

    /// Every origin allowed (`Access-Control-Allow-Origin: *`).
    pub fn permissive() -> Self {
        Self::new().allow_origin("*")
    }

    /// Adds an allowed origin; `"*"` permits all origins.
    #[must_use]
    pub fn allow_origin(mut self, origin: impl Into<String>) -> Self {
        self.allowed_origins.push(origin.into());
        self
    }

    /// Adds a method name, sent verbatim in `Access-Control-Allow-Methods`.
    #[must_use]
    pub fn allow_method(mut self, method: impl Into<String>) -> Self {
        let method = method.into();
        if !self.allowed_methods.contains(&method) {
            self.allowed_methods.push(method);
        }
        self
    }

    /// Adds a header name, sent verbatim in `Access-Control-Allow-Headers`.
    #[must_use]
    pub fn allow_header(mut self, header: impl Into<String>) -> Self {
        self.allowed_headers.push(header.into());
        self
    }

    fn allowed_origin(&self, origin: &str) -> Option<String> {
        if self.allowed_origins.iter().any(|o| o == "*") {
            Some("*".to_owned())
        } else if self.allowed_origins.iter().any(|o| o == origin) {
            Some(origin.to_owned())
        } else {
            None
        }
    }
}

impl Guard for Cors {
    fn check(&self, ctx: &mut Context) -> Outcome {
        let Some(origin) = ctx.request().headers().get("origin") else {
            return Outcome::Continue;
        };
        let Some(allow_origin) = self.allowed_origin(origin) else {
            tracing::debug!(origin, "origin not allowed by CORS policy");
            return Outcome::Continue;
        };

        let is_preflight = ctx.request().method() == &Method::Options;
        let is_wildcard = allow_origin == "*";
        let methods = self.allowed_methods.join(", ");
        let headers = self.allowed_headers.join(", ");

        if is_preflight {
            let mut resp = Response::new(StatusCode::NoContent)
                .header("Access-Control-Allow-Origin", &allow_origin)
                .header("Access-Control-Allow-Methods", &methods)
                .header("Access-Control-Allow-Headers", &headers)
                .header("Access-Control-Max-Age", "3600");
            if !is_wildcard {
                resp.add_header("Vary", "Origin");
            }
            return Outcome::Stop(resp);
        }

        let staged = ctx.response_headers_mut();
        staged.set("Access-Control-Allow-Origin", allow_origin);
        staged.set("Access-Control-Allow-Methods", methods);
        staged.set("Access-Control-Allow-Headers", headers);
        if !is_wildcard {
            staged.set("Vary", "Origin");
        }
        Outcome::Continue
    }

    fn name(&self) -> &'static str {
        "cors"
    }
}

const SECURE_HEADERS: &[(&str, &str)] = &[
    ("Content-Security-Policy", "default-src 'self'; base-uri 'self'; frame-ancestors 'self'; object-src 'none'"),
    ("Cross-Origin-Opener-Policy", "same-origin"),
    ("Cross-Origin-Resource-Policy", "same-origin"),
    ("Origin-Agent-Cluster", "?1"),
    ("Referrer-Policy", "no-referrer"),
    ("X-Content-Type-Options", "nosniff"),
    ("X-DNS-Prefetch-Control", "off"),
    ("X-Download-Options", "noopen"),
    ("X-Frame-Options", "SAMEORIGIN"),
    ("X-Permitted-Cross-Domain-Policies", "none"),
    ("X-XSS-Protection", "0"),
];

const HSTS: &str = "max-age=31536000; includeSubDomains";

/// Stages a fixed set of defensive response headers on every request.
///
/// `Strict-Transport-Security` is included unless disabled with
/// [`without_hsts`](Self::without_hsts), for deployments not fronted by TLS.
#[derive(Debug, Clone, Copy)]
pub struct SecureHeaders {
    hsts: bool,
}

impl Default for SecureHeaders {
    fn default() -> Self {
        Self { hsts: true }
    }
}

impl SecureHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn without_hsts(mut self) -> Self {
        self.hsts = false;
        self
    }
}

impl Guard for SecureHeaders {
    fn check(&self, ctx: &mut Context) -> Outcome {
        let staged = ctx.response_headers_mut();
        for (name, value) in SECURE_HEADERS {
            staged.set(*name, *value);
        }
        if self.hsts {
            staged.set("Strict-Transport-Security", HSTS);
        }
        Outcome::Continue
    }

    fn name(&self) -> &'static str {
        "secure-headers"
    }
}
