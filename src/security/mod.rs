//! Built-in guards: rate limiting, body validation, bearer-token
//! authentication, CORS and security headers.
//!
//! Every guard here implements [`Guard`](crate::middleware::Guard) and
//! converts into a [`Stage`](crate::middleware::Stage), so it can sit on a
//! single route's pipeline or in front of every route via
//! [`App::guard`](crate::app::App::guard).

pub mod auth;
pub mod middleware;
pub mod rate_limit;
pub mod token;
pub mod validate;

pub use auth::TokenAuth;
pub use middleware::{Cors, SecureHeaders};
pub use rate_limit::{ClientKey, RateLimiter};
pub use token::{Claims, TokenError};
pub use validate::{FieldType, Schema};
