//! Bearer-token authentication guard.

use std::fmt;

use crate::context::{Context, IDENTITY_KEY};
use crate::middleware::{Guard, Outcome, Rejection};
use crate::security::token::{self, Claims};

/// Requires `Authorization: Bearer <token>` signed with a shared secret.
///
/// On success the decoded [`Claims`] are stored both as a typed extension
/// (see [`Context::identity`]) and as a JSON value under
/// [`IDENTITY_KEY`]. With a [`scope`](Self::scope) prefix, requests whose path
/// does not start with it pass through unauthenticated.
///
/// # Examples
///
/// ```
/// use arunika::security::TokenAuth;
///
/// let auth = TokenAuth::new("supersecret").scope("/api");
/// assert!(auth.enforces("/api/v1/todos"));
/// assert!(!auth.enforces("/login"));
/// ```
pub struct TokenAuth {
    secret: Vec<u8>,
    prefix: Option<String>,
}

impl TokenAuth {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
            prefix: None,
        }
    }

    /// Restricts enforcement to paths starting with `prefix`.
    #[must_use]
    pub fn scope(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Returns `true` if requests to `path` must carry a valid token.
    pub fn enforces(&self, path: &str) -> bool {
        self.prefix
            .as_deref()
            .is_none_or(|prefix| path.starts_with(prefix))
    }

    fn bearer(header: Option<&str>) -> Option<&str> {
        let (scheme, token) = header?.trim().split_once(' ')?;
        let token = token.trim();
        (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
    }
}

impl fmt::Debug for TokenAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenAuth")
            .field("secret", &"<redacted>")
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl Guard for TokenAuth {
    fn check(&self, ctx: &mut Context) -> Outcome {
        if !self.enforces(ctx.request().path()) {
            return Outcome::Continue;
        }

        let Some(bearer) = Self::bearer(ctx.request().headers().get("authorization")) else {
            tracing::debug!(path = %ctx.request().path(), "missing bearer token");
            return Rejection::MissingToken.into();
        };

        match token::verify(bearer, &self.secret) {
            Ok(claims) => {
                ctx.set(IDENTITY_KEY, claims.to_value());
                ctx.extensions_mut().insert::<Claims>(claims);
                Outcome::Continue
            }
            Err(e) => {
                tracing::warn!(path = %ctx.request().path(), error = %e, "token rejected");
                Rejection::InvalidToken(e).into()
            }
        }
    }

    fn name(&self) -> &'static str {
        "authenticate"
    }
}
