//! Terminal failure outcomes shared by the built-in guards and the dispatcher.

use std::time::Duration;

use serde_json::json;
use thiserror::Error;

use crate::http::{Response, StatusCode};
use crate::security::token::TokenError;

/// A recoverable, per-request failure that ends a pipeline.
///
/// Each variant maps to one status code and a JSON body: `{"errors": [...]}`
/// for validation failures, `{"error": "..."}` for everything else.
#[derive(Debug, Error)]
pub enum Rejection {
    #[error("request validation failed")]
    Validation(Vec<String>),

    #[error("Unauthorized")]
    MissingToken,

    #[error("Invalid token")]
    InvalidToken(#[source] TokenError),

    #[error("Too many requests, please try again later.")]
    RateLimited { retry_after: Duration },

    #[error("Not found")]
    NotFound,

    #[error("Internal Server Error")]
    Internal,
}

impl Rejection {
    pub fn status(&self) -> StatusCode {
        match self {
            Rejection::Validation(_) => StatusCode::BadRequest,
            Rejection::MissingToken | Rejection::InvalidToken(_) => StatusCode::Unauthorized,
            Rejection::RateLimited { .. } => StatusCode::TooManyRequests,
            Rejection::NotFound => StatusCode::NotFound,
            Rejection::Internal => StatusCode::InternalServerError,
        }
    }

    pub fn into_response(self) -> Response {
        let status = self.status();
        let message = self.to_string();
        match self {
            Rejection::Validation(errors) => Response::json(status, &json!({ "errors": errors })),
            Rejection::RateLimited { retry_after } => {
                // Round up so clients never retry inside the window.
                let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
                Response::json(status, &json!({ "error": message }))
                    .header("Retry-After", secs.max(1).to_string())
            }
            _ => Response::json(status, &json!({ "error": message })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_lists_every_error() {
        let res = Rejection::Validation(vec!["title is required".into(), "done must be boolean".into()])
            .into_response();
        assert_eq!(res.status(), StatusCode::BadRequest);
        let body = res.json_body().unwrap();
        assert_eq!(body["errors"].as_array().unwrap().len(), 2);
        assert!(body.get("error").is_none());
    }

    #[test]
    fn auth_failures_are_401_with_distinct_messages() {
        let missing = Rejection::MissingToken.into_response();
        assert_eq!(missing.status(), StatusCode::Unauthorized);
        assert_eq!(missing.json_body().unwrap()["error"], "Unauthorized");

        let invalid = Rejection::InvalidToken(TokenError::BadSignature).into_response();
        assert_eq!(invalid.status(), StatusCode::Unauthorized);
        assert_eq!(invalid.json_body().unwrap()["error"], "Invalid token");
    }

    #[test]
    fn rate_limited_sets_retry_after() {
        let res = Rejection::RateLimited {
            retry_after: Duration::from_millis(12_300),
        }
        .into_response();
        assert_eq!(res.status(), StatusCode::TooManyRequests);
        assert_eq!(res.headers().get("retry-after"), Some("13"));
    }

    #[test]
    fn not_found_body() {
        let res = Rejection::NotFound.into_response();
        assert_eq!(res.status(), StatusCode::NotFound);
        assert_eq!(res.json_body().unwrap()["error"], "Not found");
    }
}
