//! Request routing: map methods and URL patterns to pipelines.
//!
//! | Pattern              | Example match              | Captured params       |
//! |----------------------|----------------------------|-----------------------|
//! | `/todos`             | `/todos`                   | *(none)*              |
//! | `/todos/:id`         | `/todos/42`                | `id → "42"`           |
//! | `/users/:id/posts/:p`| `/users/7/posts/9`         | `id → "7"`, `p → "9"` |
//!
//! Patterns and paths are split on `/`; a `:name` segment binds whatever the
//! path has in that position, a literal segment must match exactly, and the
//! segment counts must be equal. There is no wildcard suffix.
//!
//! Trailing slashes are normalized, so `/todos/` and `/todos` are equivalent.
//! Bound parameter values are percent-decoded (`/todos/a%20b` binds `a b`);
//! a value that does not decode to UTF-8 is bound as sent.
//!
//! Registering a pattern structurally identical to one already registered for
//! the same method (same literals, parameters in the same positions) fails
//! with [`RouterError::Duplicate`]. When distinct patterns overlap, e.g.
//! `/todos/:id` and `/todos/active`, the one with more literal segments wins;
//! among equally specific patterns the first registered wins.

use thiserror::Error;

use crate::context::{Context, PathParams};
use crate::http::{Method, Response};
use crate::middleware::{Pipeline, Rejection};

/// Errors raised while registering routes.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("route {method} {pattern} conflicts with already registered {existing}")]
    Duplicate {
        method: Method,
        pattern: String,
        existing: String,
    },

    #[error("invalid route pattern {pattern:?}: {reason}")]
    InvalidPattern {
        pattern: String,
        reason: &'static str,
    },
}

// A single path segment, either a literal string or a named capture (`:name`).
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Static(String),
    Parameter(String),
}

// Compiled representation of a route pattern string.
#[derive(Debug, Clone)]
struct Pattern {
    segments: Vec<Segment>,
}

impl Pattern {
    fn parse(pattern: &str) -> Result<Self, RouterError> {
        let invalid = |reason| RouterError::InvalidPattern {
            pattern: pattern.to_owned(),
            reason,
        };

        if !pattern.starts_with('/') {
            return Err(invalid("must start with '/'"));
        }

        let mut segments = Vec::new();
        for raw in split_path(pattern) {
            let segment = match raw.strip_prefix(':') {
                Some("") => return Err(invalid("parameter name is empty")),
                Some(name) => {
                    if segments
                        .iter()
                        .any(|s| matches!(s, Segment::Parameter(n) if n == name))
                    {
                        return Err(invalid("parameter name is repeated"));
                    }
                    Segment::Parameter(name.to_owned())
                }
                None if raw == "*" => return Err(invalid("wildcards are not supported")),
                None => Segment::Static(raw.to_owned()),
            };
            segments.push(segment);
        }

        Ok(Self { segments })
    }

    // Same literals in the same places and parameters in the same places.
    fn same_shape(&self, other: &Pattern) -> bool {
        self.segments.len() == other.segments.len()
            && self
                .segments
                .iter()
                .zip(&other.segments)
                .all(|pair| match pair {
                    (Segment::Static(a), Segment::Static(b)) => a == b,
                    (Segment::Parameter(_), Segment::Parameter(_)) => true,
                    _ => false,
                })
    }

    fn literal_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Static(_)))
            .count()
    }

    fn matches(&self, path: &str) -> Option<PathParams> {
        let path_segments: Vec<&str> = split_path(path).collect();
        if path_segments.len() != self.segments.len() {
            return None;
        }

        let mut params = PathParams::new();
        for (segment, actual) in self.segments.iter().zip(path_segments) {
            match segment {
                Segment::Static(expected) if expected != actual => return None,
                Segment::Static(_) => {}
                Segment::Parameter(name) => params.insert(name.clone(), decode(actual)),
            }
        }
        Some(params)
    }
}

fn decode(segment: &str) -> String {
    urlencoding::decode(segment)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| segment.to_owned())
}

// Empty segments are dropped, which is what normalizes trailing slashes.
fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

// A single registered route binding a method + pattern to a pipeline.
struct Route {
    method: Method,
    source: String,
    pattern: Pattern,
    pipeline: Pipeline,
}

/// A successful lookup: the route's pipeline and the bound path parameters.
pub struct RouteMatch<'a> {
    pub pattern: &'a str,
    pub pipeline: &'a Pipeline,
    pub params: PathParams,
}

/// Method + pattern route table.
///
/// Created empty, filled once at startup, then only read.
///
/// # Examples
///
/// ```rust
/// use arunika::http::{Method, Response, StatusCode};
/// use arunika::middleware::Pipeline;
/// use arunika::router::Router;
///
/// let mut router = Router::new();
/// router
///     .get("/todos/:id", Pipeline::new(|_ctx| async { Response::new(StatusCode::Ok) }))
///     .unwrap();
///
/// let found = router.find(&Method::Get, "/todos/42").unwrap();
/// assert_eq!(found.params.get("id"), Some("42"));
/// assert!(router.find(&Method::Get, "/todos").is_none());
/// ```
#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    /// Registers `pipeline` for `method` requests matching `pattern`.
    ///
    /// # Errors
    ///
    /// - [`RouterError::InvalidPattern`]: the pattern does not start with `/`,
    ///   has an empty or repeated parameter name, or uses `*`.
    /// - [`RouterError::Duplicate`]: an identical pattern is already
    ///   registered for `method`.
    pub fn add(
        &mut self,
        method: Method,
        pattern: &str,
        pipeline: Pipeline,
    ) -> Result<&mut Self, RouterError> {
        let compiled = Pattern::parse(pattern)?;

        if let Some(existing) = self
            .routes
            .iter()
            .find(|r| r.method == method && r.pattern.same_shape(&compiled))
        {
            return Err(RouterError::Duplicate {
                method,
                pattern: pattern.to_owned(),
                existing: existing.source.clone(),
            });
        }

        tracing::debug!(%method, pattern, guards = pipeline.stages().len(), "route registered");
        self.routes.push(Route {
            method,
            source: pattern.to_owned(),
            pattern: compiled,
            pipeline,
        });
        Ok(self)
    }

    pub fn get(&mut self, pattern: &str, pipeline: Pipeline) -> Result<&mut Self, RouterError> {
        self.add(Method::Get, pattern, pipeline)
    }

    pub fn post(&mut self, pattern: &str, pipeline: Pipeline) -> Result<&mut Self, RouterError> {
        self.add(Method::Post, pattern, pipeline)
    }

    pub fn put(&mut self, pattern: &str, pipeline: Pipeline) -> Result<&mut Self, RouterError> {
        self.add(Method::Put, pattern, pipeline)
    }

    pub fn delete(&mut self, pattern: &str, pipeline: Pipeline) -> Result<&mut Self, RouterError> {
        self.add(Method::Delete, pattern, pipeline)
    }

    pub fn patch(&mut self, pattern: &str, pipeline: Pipeline) -> Result<&mut Self, RouterError> {
        self.add(Method::Patch, pattern, pipeline)
    }

    pub fn options(&mut self, pattern: &str, pipeline: Pipeline) -> Result<&mut Self, RouterError> {
        self.add(Method::Options, pattern, pipeline)
    }

    /// Looks up the route for `method` and `path`.
    ///
    /// `None` is the expected "no such route" answer, not an error.
    pub fn find(&self, method: &Method, path: &str) -> Option<RouteMatch<'_>> {
        let mut best: Option<(&Route, PathParams)> = None;
        for route in self.routes.iter().filter(|r| &r.method == method) {
            let Some(params) = route.pattern.matches(path) else {
                continue;
            };
            let better = best
                .as_ref()
                .is_none_or(|(b, _)| route.pattern.literal_count() > b.pattern.literal_count());
            if better {
                best = Some((route, params));
            }
        }

        best.map(|(route, params)| RouteMatch {
            pattern: &route.source,
            pipeline: &route.pipeline,
            params,
        })
    }

    /// Runs the matching route's pipeline for `ctx`, or answers `404`.
    pub async fn dispatch(&self, mut ctx: Context) -> Response {
        let path = ctx.request().path().to_owned();
        match self.find(ctx.request().method(), &path) {
            Some(found) => {
                ctx.set_params(found.params);
                found.pipeline.run(ctx).await
            }
            None => {
                let mut response = Rejection::NotFound.into_response();
                response.merge_headers(ctx.take_response_headers());
                response
            }
        }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
