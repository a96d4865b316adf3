//! Fixed-window rate limiting keyed by client identity.
//!
//! Each client key owns a counter and the instant its current window began.
//! The first request after the window has elapsed resets the counter. Keys
//! live in a sharded [`DashMap`], so two clients only contend when they hash
//! to the same shard, never on a limiter-wide lock.
//!
//! Windows of clients that stopped sending are swept at most once per window
//! length, by whichever request arrives first after it has passed.

use std::sync::Mutex;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::context::Context;
use crate::http::Request;
use crate::middleware::{Guard, Outcome, Rejection};

/// How a request is mapped to a rate-limit bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientKey {
    /// The peer IP address (port ignored).
    RemoteAddr,
    /// The value of a request header, e.g. `X-Forwarded-For` behind a proxy.
    /// Falls back to the peer address when the header is absent.
    Header(String),
}

#[derive(Debug)]
struct Window {
    started: Instant,
    count: u32,
}

/// Fixed-window request limiter.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use arunika::security::RateLimiter;
///
/// let limiter = RateLimiter::new(2, Duration::from_secs(60));
/// assert!(limiter.hit("10.0.0.1").is_ok());
/// assert!(limiter.hit("10.0.0.1").is_ok());
/// assert!(limiter.hit("10.0.0.1").is_err());
/// assert!(limiter.hit("10.0.0.2").is_ok());
/// ```
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    key: ClientKey,
    windows: DashMap<String, Window>,
    last_sweep: Mutex<Instant>,
}

impl RateLimiter {
    /// Allows `max_requests` per client within each `window`.
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            key: ClientKey::RemoteAddr,
            windows: DashMap::new(),
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    /// Keys clients by the given header instead of the peer address.
    #[must_use]
    pub fn key_by_header(mut self, name: impl Into<String>) -> Self {
        self.key = ClientKey::Header(name.into());
        self
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Derives the bucket key for `request`.
    pub fn client_key(&self, request: &Request) -> String {
        let from_peer = || {
            request
                .peer_addr()
                .map(|addr| addr.ip().to_string())
                .unwrap_or_else(|| "unknown".to_owned())
        };
        match &self.key {
            ClientKey::RemoteAddr => from_peer(),
            ClientKey::Header(name) => request
                .headers()
                .get(name)
                .and_then(|v| v.split(',').next())
                .map(|v| v.trim().to_owned())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(from_peer),
        }
    }

    /// Counts one request for `key`.
    ///
    /// Returns the number of requests still allowed in the current window, or
    /// [`Rejection::RateLimited`] carrying the time until the window resets.
    pub fn hit(&self, key: &str) -> Result<u32, Rejection> {
        let now = Instant::now();
        self.sweep_if_due(now);
        let mut window = self.windows.entry(key.to_owned()).or_insert(Window {
            started: now,
            count: 0,
        });

        let elapsed = now.duration_since(window.started);
        if elapsed >= self.window {
            window.started = now;
            window.count = 0;
        }

        if window.count >= self.max_requests {
            let retry_after = self.window.saturating_sub(now.duration_since(window.started));
            return Err(Rejection::RateLimited { retry_after });
        }

        window.count += 1;
        Ok(self.max_requests - window.count)
    }

    /// Drops every window that has fully elapsed. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.purge_at(Instant::now())
    }

    fn purge_at(&self, now: Instant) -> usize {
        let before = self.windows.len();
        self.windows
            .retain(|_, w| now.duration_since(w.started) < self.window);
        before.saturating_sub(self.windows.len())
    }

    // Must not be called while holding a `windows` entry.
    fn sweep_if_due(&self, now: Instant) {
        // Another request is already sweeping.
        let Ok(mut last) = self.last_sweep.try_lock() else {
            return;
        };
        if now.duration_since(*last) < self.window {
            return;
        }
        *last = now;
        drop(last);

        let purged = self.purge_at(now);
        if purged > 0 {
            tracing::debug!(purged, remaining = self.windows.len(), "expired rate-limit windows swept");
        }
    }

    /// Number of client keys currently tracked.
    pub fn tracked_clients(&self) -> usize {
        self.windows.len()
    }
}

impl Guard for RateLimiter {
    fn check(&self, ctx: &mut Context) -> Outcome {
        let key = self.client_key(ctx.request());
        match self.hit(&key) {
            Ok(remaining) => {
                let headers = ctx.response_headers_mut();
                headers.set("RateLimit-Limit", self.max_requests.to_string());
                headers.set("RateLimit-Remaining", remaining.to_string());
                Outcome::Continue
            }
            Err(rejection) => {
                tracing::warn!(client = %key, limit = self.max_requests, "rate limit exceeded");
                rejection.into()
            }
        }
    }

    fn name(&self) -> &'static str {
        "rate-limit"
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;
    use crate::http::{Method, StatusCode};

    fn ctx_from(addr: &str) -> Context {
        let addr: SocketAddr = addr.parse().unwrap();
        Context::new(Request::new(Method::Get, "/api/v1/todos").remote_addr(addr))
    }

    #[tokio::test(start_paused = true)]
    async fn sixty_first_request_in_window_is_rejected() {
        let limiter = RateLimiter::new(60, Duration::from_secs(60));
        for _ in 0..60 {
            assert!(matches!(limiter.check(&mut ctx_from("10.1.1.1:5000")), Outcome::Continue));
        }
        match limiter.check(&mut ctx_from("10.1.1.1:5001")) {
            Outcome::Stop(res) => {
                assert_eq!(res.status(), StatusCode::TooManyRequests);
                assert_eq!(res.headers().get("retry-after"), Some("60"));
            }
            Outcome::Continue => panic!("61st request was allowed"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn counter_resets_after_window() {
        let limiter = RateLimiter::new(60, Duration::from_secs(60));
        for _ in 0..60 {
            limiter.hit("client").unwrap();
        }
        assert!(limiter.hit("client").is_err());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(limiter.hit("client").is_err());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(limiter.hit("client").unwrap(), 59);
    }

    #[tokio::test(start_paused = true)]
    async fn clients_are_counted_separately() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert!(matches!(limiter.check(&mut ctx_from("10.0.0.1:1")), Outcome::Continue));
        assert!(matches!(limiter.check(&mut ctx_from("10.0.0.2:1")), Outcome::Continue));
        assert!(matches!(limiter.check(&mut ctx_from("10.0.0.1:2")), Outcome::Stop(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn header_key_falls_back_to_peer() {
        let limiter = RateLimiter::new(5, Duration::from_secs(1)).key_by_header("X-Forwarded-For");
        let proxied = Request::new(Method::Get, "/")
            .header("X-Forwarded-For", "203.0.113.9, 10.0.0.1")
            .remote_addr("10.0.0.1:80".parse().unwrap());
        assert_eq!(limiter.client_key(&proxied), "203.0.113.9");
        let direct = Request::new(Method::Get, "/").remote_addr("10.0.0.7:80".parse().unwrap());
        assert_eq!(limiter.client_key(&direct), "10.0.0.7");
        assert_eq!(limiter.client_key(&Request::new(Method::Get, "/")), "unknown");
    }

    #[tokio::test(start_paused = true)]
    async fn allowed_requests_stage_quota_headers() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        let mut ctx = ctx_from("10.0.0.3:1");
        limiter.check(&mut ctx);
        let staged = ctx.take_response_headers();
        assert_eq!(staged.get("ratelimit-limit"), Some("3"));
        assert_eq!(staged.get("ratelimit-remaining"), Some("2"));
    }

    #[tokio::test(start_paused = true)]
    async fn purge_drops_elapsed_windows() {
        let limiter = RateLimiter::new(10, Duration::from_secs(10));
        limiter.hit("a").unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
        limiter.hit("b").unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(limiter.purge_expired(), 1);
        assert_eq!(limiter.tracked_clients(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_clients_are_swept_by_later_traffic() {
        let limiter = RateLimiter::new(5, Duration::from_secs(60));
        for i in 0..500 {
            limiter.hit(&format!("10.0.{}.{}", i / 256, i % 256)).unwrap();
        }
        assert_eq!(limiter.tracked_clients(), 500);

        tokio::time::advance(Duration::from_secs(30)).await;
        limiter.hit("late").unwrap();
        assert_eq!(limiter.tracked_clients(), 501);

        tokio::time::advance(Duration::from_secs(31)).await;
        limiter.hit("next").unwrap();
        assert_eq!(limiter.tracked_clients(), 2);
    }
}
