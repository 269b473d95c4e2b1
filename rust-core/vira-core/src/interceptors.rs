//! # Built-in Interceptors
//!
//! Ready-made [`Middleware`] implementations for common cross-cutting
//! concerns. Register them on an [`App`](crate::App) in the order they should
//! wrap each other; the first one added sees the request first and the
//! response last.

use crate::error::{Error, Result};
use crate::middleware::{BoxFuture, Middleware, Next};
use crate::request::Request;
use crate::response::Response;
use crate::router::Method;
use flate2::write::GzEncoder;
use flate2::Compression;
use hyper::body::Bytes;
use std::collections::{BTreeSet, HashMap};
use std::io::Write;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Logging middleware - structured request/response events
#[derive(Debug, Default)]
pub struct LoggingMiddleware {
    log_headers: bool,
}

impl LoggingMiddleware {
    /// Create a new logging middleware
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable header logging
    #[must_use]
    pub const fn with_headers(mut self) -> Self {
        self.log_headers = true;
        self
    }
}

impl Middleware for LoggingMiddleware {
    fn handle(&self, req: Request, next: Next) -> BoxFuture<'_, Result<Response>> {
        Box::pin(async move {
            let method = req.method;
            let path = req.path.clone();
            let request_id = req.header("x-request-id").unwrap_or("-").to_string();

            if self.log_headers {
                info!(%method, %path, %request_id, headers = ?req.headers(), "Request received");
            } else {
                info!(%method, %path, %request_id, "Request received");
            }

            let result = next.run(req).await;
            match &result {
                Ok(res) => info!(
                    %method,
                    %path,
                    status = res.status,
                    %request_id,
                    "Response sent"
                ),
                Err(err) => error!(%method, %path, %request_id, error = %err, "Request failed"),
            }
            result
        })
    }

    fn name(&self) -> &'static str {
        "LoggingMiddleware"
    }
}

/// Timing middleware - measures time spent in the inner pipeline
///
/// Adds an `x-process-time` header with the elapsed milliseconds.
#[derive(Debug, Default, Clone, Copy)]
pub struct TimingMiddleware;

impl TimingMiddleware {
    /// Create a new timing middleware
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Middleware for TimingMiddleware {
    fn handle(&self, req: Request, next: Next) -> BoxFuture<'_, Result<Response>> {
        Box::pin(async move {
            let method = req.method;
            let path = req.path.clone();
            let start = Instant::now();

            let mut response = next.run(req).await?;

            let duration = start.elapsed();
            debug!(
                %method,
                %path,
                duration_ms = %duration.as_millis(),
                "Request timing"
            );
            response.set_header(
                "x-process-time",
                &format!("{:.3}", duration.as_secs_f64() * 1000.0),
            );
            Ok(response)
        })
    }

    fn name(&self) -> &'static str {
        "TimingMiddleware"
    }
}

/// CORS middleware - answers preflights and decorates responses
#[derive(Debug, Clone)]
pub struct CorsMiddleware {
    allow_origins: BTreeSet<String>,
    allow_methods: BTreeSet<Method>,
    allow_headers: BTreeSet<String>,
    expose_headers: Vec<String>,
    allow_credentials: bool,
    max_age: u32,
}

impl Default for CorsMiddleware {
    fn default() -> Self {
        Self {
            allow_origins: BTreeSet::from(["*".to_string()]),
            allow_methods: Method::ALL.into_iter().collect(),
            allow_headers: BTreeSet::new(),
            expose_headers: Vec::new(),
            allow_credentials: false,
            max_age: 600,
        }
    }
}

impl CorsMiddleware {
    /// Create a new CORS middleware allowing any origin and method
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to the given origins (`*` allows all)
    #[must_use]
    pub fn allow_origins<I, S>(mut self, origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allow_origins = origins.into_iter().map(Into::into).collect();
        self
    }

    /// Set allowed methods
    #[must_use]
    pub fn allow_methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.allow_methods = methods.into_iter().collect();
        self
    }

    /// Set allowed request headers (`*` allows all); empty allows all
    #[must_use]
    pub fn allow_headers<I, S>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allow_headers = headers
            .into_iter()
            .map(|h| h.into().to_ascii_lowercase())
            .collect();
        self
    }

    /// Set headers exposed to the browser
    #[must_use]
    pub fn expose_headers<I, S>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.expose_headers = headers.into_iter().map(Into::into).collect();
        self
    }

    /// Allow credentialed requests
    ///
    /// With credentials, `*` no longer matches; origins must be listed.
    #[must_use]
    pub fn allow_credentials(mut self, allow: bool) -> Self {
        self.allow_credentials = allow;
        self
    }

    /// Preflight cache lifetime in seconds
    #[must_use]
    pub fn max_age(mut self, seconds: u32) -> Self {
        self.max_age = seconds;
        self
    }

    fn is_origin_allowed(&self, origin: &str) -> bool {
        (self.allow_origins.contains("*") && !self.allow_credentials)
            || self.allow_origins.contains(origin)
    }

    fn are_headers_allowed(&self, requested: &str) -> bool {
        self.allow_headers.is_empty()
            || self.allow_headers.contains("*")
            || requested
                .split(',')
                .map(|h| h.trim().to_ascii_lowercase())
                .filter(|h| !h.is_empty())
                .all(|h| self.allow_headers.contains(&h))
    }

    fn preflight(&self, req: &Request, origin: &str) -> Response {
        let mut response = Response::text("").with_status(204);
        if !self.is_origin_allowed(origin) {
            return response;
        }

        response.set_header("access-control-allow-origin", origin);
        if self.allow_credentials {
            response.set_header("access-control-allow-credentials", "true");
        }

        let requested_method = req
            .header("access-control-request-method")
            .and_then(|m| m.parse::<Method>().ok());
        if requested_method.is_some_and(|m| self.allow_methods.contains(&m)) {
            let methods: Vec<&str> = self.allow_methods.iter().map(Method::as_str).collect();
            response.set_header("access-control-allow-methods", &methods.join(", "));
        }

        if let Some(requested) = req.header("access-control-request-headers") {
            if self.are_headers_allowed(requested) {
                response.set_header("access-control-allow-headers", requested);
            }
        }

        response.set_header("access-control-max-age", &self.max_age.to_string());
        response
    }

    fn decorate(&self, response: &mut Response, origin: &str) {
        if !self.is_origin_allowed(origin) {
            return;
        }
        response.set_header("access-control-allow-origin", origin);
        if self.allow_credentials {
            response.set_header("access-control-allow-credentials", "true");
        }
        if !self.expose_headers.is_empty() {
            response.set_header(
                "access-control-expose-headers",
                &self.expose_headers.join(", "),
            );
        }
    }
}

impl Middleware for CorsMiddleware {
    fn handle(&self, req: Request, next: Next) -> BoxFuture<'_, Result<Response>> {
        Box::pin(async move {
            let Some(origin) = req.header("origin").map(str::to_string) else {
                return next.run(req).await;
            };

            let is_preflight = req.method == Method::Options
                && req.header("access-control-request-method").is_some();
            if is_preflight {
                return Ok(self.preflight(&req, &origin));
            }

            let mut response = next.run(req).await?;
            self.decorate(&mut response, &origin);
            Ok(response)
        })
    }

    fn name(&self) -> &'static str {
        "CorsMiddleware"
    }
}

/// Token bucket rate limiting middleware
///
/// Buckets are keyed by the `x-client-ip` header set by the server. Buckets
/// that have refilled to capacity are dropped on a periodic sweep, since a
/// full bucket behaves exactly like a missing one.
pub struct RateLimitMiddleware {
    /// Maximum burst capacity
    capacity: u64,
    /// Tokens refilled per second
    refill_per_sec: u64,
    /// Minimum time between sweeps of idle buckets
    sweep_interval: Duration,
    /// Per-key buckets
    state: Mutex<Buckets>,
}

struct Buckets {
    by_key: HashMap<String, Bucket>,
    last_sweep: Instant,
}

/// Internal token bucket state
struct Bucket {
    tokens: u64,
    last_refill: Instant,
}

enum Admission {
    Allowed,
    Limited { retry_after: Option<u64> },
}

impl RateLimitMiddleware {
    /// Create a new rate limiter
    #[must_use]
    pub fn new(capacity: u64, refill_per_sec: u64) -> Self {
        Self {
            capacity,
            refill_per_sec,
            sweep_interval: Duration::from_secs(60),
            state: Mutex::new(Buckets {
                by_key: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    /// Set how often idle buckets are evicted (default: 60 seconds)
    #[must_use]
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn refill(&self, bucket: &Bucket, now: Instant) -> u64 {
        let elapsed = now.duration_since(bucket.last_refill);
        (elapsed.as_secs_f64() * self.refill_per_sec as f64) as u64
    }

    fn sweep(&self, buckets: &mut Buckets, now: Instant) {
        if now.duration_since(buckets.last_sweep) < self.sweep_interval {
            return;
        }
        let before = buckets.by_key.len();
        buckets.by_key.retain(|_, bucket| {
            bucket.tokens.saturating_add(self.refill(bucket, now)) < self.capacity
        });
        buckets.last_sweep = now;
        debug!(evicted = before - buckets.by_key.len(), "Rate limit buckets swept");
    }

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn admit(&self, key: &str) -> Admission {
        let mut buckets = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let now = Instant::now();
        self.sweep(&mut buckets, now);

        let bucket = buckets.by_key.entry(key.to_string()).or_insert(Bucket {
            tokens: self.capacity,
            last_refill: now,
        });
        let refill = self.refill(bucket, now);
        if refill > 0 {
            bucket.tokens = bucket.tokens.saturating_add(refill).min(self.capacity);
            bucket.last_refill = now;
        }
        if bucket.tokens > 0 {
            bucket.tokens -= 1;
            return Admission::Allowed;
        }

        // Time until the next token lands, rounded up to whole seconds
        let retry_after = (self.refill_per_sec > 0).then(|| {
            let per_token = 1.0 / self.refill_per_sec as f64;
            let waited = now.duration_since(bucket.last_refill).as_secs_f64();
            ((per_token - waited).ceil() as u64).max(1)
        });
        Admission::Limited { retry_after }
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .by_key
            .len()
    }
}

impl Middleware for RateLimitMiddleware {
    fn handle(&self, req: Request, next: Next) -> BoxFuture<'_, Result<Response>> {
        Box::pin(async move {
            let key = req.header("x-client-ip").unwrap_or("unknown").to_string();
            let Admission::Limited { retry_after } = self.admit(&key) else {
                return next.run(req).await;
            };

            warn!(client = %key, path = %req.path, "Rate limit exceeded");
            let mut response = Response::json(r#"{"error":"Rate limit exceeded"}"#)
                .with_status(429)
                .with_header("x-ratelimit-limit", &self.capacity.to_string())
                .with_header("x-ratelimit-remaining", "0");
            if let Some(seconds) = retry_after {
                response.set_header("retry-after", &seconds.to_string());
            }
            Ok(response)
        })
    }

    fn name(&self) -> &'static str {
        "RateLimitMiddleware"
    }
}

/// Rejects requests whose `host` header is not in the allow list
///
/// Entries may be exact hosts, `*` or `*.example.com` wildcards.
#[derive(Debug, Clone)]
pub struct TrustedHostMiddleware {
    allowed_hosts: BTreeSet<String>,
}

impl TrustedHostMiddleware {
    /// Create with the given allowed host patterns
    #[must_use]
    pub fn new<I, S>(allowed_hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_hosts: allowed_hosts.into_iter().map(Into::into).collect(),
        }
    }

    fn is_host_allowed(&self, host: &str) -> bool {
        let host = strip_port(host);
        self.allowed_hosts.iter().any(|allowed| {
            if allowed == "*" || allowed == host {
                return true;
            }
            allowed.strip_prefix("*.").is_some_and(|domain| {
                host == domain || host.ends_with(&format!(".{domain}"))
            })
        })
    }
}

/// Drop a trailing `:port`, keeping bracketed IPv6 literals intact
fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return host.find(']').map_or(host, |end| &host[..=end]);
    }
    match host.split_once(':') {
        Some((name, port)) if !port.contains(':') => name,
        _ => host,
    }
}

impl Middleware for TrustedHostMiddleware {
    fn handle(&self, req: Request, next: Next) -> BoxFuture<'_, Result<Response>> {
        Box::pin(async move {
            if req.header("host").is_some_and(|host| self.is_host_allowed(host)) {
                return next.run(req).await;
            }

            warn!(host = ?req.header("host"), "Rejected untrusted host");
            Ok(Response::text("Invalid host header").with_status(400))
        })
    }

    fn name(&self) -> &'static str {
        "TrustedHostMiddleware"
    }
}

/// Adds browser hardening headers to every response
///
/// `strict-transport-security` is only sent when the request arrived over
/// HTTPS according to `x-forwarded-proto`.
#[derive(Debug, Clone)]
pub struct SecurityHeadersMiddleware {
    headers: Vec<(String, String)>,
    hsts: Option<String>,
}

impl Default for SecurityHeadersMiddleware {
    fn default() -> Self {
        Self {
            headers: vec![
                ("x-frame-options".to_string(), "DENY".to_string()),
                ("x-content-type-options".to_string(), "nosniff".to_string()),
                ("x-xss-protection".to_string(), "1; mode=block".to_string()),
                (
                    "referrer-policy".to_string(),
                    "strict-origin-when-cross-origin".to_string(),
                ),
            ],
            hsts: Some("max-age=31536000; includeSubDomains".to_string()),
        }
    }
}

impl SecurityHeadersMiddleware {
    /// Create with the default header set and HSTS enabled
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a header
    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        let name = name.to_ascii_lowercase();
        self.headers.retain(|(n, _)| *n != name);
        self.headers.push((name, value.to_string()));
        self
    }

    /// Set the HSTS max-age, or disable HSTS with `None`
    #[must_use]
    pub fn hsts_max_age(mut self, seconds: Option<u64>) -> Self {
        self.hsts = seconds.map(|s| format!("max-age={s}; includeSubDomains"));
        self
    }
}

impl Middleware for SecurityHeadersMiddleware {
    fn handle(&self, req: Request, next: Next) -> BoxFuture<'_, Result<Response>> {
        Box::pin(async move {
            let https = req
                .header("x-forwarded-proto")
                .is_some_and(|p| p.eq_ignore_ascii_case("https"));

            let mut response = next.run(req).await?;
            for (name, value) in &self.headers {
                response.set_header(name, value);
            }
            if let (true, Some(hsts)) = (https, &self.hsts) {
                response.set_header("strict-transport-security", hsts);
            }
            Ok(response)
        })
    }

    fn name(&self) -> &'static str {
        "SecurityHeadersMiddleware"
    }
}

/// Redirects plain HTTP requests to their `https://` equivalent
///
/// The transport does not terminate TLS, so the original scheme is read from
/// `x-forwarded-proto`. Requests without it are treated as plain HTTP.
#[derive(Debug, Clone, Copy)]
pub struct HttpsRedirectMiddleware {
    status: u16,
}

impl Default for HttpsRedirectMiddleware {
    fn default() -> Self {
        Self { status: 307 }
    }
}

impl HttpsRedirectMiddleware {
    /// Temporary redirects (307)
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Permanent redirects (308)
    #[must_use]
    pub const fn permanent() -> Self {
        Self { status: 308 }
    }

    fn location(req: &Request, host: &str) -> String {
        let host = host.strip_suffix(":80").unwrap_or(host);
        match req.query_string() {
            Some(query) if !query.is_empty() => format!("https://{host}{}?{query}", req.path),
            _ => format!("https://{host}{}", req.path),
        }
    }
}

impl Middleware for HttpsRedirectMiddleware {
    fn handle(&self, req: Request, next: Next) -> BoxFuture<'_, Result<Response>> {
        Box::pin(async move {
            let https = req
                .header("x-forwarded-proto")
                .is_some_and(|p| p.eq_ignore_ascii_case("https"));
            if https {
                return next.run(req).await;
            }

            let Some(host) = req.header("host") else {
                return Ok(Response::text("Missing host header").with_status(400));
            };
            let location = Self::location(&req, host);
            debug!(%location, "Redirecting to HTTPS");
            Ok(Response::redirect(&location, self.status))
        })
    }

    fn name(&self) -> &'static str {
        "HttpsRedirectMiddleware"
    }
}

/// Content types worth compressing
const COMPRESSIBLE_TYPES: [&str; 6] = [
    "text/",
    "application/json",
    "application/javascript",
    "application/xml",
    "application/atom+xml",
    "application/rss+xml",
];

/// Gzip-compresses responses for clients that accept it
///
/// Only textual bodies of at least `minimum_size` bytes are compressed, and
/// responses that already carry a `content-encoding` are left alone.
#[derive(Debug, Clone, Copy)]
pub struct GZipMiddleware {
    minimum_size: usize,
    level: u32,
}

impl Default for GZipMiddleware {
    fn default() -> Self {
        Self {
            minimum_size: 500,
            level: 9,
        }
    }
}

impl GZipMiddleware {
    /// Compress bodies of 500 bytes or more at level 9
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Smallest body size in bytes that gets compressed
    #[must_use]
    pub const fn minimum_size(mut self, bytes: usize) -> Self {
        self.minimum_size = bytes;
        self
    }

    /// Compression level, clamped to 0-9
    #[must_use]
    pub fn level(mut self, level: u32) -> Self {
        self.level = level.min(9);
        self
    }

    fn should_compress(&self, response: &Response) -> bool {
        response.header("content-encoding").is_none()
            && response.raw_body.is_none()
            && response.body.len() >= self.minimum_size
            && COMPRESSIBLE_TYPES
                .iter()
                .any(|t| response.content_type.starts_with(t))
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::new(self.level));
        encoder.write_all(data)?;
        encoder.finish().map_err(Error::from)
    }
}

impl Middleware for GZipMiddleware {
    fn handle(&self, req: Request, next: Next) -> BoxFuture<'_, Result<Response>> {
        Box::pin(async move {
            let accepts_gzip = req
                .header("accept-encoding")
                .is_some_and(|v| v.to_ascii_lowercase().contains("gzip"));

            let mut response = next.run(req).await?;
            if !accepts_gzip || !self.should_compress(&response) {
                return Ok(response);
            }

            let compressed = self.compress(response.body.as_bytes())?;
            debug!(
                original = response.body.len(),
                compressed = compressed.len(),
                "Response compressed"
            );
            response.raw_body = Some(Bytes::from(compressed));
            response.set_header("content-encoding", "gzip");
            let vary = match response.header("vary") {
                Some(existing) if !existing.is_empty() => format!("{existing}, accept-encoding"),
                _ => "accept-encoding".to_string(),
            };
            response.set_header("vary", &vary);
            Ok(response)
        })
    }

    fn name(&self) -> &'static str {
        "GZipMiddleware"
    }
}

/// Converts errors from inner stages into JSON 500 responses
///
/// The status is always 500. In debug mode the body carries the error kind
/// and message; otherwise a generic message is returned.
#[derive(Debug, Default, Clone, Copy)]
pub struct ErrorMiddleware {
    debug: bool,
}

impl ErrorMiddleware {
    /// Production mode: generic error bodies
    #[must_use]
    pub const fn new() -> Self {
        Self { debug: false }
    }

    /// Debug mode: error details in the body
    #[must_use]
    pub const fn debug() -> Self {
        Self { debug: true }
    }

    fn to_response(self, err: &Error) -> Response {
        let body = if self.debug {
            serde_json::json!({
                "error": {
                    "type": error_kind(err),
                    "message": err.to_string(),
                }
            })
        } else {
            serde_json::json!({
                "error": {
                    "type": "HTTP_500_INTERNAL_SERVER_ERROR",
                    "message": "Internal Server Error",
                }
            })
        };
        Response::json_value(&body).with_status(500)
    }
}

const fn error_kind(err: &Error) -> &'static str {
    match err {
        Error::Handler { .. } => "Handler",
        Error::JsonBody(_) | Error::Json(_) => "Json",
        Error::PayloadTooLarge { .. } => "PayloadTooLarge",
        Error::InvalidMethod { .. } => "InvalidMethod",
        _ => "Internal",
    }
}

impl Middleware for ErrorMiddleware {
    fn handle(&self, req: Request, next: Next) -> BoxFuture<'_, Result<Response>> {
        Box::pin(async move {
            let path = req.path.clone();
            match next.run(req).await {
                Ok(response) => Ok(response),
                Err(err) => {
                    error!(%path, error = %err, "Unhandled error converted to response");
                    Ok(self.to_response(&err))
                }
            }
        })
    }

    fn name(&self) -> &'static str {
        "ErrorMiddleware"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{MiddlewareChain, Pipeline};
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn pipeline_with<M: Middleware + 'static>(middleware: M) -> Pipeline {
        let mut chain = MiddlewareChain::new();
        chain.add(middleware).unwrap();
        chain.build(|req: Request| async move {
            if req.path == "/fail" {
                return Err(Error::handler("exploded"));
            }
            Ok(Response::text("ok"))
        })
    }

    fn request(method: Method, path: &str, headers: &[(&str, &str)]) -> Request {
        headers
            .iter()
            .fold(Request::new(method, path, HashMap::new(), None), |req, (k, v)| {
                req.with_header(k, v)
            })
    }

    #[test]
    fn test_middleware_names() {
        assert_eq!(LoggingMiddleware::new().name(), "LoggingMiddleware");
        assert_eq!(TimingMiddleware::new().name(), "TimingMiddleware");
        assert_eq!(CorsMiddleware::new().name(), "CorsMiddleware");
        assert_eq!(RateLimitMiddleware::new(1, 1).name(), "RateLimitMiddleware");
        assert_eq!(GZipMiddleware::new().name(), "GZipMiddleware");
        assert_eq!(HttpsRedirectMiddleware::new().name(), "HttpsRedirectMiddleware");
        assert_eq!(ErrorMiddleware::new().name(), "ErrorMiddleware");
    }

    #[tokio::test]
    async fn test_logging_passes_through() {
        let pipeline = pipeline_with(LoggingMiddleware::new().with_headers());
        let response = pipeline.invoke(Request::get("/")).await.unwrap();
        assert_eq!(response.body, "ok");
        assert!(pipeline.invoke(Request::get("/fail")).await.is_err());
    }

    #[tokio::test]
    async fn test_timing_header() {
        let pipeline = pipeline_with(TimingMiddleware::new());
        let response = pipeline.invoke(Request::get("/")).await.unwrap();
        let value: f64 = response.header("x-process-time").unwrap().parse().unwrap();
        assert!(value >= 0.0);
    }

    #[tokio::test]
    async fn test_cors_simple_request() {
        let pipeline = pipeline_with(
            CorsMiddleware::new()
                .allow_origins(["https://example.com"])
                .expose_headers(["x-total"]),
        );

        let response = pipeline
            .invoke(request(Method::Get, "/", &[("origin", "https://example.com")]))
            .await
            .unwrap();
        assert_eq!(
            response.header("access-control-allow-origin"),
            Some("https://example.com")
        );
        assert_eq!(response.header("access-control-expose-headers"), Some("x-total"));

        let response = pipeline
            .invoke(request(Method::Get, "/", &[("origin", "https://evil.test")]))
            .await
            .unwrap();
        assert_eq!(response.header("access-control-allow-origin"), None);
    }

    #[tokio::test]
    async fn test_cors_preflight() {
        let pipeline = pipeline_with(
            CorsMiddleware::new()
                .allow_methods([Method::Get, Method::Post])
                .allow_headers(["content-type"])
                .max_age(60),
        );

        let response = pipeline
            .invoke(request(
                Method::Options,
                "/",
                &[
                    ("origin", "https://app.test"),
                    ("access-control-request-method", "POST"),
                    ("access-control-request-headers", "Content-Type"),
                ],
            ))
            .await
            .unwrap();

        assert_eq!(response.status, 204);
        assert_eq!(response.body, "");
        assert_eq!(
            response.header("access-control-allow-methods"),
            Some("GET, POST")
        );
        assert_eq!(
            response.header("access-control-allow-headers"),
            Some("Content-Type")
        );
        assert_eq!(response.header("access-control-max-age"), Some("60"));
    }

    #[tokio::test]
    async fn test_cors_credentials_require_listed_origin() {
        let pipeline = pipeline_with(CorsMiddleware::new().allow_credentials(true));
        let response = pipeline
            .invoke(request(Method::Get, "/", &[("origin", "https://app.test")]))
            .await
            .unwrap();
        assert_eq!(response.header("access-control-allow-origin"), None);
    }

    #[tokio::test]
    async fn test_rate_limit_exhausts_bucket() {
        let pipeline = pipeline_with(RateLimitMiddleware::new(2, 0));
        let req = || request(Method::Get, "/", &[("x-client-ip", "10.0.0.1")]);

        assert_eq!(pipeline.invoke(req()).await.unwrap().status, 200);
        assert_eq!(pipeline.invoke(req()).await.unwrap().status, 200);
        assert_eq!(pipeline.invoke(req()).await.unwrap().status, 429);

        let other = request(Method::Get, "/", &[("x-client-ip", "10.0.0.2")]);
        assert_eq!(pipeline.invoke(other).await.unwrap().status, 200);
    }

    #[tokio::test]
    async fn test_rate_limit_rejection_headers() {
        let pipeline = pipeline_with(RateLimitMiddleware::new(1, 1));
        let req = || request(Method::Get, "/", &[("x-client-ip", "10.0.0.1")]);

        assert_eq!(pipeline.invoke(req()).await.unwrap().status, 200);
        let limited = pipeline.invoke(req()).await.unwrap();
        assert_eq!(limited.status, 429);
        assert_eq!(limited.header("retry-after"), Some("1"));
        assert_eq!(limited.header("x-ratelimit-limit"), Some("1"));
        assert_eq!(limited.header("x-ratelimit-remaining"), Some("0"));

        let never_refills = pipeline_with(RateLimitMiddleware::new(1, 0));
        never_refills.invoke(req()).await.unwrap();
        let limited = never_refills.invoke(req()).await.unwrap();
        assert_eq!(limited.status, 429);
        assert_eq!(limited.header("retry-after"), None);
    }

    #[tokio::test]
    async fn test_rate_limit_evicts_refilled_buckets() {
        let limiter = RateLimitMiddleware::new(1, 20).with_sweep_interval(Duration::ZERO);
        for i in 0..50 {
            assert!(matches!(limiter.admit(&format!("10.0.0.{i}")), Admission::Allowed));
        }
        assert_eq!(limiter.tracked_keys(), 50);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(matches!(limiter.admit("10.0.1.1"), Admission::Allowed));
        assert_eq!(limiter.tracked_keys(), 1);

        // Drained buckets that cannot refill must survive the sweep
        let strict = RateLimitMiddleware::new(1, 0).with_sweep_interval(Duration::ZERO);
        assert!(matches!(strict.admit("a"), Admission::Allowed));
        assert!(matches!(strict.admit("b"), Admission::Allowed));
        assert!(matches!(strict.admit("a"), Admission::Limited { .. }));
        assert_eq!(strict.tracked_keys(), 2);
    }

    #[tokio::test]
    async fn test_trusted_host() {
        let pipeline = pipeline_with(TrustedHostMiddleware::new([
            "example.com",
            "*.example.org",
            "[::1]",
        ]));

        for (host, status) in [
            ("example.com", 200),
            ("example.com:8080", 200),
            ("[::1]", 200),
            ("[::1]:8000", 200),
            ("[::2]:8000", 400),
            ("::1", 400),
            ("api.example.org", 200),
            ("example.org", 200),
            ("evil.com", 400),
            ("notexample.org", 400),
        ] {
            let response = pipeline
                .invoke(request(Method::Get, "/", &[("host", host)]))
                .await
                .unwrap();
            assert_eq!(response.status, status, "host {host}");
        }

        let response = pipeline.invoke(Request::get("/")).await.unwrap();
        assert_eq!(response.status, 400);
    }

    #[tokio::test]
    async fn test_security_headers() {
        let pipeline = pipeline_with(
            SecurityHeadersMiddleware::new().with_header("X-Frame-Options", "SAMEORIGIN"),
        );

        let response = pipeline.invoke(Request::get("/")).await.unwrap();
        assert_eq!(response.header("x-frame-options"), Some("SAMEORIGIN"));
        assert_eq!(response.header("x-content-type-options"), Some("nosniff"));
        assert_eq!(response.header("strict-transport-security"), None);

        let response = pipeline
            .invoke(request(Method::Get, "/", &[("x-forwarded-proto", "https")]))
            .await
            .unwrap();
        assert!(response.header("strict-transport-security").is_some());
    }

    #[tokio::test]
    async fn test_https_redirect() {
        let pipeline = pipeline_with(HttpsRedirectMiddleware::new());

        let response = pipeline
            .invoke(request(
                Method::Get,
                "/docs?page=2",
                &[("host", "example.com:80")],
            ))
            .await
            .unwrap();
        assert_eq!(response.status, 307);
        assert_eq!(
            response.header("location"),
            Some("https://example.com/docs?page=2")
        );

        let response = pipeline
            .invoke(request(
                Method::Get,
                "/docs",
                &[("host", "example.com"), ("x-forwarded-proto", "https")],
            ))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, "ok");

        let permanent = pipeline_with(HttpsRedirectMiddleware::permanent());
        let response = permanent
            .invoke(request(Method::Post, "/submit", &[("host", "api.test:8080")]))
            .await
            .unwrap();
        assert_eq!(response.status, 308);
        assert_eq!(response.header("location"), Some("https://api.test:8080/submit"));

        let response = permanent.invoke(Request::get("/")).await.unwrap();
        assert_eq!(response.status, 400);
    }

    fn gunzip(bytes: &[u8]) -> String {
        let mut out = String::new();
        GzDecoder::new(bytes).read_to_string(&mut out).unwrap();
        out
    }

    #[tokio::test]
    async fn test_gzip_compresses_large_text() {
        let body = "vira ".repeat(200);
        let expected = body.clone();
        let mut chain = MiddlewareChain::new();
        chain.add(GZipMiddleware::new().minimum_size(100)).unwrap();
        let pipeline = chain.build(move |req: Request| {
            let body = body.clone();
            async move {
                if req.path == "/small" {
                    return Ok(Response::text("tiny"));
                }
                if req.path == "/encoded" {
                    return Ok(Response::text(body).with_header("content-encoding", "br"));
                }
                if req.path == "/binary" {
                    return Ok(Response::text(body).with_header("content-type", "image/png"));
                }
                Ok(Response::json(body).with_header("vary", "origin"))
            }
        });
        let gzip_request =
            |path: &str| request(Method::Get, path, &[("accept-encoding", "deflate, GZIP")]);

        let response = pipeline.invoke(gzip_request("/")).await.unwrap();
        assert_eq!(response.header("content-encoding"), Some("gzip"));
        assert_eq!(response.header("vary"), Some("origin, accept-encoding"));
        let wire = response.body_bytes();
        assert!(wire.len() < expected.len());
        assert_eq!(gunzip(&wire), expected);

        let response = pipeline.invoke(Request::get("/")).await.unwrap();
        assert_eq!(response.header("content-encoding"), None);
        assert!(response.raw_body.is_none());

        for path in ["/small", "/binary"] {
            let response = pipeline.invoke(gzip_request(path)).await.unwrap();
            assert_eq!(response.header("content-encoding"), None, "{path}");
        }
        let response = pipeline.invoke(gzip_request("/encoded")).await.unwrap();
        assert_eq!(response.header("content-encoding"), Some("br"));
        assert!(response.raw_body.is_none());
    }

    #[tokio::test]
    async fn test_error_middleware_status_ignores_debug() {
        for middleware in [ErrorMiddleware::new(), ErrorMiddleware::debug()] {
            let mut chain = MiddlewareChain::new();
            chain.add(middleware).unwrap();
            let pipeline = chain.build(|req: Request| async move {
                let _: serde_json::Value = req.json()?;
                Ok(Response::text("parsed"))
            });

            let bad_json = Request::new(
                Method::Post,
                "/items",
                HashMap::new(),
                Some(Bytes::from_static(b"{")),
            );
            let response = pipeline.invoke(bad_json).await.unwrap();
            assert_eq!(response.status, 500);
        }
    }

    #[tokio::test]
    async fn test_error_middleware_production() {
        let pipeline = pipeline_with(ErrorMiddleware::new());
        let response = pipeline.invoke(Request::get("/fail")).await.unwrap();

        assert_eq!(response.status, 500);
        let body: serde_json::Value = serde_json::from_str(&response.body).unwrap();
        assert_eq!(body["error"]["message"], "Internal Server Error");
    }

    #[tokio::test]
    async fn test_error_middleware_debug() {
        let pipeline = pipeline_with(ErrorMiddleware::debug());
        let response = pipeline.invoke(Request::get("/fail")).await.unwrap();

        assert_eq!(response.status, 500);
        let body: serde_json::Value = serde_json::from_str(&response.body).unwrap();
        assert_eq!(body["error"]["type"], "Handler");
        assert_eq!(body["error"]["message"], "Handler error: exploded");
    }
}
