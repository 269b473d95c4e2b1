//! # HTTP Response
//!
//! Response value returned by handlers and threaded back out through the
//! interceptors' post phases.

use crate::json::to_json;
use crate::router::Method;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::StatusCode;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};

/// HTTP response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// HTTP status code
    pub status: u16,
    /// Response body
    pub body: String,
    /// Encoded body bytes; when set they are sent instead of `body`
    pub raw_body: Option<Bytes>,
    /// Content type
    pub content_type: String,
    /// Response headers (keys stored lowercase)
    pub headers: HashMap<String, String>,
}

impl Default for Response {
    fn default() -> Self {
        Self {
            status: 200,
            body: String::new(),
            raw_body: None,
            content_type: "text/plain".to_string(),
            headers: HashMap::new(),
        }
    }
}

impl Response {
    /// Create a JSON response from an already-encoded body
    #[must_use]
    pub fn json(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            content_type: "application/json".to_string(),
            ..Self::default()
        }
    }

    /// Create a JSON response by serializing `value`
    ///
    /// Serialization failures produce a 500 response.
    #[must_use]
    pub fn json_value<T: Serialize>(value: &T) -> Self {
        match to_json(value) {
            Ok(body) => Self::json(body),
            Err(e) => Self::internal_error(&e.to_string()),
        }
    }

    /// Create a text response
    #[must_use]
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    /// 404 response
    #[must_use]
    pub fn not_found() -> Self {
        Self::text("Not Found").with_status(404)
    }

    /// 405 response listing the allowed methods in an `allow` header
    #[must_use]
    pub fn method_not_allowed(allowed: &BTreeSet<Method>) -> Self {
        let mut names: Vec<&str> = allowed.iter().map(Method::as_str).collect();
        names.sort_unstable();
        Self::text("Method Not Allowed")
            .with_status(405)
            .with_header("allow", &names.join(", "))
    }

    /// Redirect to `location` with a 3xx `status`
    #[must_use]
    pub fn redirect(location: &str, status: u16) -> Self {
        Self::text("").with_status(status).with_header("location", location)
    }

    /// 500 response with a JSON error body
    #[must_use]
    pub fn internal_error(message: &str) -> Self {
        let body = serde_json::json!({
            "error": {
                "type": "HTTP_500_INTERNAL_SERVER_ERROR",
                "message": message,
            }
        });
        Self::json(body.to_string()).with_status(500)
    }

    /// Set status code
    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    /// Set header
    #[must_use]
    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.set_header(key, value);
        self
    }

    /// Set or override a header
    ///
    /// `content-type` is routed to the dedicated field.
    pub fn set_header(&mut self, key: &str, value: &str) {
        if key.eq_ignore_ascii_case("content-type") {
            self.content_type = value.to_string();
        } else {
            self.headers.insert(key.to_ascii_lowercase(), value.to_string());
        }
    }

    /// Bytes that go on the wire
    #[must_use]
    pub fn body_bytes(&self) -> Bytes {
        self.raw_body
            .clone()
            .unwrap_or_else(|| Bytes::from(self.body.clone()))
    }

    /// Get a header value by name (case-insensitive)
    #[must_use]
    pub fn header(&self, key: &str) -> Option<&str> {
        if key.eq_ignore_ascii_case("content-type") {
            return Some(&self.content_type);
        }
        self.headers
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Convert to hyper Response
    pub(crate) fn into_hyper(self) -> hyper::Response<Full<Bytes>> {
        let status =
            StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut builder = hyper::Response::builder()
            .status(status)
            .header("content-type", &self.content_type);
        for (k, v) in &self.headers {
            builder = builder.header(k.as_str(), v.as_str());
        }

        let body = self.raw_body.unwrap_or_else(|| Bytes::from(self.body));
        builder
            .body(Full::new(body))
            .unwrap_or_else(|_| {
                let mut fallback = hyper::Response::new(Full::new(Bytes::from_static(
                    b"Internal Server Error",
                )));
                *fallback.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                fallback
            })
    }
}
