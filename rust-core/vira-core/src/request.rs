//! # HTTP Request
//!
//! Request wrapper carried through the middleware pipeline.
//!
//! Holds the method, path, decoded query, headers, collected body and, once
//! routed, the typed path parameters. Interceptors may attach string
//! extensions for downstream stages.

use crate::error::{Error, Result};
use crate::json::parse_json_bytes;
use crate::route::PathParams;
use crate::router::Method;
use http_body_util::BodyExt;
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use serde::de::DeserializeOwned;
use std::collections::HashMap;

/// HTTP request as seen by interceptors and handlers
#[derive(Debug, Clone)]
pub struct Request {
    /// HTTP method
    pub method: Method,
    /// Request path (without query string)
    pub path: String,
    /// Typed path parameters, filled in by the router dispatch
    pub path_params: PathParams,
    query_string: Option<String>,
    query_params: HashMap<String, String>,
    headers: HeaderMap,
    body: Bytes,
    extensions: HashMap<String, String>,
}

impl Request {
    /// Create a request from its parts
    ///
    /// A `?query` suffix on `path` is split off and decoded. Header pairs that
    /// are not valid HTTP are skipped.
    pub fn new(
        method: Method,
        path: impl Into<String>,
        headers_map: HashMap<String, String>,
        body: Option<Bytes>,
    ) -> Self {
        let path = path.into();
        let (path, query_string) = match path.split_once('?') {
            Some((p, q)) => (p.to_string(), Some(q.to_string())),
            None => (path, None),
        };

        let mut headers = HeaderMap::new();
        for (k, v) in headers_map {
            if let (Ok(n), Ok(v)) = (
                HeaderName::from_bytes(k.as_bytes()),
                HeaderValue::from_str(&v),
            ) {
                headers.insert(n, v);
            }
        }

        Self {
            method,
            path,
            path_params: PathParams::new(),
            query_params: parse_query_string(query_string.as_deref()),
            query_string,
            headers,
            body: body.unwrap_or_default(),
            extensions: HashMap::new(),
        }
    }

    /// Shorthand for a bodiless request without headers
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path, HashMap::new(), None)
    }

    /// Create from a hyper request, rejecting bodies above `max_body_size`
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidMethod` for methods outside [`Method::ALL`],
    /// `Error::PayloadTooLarge` for oversize bodies and `Error::Http` if the
    /// body stream fails.
    pub async fn from_hyper_with_limit(
        req: hyper::Request<hyper::body::Incoming>,
        max_body_size: usize,
    ) -> Result<Self> {
        let method: Method = req.method().as_str().parse()?;

        let uri = req.uri();
        let path = percent_decode(uri.path(), false);
        let query_string = uri.query().map(String::from);

        let headers = req.headers().clone();
        let declared = headers
            .get(hyper::header::CONTENT_LENGTH)
            .and_then(|len| len.to_str().ok())
            .and_then(|len| len.parse::<usize>().ok());
        if let Some(content_len) = declared {
            if content_len > max_body_size {
                return Err(Error::PayloadTooLarge {
                    limit: max_body_size,
                    actual: content_len,
                });
            }
        }

        let body = BodyExt::collect(req.into_body()).await?.to_bytes();
        if body.len() > max_body_size {
            return Err(Error::PayloadTooLarge {
                limit: max_body_size,
                actual: body.len(),
            });
        }

        Ok(Self {
            method,
            path,
            path_params: PathParams::new(),
            query_params: parse_query_string(query_string.as_deref()),
            query_string,
            headers,
            body,
            extensions: HashMap::new(),
        })
    }

    /// Get a header value by name (case-insensitive)
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Set or override a header
    pub fn set_header(&mut self, name: &str, value: &str) {
        if let (Ok(n), Ok(v)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.insert(n, v);
        }
    }

    /// Builder form of [`Request::set_header`]
    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.set_header(name, value);
        self
    }

    /// Raw header map
    #[must_use]
    pub const fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Get a decoded query parameter
    #[must_use]
    pub fn query(&self, name: &str) -> Option<&str> {
        self.query_params.get(name).map(String::as_str)
    }

    /// Get query parameters as a `HashMap`
    #[must_use]
    pub const fn query_map(&self) -> &HashMap<String, String> {
        &self.query_params
    }

    /// Get raw query string
    #[must_use]
    pub fn query_string(&self) -> Option<&str> {
        self.query_string.as_deref()
    }

    /// Get the request body as bytes
    #[must_use]
    pub fn body_bytes(&self) -> &[u8] {
        &self.body
    }

    /// Get the request body as string (UTF-8)
    #[must_use]
    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    /// Parse the body as JSON
    ///
    /// # Errors
    ///
    /// Returns `Error::JsonBody` if the body is not valid JSON for `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        let mut bytes = self.body.to_vec();
        parse_json_bytes(&mut bytes)
    }

    /// Attach a value for later pipeline stages
    pub fn set_extension(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.extensions.insert(key.into(), value.into());
    }

    /// Read a value attached by an earlier stage
    #[must_use]
    pub fn extension(&self, key: &str) -> Option<&str> {
        self.extensions.get(key).map(String::as_str)
    }
}

/// Parse query string into `HashMap`
///
/// Handles URL decoding and duplicate keys (last value wins).
fn parse_query_string(query: Option<&str>) -> HashMap<String, String> {
    query
        .map(|q| {
            q.split('&')
                .filter(|pair| !pair.is_empty())
                .map(|pair| {
                    let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                    (percent_decode(key, true), percent_decode(value, true))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Basic URL decoding of `+` and `%XX` escapes
/// Decode `%XX` escapes; `+` becomes a space only in query components
///
/// Malformed escapes are kept literally.
fn percent_decode(s: &str, plus_as_space: bool) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'+' if plus_as_space => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                let decoded = std::str::from_utf8(&bytes[i + 1..i + 3])
                    .ok()
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok());
                if let Some(byte) = decoded {
                    out.push(byte);
                    i += 2;
                } else {
                    out.push(b'%');
                }
            }
            b => out.push(b),
        }
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}
