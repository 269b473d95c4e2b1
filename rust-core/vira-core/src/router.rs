//! # Router
//!
//! Ordered route table with prefixing and sub-router inclusion.
//!
//! Routes are kept sorted by a total order and `find_route` returns the first
//! full match, so the order itself is observable behavior:
//!
//! 1. `priority` descending
//! 2. literal segment count descending
//! 3. fixed-length routes before `multipath` routes
//! 4. total segment count ascending
//! 5. definition order ascending (first registered wins)
//!
//! The table is re-sorted after every mutation; lookups never sort.

use crate::error::{Error, Result};
use crate::route::{normalize_path, PathParams, Route, RouteMatch};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// HTTP methods supported by the router
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Method {
    /// HTTP GET
    Get,
    /// HTTP POST
    Post,
    /// HTTP PUT
    Put,
    /// HTTP DELETE
    Delete,
    /// HTTP PATCH
    Patch,
    /// HTTP HEAD
    Head,
    /// HTTP OPTIONS
    Options,
}

impl Method {
    /// Every supported method
    pub const ALL: [Self; 7] = [
        Self::Get,
        Self::Post,
        Self::Put,
        Self::Delete,
        Self::Patch,
        Self::Head,
        Self::Options,
    ];

    /// Uppercase method token
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Patch => "PATCH",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::InvalidMethod {
                method: s.to_string(),
            })
    }
}

/// Result of a route lookup
#[derive(Debug)]
pub enum Lookup<'a, H> {
    /// First route that accepted path and method, with typed params
    Found(&'a Route<H>, PathParams),
    /// Some route accepted the path, none the method
    MethodNotAllowed(BTreeSet<Method>),
    /// No route accepted the path
    NotFound,
}

/// Ordered route table
#[derive(Clone)]
pub struct Router<H> {
    prefix: String,
    routes: Vec<Route<H>>,
    next_definition: u64,
}

impl<H> fmt::Debug for Router<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("prefix", &self.prefix)
            .field("routes", &self.routes)
            .finish()
    }
}

impl<H> Default for Router<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> Router<H> {
    /// Create a new empty router
    #[must_use]
    pub const fn new() -> Self {
        Self {
            prefix: String::new(),
            routes: Vec::new(),
            next_definition: 0,
        }
    }

    /// Create a router whose routes all live under `prefix`
    ///
    /// Trailing slashes are dropped so `/api/` and `/api` behave alike.
    #[must_use]
    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
            ..Self::new()
        }
    }

    /// Prefix applied to routes registered on this router
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Routes in matching order
    #[must_use]
    pub fn routes(&self) -> &[Route<H>] {
        &self.routes
    }

    /// Number of registered routes
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether no routes are registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    fn sort(&mut self) {
        self.routes.sort_by_key(Route::specificity);
    }

    /// Register a route
    ///
    /// The effective pattern is this router's prefix followed by `pattern`.
    /// An empty `methods` iterator registers the route for `GET`.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidRoutePattern` if the pattern is malformed.
    pub fn add_route(
        &mut self,
        pattern: &str,
        handler: H,
        methods: impl IntoIterator<Item = Method>,
        priority: i32,
    ) -> Result<()> {
        let effective = format!("{}{pattern}", self.prefix);
        let route = Route::new(
            &effective,
            handler,
            methods.into_iter().collect(),
            priority,
            self.next_definition,
        )?;
        self.next_definition += 1;

        debug!(route = %route, "Route registered");
        self.routes.push(route);
        self.sort();
        Ok(())
    }

    /// Copy every route of `other` into this router
    ///
    /// Each copy lives under `extra_prefix + self.prefix + other.prefix +
    /// pattern`, keeps its priority, methods and handler, and receives a fresh
    /// definition order from this router in `other`'s matching order.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidRoutePattern` if a combined pattern is malformed;
    /// this router is left unchanged in that case.
    pub fn include(&mut self, other: &Self, extra_prefix: &str) -> Result<()>
    where
        H: Clone,
    {
        let combined = format!("{}{}", extra_prefix.trim_end_matches('/'), self.prefix);

        let mut copies = Vec::with_capacity(other.routes.len());
        let mut next = self.next_definition;
        for route in &other.routes {
            copies.push(route.rebased(&combined, next)?);
            next += 1;
        }

        debug!(
            prefix = %combined,
            count = copies.len(),
            "Router included"
        );
        self.next_definition = next;
        self.routes.extend(copies);
        self.sort();
        Ok(())
    }

    /// Find the route for a request
    ///
    /// Returns the first full match in table order. If none matched fully but
    /// some route matched the path, the union of those routes' methods is
    /// returned for a 405 response.
    pub fn find_route(&self, path: &str, method: Method) -> Lookup<'_, H> {
        let mut allowed = BTreeSet::new();

        for route in &self.routes {
            match route.matches(path, method) {
                RouteMatch::FullMatch(params) => return Lookup::Found(route, params),
                RouteMatch::PathMatch => allowed.extend(route.methods().iter().copied()),
                RouteMatch::NoMatch => {}
            }
        }

        if allowed.is_empty() {
            debug!(path = %normalize_path(path), %method, "No route found");
            Lookup::NotFound
        } else {
            debug!(path = %path, %method, "Method not allowed");
            Lookup::MethodNotAllowed(allowed)
        }
    }

    /// Register a `GET` route with default priority
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidRoutePattern` if the pattern is malformed.
    pub fn get(&mut self, pattern: &str, handler: H) -> Result<()> {
        self.add_route(pattern, handler, [Method::Get], 0)
    }

    /// Register a `POST` route with default priority
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidRoutePattern` if the pattern is malformed.
    pub fn post(&mut self, pattern: &str, handler: H) -> Result<()> {
        self.add_route(pattern, handler, [Method::Post], 0)
    }

    /// Register a `PUT` route with default priority
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidRoutePattern` if the pattern is malformed.
    pub fn put(&mut self, pattern: &str, handler: H) -> Result<()> {
        self.add_route(pattern, handler, [Method::Put], 0)
    }

    /// Register a `DELETE` route with default priority
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidRoutePattern` if the pattern is malformed.
    pub fn delete(&mut self, pattern: &str, handler: H) -> Result<()> {
        self.add_route(pattern, handler, [Method::Delete], 0)
    }

    /// Register a `PATCH` route with default priority
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidRoutePattern` if the pattern is malformed.
    pub fn patch(&mut self, pattern: &str, handler: H) -> Result<()> {
        self.add_route(pattern, handler, [Method::Patch], 0)
    }

    /// Register a `HEAD` route with default priority
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidRoutePattern` if the pattern is malformed.
    pub fn head(&mut self, pattern: &str, handler: H) -> Result<()> {
        self.add_route(pattern, handler, [Method::Head], 0)
    }

    /// Register an `OPTIONS` route with default priority
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidRoutePattern` if the pattern is malformed.
    pub fn options(&mut self, pattern: &str, handler: H) -> Result<()> {
        self.add_route(pattern, handler, [Method::Options], 0)
    }
}
