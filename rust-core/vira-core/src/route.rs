//! # Route Definition
//!
//! A single registered endpoint: the compiled form of one path pattern plus
//! the methods, priority and handler attached to it.
//!
//! Pattern grammar: a `/`-separated sequence of segments, each either a
//! literal (no `{`, `}` or `*`) or exactly one `{name}` / `{name:type}` token.
//! A `multipath` parameter may only be the final segment and may match zero
//! segments.

use crate::error::{Error, Result};
use crate::router::Method;
use crate::types::{convert_param, parse_param_pattern, ParamType, ParamValue};
use regex::Regex;
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use tracing::trace;
use uuid::Uuid;

/// One component of a compiled pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Fixed text that must appear verbatim
    Literal(String),
    /// Named, typed placeholder
    Param {
        /// Parameter name, unique within the pattern
        name: String,
        /// Declared type
        param_type: ParamType,
    },
}

/// Typed path parameters extracted from a matched request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PathParams {
    values: HashMap<String, ParamValue>,
}

impl PathParams {
    /// Create an empty parameter set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, name: impl Into<String>, value: ParamValue) {
        self.values.insert(name.into(), value);
    }

    /// Get a typed parameter by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.values.get(name)
    }

    /// Get a `str` or `multipath` parameter
    #[must_use]
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.values.get(name).and_then(ParamValue::as_str)
    }

    /// Get an `int` parameter
    #[must_use]
    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.values.get(name).and_then(ParamValue::as_int)
    }

    /// Get a `float` parameter
    #[must_use]
    pub fn get_float(&self, name: &str) -> Option<f64> {
        self.values.get(name).and_then(ParamValue::as_float)
    }

    /// Get a `uuid` parameter
    #[must_use]
    pub fn get_uuid(&self, name: &str) -> Option<Uuid> {
        self.values.get(name).and_then(ParamValue::as_uuid)
    }

    /// Iterate over `(name, value)` pairs in arbitrary order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of extracted parameters
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether no parameters were extracted
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Outcome of testing one route against a request
#[derive(Debug, Clone, PartialEq)]
pub enum RouteMatch {
    /// Path shape or parameter types do not fit
    NoMatch,
    /// Path fits but the method is not accepted
    PathMatch,
    /// Path and method fit
    FullMatch(PathParams),
}

/// A compiled route
///
/// The matcher is derived once from the pattern and never changes. Two routes
/// with identical patterns are independent; only ordering decides which wins.
#[derive(Clone)]
pub struct Route<H> {
    pattern: String,
    segments: Vec<Segment>,
    matcher: Regex,
    methods: BTreeSet<Method>,
    priority: i32,
    literal_count: usize,
    total_count: usize,
    has_multipath: bool,
    definition_order: u64,
    handler: H,
}

impl<H> fmt::Debug for Route<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("pattern", &self.pattern)
            .field("methods", &self.methods)
            .field("priority", &self.priority)
            .field("definition_order", &self.definition_order)
            .finish_non_exhaustive()
    }
}

impl<H> fmt::Display for Route<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let methods: Vec<&str> = self.methods.iter().map(Method::as_str).collect();
        write!(f, "<Route {} {}", methods.join(","), self.pattern)?;
        if self.priority != 0 {
            write!(f, " priority={}", self.priority)?;
        }
        f.write_str(">")
    }
}

impl<H> Route<H> {
    /// Compile a pattern into a route
    ///
    /// An empty method set defaults to `GET`.
    pub(crate) fn new(
        pattern: &str,
        handler: H,
        methods: BTreeSet<Method>,
        priority: i32,
        definition_order: u64,
    ) -> Result<Self> {
        let pattern = normalize_path(pattern);
        let invalid = |reason: &str| Error::InvalidRoutePattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };

        if !pattern.starts_with('/') {
            return Err(invalid("pattern must start with '/'"));
        }
        if pattern.contains('*') {
            return Err(invalid("wildcards are not supported, use {name:multipath}"));
        }

        let segments = parse_segments(pattern)?;
        let matcher = compile_matcher(pattern, &segments)?;

        let literal_count = segments
            .iter()
            .filter(|s| matches!(s, Segment::Literal(_)))
            .count();
        let has_multipath = segments.iter().any(|s| {
            matches!(s, Segment::Param { param_type, .. } if param_type.is_multipath())
        });

        let methods = if methods.is_empty() {
            BTreeSet::from([Method::Get])
        } else {
            methods
        };

        Ok(Self {
            pattern: pattern.to_string(),
            total_count: segments.len(),
            segments,
            matcher,
            methods,
            priority,
            literal_count,
            has_multipath,
            definition_order,
            handler,
        })
    }

    /// Recompile this route under `prefix` with a new definition order
    pub(crate) fn rebased(&self, prefix: &str, definition_order: u64) -> Result<Self>
    where
        H: Clone,
    {
        Self::new(
            &format!("{prefix}{}", self.pattern),
            self.handler.clone(),
            self.methods.clone(),
            self.priority,
            definition_order,
        )
    }

    /// Test this route against a request path and method
    ///
    /// A typed capture that fails conversion is a `NoMatch`, so a less
    /// specific route further down the table can still claim the request.
    pub fn matches(&self, path: &str, method: Method) -> RouteMatch {
        let normalized = normalize_path(path);
        let count = segment_count(normalized);

        let count_ok = if self.has_multipath {
            count >= self.total_count - 1
        } else {
            count == self.total_count
        };
        if !count_ok {
            return RouteMatch::NoMatch;
        }

        // Multipath routes see the raw path so a trailing remainder survives
        let candidate = if self.has_multipath { path } else { normalized };
        let Some(captures) = self.matcher.captures(candidate) else {
            return RouteMatch::NoMatch;
        };

        let mut params = PathParams::new();
        for (index, (name, param_type)) in self.param_types().enumerate() {
            let raw = captures.get(index + 1).map_or("", |m| m.as_str());
            match convert_param(raw, param_type) {
                Ok(value) => params.insert(name, value),
                Err(err) => {
                    trace!(
                        pattern = %self.pattern,
                        error = %err,
                        "Parameter conversion rejected match"
                    );
                    return RouteMatch::NoMatch;
                }
            }
        }

        if !self.methods.contains(&method) {
            return RouteMatch::PathMatch;
        }

        RouteMatch::FullMatch(params)
    }

    /// Sort key: ascending order of this key is matching order
    pub(crate) fn specificity(&self) -> (Reverse<i32>, Reverse<usize>, bool, usize, u64) {
        (
            Reverse(self.priority),
            Reverse(self.literal_count),
            self.has_multipath,
            self.total_count,
            self.definition_order,
        )
    }

    /// Effective (prefixed, normalized) pattern
    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Compiled segments in order
    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Parameter names and types in pattern order
    pub fn param_types(&self) -> impl Iterator<Item = (&str, ParamType)> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Param { name, param_type } => Some((name.as_str(), *param_type)),
            Segment::Literal(_) => None,
        })
    }

    /// Accepted methods
    #[must_use]
    pub const fn methods(&self) -> &BTreeSet<Method> {
        &self.methods
    }

    /// Caller-assigned priority
    #[must_use]
    pub const fn priority(&self) -> i32 {
        self.priority
    }

    /// Number of literal segments
    #[must_use]
    pub const fn literal_segment_count(&self) -> usize {
        self.literal_count
    }

    /// Number of literal plus parameter segments
    #[must_use]
    pub const fn total_segment_count(&self) -> usize {
        self.total_count
    }

    /// Whether the final segment is a `multipath` parameter
    #[must_use]
    pub const fn has_multipath(&self) -> bool {
        self.has_multipath
    }

    /// Registration counter value within the owning router
    #[must_use]
    pub const fn definition_order(&self) -> u64 {
        self.definition_order
    }

    /// The opaque handler
    #[must_use]
    pub const fn handler(&self) -> &H {
        &self.handler
    }
}

/// Strip trailing slashes, keeping the root as `/`
pub(crate) fn normalize_path(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/"
    } else {
        trimmed
    }
}

/// Count segments of a normalized path; the root has none
fn segment_count(normalized: &str) -> usize {
    let body = normalized.strip_prefix('/').unwrap_or(normalized);
    if body.is_empty() {
        0
    } else {
        body.split('/').count()
    }
}

fn parse_segments(pattern: &str) -> Result<Vec<Segment>> {
    let invalid = |reason: String| Error::InvalidRoutePattern {
        pattern: pattern.to_string(),
        reason,
    };

    if pattern == "/" {
        return Ok(Vec::new());
    }

    let raw_segments: Vec<&str> = pattern[1..].split('/').collect();
    let last = raw_segments.len() - 1;
    let mut segments = Vec::with_capacity(raw_segments.len());
    let mut seen = BTreeSet::new();

    for (index, raw) in raw_segments.into_iter().enumerate() {
        if raw.is_empty() {
            return Err(invalid("empty segment".to_string()));
        }

        let segment = match parse_param_pattern(raw).map_err(|e| match e {
            Error::InvalidRoutePattern { reason, .. } => invalid(reason),
            other => other,
        })? {
            Some((name, param_type)) => {
                if param_type.is_multipath() && index != last {
                    return Err(invalid(format!(
                        "multipath parameter '{name}' must be the final segment"
                    )));
                }
                if !seen.insert(name.clone()) {
                    return Err(invalid(format!("duplicate parameter '{name}'")));
                }
                Segment::Param { name, param_type }
            }
            None => Segment::Literal(raw.to_string()),
        };
        segments.push(segment);
    }

    Ok(segments)
}

fn compile_matcher(pattern: &str, segments: &[Segment]) -> Result<Regex> {
    let mut source = String::from("^");

    for segment in segments {
        match segment {
            Segment::Literal(text) => {
                source.push('/');
                source.push_str(&regex::escape(text));
            }
            Segment::Param { param_type, .. } if param_type.is_multipath() => {
                // Optional so that zero trailing segments still match
                source.push_str(&format!("(?:/({}))?", param_type.regex_fragment()));
            }
            Segment::Param { param_type, .. } => {
                source.push_str(&format!("/({})", param_type.regex_fragment()));
            }
        }
    }

    if segments.is_empty() {
        source.push('/');
    }
    source.push('$');

    Regex::new(&source).map_err(|e| Error::InvalidRoutePattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}
