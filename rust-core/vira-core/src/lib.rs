//! # Vira Core
//!
//! Routing and request-interception core of the Vira web framework.
//!
//! Routes are declared with typed path patterns such as
//! `/users/{id:int}` and kept in a deterministically ordered table; requests
//! travel through an onion of interceptors before reaching the matched
//! handler.
//!
//! ## Modules
//!
//! - `types` - Path parameter types and conversion
//! - `route` - Compiled route patterns and matching
//! - `router` - Ordered route table, prefixes and inclusion
//! - `middleware` - Onion-style middleware chain and pipelines
//! - `interceptors` - Built-in middlewares (logging, CORS, rate limiting, gzip, ...)
//! - `request` / `response` - HTTP message wrappers
//! - `app` - Application builder and frozen service
//! - `background` - Bounded runner for work queued by handlers
//! - `server` - HTTP server built on Hyper
//! - `json` - JSON parsing with simd-json
//! - `logging` - Tracing subscriber setup
//! - `error` - Error types and handling
//!
//! ## Example
//!
//! ```no_run
//! use vira_core::{App, Request, Response, Server};
//!
//! # async fn run() -> vira_core::Result<()> {
//! let mut app = App::new();
//! app.get("/users/{id:int}", |req: Request| async move {
//!     let id = req.path_params.get_int("id").unwrap_or_default();
//!     Ok(Response::json(format!(r#"{{"id": {id}}}"#)))
//! })?;
//!
//! Server::new(app.build()).serve().await
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod app;
pub mod background;
pub mod error;
pub mod interceptors;
pub mod json;
pub mod logging;
pub mod middleware;
pub mod request;
pub mod response;
pub mod route;
pub mod router;
pub mod server;
pub mod types;

pub use app::{handler, App, AppConfig, Handler, Service};
pub use background::{BackgroundTasks, Task};
pub use error::{Error, Result};
pub use interceptors::{
    CorsMiddleware, ErrorMiddleware, GZipMiddleware, HttpsRedirectMiddleware, LoggingMiddleware,
    RateLimitMiddleware, SecurityHeadersMiddleware, TimingMiddleware, TrustedHostMiddleware,
};
pub use json::{parse_json, to_json};
pub use logging::init_tracing;
pub use middleware::{
    from_fn, BoxFuture, ChainState, Endpoint, Middleware, MiddlewareChain, Next, Pipeline,
};
pub use request::Request;
pub use response::Response;
pub use route::{PathParams, Route, RouteMatch, Segment};
pub use router::{Lookup, Method, Router};
pub use server::{Server, ServerConfig};
pub use types::{ParamType, ParamValue};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
