//! # Application Shell
//!
//! [`App`] collects routes, interceptors and lifecycle hooks. [`App::build`]
//! consumes it and produces a frozen [`Service`]: the router moves behind an
//! `Arc`, the middleware chain is composed around the router dispatch, and
//! nothing can be registered afterwards.

use crate::background::BackgroundTasks;
use crate::error::{Error, Result};
use crate::middleware::{
    from_fn, BoxFuture, Endpoint, Middleware, MiddlewareChain, Next, Pipeline,
};
use crate::request::Request;
use crate::response::Response;
use crate::router::{Lookup, Method, Router};
use hyper::body::Bytes;
use serde::Deserialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Route handler stored in the application router
pub type Handler = Arc<dyn Endpoint>;

/// Wrap an endpoint or async closure as a [`Handler`]
pub fn handler<E: Endpoint + 'static>(endpoint: E) -> Handler {
    Arc::new(endpoint)
}

type Hook = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Application settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Expose error messages in 500 bodies
    pub debug: bool,
    /// Max request body size in bytes
    pub max_body_size: usize,
    /// Background tasks allowed to run at once
    pub max_background_tasks: usize,
    /// How long shutdown waits for running background tasks
    pub background_shutdown_timeout: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            debug: false,
            max_body_size: 1024 * 1024,
            max_background_tasks: 2,
            background_shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Application builder
pub struct App {
    config: AppConfig,
    router: Router<Handler>,
    middleware: MiddlewareChain,
    tasks: BackgroundTasks,
    startup_hooks: Vec<Hook>,
    shutdown_hooks: Vec<Hook>,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("config", &self.config)
            .field("routes", &self.router.len())
            .field("middleware", &self.middleware.names())
            .finish_non_exhaustive()
    }
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

impl App {
    /// Create an application with default settings
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(AppConfig::default())
    }

    /// Create an application with explicit settings
    #[must_use]
    pub fn with_config(config: AppConfig) -> Self {
        Self {
            tasks: BackgroundTasks::new(config.max_background_tasks),
            config,
            router: Router::new(),
            middleware: MiddlewareChain::new(),
            startup_hooks: Vec::new(),
            shutdown_hooks: Vec::new(),
        }
    }

    /// Current settings
    #[must_use]
    pub const fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Handle to the background task runner, for handlers to capture
    #[must_use]
    pub fn background_tasks(&self) -> BackgroundTasks {
        self.tasks.clone()
    }

    /// Register a route for the given methods
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidRoutePattern` if the pattern is malformed.
    pub fn add_route<E: Endpoint + 'static>(
        &mut self,
        pattern: &str,
        methods: impl IntoIterator<Item = Method>,
        priority: i32,
        endpoint: E,
    ) -> Result<()> {
        self.router.add_route(pattern, handler(endpoint), methods, priority)
    }

    /// Register a `GET` route
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidRoutePattern` if the pattern is malformed.
    pub fn get<E: Endpoint + 'static>(&mut self, pattern: &str, endpoint: E) -> Result<()> {
        self.add_route(pattern, [Method::Get], 0, endpoint)
    }

    /// Register a `POST` route
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidRoutePattern` if the pattern is malformed.
    pub fn post<E: Endpoint + 'static>(&mut self, pattern: &str, endpoint: E) -> Result<()> {
        self.add_route(pattern, [Method::Post], 0, endpoint)
    }

    /// Register a `PUT` route
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidRoutePattern` if the pattern is malformed.
    pub fn put<E: Endpoint + 'static>(&mut self, pattern: &str, endpoint: E) -> Result<()> {
        self.add_route(pattern, [Method::Put], 0, endpoint)
    }

    /// Register a `DELETE` route
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidRoutePattern` if the pattern is malformed.
    pub fn delete<E: Endpoint + 'static>(&mut self, pattern: &str, endpoint: E) -> Result<()> {
        self.add_route(pattern, [Method::Delete], 0, endpoint)
    }

    /// Register a `PATCH` route
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidRoutePattern` if the pattern is malformed.
    pub fn patch<E: Endpoint + 'static>(&mut self, pattern: &str, endpoint: E) -> Result<()> {
        self.add_route(pattern, [Method::Patch], 0, endpoint)
    }

    /// Copy every route of `router` into the application under `prefix`
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidRoutePattern` if a combined pattern is malformed.
    pub fn include_router(&mut self, router: &Router<Handler>, prefix: &str) -> Result<()> {
        self.router.include(router, prefix)
    }

    /// Append an interceptor; the first one added is the outermost
    ///
    /// # Errors
    ///
    /// Returns `Error::ChainMisuse` if the chain was already built.
    pub fn add_middleware<M: Middleware + 'static>(&mut self, middleware: M) -> Result<()> {
        self.middleware.add(middleware)
    }

    /// Append an async closure interceptor
    ///
    /// # Errors
    ///
    /// Returns `Error::ChainMisuse` if the chain was already built.
    pub fn middleware<F, Fut>(&mut self, f: F) -> Result<()>
    where
        F: Fn(Request, Next) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response>> + Send + 'static,
    {
        self.middleware.add(from_fn(f))
    }

    /// Register a hook run before the server accepts connections
    pub fn on_startup<F, Fut>(&mut self, hook: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.startup_hooks.push(Arc::new(move || -> BoxFuture<'static, Result<()>> {
            Box::pin(hook())
        }));
    }

    /// Register a hook run after in-flight requests drained
    pub fn on_shutdown<F, Fut>(&mut self, hook: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.shutdown_hooks.push(Arc::new(move || -> BoxFuture<'static, Result<()>> {
            Box::pin(hook())
        }));
    }

    /// Freeze routes and interceptors into a [`Service`]
    #[must_use]
    pub fn build(mut self) -> Service {
        let router = Arc::new(self.router);
        let pipeline = self.middleware.build_endpoint(Arc::new(Dispatch {
            router: Arc::clone(&router),
        }));

        info!(
            routes = router.len(),
            middlewares = pipeline.layers(),
            debug_mode = self.config.debug,
            "Application built"
        );
        Service {
            inner: Arc::new(ServiceInner {
                config: self.config,
                router,
                pipeline,
                tasks: self.tasks,
                startup_hooks: self.startup_hooks,
                shutdown_hooks: self.shutdown_hooks,
            }),
        }
    }
}

/// Terminal stage: route lookup and handler invocation
struct Dispatch {
    router: Arc<Router<Handler>>,
}

impl Endpoint for Dispatch {
    fn call(&self, mut req: Request) -> BoxFuture<'_, Result<Response>> {
        match self.router.find_route(&req.path, req.method) {
            Lookup::Found(route, params) => {
                debug!(route = %route, "Dispatching");
                req.path_params = params;
                route.handler().call(req)
            }
            Lookup::MethodNotAllowed(allowed) => {
                Box::pin(async move { Ok(Response::method_not_allowed(&allowed)) })
            }
            Lookup::NotFound => Box::pin(async { Ok(Response::not_found()) }),
        }
    }
}

struct ServiceInner {
    config: AppConfig,
    router: Arc<Router<Handler>>,
    pipeline: Pipeline,
    tasks: BackgroundTasks,
    startup_hooks: Vec<Hook>,
    shutdown_hooks: Vec<Hook>,
}

/// Frozen application, cheap to clone and shared by every connection
#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("config", &self.inner.config)
            .field("routes", &self.inner.router.len())
            .field("pipeline", &self.inner.pipeline)
            .field("tasks", &self.inner.tasks)
            .finish()
    }
}

impl Service {
    /// Application settings
    #[must_use]
    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    /// The frozen route table
    #[must_use]
    pub fn router(&self) -> &Router<Handler> {
        &self.inner.router
    }

    /// The background task runner shared with the [`App`] it was built from
    #[must_use]
    pub fn background_tasks(&self) -> &BackgroundTasks {
        &self.inner.tasks
    }

    /// Run startup hooks in registration order, stopping at the first failure
    ///
    /// # Errors
    ///
    /// Returns `Error::Lifecycle` wrapping the failing hook's error.
    pub async fn startup(&self) -> Result<()> {
        for (index, hook) in self.inner.startup_hooks.iter().enumerate() {
            hook().await.map_err(|err| Error::Lifecycle {
                message: format!("startup hook #{index}: {err}"),
            })?;
        }
        debug!(hooks = self.inner.startup_hooks.len(), "Startup hooks completed");
        Ok(())
    }

    /// Drain background tasks, then run every shutdown hook in registration
    /// order
    ///
    /// Hook failures are logged and do not stop later hooks.
    ///
    /// # Errors
    ///
    /// Returns `Error::Lifecycle` for the first hook that failed.
    pub async fn shutdown(&self) -> Result<()> {
        self.inner
            .tasks
            .shutdown(self.inner.config.background_shutdown_timeout)
            .await;

        let mut first_failure = None;
        for (index, hook) in self.inner.shutdown_hooks.iter().enumerate() {
            if let Err(err) = hook().await {
                warn!(hook = index, error = %err, "Shutdown hook failed");
                first_failure.get_or_insert(Error::Lifecycle {
                    message: format!("shutdown hook #{index}: {err}"),
                });
            }
        }
        first_failure.map_or(Ok(()), Err)
    }

    /// Run a request through the pipeline
    ///
    /// Errors no interceptor handled become a JSON error response. An
    /// `x-request-id` is assigned when missing and echoed on the response.
    pub async fn handle(&self, mut req: Request) -> Response {
        let request_id = match req.header("x-request-id") {
            Some(id) => id.to_string(),
            None => {
                let id = generate_request_id();
                req.set_header("x-request-id", &id);
                id
            }
        };

        let method = req.method;
        let path = req.path.clone();
        let mut response = match self.inner.pipeline.invoke(req).await {
            Ok(response) => response,
            Err(err) => {
                error!(%method, %path, %request_id, error = %err, "Unhandled error");
                self.error_response(&err)
            }
        };

        response.set_header("x-request-id", &request_id);
        response
    }

    /// Execute a request without the network stack
    pub async fn test_request(
        &self,
        method: Method,
        path: &str,
        headers: HashMap<String, String>,
        body: Option<Bytes>,
    ) -> Response {
        let limit = self.inner.config.max_body_size;
        if let Some(actual) = body.as_ref().map(Bytes::len).filter(|len| *len > limit) {
            return self.error_response(&Error::PayloadTooLarge { limit, actual });
        }

        let req = Request::new(method, path, headers, body).with_header("x-client-ip", "test");
        self.handle(req).await
    }

    fn error_response(&self, err: &Error) -> Response {
        let message = if self.inner.config.debug {
            format!("Internal Server Error: {err}")
        } else {
            "Internal Server Error".to_string()
        };
        Response::internal_error(&message).with_status(err.status_code())
    }
}

static REQUEST_COUNTER: AtomicUsize = AtomicUsize::new(1);

fn generate_request_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let counter = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{:x}-{:x}", now.as_nanos(), counter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    async fn echo_id(req: Request) -> Result<Response> {
        let id = req.path_params.get_int("id").unwrap_or(-1);
        Ok(Response::text(format!("user {id}")))
    }

    fn service() -> Service {
        let mut app = App::new();
        app.get("/users/{id:int}", echo_id).unwrap();
        app.add_route("/users", [Method::Get, Method::Post], 0, |_req: Request| async {
            Ok(Response::text("users"))
        })
        .unwrap();
        app.get("/boom", |_req: Request| async { Err(Error::handler("kaboom")) })
            .unwrap();
        app.build()
    }

    #[tokio::test]
    async fn test_dispatch_found_sets_params() {
        let response = service().handle(Request::get("/users/42")).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body, "user 42");
        assert!(response.header("x-request-id").is_some());
    }

    #[tokio::test]
    async fn test_dispatch_not_found() {
        let response = service().handle(Request::get("/users/abc")).await;
        assert_eq!(response.status, 404);
    }

    #[tokio::test]
    async fn test_dispatch_method_not_allowed() {
        let req = Request::new(Method::Delete, "/users", HashMap::new(), None);
        let response = service().handle(req).await;
        assert_eq!(response.status, 405);
        assert_eq!(response.header("allow"), Some("GET, POST"));
    }

    #[tokio::test]
    async fn test_escaped_error_production_body() {
        let response = service().handle(Request::get("/boom")).await;
        assert_eq!(response.status, 500);
        let body: serde_json::Value = serde_json::from_str(&response.body).unwrap();
        assert_eq!(body["error"]["message"], "Internal Server Error");
    }

    #[tokio::test]
    async fn test_escaped_error_debug_body() {
        let mut app = App::with_config(AppConfig {
            debug: true,
            ..AppConfig::default()
        });
        app.get("/boom", |_req: Request| async { Err(Error::handler("kaboom")) })
            .unwrap();
        let response = app.build().handle(Request::get("/boom")).await;

        let body: serde_json::Value = serde_json::from_str(&response.body).unwrap();
        assert_eq!(
            body["error"]["message"],
            "Internal Server Error: Handler error: kaboom"
        );
    }

    #[tokio::test]
    async fn test_request_id_preserved() {
        let req = Request::get("/users").with_header("x-request-id", "abc-123");
        let response = service().handle(req).await;
        assert_eq!(response.header("x-request-id"), Some("abc-123"));
    }

    #[tokio::test]
    async fn test_middleware_wraps_dispatch() {
        let mut app = App::new();
        app.middleware(|req: Request, next: Next| async move {
            let mut response = next.run(req).await?;
            response.set_header("x-seen", "1");
            Ok(response)
        })
        .unwrap();
        app.get("/", |_req: Request| async { Ok(Response::text("home")) })
            .unwrap();
        let service = app.build();

        let found = service.handle(Request::get("/")).await;
        assert_eq!(found.header("x-seen"), Some("1"));

        let missing = service.handle(Request::get("/nope")).await;
        assert_eq!(missing.status, 404);
        assert_eq!(missing.header("x-seen"), Some("1"));
    }

    #[tokio::test]
    async fn test_include_router() {
        let mut api = Router::with_prefix("/api");
        api.get("/users/{id:int}", handler(echo_id)).unwrap();

        let mut app = App::new();
        app.include_router(&api, "/v1").unwrap();
        let service = app.build();

        assert_eq!(service.router().routes()[0].pattern(), "/v1/api/users/{id:int}");
        let response = service.handle(Request::get("/v1/api/users/7")).await;
        assert_eq!(response.body, "user 7");
    }

    #[tokio::test]
    async fn test_test_request_payload_limit() {
        let mut app = App::with_config(AppConfig {
            max_body_size: 4,
            ..AppConfig::default()
        });
        app.post("/upload", |_req: Request| async { Ok(Response::text("ok")) })
            .unwrap();
        let service = app.build();

        let response = service
            .test_request(
                Method::Post,
                "/upload",
                HashMap::new(),
                Some(Bytes::from_static(b"too large")),
            )
            .await;
        assert_eq!(response.status, 413);

        let response = service
            .test_request(Method::Post, "/upload", HashMap::new(), Some(Bytes::from_static(b"ok")))
            .await;
        assert_eq!(response.status, 200);
    }

    #[tokio::test]
    async fn test_lifecycle_hooks() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut app = App::new();

        let startup_log = Arc::clone(&log);
        app.on_startup(move || {
            let log = Arc::clone(&startup_log);
            async move {
                log.lock().unwrap().push("startup");
                Ok(())
            }
        });
        app.on_shutdown(|| async { Err(Error::handler("flush failed")) });
        let shutdown_log = Arc::clone(&log);
        app.on_shutdown(move || {
            let log = Arc::clone(&shutdown_log);
            async move {
                log.lock().unwrap().push("shutdown");
                Ok(())
            }
        });

        let service = app.build();
        service.startup().await.unwrap();
        let result = service.shutdown().await;

        assert!(matches!(result, Err(Error::Lifecycle { .. })));
        assert_eq!(*log.lock().unwrap(), vec!["startup", "shutdown"]);
    }

    #[tokio::test]
    async fn test_failing_startup_hook_stops() {
        let mut app = App::new();
        app.on_startup(|| async { Err(Error::handler("no database")) });
        let err = app.build().startup().await.unwrap_err();
        assert!(err.to_string().contains("no database"));
    }

    #[tokio::test]
    async fn test_handler_queues_background_task() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut app = App::new();
        let tasks = app.background_tasks();
        let task_log = Arc::clone(&log);
        app.post("/signup", move |_req: Request| {
            let tasks = tasks.clone();
            let log = Arc::clone(&task_log);
            async move {
                tasks.add(crate::background::Task::new("welcome_email", move || {
                    let log = Arc::clone(&log);
                    async move {
                        log.lock().unwrap().push("email sent");
                        Ok(())
                    }
                }));
                Ok(Response::text("created").with_status(201))
            }
        })
        .unwrap();
        let service = app.build();

        let req = Request::new(Method::Post, "/signup", HashMap::new(), None);
        assert_eq!(service.handle(req).await.status, 201);

        assert!(service.background_tasks().wait_idle(Duration::from_secs(1)).await);
        service.shutdown().await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["email sent"]);
        assert!(service.background_tasks().is_shutting_down());
    }

    #[test]
    fn test_generate_request_id_unique() {
        assert_ne!(generate_request_id(), generate_request_id());
    }
}
