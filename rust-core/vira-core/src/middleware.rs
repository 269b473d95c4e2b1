//! # Middleware System
//!
//! Onion-style request interception.
//!
//! A [`MiddlewareChain`] collects interceptors during setup and is turned into
//! an immutable [`Pipeline`] by [`MiddlewareChain::build`]. The pipeline is a
//! linked list of nodes built back to front: the last registered interceptor
//! wraps the terminal endpoint, and the first registered one is the outermost
//! layer.
//!
//! ```text
//! Request -> A -> B -> C -> endpoint -> C -> B -> A -> Response
//! ```
//!
//! Each interceptor receives an owned [`Next`] continuation. It may do work
//! before calling it, skip it entirely to short-circuit, or inspect the
//! response afterwards. `Next::run` consumes the continuation, so a stage can
//! never be replayed.

use crate::error::{Error, Result};
use crate::request::Request;
use crate::response::Response;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::debug;

/// Boxed, sendable future returned by interceptors and endpoints
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Interceptor wrapping the rest of the pipeline
pub trait Middleware: Send + Sync {
    /// Process `req`, usually by awaiting `next.run(req)` at some point
    fn handle(&self, req: Request, next: Next) -> BoxFuture<'_, Result<Response>>;

    /// Middleware name for logging
    fn name(&self) -> &'static str {
        "Unknown"
    }
}

/// Terminal stage of a pipeline, also the shape of a route handler
pub trait Endpoint: Send + Sync {
    /// Produce the response for `req`
    fn call(&self, req: Request) -> BoxFuture<'_, Result<Response>>;
}

impl<F, Fut> Endpoint for F
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Response>> + Send + 'static,
{
    fn call(&self, req: Request) -> BoxFuture<'_, Result<Response>> {
        Box::pin(self(req))
    }
}

/// Middleware backed by an async closure, see [`from_fn`]
pub struct FnMiddleware<F> {
    f: F,
    name: &'static str,
}

impl<F> FnMiddleware<F> {
    /// Give the closure a name for logs
    #[must_use]
    pub fn named(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }
}

/// Wrap an async closure `(request, next) -> response` as a middleware
pub fn from_fn<F, Fut>(f: F) -> FnMiddleware<F>
where
    F: Fn(Request, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response>> + Send + 'static,
{
    FnMiddleware { f, name: "FnMiddleware" }
}

impl<F, Fut> Middleware for FnMiddleware<F>
where
    F: Fn(Request, Next) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Response>> + Send + 'static,
{
    fn handle(&self, req: Request, next: Next) -> BoxFuture<'_, Result<Response>> {
        Box::pin((self.f)(req, next))
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// One link of a built pipeline
enum Node {
    Layer {
        middleware: Arc<dyn Middleware>,
        next: Arc<Node>,
    },
    Endpoint(Arc<dyn Endpoint>),
}

/// Continuation handed to an interceptor
///
/// Points at the next node of the pipeline. Running it consumes it.
#[must_use = "a middleware that drops `Next` without running it short-circuits the pipeline"]
pub struct Next {
    node: Arc<Node>,
}

impl Next {
    /// Invoke the remainder of the pipeline
    ///
    /// # Errors
    ///
    /// Propagates whatever error the inner stages return, unchanged.
    pub async fn run(self, req: Request) -> Result<Response> {
        match self.node.as_ref() {
            Node::Layer { middleware, next } => {
                let next = Self {
                    node: Arc::clone(next),
                };
                middleware.handle(req, next).await
            }
            Node::Endpoint(endpoint) => endpoint.call(req).await,
        }
    }
}

/// Immutable composed pipeline
///
/// Cheap to clone; every clone shares the same nodes and may be invoked
/// concurrently from many tasks.
#[derive(Clone)]
pub struct Pipeline {
    head: Arc<Node>,
    layers: usize,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("layers", &self.layers)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Run a request through every layer and the terminal endpoint
    ///
    /// # Errors
    ///
    /// Returns the first error no interceptor converted into a response.
    pub async fn invoke(&self, req: Request) -> Result<Response> {
        let next = Next {
            node: Arc::clone(&self.head),
        };
        next.run(req).await
    }

    /// Number of interceptor layers around the endpoint
    #[must_use]
    pub const fn layers(&self) -> usize {
        self.layers
    }
}

/// Lifecycle of a [`MiddlewareChain`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    /// Nothing registered yet
    Empty,
    /// Interceptors registered, not built
    Accumulating,
    /// At least one pipeline has been built; registration is closed
    Built,
}

/// Ordered interceptor list, append-only until built
#[derive(Default, Clone)]
pub struct MiddlewareChain {
    middlewares: Vec<Arc<dyn Middleware>>,
    built: bool,
}

impl std::fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewareChain")
            .field("middlewares", &self.names())
            .field("state", &self.state())
            .finish()
    }
}

impl MiddlewareChain {
    /// Create a new empty middleware chain
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a middleware to the end of the chain
    ///
    /// # Errors
    ///
    /// Returns `Error::ChainMisuse` once a pipeline has been built.
    pub fn add<M: Middleware + 'static>(&mut self, middleware: M) -> Result<()> {
        self.add_shared(Arc::new(middleware))
    }

    /// Add an already shared middleware
    ///
    /// # Errors
    ///
    /// Returns `Error::ChainMisuse` once a pipeline has been built.
    pub fn add_shared(&mut self, middleware: Arc<dyn Middleware>) -> Result<()> {
        if self.built {
            return Err(Error::ChainMisuse {
                reason: format!(
                    "cannot add middleware '{}' after the pipeline was built",
                    middleware.name()
                ),
            });
        }
        self.middlewares.push(middleware);
        Ok(())
    }

    /// Build a pipeline ending in an async closure
    pub fn build<F, Fut>(&mut self, terminal: F) -> Pipeline
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response>> + Send + 'static,
    {
        self.build_endpoint(Arc::new(terminal))
    }

    /// Build a pipeline ending in `endpoint`
    ///
    /// Calling this again yields a new pipeline over the current list; earlier
    /// pipelines are unaffected.
    pub fn build_endpoint(&mut self, endpoint: Arc<dyn Endpoint>) -> Pipeline {
        let mut head = Arc::new(Node::Endpoint(endpoint));
        for middleware in self.middlewares.iter().rev() {
            head = Arc::new(Node::Layer {
                middleware: Arc::clone(middleware),
                next: head,
            });
        }
        self.built = true;

        debug!(
            layers = self.middlewares.len(),
            middlewares = ?self.names(),
            "Middleware pipeline built"
        );
        Pipeline {
            head,
            layers: self.middlewares.len(),
        }
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> ChainState {
        if self.built {
            ChainState::Built
        } else if self.middlewares.is_empty() {
            ChainState::Empty
        } else {
            ChainState::Accumulating
        }
    }

    /// Registered middleware names in order
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.middlewares.iter().map(|m| m.name()).collect()
    }

    /// Get the number of middlewares
    #[must_use]
    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    /// Check if chain is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    type Stage = BoxFuture<'static, Result<Response>>;

    fn recorder(
        log: &Log,
        name: &'static str,
    ) -> FnMiddleware<impl Fn(Request, Next) -> Stage + Send + Sync> {
        let log = Arc::clone(log);
        from_fn(move |req: Request, next: Next| -> Stage {
            let log = Arc::clone(&log);
            Box::pin(async move {
                log.lock().unwrap().push(format!("{name}-pre"));
                let response = next.run(req).await;
                log.lock().unwrap().push(format!("{name}-post"));
                response
            })
        })
        .named(name)
    }

    fn terminal(log: &Log) -> impl Fn(Request) -> Stage + Send + Sync + 'static {
        let log = Arc::clone(log);
        move |_req: Request| -> Stage {
            let log = Arc::clone(&log);
            Box::pin(async move {
                log.lock().unwrap().push("T".to_string());
                Ok(Response::text("done"))
            })
        }
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    #[test]
    fn test_middleware_chain_empty() {
        let chain = MiddlewareChain::new();
        assert!(chain.is_empty());
        assert_eq!(chain.len(), 0);
        assert_eq!(chain.state(), ChainState::Empty);
    }

    #[tokio::test]
    async fn test_onion_order() {
        let log: Log = Arc::default();
        let mut chain = MiddlewareChain::new();
        chain.add(recorder(&log, "A")).unwrap();
        chain.add(recorder(&log, "B")).unwrap();
        chain.add(recorder(&log, "C")).unwrap();
        assert_eq!(chain.state(), ChainState::Accumulating);
        assert_eq!(chain.names(), vec!["A", "B", "C"]);

        let pipeline = chain.build(terminal(&log));
        assert_eq!(pipeline.layers(), 3);

        let response = pipeline.invoke(Request::get("/")).await.unwrap();
        assert_eq!(response.body, "done");
        assert_eq!(
            entries(&log),
            vec!["A-pre", "B-pre", "C-pre", "T", "C-post", "B-post", "A-post"]
        );
    }

    #[tokio::test]
    async fn test_short_circuit_skips_inner_stages() {
        let log: Log = Arc::default();
        let mut chain = MiddlewareChain::new();
        chain.add(recorder(&log, "A")).unwrap();

        let b_log = Arc::clone(&log);
        chain
            .add(from_fn(move |_req: Request, _next: Next| {
                let log = Arc::clone(&b_log);
                async move {
                    log.lock().unwrap().push("B".to_string());
                    Ok(Response::text("blocked").with_status(403))
                }
            }))
            .unwrap();
        chain.add(recorder(&log, "C")).unwrap();

        let pipeline = chain.build(terminal(&log));
        let response = pipeline.invoke(Request::get("/")).await.unwrap();

        assert_eq!(response.status, 403);
        assert_eq!(entries(&log), vec!["A-pre", "B", "A-post"]);
    }

    #[tokio::test]
    async fn test_post_phase_can_rewrite_response() {
        let mut chain = MiddlewareChain::new();
        chain
            .add(from_fn(|req: Request, next: Next| async move {
                let mut response = next.run(req).await?;
                response.set_header("x-wrapped", "yes");
                Ok(response)
            }))
            .unwrap();

        let pipeline = chain.build(|_req: Request| async { Ok(Response::text("inner")) });
        let response = pipeline.invoke(Request::get("/")).await.unwrap();
        assert_eq!(response.header("x-wrapped"), Some("yes"));
    }

    #[tokio::test]
    async fn test_errors_propagate_to_enclosing_layer() {
        let log: Log = Arc::default();
        let mut chain = MiddlewareChain::new();

        let outer_log = Arc::clone(&log);
        chain
            .add(from_fn(move |req: Request, next: Next| {
                let log = Arc::clone(&outer_log);
                async move {
                    match next.run(req).await {
                        Ok(response) => Ok(response),
                        Err(err) => {
                            log.lock().unwrap().push(format!("caught: {err}"));
                            Ok(Response::text("recovered").with_status(500))
                        }
                    }
                }
            }))
            .unwrap();
        chain.add(recorder(&log, "inner")).unwrap();

        let pipeline = chain.build(|_req: Request| async { Err(Error::handler("boom")) });
        let response = pipeline.invoke(Request::get("/")).await.unwrap();

        assert_eq!(response.status, 500);
        assert_eq!(
            entries(&log),
            vec!["inner-pre", "inner-post", "caught: Handler error: boom"]
        );
    }

    #[tokio::test]
    async fn test_uncaught_error_reaches_caller() {
        let mut chain = MiddlewareChain::new();
        let pipeline = chain.build(|_req: Request| async { Err(Error::handler("nope")) });
        assert!(matches!(
            pipeline.invoke(Request::get("/")).await,
            Err(Error::Handler { .. })
        ));
    }

    #[test]
    fn test_add_after_build_is_rejected() {
        let mut chain = MiddlewareChain::new();
        let _pipeline = chain.build(|_req: Request| async { Ok(Response::default()) });
        assert_eq!(chain.state(), ChainState::Built);

        let result = chain.add(from_fn(|req: Request, next: Next| next.run(req)));
        assert!(matches!(result, Err(Error::ChainMisuse { .. })));
        assert!(chain.is_empty());
    }

    #[tokio::test]
    async fn test_rebuild_yields_independent_pipelines() {
        let log: Log = Arc::default();
        let mut chain = MiddlewareChain::new();
        chain.add(recorder(&log, "A")).unwrap();

        let mut extended = chain.clone();
        let first = chain.build(|_req: Request| async { Ok(Response::text("first")) });

        extended.add(recorder(&log, "B")).unwrap();
        let second = extended.build(|_req: Request| async { Ok(Response::text("second")) });

        let again = chain.build(|_req: Request| async { Ok(Response::text("again")) });

        assert_eq!(first.layers(), 1);
        assert_eq!(second.layers(), 2);
        assert_eq!(first.invoke(Request::get("/")).await.unwrap().body, "first");
        assert_eq!(again.invoke(Request::get("/")).await.unwrap().body, "again");
        assert_eq!(entries(&log), vec!["A-pre", "A-post", "A-pre", "A-post"]);
    }

    #[tokio::test]
    async fn test_pipeline_shared_across_tasks() {
        let mut chain = MiddlewareChain::new();
        chain
            .add(from_fn(|mut req: Request, next: Next| async move {
                req.set_extension("seen", "yes");
                next.run(req).await
            }))
            .unwrap();
        let pipeline = chain.build(|req: Request| async move {
            Ok(Response::text(format!(
                "{}:{}",
                req.path,
                req.extension("seen").unwrap_or("no")
            )))
        });

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let pipeline = pipeline.clone();
                tokio::spawn(async move { pipeline.invoke(Request::get(format!("/{i}"))).await })
            })
            .collect();

        for (i, handle) in handles.into_iter().enumerate() {
            let response = handle.await.unwrap().unwrap();
            assert_eq!(response.body, format!("/{i}:yes"));
        }
    }

    #[test]
    fn test_empty_chain_runs_endpoint_directly() {
        let mut chain = MiddlewareChain::new();
        let pipeline = chain.build(|_req: Request| async { Ok(Response::text("direct")) });
        assert_eq!(pipeline.layers(), 0);

        let response = tokio_test::block_on(pipeline.invoke(Request::get("/"))).unwrap();
        assert_eq!(response.body, "direct");
    }
}
