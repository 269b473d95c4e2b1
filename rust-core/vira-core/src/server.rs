//! # HTTP Server
//!
//! Hyper/Tokio transport for a built [`Service`].
//!
//! ## Key Features
//!
//! - HTTP/1.1 accept loop, one task per connection
//! - Startup hooks before the first accept, shutdown hooks after draining
//! - Graceful shutdown on CTRL+C with a bounded drain
//! - Body size limit enforced before the pipeline runs

use crate::app::Service;
use crate::error::{Error, Result};
use crate::request::Request;
use crate::response::Response;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket};
use tracing::{debug, error, info, warn};

/// HTTP Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind the server to
    pub address: SocketAddr,
    /// Enable keep-alive connections
    pub keep_alive: bool,
    /// Shutdown timeout for graceful shutdown (default: 30 seconds)
    pub shutdown_timeout: Duration,
    /// Max request body size in bytes
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: ([127, 0, 0, 1], 8000).into(),
            keep_alive: true,
            shutdown_timeout: Duration::from_secs(30),
            max_body_size: 1024 * 1024,
        }
    }
}

/// HTTP server driving a [`Service`]
#[derive(Debug)]
pub struct Server {
    config: ServerConfig,
    service: Service,
}

impl Server {
    /// Create a server for `service`, inheriting its body size limit
    #[must_use]
    pub fn new(service: Service) -> Self {
        let config = ServerConfig {
            max_body_size: service.config().max_body_size,
            ..ServerConfig::default()
        };
        Self { config, service }
    }

    /// Replace the whole configuration
    #[must_use]
    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Bind the server to an address
    #[must_use]
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.config.address = addr;
        self
    }

    /// Set max request body size
    #[must_use]
    pub fn with_max_body_size(mut self, bytes: usize) -> Self {
        self.config.max_body_size = bytes;
        self
    }

    /// Set how long shutdown waits for in-flight connections
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Current configuration
    #[must_use]
    pub const fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Serve until CTRL+C
    ///
    /// # Errors
    ///
    /// Returns `Error::BindError` if the address cannot be bound and
    /// `Error::Lifecycle` if a startup or shutdown hook fails.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(shutdown_signal()).await
    }

    /// Serve until `signal` completes
    ///
    /// # Errors
    ///
    /// See [`Server::serve`].
    pub async fn serve_with_shutdown<S>(self, signal: S) -> Result<()>
    where
        S: Future<Output = ()> + Send,
    {
        let listener = bind_listener(self.config.address)?;
        self.serve_listener(listener, signal).await
    }

    /// Serve on an already bound listener until `signal` completes
    ///
    /// # Errors
    ///
    /// Returns `Error::Lifecycle` if a startup or shutdown hook fails.
    pub async fn serve_listener<S>(self, listener: TcpListener, signal: S) -> Result<()>
    where
        S: Future<Output = ()> + Send,
    {
        self.service.startup().await?;

        let addr = listener.local_addr()?;
        info!("Server listening on http://{}", addr);

        let active = Arc::new(AtomicUsize::new(0));
        let max_body_size = self.config.max_body_size;
        let keep_alive = self.config.keep_alive;

        tokio::pin!(signal);
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    let (stream, remote_addr) = match accept_result {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            warn!(error = %err, "Failed to accept connection");
                            continue;
                        }
                    };
                    let io = TokioIo::new(stream);
                    let service = self.service.clone();
                    let active = Arc::clone(&active);

                    active.fetch_add(1, Ordering::Relaxed);
                    tokio::task::spawn(async move {
                        if let Err(err) = http1::Builder::new()
                            .keep_alive(keep_alive)
                            .serve_connection(io, service_fn(move |req| {
                                let service = service.clone();
                                async move {
                                    Ok::<_, Infallible>(
                                        handle_request(req, &service, remote_addr, max_body_size)
                                            .await,
                                    )
                                }
                            }))
                            .await
                        {
                            debug!(error = ?err, %remote_addr, "Error serving connection");
                        }
                        active.fetch_sub(1, Ordering::Relaxed);
                    });
                }
                () = &mut signal => {
                    info!("Shutdown signal received, stopping server...");
                    break;
                }
            }
        }
        drop(listener);

        let timeout = self.config.shutdown_timeout;
        let drain = async {
            while active.load(Ordering::Relaxed) > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };
        if tokio::time::timeout(timeout, drain).await.is_err() {
            warn!(
                remaining = active.load(Ordering::Relaxed),
                "Shutdown timeout elapsed with connections still open"
            );
        }

        self.service.shutdown().await?;
        info!("Server stopped");
        Ok(())
    }
}

fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
    let bind_error = |source| Error::BindError {
        address: addr.to_string(),
        source,
    };

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(bind_error)?;
    socket.set_reuseaddr(true).map_err(bind_error)?;
    socket.bind(addr).map_err(bind_error)?;
    socket.listen(1024).map_err(bind_error)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "Failed to install CTRL+C signal handler");
        std::future::pending::<()>().await;
    }
}

async fn handle_request(
    req: hyper::Request<Incoming>,
    service: &Service,
    remote_addr: SocketAddr,
    max_body_size: usize,
) -> hyper::Response<Full<Bytes>> {
    let version = req.version();
    let mut request = match Request::from_hyper_with_limit(req, max_body_size).await {
        Ok(request) => request,
        Err(err) => return reject(&err, remote_addr).into_hyper(),
    };
    request.set_header("x-client-ip", &remote_addr.ip().to_string());

    let method = request.method;
    let path = request.path.clone();
    let response = service.handle(request).await;

    info!(
        "    {} - \"{} {} {:?}\" {}",
        remote_addr, method, path, version, response.status
    );
    response.into_hyper()
}

fn reject(err: &Error, remote_addr: SocketAddr) -> Response {
    warn!(error = %err, %remote_addr, "Request rejected before dispatch");
    match err {
        Error::PayloadTooLarge { .. } => {
            Response::json(r#"{"error": "Payload Too Large"}"#).with_status(413)
        }
        Error::InvalidMethod { .. } => Response::text("Not Implemented").with_status(501),
        _ => Response::text("Bad Request").with_status(400),
    }
}
