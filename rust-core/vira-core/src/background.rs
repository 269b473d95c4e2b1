//! # Background Tasks
//!
//! Fire-and-forget work queued by handlers and run on the Tokio runtime
//! after the response is on its way.
//!
//! At most `max_running` tasks execute at once; the rest wait for a slot.
//! A task that exceeds its timeout is retried until it runs out of attempts,
//! while a task that returns an error is logged and dropped. Shutdown stops
//! intake, discards tasks that never started and waits a bounded time for
//! the running ones.

use crate::error::Result;
use crate::middleware::BoxFuture;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

type TaskFn = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// A unit of background work
#[derive(Clone)]
pub struct Task {
    name: String,
    run: TaskFn,
    timeout: Duration,
    max_attempts: u32,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl Task {
    /// Create a task with a 5 second timeout and 3 attempts
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            run: Arc::new(move || -> BoxFuture<'static, Result<()>> { Box::pin(f()) }),
            timeout: Duration::from_secs(5),
            max_attempts: 3,
        }
    }

    /// Time allowed for a single attempt
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Total attempts when the task keeps timing out (at least 1)
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Task name used in log events
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

struct Inner {
    slots: Semaphore,
    pending: AtomicUsize,
    shutting_down: AtomicBool,
    max_running: usize,
}

/// Decrements the pending count however the task ends
struct PendingGuard(Arc<Inner>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.pending.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Bounded background task runner, cheap to clone
#[derive(Clone)]
pub struct BackgroundTasks {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for BackgroundTasks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundTasks")
            .field("max_running", &self.inner.max_running)
            .field("pending", &self.pending())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

impl BackgroundTasks {
    /// Runner executing at most `max_running` tasks at once (at least 1)
    #[must_use]
    pub fn new(max_running: usize) -> Self {
        let max_running = max_running.max(1);
        Self {
            inner: Arc::new(Inner {
                slots: Semaphore::new(max_running),
                pending: AtomicUsize::new(0),
                shutting_down: AtomicBool::new(false),
                max_running,
            }),
        }
    }

    /// Queue a task
    ///
    /// Returns `false` without queueing once shutdown has begun. Must be
    /// called from within a Tokio runtime.
    pub fn add(&self, task: Task) -> bool {
        if self.is_shutting_down() {
            debug!(task = %task.name, "Task rejected during shutdown");
            return false;
        }
        self.inner.pending.fetch_add(1, Ordering::Relaxed);
        let guard = PendingGuard(Arc::clone(&self.inner));
        tokio::spawn(run_task(guard, task));
        true
    }

    /// Queue several tasks; returns how many were accepted
    pub fn add_all(&self, tasks: impl IntoIterator<Item = Task>) -> usize {
        tasks.into_iter().map(|task| self.add(task)).filter(|accepted| *accepted).count()
    }

    /// Tasks queued or running
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::Relaxed)
    }

    /// Whether shutdown has begun
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Relaxed)
    }

    /// Wait until nothing is queued or running
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let idle = async {
            while self.pending() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(timeout, idle).await.is_ok()
    }

    /// Stop intake, drop tasks that have not started and wait for the rest
    ///
    /// Returns the number of tasks still running when `timeout` elapsed.
    pub async fn shutdown(&self, timeout: Duration) -> usize {
        if self.inner.shutting_down.swap(true, Ordering::Relaxed) {
            return self.pending();
        }
        info!(pending = self.pending(), "Shutting down background tasks");
        self.inner.slots.close();

        if self.wait_idle(timeout).await {
            return 0;
        }
        let remaining = self.pending();
        warn!(remaining, "Background tasks still running after shutdown timeout");
        remaining
    }
}

async fn run_task(guard: PendingGuard, task: Task) {
    let Ok(_slot) = guard.0.slots.acquire().await else {
        debug!(task = %task.name, "Task discarded before start");
        return;
    };

    let mut attempt = 1;
    loop {
        debug!(task = %task.name, attempt, "Running task");
        match tokio::time::timeout(task.timeout, (task.run)()).await {
            Ok(Ok(())) => {
                debug!(task = %task.name, attempt, "Task finished");
                return;
            }
            Ok(Err(err)) => {
                warn!(task = %task.name, error = %err, "Task failed");
                return;
            }
            Err(_) if attempt >= task.max_attempts => {
                warn!(task = %task.name, attempts = attempt, "Task timed out, giving up");
                return;
            }
            Err(_) if guard.0.shutting_down.load(Ordering::Relaxed) => {
                warn!(task = %task.name, "Task timed out during shutdown, not retried");
                return;
            }
            Err(_) => {
                debug!(task = %task.name, attempt, "Task timed out, retrying");
                attempt += 1;
            }
        }
    }
}
