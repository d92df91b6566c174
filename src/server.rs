//! # Generic connection server.
//!
//! [`Server`] turns a [`Listener`] plus a [`ConnHandler`] into a supervised
//! accept loop:
//!
//! ```text
//! Environment ──spawn──► accept loop ──per conn──► handler task
//!      │                      │                        │
//!      └──── cancel ─────────►└── stop accepting       └── child token
//! ```
//!
//! Each accepted connection runs under a child token of the accept loop's
//! context and is counted by a private tracker, so [`Server::serve`]'s task
//! only returns once every connection handler has. An optional shutdown
//! timeout caps that drain; when it fires, remaining handlers are abandoned
//! (their tokens are already cancelled) and [`Server::timed_out`] reports it.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::env::Environment;
use crate::error::TaskError;
use crate::global;
use crate::listener::{Listener, Stream};

/// Handles one accepted connection.
///
/// The token is a child of the server's context: it fires when the server
/// shuts down, and handlers are expected to wind down promptly once it does.
#[async_trait]
pub trait ConnHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: CancellationToken, stream: Stream) -> Result<(), TaskError>;
}

/// Adapter implementing [`ConnHandler`] for a closure.
///
/// ```no_run
/// use std::sync::Arc;
/// use graceserve::{HandlerFn, Server};
///
/// let handler = Arc::new(HandlerFn::new(|_ctx, _stream| async { Ok(()) }));
/// let server = Server::new(handler);
/// ```
pub struct HandlerFn<F> {
    f: F,
}

impl<F> HandlerFn<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> ConnHandler for HandlerFn<F>
where
    F: Fn(CancellationToken, Stream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
{
    async fn handle(&self, ctx: CancellationToken, stream: Stream) -> Result<(), TaskError> {
        (self.f)(ctx, stream).await
    }
}

/// Accept loop with connection supervision and bounded drain.
pub struct Server {
    handler: Arc<dyn ConnHandler>,
    env: Option<Environment>,
    shutdown_timeout: Duration,
    shared: Arc<Shared>,
}

struct Shared {
    /// Counts live connection handlers; the drain barrier.
    conns: TaskTracker,
    timed_out: AtomicBool,
}

impl Server {
    pub fn new(handler: Arc<dyn ConnHandler>) -> Self {
        Self {
            handler,
            env: None,
            shutdown_timeout: Duration::ZERO,
            shared: Arc::new(Shared {
                conns: TaskTracker::new(),
                timed_out: AtomicBool::new(false),
            }),
        }
    }

    /// Runs under `env` instead of the process-wide default.
    pub fn with_env(mut self, env: Environment) -> Self {
        self.env = Some(env);
        self
    }

    /// Caps the connection drain after shutdown starts. Zero (the default)
    /// waits indefinitely.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// True once a shutdown drain has been abandoned because the timeout
    /// elapsed with connections still open.
    pub fn timed_out(&self) -> bool {
        self.shared.timed_out.load(Ordering::Relaxed)
    }

    /// Starts serving `listener`. Returns immediately; the accept loop runs
    /// as a task of the Environment, so [`Environment::wait`] covers it.
    pub fn serve(&self, listener: Listener) {
        let env = match &self.env {
            Some(env) => env.clone(),
            None => global::global().clone(),
        };
        let handler = Arc::clone(&self.handler);
        let shared = Arc::clone(&self.shared);
        let shutdown_timeout = self.shutdown_timeout;

        env.spawn(move |ctx| async move {
            accept_loop(ctx, listener, handler, Arc::clone(&shared)).await;
            drain(&shared, shutdown_timeout).await;
            Ok(())
        });
    }
}

async fn accept_loop(
    ctx: CancellationToken,
    listener: Listener,
    handler: Arc<dyn ConnHandler>,
    shared: Arc<Shared>,
) {
    tracing::info!(addr = %listener.describe(), "server started");
    loop {
        let stream = tokio::select! {
            _ = ctx.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(stream) => stream,
                Err(err) => {
                    // Listener broken (or closed under us); treat like shutdown.
                    tracing::debug!(error = %err, "accept failed, stopping");
                    break;
                }
            },
        };

        let handler = Arc::clone(&handler);
        let conn_ctx = ctx.child_token();
        shared.conns.spawn(async move {
            let guard = conn_ctx.clone().drop_guard();
            if let Err(err) = handler.handle(conn_ctx, stream).await {
                tracing::error!(error = %err, kind = err.as_label(), "connection handler failed");
            }
            drop(guard);
        });
    }
    // Dropping the listener closes the socket before the drain starts.
    drop(listener);
    tracing::info!("server stopped accepting");
}

async fn drain(shared: &Shared, timeout: Duration) {
    shared.conns.close();
    if timeout.is_zero() {
        shared.conns.wait().await;
        return;
    }
    if tokio::time::timeout(timeout, shared.conns.wait()).await.is_err() {
        shared.timed_out.store(true, Ordering::Relaxed);
        tracing::warn!(
            timeout_ms = timeout.as_millis() as u64,
            "shutdown timeout elapsed with connections still open"
        );
    }
}
