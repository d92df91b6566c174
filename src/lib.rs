//! # graceserve
//!
//! Process- and connection-lifecycle framework for network services:
//! supervised task trees, graceful shutdown on signals, and zero-downtime
//! restarts by descriptor handoff.
//!
//! ```text
//!                         ┌─────────────────────────────┐
//!                         │         Environment         │
//!                         │  base token · task tracker  │
//!                         │  first-error latch · wait   │
//!                         └──────┬──────────────┬───────┘
//!            SIGINT/SIGTERM ─────┤              │
//!                                │              │
//!               ┌────────────────▼───┐   ┌──────▼─────────────────┐
//!               │  Server (generic)  │   │  HttpServer (http/1.1) │
//!               │  accept + handler  │   │  conn states · access  │
//!               │  bounded drain     │   │  logs · idle forcing   │
//!               └────────────────────┘   └────────────────────────┘
//!                                │              │
//!               ┌────────────────▼──────────────▼───────┐
//!               │   Graceful: SIGHUP → re-exec self,    │
//!               │   hand fds 3..N to successor, shut    │
//!               │   down once it signals readiness      │
//!               └───────────────────────────────────────┘
//! ```
//!
//! ## Core pieces
//! - [`Environment`] — cancellable task registry with a first-error latch
//!   and a completion barrier; a process-wide default lives behind the free
//!   functions in [`global`] (re-exported at the root).
//! - [`Server`] / [`ConnHandler`] — generic accept loop with per-connection
//!   supervision and an optional shutdown timeout.
//! - [`HttpServer`] / [`HttpHandler`] — HTTP/1.1 on hyper with JSON access
//!   logs, request correlation ids, keep-alive interruption during drain,
//!   and TLS via rustls.
//! - [`Graceful`] / [`Restarter`] — restart orchestration: listener
//!   acquisition (socket activation, inheritance, fresh bind), SIGHUP
//!   handling, readiness handshake.
//!
//! ## Minimal HTTP service
//! ```no_run
//! use std::sync::Arc;
//!
//! use bytes::Bytes;
//! use http_body_util::Full;
//! use hyper::Response;
//!
//! use graceserve::{Environment, HttpHandlerFn, HttpServer, TaskError};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), TaskError> {
//!     let env = Environment::new();
//!     let handler = Arc::new(HttpHandlerFn::new(|_ctx, _req| async {
//!         Response::new(Full::new(Bytes::from_static(b"hello\n")))
//!     }));
//!
//!     let server = HttpServer::new(handler).with_env(env.clone());
//!     server.listen_and_serve("0.0.0.0:8080").await?;
//!
//!     env.wait().await
//! }
//! ```

pub mod env;
pub mod error;
pub mod global;
pub mod graceful;
pub mod http;
pub mod listener;
pub mod logging;
pub mod server;
pub mod signals;

pub use crate::env::Environment;
pub use crate::error::{is_signaled, SetupError, TaskError};
pub use crate::global::{cancel, context, spawn, stop, wait};
pub use crate::graceful::{generation, Descriptor, Graceful, Restarter};
pub use crate::http::state::ConnState;
pub use crate::http::{
    tls_acceptor, HttpHandler, HttpHandlerFn, HttpServer, RequestId, DEFAULT_READ_TIMEOUT,
    REQUEST_ID_HEADER,
};
pub use crate::listener::{Listener, Stream};
pub use crate::logging::{status_severity, AccessLog, AccessLogger, JsonLogWriter, Severity};
pub use crate::server::{ConnHandler, HandlerFn, Server};
pub use crate::signals::stop_delay;

#[cfg(unix)]
pub use crate::graceful::OsRestarter;
#[cfg(unix)]
pub use crate::listener::{activated_listeners, inherited_listeners};
