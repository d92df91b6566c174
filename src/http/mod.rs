//! # Supervised HTTP/1.1 server with graceful shutdown.
//!
//! [`HttpServer`] layers request handling, access logging, and
//! connection-state tracking on top of the lifecycle machinery:
//!
//! ```text
//!                        ┌──────────────────────────────┐
//!   Environment ──spawn──► accept loop (per listener)   │
//!        │                │   conn ► ConnTable register │
//!        │                │   conn ► hyper http1 drive  │
//!        │                └──────────────┬───────────────┘
//!        │ cancel                        │ per request
//!        ▼                               ▼
//!   drain: close tracker,        handler + access log
//!   every 10ms interrupt         Connection: close while
//!   New/Idle connections         draining
//! ```
//!
//! ## Shutdown
//! When the Environment's context is cancelled the server stops accepting,
//! flips into draining mode, and repeatedly (every 10ms) interrupts
//! connections that are between requests, so a fleet of keep-alive clients
//! cannot pin the process open. Connections with an in-flight request finish
//! it first; responses sent while draining carry `Connection: close`. An
//! optional shutdown timeout caps the whole drain.
//!
//! ## Request context
//! Each request's handler receives a child token of the Environment's
//! context, cancelled when the handler returns. The `x-request-id` header,
//! when present, is exposed to handlers via the [`RequestId`] request
//! extension and echoed into the access log.

pub mod state;

use std::future::Future;
use std::io::{self, BufReader};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use ::http::header::{CONNECTION, HOST, USER_AGENT};
use ::http::{HeaderMap, HeaderValue, StatusCode};
use http_body_util::Full;
use hyper::body::{Body, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::rustls::pki_types::PrivateKeyDer;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::env::Environment;
use crate::error::SetupError;
use crate::global;
use crate::listener::Listener;
use crate::logging::{default_topic, status_severity, AccessLog, AccessLogger, JsonLogWriter};
use self::state::{ConnState, ConnTable};

/// Header carrying the request correlation id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Default cap on reading a request head.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// TCP keepalive period applied to accepted connections.
pub const KEEPALIVE_PERIOD: Duration = Duration::from_secs(180);

/// How often the drain loop interrupts idle connections.
const IDLE_FORCE_INTERVAL: Duration = Duration::from_millis(10);

/// Correlation id of the current request, taken from [`REQUEST_ID_HEADER`].
/// Empty when the client sent none. Available to handlers through
/// [`Request::extensions`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(pub String);

/// Handles one HTTP request.
///
/// The token is a child of the server's context, cancelled when the handler
/// returns or when the whole server shuts down; long-running handlers should
/// watch it.
#[async_trait]
pub trait HttpHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        ctx: CancellationToken,
        req: Request<Incoming>,
    ) -> Response<Full<Bytes>>;
}

/// Adapter implementing [`HttpHandler`] for a closure.
pub struct HttpHandlerFn<F> {
    f: F,
}

impl<F> HttpHandlerFn<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> HttpHandler for HttpHandlerFn<F>
where
    F: Fn(CancellationToken, Request<Incoming>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response<Full<Bytes>>> + Send + 'static,
{
    async fn handle(
        &self,
        ctx: CancellationToken,
        req: Request<Incoming>,
    ) -> Response<Full<Bytes>> {
        (self.f)(ctx, req).await
    }
}

/// HTTP/1.1 server with supervised connections and JSON access logs.
pub struct HttpServer {
    handler: Arc<dyn HttpHandler>,
    access_log: Arc<dyn AccessLogger>,
    topic: String,
    env: Option<Environment>,
    shutdown_timeout: Duration,
    read_timeout: Duration,
    shared: Arc<HttpShared>,
}

struct HttpShared {
    /// Counts live connections; the drain barrier.
    conns: TaskTracker,
    table: ConnTable,
    draining: AtomicBool,
    timed_out: AtomicBool,
    drain_once: Once,
}

impl HttpShared {
    /// First caller flips into draining mode and starts the idle-forcing
    /// loop; later calls are no-ops. Accept loops of every listener call
    /// this after they stop.
    fn begin_drain(self: &Arc<Self>) {
        self.drain_once.call_once(|| {
            self.draining.store(true, Ordering::Relaxed);
            self.conns.close();
            let shared = Arc::clone(self);
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(IDLE_FORCE_INTERVAL);
                loop {
                    tokio::select! {
                        _ = shared.conns.wait() => break,
                        _ = tick.tick() => {
                            for interrupt in shared.table.snapshot_idle() {
                                interrupt.cancel();
                            }
                        }
                    }
                }
            });
        });
    }
}

impl HttpServer {
    pub fn new(handler: Arc<dyn HttpHandler>) -> Self {
        Self {
            handler,
            access_log: Arc::new(JsonLogWriter::stderr()),
            topic: default_topic(),
            env: None,
            shutdown_timeout: Duration::ZERO,
            read_timeout: DEFAULT_READ_TIMEOUT,
            shared: Arc::new(HttpShared {
                conns: TaskTracker::new(),
                table: ConnTable::new(),
                draining: AtomicBool::new(false),
                timed_out: AtomicBool::new(false),
                drain_once: Once::new(),
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

    /// Caps reading a request head. Zero disables the timeout.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Replaces the access-log sink (default: JSON lines on stderr).
    pub fn with_access_logger(mut self, logger: Arc<dyn AccessLogger>) -> Self {
        self.access_log = logger;
        self
    }

    /// Sets the `topic` field of emitted access logs (default: the program
    /// name).
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    /// True once a shutdown drain has been abandoned because the timeout
    /// elapsed with connections still open.
    pub fn timed_out(&self) -> bool {
        self.shared.timed_out.load(Ordering::Relaxed)
    }

    /// Binds `addr` and serves plaintext HTTP on it.
    pub async fn listen_and_serve(&self, addr: &str) -> Result<(), SetupError> {
        let listener = Listener::bind_tcp(addr).await?;
        self.serve(listener);
        Ok(())
    }

    /// Binds `addr` and serves HTTPS with the given PEM certificate chain
    /// and private key.
    pub async fn listen_and_serve_tls(
        &self,
        addr: &str,
        cert_path: &str,
        key_path: &str,
    ) -> Result<(), SetupError> {
        let acceptor = tls_acceptor(cert_path, key_path)?;
        let listener = Listener::bind_tcp(addr).await?;
        self.serve_tls(listener, acceptor);
        Ok(())
    }

    /// Serves plaintext HTTP on an already-acquired listener.
    pub fn serve(&self, listener: Listener) {
        self.spawn_accept(listener, None);
    }

    /// Serves HTTPS on an already-acquired listener.
    pub fn serve_tls(&self, listener: Listener, acceptor: TlsAcceptor) {
        self.spawn_accept(listener, Some(acceptor));
    }

    fn spawn_accept(&self, listener: Listener, tls: Option<TlsAcceptor>) {
        let env = match &self.env {
            Some(env) => env.clone(),
            None => global::global().clone(),
        };
        let listener = listener.with_keepalive(KEEPALIVE_PERIOD);
        let handler = Arc::clone(&self.handler);
        let access_log = Arc::clone(&self.access_log);
        let topic = self.topic.clone();
        let shared = Arc::clone(&self.shared);
        let shutdown_timeout = self.shutdown_timeout;
        let read_timeout = self.read_timeout;
        let protocol = if tls.is_some() { "https" } else { "http" };

        env.spawn(move |ctx| async move {
            tracing::info!(addr = %listener.describe(), protocol, "http server started");
            loop {
                let stream = tokio::select! {
                    _ = ctx.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok(stream) => stream,
                        Err(err) => {
                            tracing::debug!(error = %err, "accept failed, stopping");
                            break;
                        }
                    },
                };

                let (conn_id, interrupt) = shared.table.register();
                let rctx = Arc::new(RequestContext {
                    handler: Arc::clone(&handler),
                    access_log: Arc::clone(&access_log),
                    topic: topic.clone(),
                    base: ctx.clone(),
                    shared: Arc::clone(&shared),
                    conn_id,
                    remote: stream
                        .peer_ip()
                        .map(|ip| ip.to_string())
                        .unwrap_or_default(),
                    protocol,
                });
                let tls = tls.clone();
                let conn_shared = Arc::clone(&shared);
                shared.conns.spawn(async move {
                    match tls {
                        None => drive_connection(stream, interrupt, rctx, read_timeout).await,
                        Some(acceptor) => {
                            // A shutdown mid-handshake just drops the socket.
                            let io = tokio::select! {
                                _ = interrupt.cancelled() => None,
                                accepted = acceptor.accept(stream) => match accepted {
                                    Ok(io) => Some(io),
                                    Err(err) => {
                                        tracing::debug!(error = %err, "tls handshake failed");
                                        None
                                    }
                                },
                            };
                            if let Some(io) = io {
                                drive_connection(io, interrupt, rctx, read_timeout).await;
                            }
                        }
                    }
                    conn_shared.table.set_state(conn_id, ConnState::Closed);
                });
            }
            drop(listener);
            tracing::info!("http server stopping, draining connections");

            shared.begin_drain();
            if shutdown_timeout.is_zero() {
                shared.conns.wait().await;
            } else if tokio::time::timeout(shutdown_timeout, shared.conns.wait())
                .await
                .is_err()
            {
                shared.timed_out.store(true, Ordering::Relaxed);
                tracing::warn!(
                    timeout_ms = shutdown_timeout.as_millis() as u64,
                    "shutdown timeout elapsed with connections still open"
                );
            }
            Ok(())
        });
    }
}

/// Everything a connection needs to serve requests.
struct RequestContext {
    handler: Arc<dyn HttpHandler>,
    access_log: Arc<dyn AccessLogger>,
    topic: String,
    /// Server context; each request gets a child token of it.
    base: CancellationToken,
    shared: Arc<HttpShared>,
    conn_id: u64,
    remote: String,
    protocol: &'static str,
}

/// Runs the hyper http1 state machine over `io` until the connection ends.
///
/// The interrupt token converts into a hyper graceful shutdown: an idle
/// keep-alive connection closes immediately, an active one closes after its
/// in-flight request.
async fn drive_connection<I>(
    io: I,
    interrupt: CancellationToken,
    rctx: Arc<RequestContext>,
    read_timeout: Duration,
) where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req| {
        let rctx = Arc::clone(&rctx);
        async move { Ok::<_, std::convert::Infallible>(handle_request(rctx, req).await) }
    });

    let mut builder = http1::Builder::new();
    builder.timer(TokioTimer::new());
    if !read_timeout.is_zero() {
        builder.header_read_timeout(read_timeout);
    }
    let conn = builder
        .serve_connection(TokioIo::new(io), service)
        .with_upgrades();
    tokio::pin!(conn);

    let mut interrupted = false;
    loop {
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(err) = result {
                    tracing::debug!(error = %err, "connection ended with error");
                }
                break;
            }
            _ = interrupt.cancelled(), if !interrupted => {
                interrupted = true;
                conn.as_mut().graceful_shutdown();
            }
        }
    }
}

async fn handle_request(rctx: Arc<RequestContext>, mut req: Request<Incoming>) -> Response<Full<Bytes>> {
    rctx.shared.table.set_state(rctx.conn_id, ConnState::Active);
    let start = Instant::now();

    let method = req.method().to_string();
    let request_uri = req.uri().to_string();
    let host = {
        let from_header = header_str(req.headers(), HOST);
        if from_header.is_empty() {
            req.uri().host().unwrap_or("").to_string()
        } else {
            from_header
        }
    };
    let user_agent = header_str(req.headers(), USER_AGENT);
    let request_id = header_str(req.headers(), REQUEST_ID_HEADER);
    let request_size = req
        .body()
        .size_hint()
        .exact()
        .map(|n| n as i64)
        .unwrap_or(-1);

    req.extensions_mut().insert(RequestId(request_id.clone()));

    let token = rctx.base.child_token();
    let guard = token.clone().drop_guard();
    let mut response = rctx.handler.handle(token, req).await;
    drop(guard);

    let status = response.status();
    if rctx.shared.draining.load(Ordering::Relaxed) && status != StatusCode::SWITCHING_PROTOCOLS {
        response
            .headers_mut()
            .insert(CONNECTION, HeaderValue::from_static("close"));
    }
    let response_size = response
        .body()
        .size_hint()
        .exact()
        .map(|n| n as i64)
        .unwrap_or(-1);

    rctx.access_log.log(AccessLog {
        topic: rctx.topic.clone(),
        logged_at: AccessLog::format_time(Utc::now()),
        severity: status_severity(status.as_u16()),
        message: status.canonical_reason().unwrap_or("").to_string(),
        kind: "access".to_string(),
        response_time: start.elapsed().as_secs_f64(),
        protocol: rctx.protocol.to_string(),
        http_status_code: status.as_u16(),
        http_method: method,
        request_uri,
        http_host: host,
        request_size,
        response_size,
        remote_ipaddr: rctx.remote.clone(),
        http_user_agent: user_agent,
        request_id,
    });

    rctx.shared
        .table
        .set_state(rctx.conn_id, post_response_state(status));
    response
}

/// State a connection enters once its response is written. A 101 hands the
/// connection over to the application: it is done from the server's point
/// of view and leaves the drain accounting as `Hijacked`.
fn post_response_state(status: StatusCode) -> ConnState {
    if status == StatusCode::SWITCHING_PROTOCOLS {
        ConnState::Hijacked
    } else {
        ConnState::Idle
    }
}

fn header_str(headers: &HeaderMap, name: impl ::http::header::AsHeaderName) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

/// Builds a TLS acceptor from PEM files, advertising HTTP/1.1 over ALPN.
pub fn tls_acceptor(cert_path: &str, key_path: &str) -> Result<TlsAcceptor, SetupError> {
    let load = |source: io::Error| SetupError::TlsLoad { source };

    let mut cert_reader = BufReader::new(std::fs::File::open(cert_path).map_err(load)?);
    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(load)?;

    let mut key_reader = BufReader::new(std::fs::File::open(key_path).map_err(load)?);
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_reader)
        .map_err(load)?
        .ok_or_else(|| load(io::Error::new(io::ErrorKind::InvalidData, "no private key found")))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| load(io::Error::other(err)))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(TlsAcceptor::from(Arc::new(config)))
}
