//! End-to-end HTTP server behavior over real sockets: access-log records,
//! request correlation, draining, keep-alive interruption, and the shutdown
//! timeout. Requests are written raw so the tests control framing exactly.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

mod common;

use graceserve::{
    AccessLog, AccessLogger, Environment, HttpHandlerFn, HttpServer, Listener, RequestId, Severity,
};

#[derive(Default)]
struct CaptureLog(Mutex<Vec<AccessLog>>);

impl CaptureLog {
    fn records(&self) -> Vec<AccessLog> {
        self.0.lock().unwrap().clone()
    }
}

impl AccessLogger for CaptureLog {
    fn log(&self, record: AccessLog) {
        self.0.lock().unwrap().push(record);
    }
}

struct RawResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl RawResponse {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

async fn read_response(stream: &mut TcpStream) -> RawResponse {
    let mut buf = Vec::new();
    let header_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let mut chunk = [0u8; 1024];
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed before response headers");
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8(buf[..header_end].to_vec()).unwrap();
    let mut lines = head.split("\r\n");
    let status: u16 = lines
        .next()
        .unwrap()
        .split_whitespace()
        .nth(1)
        .unwrap()
        .parse()
        .unwrap();
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(": "))
        .map(|(n, v)| (n.to_string(), v.to_string()))
        .collect();

    let content_length: usize = headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
        .map(|(_, v)| v.parse().unwrap())
        .unwrap_or(0);

    let mut body = buf[header_end..].to_vec();
    while body.len() < content_length {
        let mut chunk = [0u8; 1024];
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed mid-body");
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    RawResponse {
        status,
        headers,
        body,
    }
}

async fn request(addr: SocketAddr, raw: &str) -> RawResponse {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();
    read_response(&mut stream).await
}

fn test_handler() -> Arc<dyn graceserve::HttpHandler> {
    Arc::new(HttpHandlerFn::new(|_ctx, req: Request<Incoming>| async move {
        let response = |status: u16, body: Bytes| {
            Response::builder()
                .status(status)
                .body(Full::new(body))
                .unwrap()
        };
        match req.uri().path() {
            "/missing" => response(404, Bytes::from_static(b"gone")),
            "/id" => {
                let id = req
                    .extensions()
                    .get::<RequestId>()
                    .map(|id| id.0.clone())
                    .unwrap_or_default();
                response(200, Bytes::from(id))
            }
            "/sleep" => {
                tokio::time::sleep(Duration::from_millis(200)).await;
                response(200, Bytes::from_static(b"done"))
            }
            _ => response(200, Bytes::from_static(b"hello")),
        }
    }))
}

async fn start_server(env: &Environment, log: Arc<CaptureLog>) -> (HttpServer, SocketAddr) {
    let listener = Listener::bind_tcp("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = HttpServer::new(test_handler())
        .with_env(env.clone())
        .with_access_logger(log)
        .with_topic("test");
    server.serve(listener);
    (server, addr)
}

#[tokio::test]
async fn test_access_log_records_each_exchange() {
    common::init_tracing();
    let env = Environment::new();
    let log = Arc::new(CaptureLog::default());
    let (server, addr) = start_server(&env, Arc::clone(&log)).await;

    let ok = request(
        addr,
        "GET / HTTP/1.1\r\nHost: test.local\r\nUser-Agent: check/1\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert_eq!(ok.status, 200);
    assert_eq!(ok.body, b"hello");

    let missing = request(
        addr,
        "GET /missing HTTP/1.1\r\nHost: test.local\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert_eq!(missing.status, 404);

    let echoed = request(
        addr,
        "GET /id HTTP/1.1\r\nHost: test.local\r\nx-request-id: req-42\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert_eq!(echoed.body, b"req-42");

    env.cancel(None);
    env.wait().await.unwrap();
    assert!(!server.timed_out());

    let records = log.records();
    assert_eq!(records.len(), 3);

    let first = &records[0];
    assert_eq!(first.topic, "test");
    assert_eq!(first.kind, "access");
    assert_eq!(first.severity, Severity::Info);
    assert_eq!(first.message, "OK");
    assert_eq!(first.http_status_code, 200);
    assert_eq!(first.http_method, "GET");
    assert_eq!(first.request_uri, "/");
    assert_eq!(first.http_host, "test.local");
    assert_eq!(first.http_user_agent, "check/1");
    assert_eq!(first.protocol, "http");
    assert_eq!(first.remote_ipaddr, "127.0.0.1");
    assert_eq!(first.request_size, 0);
    assert_eq!(first.response_size, 5);
    assert_eq!(first.request_id, "");
    assert!(first.response_time >= 0.0);

    let second = &records[1];
    assert_eq!(second.severity, Severity::Warning);
    assert_eq!(second.message, "Not Found");
    assert_eq!(second.http_status_code, 404);
    assert_eq!(second.request_uri, "/missing");

    let third = &records[2];
    assert_eq!(third.severity, Severity::Info);
    assert_eq!(third.request_id, "req-42");
    assert_eq!(third.response_size, 6);
}

#[tokio::test]
async fn test_in_flight_request_finishes_with_connection_close() {
    common::init_tracing();
    let env = Environment::new();
    let (server, addr) = start_server(&env, Arc::new(CaptureLog::default())).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /sleep HTTP/1.1\r\nHost: test.local\r\n\r\n")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    env.cancel(None);

    // The in-flight request completes and the response tells the client the
    // connection is going away.
    let response = read_response(&mut stream).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"done");
    assert_eq!(response.header("connection"), Some("close"));

    tokio::time::timeout(Duration::from_secs(2), env.wait())
        .await
        .expect("drain should complete once the request finishes")
        .unwrap();
    assert!(!server.timed_out());
}

#[tokio::test]
async fn test_idle_keep_alive_connection_does_not_block_shutdown() {
    common::init_tracing();
    let env = Environment::new();
    let (server, addr) = start_server(&env, Arc::new(CaptureLog::default())).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: test.local\r\n\r\n")
        .await
        .unwrap();
    let response = read_response(&mut stream).await;
    assert_eq!(response.status, 200);

    // The connection now sits idle between requests. Shutdown must not wait
    // for the client to close it.
    env.cancel(None);
    tokio::time::timeout(Duration::from_secs(2), env.wait())
        .await
        .expect("idle connection should be interrupted")
        .unwrap();
    assert!(!server.timed_out());
    drop(stream);
}

#[tokio::test]
async fn test_shutdown_timeout_abandons_slow_requests() {
    common::init_tracing();
    let env = Environment::new();
    let listener = Listener::bind_tcp("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = HttpServer::new(test_handler())
        .with_env(env.clone())
        .with_access_logger(Arc::new(CaptureLog::default()))
        .with_shutdown_timeout(Duration::from_millis(50));
    server.serve(listener);

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /sleep HTTP/1.1\r\nHost: test.local\r\n\r\n")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    env.cancel(None);
    tokio::time::timeout(Duration::from_secs(2), env.wait())
        .await
        .expect("timeout should cap the drain")
        .unwrap();
    assert!(server.timed_out());
}
