//! # Structured access logging.
//!
//! One JSON object per request, written through an [`AccessLogger`]. The
//! record shape is stable so downstream pipelines can index on field names;
//! see [`AccessLog`].
//!
//! [`JsonLogWriter`] is the default sink (one line of JSON per record, to
//! stderr). Tests substitute their own [`AccessLogger`] to capture records.

use std::fmt;
use std::io::{self, Write};
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Severity of an access-log record, derived from the response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps a response status code to a record severity: 2xx/3xx informational,
/// 4xx warning, 5xx error.
pub fn status_severity(status: u16) -> Severity {
    match status {
        s if s >= 500 => Severity::Error,
        s if s >= 400 => Severity::Warning,
        _ => Severity::Info,
    }
}

/// One completed HTTP exchange.
///
/// Serialized field names are part of the wire contract; renaming any of
/// them breaks downstream log consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessLog {
    /// Log stream name, normally the program name.
    pub topic: String,
    /// RFC 3339 completion time, microsecond precision, UTC.
    pub logged_at: String,
    pub severity: Severity,
    /// Response status reason phrase ("OK", "Not Found", ...).
    pub message: String,
    /// Always "access". Distinguishes these records in mixed streams.
    #[serde(rename = "type")]
    pub kind: String,
    /// Seconds between request receipt and response completion.
    pub response_time: f64,
    /// "http" or "https".
    pub protocol: String,
    pub http_status_code: u16,
    pub http_method: String,
    #[serde(rename = "url")]
    pub request_uri: String,
    pub http_host: String,
    /// Request body size in bytes; -1 when unknown (chunked with no length).
    pub request_size: i64,
    pub response_size: i64,
    /// Peer IP; empty for unix-domain connections.
    pub remote_ipaddr: String,
    pub http_user_agent: String,
    /// Correlation id from the `x-request-id` header; empty if absent.
    #[serde(rename = "id")]
    pub request_id: String,
}

impl AccessLog {
    /// Formats `t` the way [`AccessLog::logged_at`] expects.
    pub fn format_time(t: DateTime<Utc>) -> String {
        t.to_rfc3339_opts(SecondsFormat::Micros, true)
    }
}

/// Sink for access-log records.
pub trait AccessLogger: Send + Sync + 'static {
    fn log(&self, record: AccessLog);
}

/// Writes each record as one line of JSON.
pub struct JsonLogWriter<W> {
    out: Mutex<W>,
}

impl JsonLogWriter<io::Stderr> {
    /// The default sink: JSON lines on stderr.
    pub fn stderr() -> Self {
        Self::new(io::stderr())
    }
}

impl<W: Write + Send + 'static> JsonLogWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }
}

impl<W: Write + Send + 'static> AccessLogger for JsonLogWriter<W> {
    fn log(&self, record: AccessLog) {
        let mut line = match serde_json::to_vec(&record) {
            Ok(line) => line,
            Err(err) => {
                tracing::error!(error = %err, "failed to serialize access log record");
                return;
            }
        };
        line.push(b'\n');
        let mut out = self
            .out
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(err) = out.write_all(&line) {
            tracing::error!(error = %err, "failed to write access log record");
        }
    }
}

/// Default topic for access logs: the program name.
pub fn default_topic() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "graceserve".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_severity_mapping() {
        assert_eq!(status_severity(200), Severity::Info);
        assert_eq!(status_severity(302), Severity::Info);
        assert_eq!(status_severity(399), Severity::Info);
        assert_eq!(status_severity(400), Severity::Warning);
        assert_eq!(status_severity(404), Severity::Warning);
        assert_eq!(status_severity(499), Severity::Warning);
        assert_eq!(status_severity(500), Severity::Error);
        assert_eq!(status_severity(503), Severity::Error);
    }

    #[test]
    fn test_record_field_names() {
        let record = AccessLog {
            topic: "app".to_string(),
            logged_at: "2026-01-02T03:04:05.000006Z".to_string(),
            severity: Severity::Warning,
            message: "Not Found".to_string(),
            kind: "access".to_string(),
            response_time: 0.012,
            protocol: "http".to_string(),
            http_status_code: 404,
            http_method: "GET".to_string(),
            request_uri: "/missing".to_string(),
            http_host: "example.com".to_string(),
            request_size: -1,
            response_size: 9,
            remote_ipaddr: "10.0.0.1".to_string(),
            http_user_agent: "curl/8".to_string(),
            request_id: "req-1".to_string(),
        };
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&record).expect("serialize"))
                .expect("parse");
        assert_eq!(value["severity"], "warning");
        assert_eq!(value["type"], "access");
        assert_eq!(value["url"], "/missing");
        assert_eq!(value["id"], "req-1");
        assert_eq!(value["http_status_code"], 404);
        assert_eq!(value["request_size"], -1);
    }

    #[test]
    fn test_writer_emits_one_line_per_record() {
        use std::sync::Arc;

        #[derive(Clone)]
        struct Buf(Arc<Mutex<Vec<u8>>>);
        impl Write for Buf {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let buf = Buf(Arc::new(Mutex::new(Vec::new())));
        let writer = JsonLogWriter::new(buf.clone());
        let record = AccessLog {
            topic: "app".to_string(),
            logged_at: AccessLog::format_time(Utc::now()),
            severity: Severity::Info,
            message: "OK".to_string(),
            kind: "access".to_string(),
            response_time: 0.0,
            protocol: "http".to_string(),
            http_status_code: 200,
            http_method: "GET".to_string(),
            request_uri: "/".to_string(),
            http_host: "localhost".to_string(),
            request_size: 0,
            response_size: 2,
            remote_ipaddr: "127.0.0.1".to_string(),
            http_user_agent: String::new(),
            request_id: String::new(),
        };
        writer.log(record.clone());
        writer.log(record);

        let bytes = buf.0.lock().unwrap().clone();
        let text = String::from_utf8(bytes).expect("utf8");
        assert_eq!(text.lines().count(), 2);
        for line in text.lines() {
            let value: serde_json::Value = serde_json::from_str(line).expect("json line");
            assert_eq!(value["http_status_code"], 200);
        }
    }
}
