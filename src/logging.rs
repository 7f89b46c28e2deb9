use axum::{
    body::Body,
    http::{Request, Response},
    middleware::Next,
};
use lazy_static::lazy_static;
use regex::Regex;
use std::io::Write;
use std::panic;
use tracing::{error, info, info_span, Instrument};
use tracing_appender::non_blocking::WorkerGuard;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-relay-request-id";

lazy_static! {
    static ref REDACTION_REGEX: Regex = Regex::new(
        r"(?i)(hf_[A-Za-z0-9]{16,}|Bearer\s+[^\s]+|data:image/[a-z+.-]+;base64,[A-Za-z0-9+/=]{64,})"
    )
    .expect("Invalid redaction regex");
}

/// Scrubs API tokens and inline image payloads before they reach the log file.
pub struct RedactingWriter<W: Write> {
    inner: W,
}

impl<W: Write> RedactingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let input = String::from_utf8_lossy(buf);
        let redacted = REDACTION_REGEX.replace_all(&input, "[REDACTED]");
        self.inner.write_all(redacted.as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

pub fn redact(s: &str) -> String {
    REDACTION_REGEX.replace_all(s, "[REDACTED]").into_owned()
}

/// Installs the global subscriber: env filter, stderr, a daily redacted log file
/// and the span-trace error layer. Keep the returned guard alive for the process lifetime.
pub fn init_tracing(file_prefix: &str, default_filter: &str, to_stderr: bool) -> WorkerGuard {
    use tracing_subscriber::prelude::*;

    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => default_filter.into(),
    };

    let file_appender = tracing_appender::rolling::daily("logs", file_prefix);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let json = std::env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false);

    let file_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::sync::Mutex::new(RedactingWriter::new(non_blocking)))
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::sync::Mutex::new(RedactingWriter::new(non_blocking)))
            .with_ansi(false)
            .boxed()
    };

    let stderr_layer = if to_stderr {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .with(tracing_error::ErrorLayer::default())
        .init();

    guard
}

/// Sets up a global panic hook that logs panics using tracing.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

pub async fn request_id_middleware(mut req: Request<Body>, next: Next) -> Response<Body> {
    let request_id = Uuid::new_v4().to_string();
    if let Ok(val) = request_id.parse() {
        req.headers_mut().insert(REQUEST_ID_HEADER, val);
    }

    let span = info_span!(
        "request",
        request_id = %crate::str_utils::prefix_chars(&request_id, 8),
        method = %req.method(),
        path = %req.uri().path()
    );
    let start = std::time::Instant::now();
    let mut response = next.run(req).instrument(span.clone()).await;
    if let Ok(val) = request_id.parse() {
        response.headers_mut().insert(REQUEST_ID_HEADER, val);
    }
    span.in_scope(|| {
        info!(
            "[🌐 -> ⚙️ ] {} in {:?}",
            response.status(),
            start.elapsed()
        )
    });
    response
}

#[derive(Debug, Default)]
pub struct StreamMetric {
    pub frames: usize,
    pub skipped: usize,
    pub text_chars: usize,
    pub failed: bool,
}

impl StreamMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_frame(&mut self, text: &str) {
        self.frames += 1;
        self.text_chars += text.chars().count();
    }

    pub fn log_summary(&self) {
        info!(
            target: "flight_recorder",
            "[STREAM END] Frames: {} | Skipped: {} | Text: {} chars | Failed: {}",
            self.frames, self.skipped, self.text_chars, self.failed
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_and_inline_images_are_redacted() {
        let image = format!("data:image/png;base64,{}", "A".repeat(100));
        let line = format!(
            "auth Bearer hf_abcdefghijklmnopqrstuv token hf_abcdefghijklmnopqrstuv img {}",
            image
        );
        let out = redact(&line);
        assert!(!out.contains("hf_abcdefghijklmnopqrstuv"));
        assert!(!out.contains(&image));
        assert!(out.contains("[REDACTED]"));
    }

    #[test]
    fn redacting_writer_passes_clean_text_through() {
        let mut buf = Vec::new();
        {
            let mut w = RedactingWriter::new(&mut buf);
            w.write_all(b"hello world").unwrap();
        }
        assert_eq!(buf, b"hello world");
    }
}
