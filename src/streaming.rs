use crate::constants::MAX_STREAM_LINE_BYTES;
use crate::hardening::classify_upstream_failure;
use crate::logging::StreamMetric;
use crate::specs::openai::ChatChunk;
use crate::types::*;
use axum::http::StatusCode;
use axum::response::sse::Event;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use std::convert::Infallible;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::io::StreamReader;

/// What a single SSE line turned into.
#[derive(Debug)]
pub enum FrameOutcome<T> {
    Frame(T),
    Skip,
    Done,
    Fatal(RelayError),
}

pub type LineStream<S> = FramedRead<StreamReader<S, Bytes>, LinesCodec>;

/// Line-buffers a chunked byte stream; a line split across chunks is yielded once complete.
pub fn upstream_lines<S>(bytes_stream: S) -> LineStream<S>
where
    S: Stream<Item = std::io::Result<Bytes>> + Unpin,
{
    FramedRead::new(
        StreamReader::new(bytes_stream),
        LinesCodec::new_with_max_length(MAX_STREAM_LINE_BYTES),
    )
}

fn data_payload(line: &str) -> Option<&str> {
    line.trim_end()
        .strip_prefix("data:")
        .map(|rest| rest.trim_start())
}

/// Parses one line of the provider's completion stream.
pub fn parse_upstream_line(line: &str) -> FrameOutcome<String> {
    let data = match data_payload(line) {
        Some(d) if !d.is_empty() => d,
        _ => return FrameOutcome::Skip,
    };
    if data == "[DONE]" {
        return FrameOutcome::Done;
    }

    let value: serde_json::Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            let err = RelayError::MalformedFrame(format!("{}: {}", e, crate::str_utils::prefix_chars(data, 80)));
            tracing::debug!("[☁️  -> ⚙️ ] Skipping frame: {}", err);
            return FrameOutcome::Skip;
        }
    };

    if value.get("error").is_some() {
        return FrameOutcome::Fatal(classify_upstream_failure(StatusCode::BAD_GATEWAY, data));
    }

    match serde_json::from_value::<ChatChunk>(value) {
        Ok(chunk) => {
            let text = chunk.text();
            if text.is_empty() {
                FrameOutcome::Skip
            } else {
                FrameOutcome::Frame(text)
            }
        }
        Err(e) => {
            tracing::debug!("[☁️  -> ⚙️ ] Skipping unrecognized frame: {}", e);
            FrameOutcome::Skip
        }
    }
}

/// Parses one line of the proxy's own `{text}` stream, as the client sees it.
pub fn parse_relay_line(line: &str) -> FrameOutcome<String> {
    let data = match data_payload(line) {
        Some(d) if !d.is_empty() => d,
        _ => return FrameOutcome::Skip,
    };
    if data == "[DONE]" {
        return FrameOutcome::Done;
    }
    let value: serde_json::Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(_) => return FrameOutcome::Skip,
    };
    if let Some(text) = value.get("text").and_then(|t| t.as_str()) {
        return FrameOutcome::Frame(text.to_string());
    }
    if value.get("error").is_some() {
        return FrameOutcome::Fatal(classify_upstream_failure(StatusCode::BAD_GATEWAY, data));
    }
    FrameOutcome::Skip
}

/// The JSON body of an error frame; shaped like the proxy's error responses.
pub fn error_frame(err: &RelayError) -> serde_json::Value {
    match err {
        RelayError::UpstreamLoading {
            estimated_seconds,
            message,
        } => serde_json::json!({
            "error": "model_loading",
            "detail": message,
            "estimated_seconds": estimated_seconds,
        }),
        other => serde_json::json!({
            "error": "upstream_error",
            "detail": other.user_message(),
        }),
    }
}

pub struct StreamHandler;

impl StreamHandler {
    /// Re-frames upstream lines as `{"text": ...}` SSE events until the stream ends,
    /// a fatal frame arrives, or the client goes away.
    pub async fn relay<L>(
        mut lines: L,
        tx: mpsc::Sender<std::result::Result<Event, Infallible>>,
    ) -> StreamMetric
    where
        L: Stream<Item = std::result::Result<String, LinesCodecError>> + Unpin,
    {
        let mut metrics = StreamMetric::new();

        while let Some(line_result) = lines.next().await {
            let line = match line_result {
                Ok(line) => line,
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    tracing::warn!("[☁️  -> ⚙️ ] Dropping oversized frame");
                    metrics.skipped += 1;
                    continue;
                }
                Err(LinesCodecError::Io(e)) => {
                    tracing::error!("[☁️  -> ⚙️ ] Upstream read failed: {}", e);
                    let frame = error_frame(&RelayError::Io(e));
                    let _ = tx.send(Ok(Event::default().data(frame.to_string()))).await;
                    metrics.failed = true;
                    break;
                }
            };

            match parse_upstream_line(&line) {
                FrameOutcome::Frame(text) => {
                    metrics.record_frame(&text);
                    let payload = serde_json::json!({ "text": text }).to_string();
                    if tx.send(Ok(Event::default().data(payload))).await.is_err() {
                        tracing::info!("[⚙️  -> 🌐] Client disconnected, stopping relay");
                        break;
                    }
                }
                FrameOutcome::Skip => metrics.skipped += 1,
                FrameOutcome::Done => {
                    tracing::debug!("[☁️  -> ⚙️ ] Stream end marker [DONE] received");
                    break;
                }
                FrameOutcome::Fatal(err) => {
                    tracing::error!("[☁️  -> ⚙️ ] Stream Error: {}", err);
                    let frame = error_frame(&err);
                    let _ = tx.send(Ok(Event::default().data(frame.to_string()))).await;
                    metrics.failed = true;
                    break;
                }
            }
        }

        metrics.log_summary();
        metrics
    }
}

/// Decodes a proxy `/api/stream` body into text deltas.
pub fn relay_text_stream<S>(bytes_stream: S) -> BoxStream<'static, Result<String>>
where
    S: Stream<Item = std::io::Result<Bytes>> + Unpin + Send + 'static,
{
    let lines = upstream_lines(bytes_stream);
    futures_util::stream::unfold(Some(lines), |state| async move {
        let mut lines = state?;
        loop {
            match lines.next().await {
                None => return None,
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => continue,
                Some(Err(LinesCodecError::Io(e))) => {
                    return Some((Err(RelayError::Io(e).into()), None));
                }
                Some(Ok(line)) => match parse_relay_line(&line) {
                    FrameOutcome::Frame(text) => return Some((Ok(text), Some(lines))),
                    FrameOutcome::Skip => continue,
                    FrameOutcome::Done => return None,
                    FrameOutcome::Fatal(err) => return Some((Err(err.into()), None)),
                },
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_delta_becomes_frame() {
        let line = r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#;
        match parse_upstream_line(line) {
            FrameOutcome::Frame(t) => assert_eq!(t, "Hel"),
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[test]
    fn tgi_token_frames_are_understood() {
        let line = r#"data:{"token":{"id":1,"text":" world","special":false}}"#;
        assert!(matches!(parse_upstream_line(line), FrameOutcome::Frame(ref t) if t == " world"));
        let special = r#"data:{"token":{"id":2,"text":"</s>","special":true}}"#;
        assert!(matches!(parse_upstream_line(special), FrameOutcome::Skip));
    }

    #[test]
    fn sentinel_comment_and_garbage_lines() {
        assert!(matches!(parse_upstream_line("data: [DONE]"), FrameOutcome::Done));
        assert!(matches!(parse_upstream_line(": ping"), FrameOutcome::Skip));
        assert!(matches!(parse_upstream_line(""), FrameOutcome::Skip));
        assert!(matches!(parse_upstream_line("event: message"), FrameOutcome::Skip));
        assert!(matches!(parse_upstream_line("data: {not json"), FrameOutcome::Skip));
        assert!(matches!(
            parse_upstream_line(r#"data: {"choices":[{"delta":{},"finish_reason":"stop"}]}"#),
            FrameOutcome::Skip
        ));
    }

    #[test]
    fn error_frame_mid_stream_is_fatal_and_classified() {
        let line = r#"data: {"error":"Model too busy","estimated_time":8}"#;
        match parse_upstream_line(line) {
            FrameOutcome::Fatal(RelayError::UpstreamLoading {
                estimated_seconds, ..
            }) => assert_eq!(estimated_seconds, 8.0),
            other => panic!("expected fatal loading, got {:?}", other),
        }
    }

    #[test]
    fn relay_lines_round_trip_text_and_errors() {
        assert!(matches!(
            parse_relay_line(r#"data: {"text":"abc"}"#),
            FrameOutcome::Frame(ref t) if t == "abc"
        ));
        match parse_relay_line(r#"data: {"error":"model_loading","detail":"warming","estimated_seconds":5}"#) {
            FrameOutcome::Fatal(err) => assert_eq!(err.estimated_seconds(), Some(5.0)),
            other => panic!("expected fatal, got {:?}", other),
        }
        match parse_relay_line(r#"data: {"error":"upstream_error","detail":"boom"}"#) {
            FrameOutcome::Fatal(RelayError::Upstream(_, msg)) => assert_eq!(msg, "boom"),
            other => panic!("expected hard failure, got {:?}", other),
        }
    }
}
