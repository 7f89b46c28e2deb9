use crate::constants::{RELAY_CHANNEL_CAPACITY, SSE_KEEPALIVE};
use crate::engine::RelayEngine;
use crate::ingress::{ImageRequest, StreamRequest, VisionRequest};
use crate::streaming::{upstream_lines, StreamHandler};
use crate::AppState;
use axum::extract::State;
use axum::response::sse::KeepAlive;
use axum::response::{IntoResponse, Response, Sse};
use axum::Json;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::Instrument;

/// `POST /api/stream`: relays a chat completion as `{text}` SSE frames.
pub async fn stream_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<StreamRequest>,
) -> Response {
    if let Err(e) = request.validate() {
        tracing::warn!("[🌐 -> ⚙️ ] Rejected stream request: {}", e);
        return e.into_response();
    }

    tracing::info!(
        "[🌐 -> ⚙️ ] Stream: mode={} history={} prompt={:?}",
        request.mode,
        request.history.len(),
        crate::str_utils::prefix_chars(&request.prompt, 40)
    );

    let outgoing = RelayEngine::project_chat(
        request.mode,
        &request.history,
        &request.prompt,
        &state.args.chat_model,
    );

    let response = match RelayEngine::forward_chat(&state, &outgoing).await {
        Ok(r) => r,
        Err(e) => return e.into_response(),
    };

    let bytes_stream = response
        .bytes_stream()
        .map(|r| r.map_err(std::io::Error::other));
    let lines = upstream_lines(bytes_stream);

    let (tx, rx) = mpsc::channel(RELAY_CHANNEL_CAPACITY);
    let stream_span = tracing::info_span!(
        "stream",
        mode = %request.mode,
        model = %state.args.chat_model
    );
    tokio::spawn(StreamHandler::relay(lines, tx).instrument(stream_span));

    Sse::new(ReceiverStream::new(rx))
        .keep_alive(KeepAlive::new().interval(SSE_KEEPALIVE).text("keepalive"))
        .into_response()
}

/// `POST /api/image`: `{imageUrl}` as a data URL.
pub async fn image_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ImageRequest>,
) -> Response {
    if let Err(e) = request.validate() {
        return e.into_response();
    }
    match RelayEngine::forward_image(&state, request.prompt.trim()).await {
        Ok(image_url) => Json(serde_json::json!({ "imageUrl": image_url })).into_response(),
        Err(e) => e.into_response(),
    }
}

/// `POST /api/vision`: `{answer}` from the visual QA model.
pub async fn vision_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<VisionRequest>,
) -> Response {
    if let Err(e) = request.validate() {
        return e.into_response();
    }
    match RelayEngine::forward_vision(&state, request.question(), request.image_payload()).await {
        Ok(answer) => Json(serde_json::json!({ "answer": answer })).into_response(),
        Err(e) => e.into_response(),
    }
}
