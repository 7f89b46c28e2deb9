use crate::engine::RelayEngine;
use crate::types::{ModelReadiness, WakeupState, WakeupStatus};
use crate::AppState;
use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Serialize)]
pub struct LivenessResponse {
    pub status: &'static str,
}

pub async fn liveness() -> Json<LivenessResponse> {
    Json(LivenessResponse { status: "ok" })
}

/// `GET /api/status`: readiness of every backing model, probed concurrently.
pub async fn status(State(state): State<Arc<AppState>>) -> Json<BTreeMap<String, ModelReadiness>> {
    let mut models = vec![
        state.args.chat_model.clone(),
        state.args.image_model.clone(),
        state.args.vision_model.clone(),
    ];
    models.sort();
    models.dedup();

    let probes = models
        .iter()
        .map(|model| RelayEngine::probe_model(&state, model));
    let results = futures_util::future::join_all(probes).await;

    let report: BTreeMap<String, ModelReadiness> = models
        .into_iter()
        .zip(results)
        .map(|(model, probe)| (model, probe.readiness))
        .collect();

    tracing::info!("Model status: {:?}", report);
    Json(report)
}

/// `POST /api/wakeup`: nudges the primary model and reports whether it is warm.
pub async fn wakeup(State(state): State<Arc<AppState>>) -> (StatusCode, Json<WakeupStatus>) {
    let probe = RelayEngine::probe_model(&state, &state.args.chat_model).await;
    match probe.readiness {
        ModelReadiness::Online => (
            StatusCode::OK,
            Json(WakeupStatus {
                status: WakeupState::Ready,
                estimated_time: None,
                detail: None,
            }),
        ),
        ModelReadiness::Loading => {
            tracing::info!(
                "Primary model warming up, ~{:?}s remaining",
                probe.estimated_time
            );
            (
                StatusCode::ACCEPTED,
                Json(WakeupStatus {
                    status: WakeupState::Loading,
                    estimated_time: probe.estimated_time,
                    detail: None,
                }),
            )
        }
        ModelReadiness::Offline => {
            tracing::warn!("Primary model offline: {:?}", probe.detail);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(WakeupStatus {
                    status: WakeupState::Offline,
                    estimated_time: None,
                    detail: probe.detail,
                }),
            )
        }
    }
}
