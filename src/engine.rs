use crate::constants::{CHAT_MAX_TOKENS, CHAT_TEMPERATURE, VISION_FALLBACK_ANSWER};
use crate::hardening::{
    classify_probe, classify_upstream_failure, extract_error_message, extract_estimated_seconds,
};
use crate::specs::inference::{
    top_answer, ImageJson, TextToImageRequest, VqaAnswer, VqaInputs, VqaRequest,
};
use crate::specs::openai::{OpenAiMessage, OpenAiRequest};
use crate::types::*;
use crate::AppState;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;

pub struct RelayEngine;

impl RelayEngine {
    /// Builds the upstream chat request: mode system prompt, prior turns, then the new prompt.
    pub fn project_chat(
        mode: Mode,
        history: &[Message],
        prompt: &str,
        model: &str,
    ) -> OpenAiRequest {
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(OpenAiMessage::System {
            content: mode.system_prompt().to_string(),
        });

        for message in history {
            if message.is_transient() || message.content.trim().is_empty() {
                continue;
            }
            let content = message.content.clone();
            messages.push(match message.role {
                Role::User => OpenAiMessage::User { content },
                Role::Model => OpenAiMessage::Assistant { content },
            });
        }

        messages.push(OpenAiMessage::User {
            content: prompt.to_string(),
        });

        OpenAiRequest {
            model: model.to_string(),
            messages,
            stream: Some(true),
            temperature: Some(CHAT_TEMPERATURE),
            max_tokens: Some(CHAT_MAX_TOKENS),
        }
    }

    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = match response.text().await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!("Failed to read upstream error body: {}", e);
                String::new()
            }
        };
        let err = classify_upstream_failure(status, &body);
        match &err {
            RelayError::UpstreamLoading {
                estimated_seconds, ..
            } => tracing::warn!(
                "[☁️  -> ⚙️ ] Model loading, ready in ~{:.0}s",
                estimated_seconds
            ),
            _ => tracing::error!("[☁️  -> ⚙️ ] Upstream Error {}: {}", status, body),
        }
        Err(err.into())
    }

    /// Opens the upstream completion stream. Exactly one request, no retries.
    pub async fn forward_chat(state: &AppState, request: &OpenAiRequest) -> Result<reqwest::Response> {
        tracing::info!(
            "[⚙️  -> ☁️ ] Chat: model={} messages={}",
            request.model,
            request.messages.len()
        );
        let response = state
            .client
            .post(&state.args.chat_url)
            .bearer_auth(&state.api_token)
            .json(request)
            .send()
            .await
            .map_err(RelayError::Network)?;
        Self::ensure_success(response).await
    }

    /// Generates an image and returns it as a data URL.
    pub async fn forward_image(state: &AppState, prompt: &str) -> Result<String> {
        let url = state.args.inference_endpoint(&state.args.image_model);
        tracing::info!("[⚙️  -> ☁️ ] Image: model={}", state.args.image_model);
        let response = state
            .client
            .post(&url)
            .bearer_auth(&state.api_token)
            .header(reqwest::header::ACCEPT, "image/png")
            .json(&TextToImageRequest {
                inputs: prompt.to_string(),
            })
            .send()
            .await
            .map_err(RelayError::Network)?;
        let response = Self::ensure_success(response).await?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.split(';').next().unwrap_or(s).trim().to_string())
            .unwrap_or_else(|| "image/png".to_string());
        let bytes = response.bytes().await.map_err(RelayError::Network)?;

        Self::image_to_data_url(&content_type, &bytes)
    }

    /// Raw image bytes become a base64 data URL; JSON bodies must carry base64 already.
    pub fn image_to_data_url(content_type: &str, bytes: &[u8]) -> Result<String> {
        if content_type == "application/json" {
            let parsed: ImageJson = serde_json::from_slice(bytes).map_err(|e| {
                RelayError::Upstream(
                    axum::http::StatusCode::BAD_GATEWAY,
                    format!("Image response carried no image: {}", e),
                )
            })?;
            if parsed.image.starts_with("data:") {
                return Ok(parsed.image);
            }
            return Ok(crate::str_utils::to_data_url("image/png", &parsed.image));
        }
        if bytes.is_empty() {
            return Err(RelayError::Upstream(
                axum::http::StatusCode::BAD_GATEWAY,
                "Image response was empty".to_string(),
            )
            .into());
        }
        let mime = if content_type.starts_with("image/") {
            content_type
        } else {
            "image/png"
        };
        Ok(crate::str_utils::to_data_url(
            mime,
            &BASE64_STANDARD.encode(bytes),
        ))
    }

    /// Asks the visual QA model and returns its best answer.
    pub async fn forward_vision(state: &AppState, question: &str, image_b64: &str) -> Result<String> {
        let url = state.args.inference_endpoint(&state.args.vision_model);
        tracing::info!("[⚙️  -> ☁️ ] Vision: model={}", state.args.vision_model);
        let response = state
            .client
            .post(&url)
            .bearer_auth(&state.api_token)
            .json(&VqaRequest {
                inputs: VqaInputs {
                    image: image_b64.to_string(),
                    question: question.to_string(),
                },
            })
            .send()
            .await
            .map_err(RelayError::Network)?;
        let response = Self::ensure_success(response).await?;
        let answers: Vec<VqaAnswer> = response.json().await.map_err(RelayError::Network)?;
        Ok(Self::pick_answer(&answers))
    }

    pub fn pick_answer(answers: &[VqaAnswer]) -> String {
        match top_answer(answers) {
            Some(a) if !a.answer.trim().is_empty() => a.answer.clone(),
            _ => VISION_FALLBACK_ANSWER.to_string(),
        }
    }

    /// Sends a minimal request to a model and classifies its readiness.
    pub async fn probe_model(state: &AppState, model: &str) -> Probe {
        let request = if model == state.args.chat_model {
            state.client.post(&state.args.chat_url).json(&serde_json::json!({
                "model": model,
                "messages": [{ "role": "user", "content": "ping" }],
                "max_tokens": 1,
                "stream": false,
            }))
        } else {
            state
                .client
                .post(state.args.inference_endpoint(model))
                .json(&serde_json::json!({ "inputs": "" }))
        };

        let response = match request
            .bearer_auth(&state.api_token)
            .timeout(state.args.probe_timeout())
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("Probe for {} failed: {}", model, e);
                return Probe {
                    readiness: ModelReadiness::Offline,
                    estimated_time: None,
                    detail: Some(e.to_string()),
                };
            }
        };

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let readiness = classify_probe(status, &body);
        tracing::debug!("Probe {} -> {} ({:?})", model, status, readiness);
        Probe {
            readiness,
            estimated_time: match readiness {
                ModelReadiness::Loading => extract_estimated_seconds(&body),
                _ => None,
            },
            detail: match readiness {
                ModelReadiness::Offline => Some(extract_error_message(&body)),
                _ => None,
            },
        }
    }
}

/// Result of a readiness probe.
#[derive(Debug, Clone)]
pub struct Probe {
    pub readiness: ModelReadiness,
    pub estimated_time: Option<f64>,
    pub detail: Option<String>,
}
