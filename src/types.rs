use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing_error::SpanTrace;
use uuid::Uuid;

/// A named conversation context with its own history, system prompt and backing model.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    General,
    Coding,
    Vision,
    Media,
    Todo,
}

/// What a mode produces when a prompt is submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeKind {
    Text,
    ImageGeneration,
    ImageQuestion,
    Local,
}

impl Mode {
    pub const ALL: [Mode; 5] = [
        Mode::General,
        Mode::Coding,
        Mode::Vision,
        Mode::Media,
        Mode::Todo,
    ];

    pub fn kind(&self) -> ModeKind {
        match self {
            Mode::General | Mode::Coding => ModeKind::Text,
            Mode::Media => ModeKind::ImageGeneration,
            Mode::Vision => ModeKind::ImageQuestion,
            Mode::Todo => ModeKind::Local,
        }
    }

    pub fn is_artifact(&self) -> bool {
        matches!(
            self.kind(),
            ModeKind::ImageGeneration | ModeKind::ImageQuestion
        )
    }

    pub fn system_prompt(&self) -> &'static str {
        match self {
            Mode::Coding => crate::constants::CODING_SYSTEM_PROMPT,
            _ => crate::constants::GENERAL_SYSTEM_PROMPT,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::General => "general",
            Mode::Coding => "coding",
            Mode::Vision => "vision",
            Mode::Media => "media",
            Mode::Todo => "todo",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Mode {
    type Err = ObservedError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "general" | "chat" => Ok(Mode::General),
            "coding" | "code" => Ok(Mode::Coding),
            "vision" => Ok(Mode::Vision),
            "media" | "image" => Ok(Mode::Media),
            "todo" => Ok(Mode::Todo),
            other => Err(RelayError::InvalidRequest(format!("unknown mode: {}", other)).into()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_loading: bool,
    /// Transient retry notice; removed before the next attempt.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub notice: bool,
}

impl Message {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            image: None,
            prompt: None,
            is_loading: false,
            notice: false,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn model(content: impl Into<String>) -> Self {
        Self::new(Role::Model, content)
    }

    pub fn placeholder(content: impl Into<String>) -> Self {
        Self {
            is_loading: true,
            ..Self::new(Role::Model, content)
        }
    }

    pub fn notice(content: impl Into<String>) -> Self {
        Self {
            notice: true,
            ..Self::new(Role::Model, content)
        }
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    /// Placeholders and notices are UI-only and never part of the upstream conversation.
    pub fn is_transient(&self) -> bool {
        self.is_loading || self.notice
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ModelReadiness {
    Online,
    Loading,
    Offline,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WakeupState {
    Ready,
    Loading,
    Offline,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WakeupStatus {
    pub status: WakeupState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Model is loading (ready in ~{estimated_seconds:.0}s): {message}")]
    UpstreamLoading {
        estimated_seconds: f64,
        message: String,
    },

    #[error("Upstream error (status {0}): {1}")]
    Upstream(axum::http::StatusCode, String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Malformed upstream frame: {0}")]
    MalformedFrame(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("A request is already in flight for mode {0}")]
    Busy(Mode),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String, SpanTrace),
}

impl RelayError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RelayError::UpstreamLoading { .. })
    }

    pub fn estimated_seconds(&self) -> Option<f64> {
        match self {
            RelayError::UpstreamLoading {
                estimated_seconds, ..
            } => Some(*estimated_seconds),
            _ => None,
        }
    }

    /// The text shown to the user when this error ends a request.
    pub fn user_message(&self) -> String {
        match self {
            RelayError::Upstream(_, m) => m.clone(),
            RelayError::UpstreamLoading { message, .. } => message.clone(),
            RelayError::Network(e) => format!("Could not reach the server: {}", e),
            other => other.to_string(),
        }
    }
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: RelayError,
    pub span_trace: SpanTrace,
}

impl std::fmt::Display for ObservedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<RelayError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;

impl axum::response::IntoResponse for ObservedError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let (status, msg, code) = match &self.inner {
            RelayError::Upstream(s, m) => (*s, m.clone(), "UPSTREAM_ERROR"),
            RelayError::InvalidRequest(m) => {
                (StatusCode::BAD_REQUEST, m.clone(), "INVALID_REQUEST")
            }
            RelayError::Busy(_) => (StatusCode::CONFLICT, self.inner.to_string(), "BUSY"),
            RelayError::Timeout(_) => (
                StatusCode::GATEWAY_TIMEOUT,
                self.inner.to_string(),
                "TIMEOUT",
            ),
            RelayError::Network(e) => (StatusCode::BAD_GATEWAY, e.to_string(), "NETWORK_ERROR"),
            RelayError::Cancelled => (
                // 499 "client closed request"
                StatusCode::from_u16(499).unwrap_or(StatusCode::REQUEST_TIMEOUT),
                self.inner.to_string(),
                "CANCELLED",
            ),
            RelayError::MalformedFrame(m) => (StatusCode::BAD_GATEWAY, m.clone(), "PROTOCOL_ERROR"),
            RelayError::Io(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
                "IO_ERROR",
            ),
            RelayError::Serialization(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
                "SERIALIZATION_ERROR",
            ),
            RelayError::Internal(m, _) => {
                (StatusCode::INTERNAL_SERVER_ERROR, m.clone(), "INTERNAL_ERROR")
            }
            RelayError::UpstreamLoading {
                estimated_seconds,
                message,
            } => {
                return (
                    StatusCode::SERVICE_UNAVAILABLE,
                    axum::Json(serde_json::json!({
                        "error": "model_loading",
                        "detail": message,
                        "estimated_seconds": estimated_seconds,
                        "estimated_time": estimated_seconds,
                    })),
                )
                    .into_response();
            }
        };
        (
            status,
            axum::Json(serde_json::json!({
                "error": code,
                "detail": msg,
            })),
        )
            .into_response()
    }
}
