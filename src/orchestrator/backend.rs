use crate::constants::MAX_HISTORY_MESSAGES;
use crate::hardening::classify_upstream_failure;
use crate::ingress::{ImageRequest, StreamRequest, VisionRequest};
use crate::streaming::relay_text_stream;
use crate::types::*;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::Deserialize;
use std::collections::BTreeMap;

pub type TextStream = BoxStream<'static, Result<String>>;

/// What the orchestrator needs from the network: a text stream or a finished artifact.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn stream(&self, mode: Mode, history: Vec<Message>, prompt: String) -> Result<TextStream>;

    /// Returns the generated image as a data URL.
    async fn image(&self, prompt: String) -> Result<String>;

    async fn vision(&self, prompt: String, image: String) -> Result<String>;

    async fn status(&self) -> Result<BTreeMap<String, ModelReadiness>>;

    async fn wakeup(&self) -> Result<WakeupStatus>;
}

/// The most recent `limit` non-transient messages, oldest first.
pub fn recent_history(history: Vec<Message>, limit: usize) -> Vec<Message> {
    let mut kept: Vec<Message> = history.into_iter().filter(|m| !m.is_transient()).collect();
    if kept.len() > limit {
        kept.drain(..kept.len() - limit);
    }
    kept
}

/// Talks to the edge proxy over HTTP.
#[derive(Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageResponse {
    image_url: String,
}

#[derive(Deserialize)]
struct VisionResponse {
    answer: String,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_upstream_failure(status, &body).into())
    }
}

#[async_trait]
impl ChatBackend for HttpBackend {
    async fn stream(&self, mode: Mode, history: Vec<Message>, prompt: String) -> Result<TextStream> {
        let history = recent_history(history, MAX_HISTORY_MESSAGES);
        let response = self
            .client
            .post(self.url("/api/stream"))
            .json(&StreamRequest {
                mode,
                history,
                prompt,
            })
            .send()
            .await?;
        let response = Self::check(response).await?;
        let bytes = response
            .bytes_stream()
            .map(|r| r.map_err(std::io::Error::other));
        Ok(relay_text_stream(bytes))
    }

    async fn image(&self, prompt: String) -> Result<String> {
        let response = self
            .client
            .post(self.url("/api/image"))
            .json(&ImageRequest { prompt })
            .send()
            .await?;
        let body: ImageResponse = Self::check(response).await?.json().await?;
        Ok(body.image_url)
    }

    async fn vision(&self, prompt: String, image: String) -> Result<String> {
        let response = self
            .client
            .post(self.url("/api/vision"))
            .json(&VisionRequest {
                prompt,
                image_base64: image,
            })
            .send()
            .await?;
        let body: VisionResponse = Self::check(response).await?.json().await?;
        Ok(body.answer)
    }

    async fn status(&self) -> Result<BTreeMap<String, ModelReadiness>> {
        let response = self.client.get(self.url("/api/status")).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn wakeup(&self) -> Result<WakeupStatus> {
        let response = self.client.post(self.url("/api/wakeup")).send().await?;
        // 202 and 503 carry a status body too.
        Ok(response.json().await?)
    }
}
