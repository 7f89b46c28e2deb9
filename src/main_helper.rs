use crate::constants::*;
use crate::logging::request_id_middleware;
use crate::types::Mode;
use axum::http::{HeaderValue, Method};
use axum::routing::{get, post};
use axum::{middleware, Router};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the edge proxy in front of the inference provider
    Serve(ServeArgs),
    /// Chat with a running proxy from the terminal
    Chat(ChatArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct ServeArgs {
    #[arg(long, default_value_t = 8787)]
    pub port: u16,
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, default_value = DEFAULT_CHAT_URL)]
    pub chat_url: String,
    #[arg(long, default_value = DEFAULT_INFERENCE_URL)]
    pub inference_url: String,
    #[arg(long, default_value = DEFAULT_CHAT_MODEL)]
    pub chat_model: String,
    #[arg(long, default_value = DEFAULT_IMAGE_MODEL)]
    pub image_model: String,
    #[arg(long, default_value = DEFAULT_VISION_MODEL)]
    pub vision_model: String,
    #[arg(long, default_value_t = 300)]
    pub request_timeout_secs: u64,
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,
    #[arg(long, default_value_t = 15)]
    pub probe_timeout_secs: u64,
    #[arg(long, default_value_t = 20 * 1024 * 1024)]
    pub max_body_size: usize,
    /// Origins allowed by CORS; permissive when none are given
    #[arg(long = "allow-origin")]
    pub allow_origin: Vec<String>,
}

impl ServeArgs {
    pub fn inference_endpoint(&self, model: &str) -> String {
        format!("{}/{}", self.inference_url.trim_end_matches('/'), model)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

#[derive(Parser, Debug, Clone)]
pub struct ChatArgs {
    #[arg(long, default_value = "http://127.0.0.1:8787")]
    pub proxy_url: String,
    #[arg(long, default_value = "general")]
    pub mode: Mode,
    #[arg(long, default_value = "chatrelay-todos.json")]
    pub todo_file: String,
    /// Skip waiting for the primary model before the first prompt
    #[arg(long, default_value_t = false)]
    pub no_wait: bool,
    #[arg(long, default_value_t = TEXT_TIMEOUT.as_secs())]
    pub text_timeout_secs: u64,
    #[arg(long, default_value_t = ARTIFACT_TIMEOUT.as_secs())]
    pub artifact_timeout_secs: u64,
}

#[derive(Clone)]
pub struct AppState {
    pub client: reqwest::Client,
    pub api_token: String,
    pub args: Arc<ServeArgs>,
}

impl AppState {
    pub fn new(args: ServeArgs, api_token: String) -> crate::types::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(args.request_timeout_secs))
            .connect_timeout(Duration::from_secs(args.connect_timeout_secs))
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .build()?;
        Ok(Self {
            client,
            api_token,
            args: Arc::new(args),
        })
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);
    if origins.is_empty() {
        return base.allow_origin(Any);
    }
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match o.parse::<HeaderValue>() {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!("Ignoring invalid CORS origin {:?}: {}", o, e);
                None
            }
        })
        .collect();
    base.allow_origin(AllowOrigin::list(parsed))
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.args.allow_origin);
    Router::new()
        .route("/api/stream", post(crate::handlers::stream_handler))
        .route("/api/image", post(crate::handlers::image_handler))
        .route("/api/vision", post(crate::handlers::vision_handler))
        .route("/api/wakeup", post(crate::health::wakeup))
        .route("/api/status", get(crate::health::status))
        .route("/health", get(crate::health::liveness))
        .layer(axum::extract::DefaultBodyLimit::max(state.args.max_body_size))
        .layer(cors)
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}
