use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use chatrelay::hardening::RetryPolicy;
use chatrelay::orchestrator::backend::HttpBackend;
use chatrelay::orchestrator::store::Phase;
use chatrelay::orchestrator::{ChatOrchestrator, OrchestratorConfig, SubmitOutcome};
use chatrelay::*;
use clap::Parser;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

/// Starts the proxy in front of `upstream` and returns an orchestrator talking to it.
async fn orchestrator_for(upstream: Router) -> ChatOrchestrator {
    let upstream_url = serve(upstream).await;
    let chat_url = format!("{}/v1/chat/completions", upstream_url);
    let inference_url = format!("{}/models", upstream_url);
    let args = ServeArgs::parse_from([
        "chatrelay",
        "--chat-url",
        chat_url.as_str(),
        "--inference-url",
        inference_url.as_str(),
    ]);
    let proxy = build_router(Arc::new(AppState::new(args, "hf_testtoken".into()).unwrap()));
    let proxy_url = serve(proxy).await;

    let config = OrchestratorConfig {
        retry: RetryPolicy::new(2, Duration::from_millis(10)),
        ..Default::default()
    };
    ChatOrchestrator::new(Arc::new(HttpBackend::new(proxy_url).unwrap()), config)
}

fn sse(chunks: Vec<&'static str>) -> Response {
    let stream = futures_util::stream::iter(
        chunks
            .into_iter()
            .map(|c| Ok::<_, std::io::Error>(bytes::Bytes::from_static(c.as_bytes()))),
    );
    (
        [(header::CONTENT_TYPE, "text/event-stream")],
        Body::from_stream(stream),
    )
        .into_response()
}

#[tokio::test]
async fn cold_start_is_retried_through_the_proxy() {
    let calls = Arc::new(AtomicU32::new(0));
    let c = calls.clone();
    let upstream = Router::new().route(
        "/v1/chat/completions",
        post(move || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) == 0 {
                    return (
                        StatusCode::SERVICE_UNAVAILABLE,
                        Json(json!({"error": "Model is currently loading", "estimated_time": 0.05})),
                    )
                        .into_response();
                }
                sse(vec![
                    "data: {\"choices\":[{\"delta\":{\"content\":\"Good \"}}]}\n\n",
                    "data: {\"choices\":[{\"delta\":{\"content\":\"morning\"}}]}\n\ndata: [DONE]\n\n",
                ])
            }
        }),
    );
    let orch = orchestrator_for(upstream).await;

    let outcome = orch.submit(Mode::General, "hello", None).await.unwrap();
    assert_eq!(outcome, SubmitOutcome::Committed { attempts: 2 });
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let history = orch.store().history(Mode::General);
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].content, "hello");
    assert_eq!(history[1].content, "Good morning");
    assert_eq!(orch.store().phase(Mode::General), Phase::Idle);
}

#[tokio::test]
async fn long_conversations_keep_streaming() {
    let upstream = Router::new().route(
        "/v1/chat/completions",
        post(|| async {
            sse(vec![
                "data: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n\ndata: [DONE]\n\n",
            ])
        }),
    );
    let orch = orchestrator_for(upstream).await;

    for i in 0..101 {
        let outcome = orch
            .submit(Mode::General, &format!("turn {}", i), None)
            .await
            .unwrap();
        assert_eq!(outcome, SubmitOutcome::Committed { attempts: 1 }, "turn {}", i);
    }
    assert_eq!(orch.store().history(Mode::General).len(), 202);

    let outcome = orch.submit(Mode::General, "one more", None).await.unwrap();
    assert_eq!(outcome, SubmitOutcome::Committed { attempts: 1 });
    let history = orch.store().history(Mode::General);
    assert_eq!(history.len(), 204);
    assert_eq!(history[203].content, "ok");
}

#[tokio::test]
async fn error_frame_mid_stream_ends_in_one_error_message() {
    let upstream = Router::new().route(
        "/v1/chat/completions",
        post(|| async {
            sse(vec![
                "data: {\"choices\":[{\"delta\":{\"content\":\"Partial\"}}]}\n\n",
                "data: {\"error\":\"upstream overloaded\"}\n\n",
            ])
        }),
    );
    let orch = orchestrator_for(upstream).await;

    let outcome = orch.submit(Mode::Coding, "write a sort", None).await.unwrap();
    match outcome {
        SubmitOutcome::Failed { message, attempts } => {
            assert_eq!(attempts, 1);
            assert!(message.contains("upstream overloaded"));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    let history = orch.store().history(Mode::Coding);
    assert_eq!(history.len(), 2);
    assert!(!history[1].content.contains("Partial"));
    assert!(orch.store().draft(Mode::Coding).is_none());
}

#[tokio::test]
async fn generated_image_replaces_the_placeholder() {
    let upstream = Router::new().route(
        "/models/*model",
        post(|| async { ([(header::CONTENT_TYPE, "image/png")], vec![0u8, 1, 2]) }),
    );
    let orch = orchestrator_for(upstream).await;

    let outcome = orch.submit(Mode::Media, "a lighthouse", None).await.unwrap();
    assert_eq!(outcome, SubmitOutcome::Committed { attempts: 1 });

    let history = orch.store().history(Mode::Media);
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].image.as_deref(), Some("data:image/png;base64,AAEC"));
    assert_eq!(history[1].prompt.as_deref(), Some("a lighthouse"));
    assert!(history.iter().all(|m| !m.is_transient()));
}

#[tokio::test]
async fn vision_question_is_answered() {
    let upstream = Router::new().route(
        "/models/*model",
        post(|| async { Json(json!([{"answer": "two cats", "score": 0.8}])) }),
    );
    let orch = orchestrator_for(upstream).await;

    let outcome = orch
        .submit(
            Mode::Vision,
            "how many cats?",
            Some("data:image/png;base64,QUJD".into()),
        )
        .await
        .unwrap();
    assert_eq!(outcome, SubmitOutcome::Committed { attempts: 1 });
    assert_eq!(orch.store().history(Mode::Vision)[1].content, "two cats");
}

#[tokio::test]
async fn await_ready_returns_once_the_model_answers() {
    let upstream = Router::new().route(
        "/v1/chat/completions",
        post(|| async { Json(json!({"choices": []})) }),
    );
    let orch = orchestrator_for(upstream).await;

    let status = orch
        .await_ready(3, &tokio_util::sync::CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(status.status, WakeupState::Ready);
}
