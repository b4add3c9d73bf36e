/*!
Fake inference server and Ray dashboard

One axum listener on 127.0.0.1 answering the routes the agent talks to:
`/health`, `/v1/models`, `/v1/chat/completions` and the Ray dashboard's
`/api/version`. Because it accepts TCP it also stands in for the Ray GCS
port in reachability checks.
*/

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct FakeServerOptions {
    pub model: String,
    pub ray_version: String,
    pub healthy: bool,
    /// Completion tokens per answer, capped by the request's max_tokens
    pub completion_tokens: u64,
    pub reasoning: Option<String>,
    /// Answer this many chat requests with 500 before succeeding
    pub fail_first: usize,
    pub delay: Duration,
}

impl Default for FakeServerOptions {
    fn default() -> Self {
        Self {
            model: "test-model".to_string(),
            ray_version: "2.51.0".to_string(),
            healthy: true,
            completion_tokens: 64,
            reasoning: None,
            fail_first: 0,
            delay: Duration::ZERO,
        }
    }
}

#[derive(Default)]
struct Counters {
    chat_requests: usize,
    failures_left: usize,
}

#[derive(Clone)]
struct ServerState {
    options: Arc<Mutex<FakeServerOptions>>,
    counters: Arc<Mutex<Counters>>,
}

#[derive(Debug, Deserialize)]
struct ChatBody {
    model: String,
    max_tokens: Option<u64>,
}

pub struct FakeInferenceServer {
    addr: SocketAddr,
    state: ServerState,
    shutdown: CancellationToken,
}

impl FakeInferenceServer {
    pub async fn start() -> anyhow::Result<Self> {
        Self::start_with(FakeServerOptions::default()).await
    }

    pub async fn start_with(options: FakeServerOptions) -> anyhow::Result<Self> {
        let counters = Counters {
            chat_requests: 0,
            failures_left: options.fail_first,
        };
        let state = ServerState {
            options: Arc::new(Mutex::new(options)),
            counters: Arc::new(Mutex::new(counters)),
        };

        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();

        let app = build_router(state.clone());
        let token = shutdown.clone();
        tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = served {
                log::warn!("[FAKE] server stopped: {}", e);
            }
        });
        log::info!("🧪 [FAKE] inference server listening on http://{}", addr);

        Ok(Self { addr, state, shutdown })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.state.options.lock().healthy = healthy;
    }

    pub fn chat_requests(&self) -> usize {
        self.state.counters.lock().chat_requests
    }
}

impl Drop for FakeInferenceServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn build_router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/models", get(models))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/api/version", get(ray_version))
        .with_state(state)
}

async fn health(State(state): State<ServerState>) -> StatusCode {
    if state.options.lock().healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn models(State(state): State<ServerState>) -> Json<Value> {
    let model = state.options.lock().model.clone();
    Json(json!({
        "object": "list",
        "data": [{ "id": model, "object": "model", "owned_by": "vllm" }]
    }))
}

async fn ray_version(State(state): State<ServerState>) -> Json<Value> {
    let version = state.options.lock().ray_version.clone();
    Json(json!({ "ray_version": version, "version": "4", "ray_commit": "fake" }))
}

async fn chat_completions(State(state): State<ServerState>, Json(body): Json<ChatBody>) -> (StatusCode, Json<Value>) {
    let options = state.options.lock().clone();
    let inject_failure = {
        let mut counters = state.counters.lock();
        counters.chat_requests += 1;
        if counters.failures_left > 0 {
            counters.failures_left -= 1;
            true
        } else {
            false
        }
    };

    if !options.delay.is_zero() {
        tokio::time::sleep(options.delay).await;
    }
    if inject_failure {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "object": "error", "message": "injected failure" })),
        );
    }
    if body.model != options.model {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "object": "error", "message": format!("The model `{}` does not exist.", body.model) })),
        );
    }

    let completion_tokens = body
        .max_tokens
        .map_or(options.completion_tokens, |max| max.min(options.completion_tokens));
    let prompt_tokens = 12;
    (
        StatusCode::OK,
        Json(json!({
            "id": "chatcmpl-fake",
            "object": "chat.completion",
            "created": chrono::Utc::now().timestamp(),
            "model": options.model,
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": "Hello from the fake server.",
                    "reasoning_content": options.reasoning,
                },
                "finish_reason": "stop"
            }],
            "usage": {
                "prompt_tokens": prompt_tokens,
                "completion_tokens": completion_tokens,
                "total_tokens": prompt_tokens + completion_tokens
            }
        })),
    )
}
