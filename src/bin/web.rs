//! mmagent HTTP 控制面
//!
//! 启动: cargo run --bin mmagent-web --features web
//! 端口：MMAGENT_WEB_PORT > 配置 [web].port（默认 5000）

#![cfg(feature = "web")]

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        Response,
    },
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use futures_util::stream;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use mmagent::config::{load_config, AppConfig};
use mmagent::observability::{self, LogBuffer};
use mmagent::react::AgentEvent;
use mmagent::{create_agent_components, AgentController, AgentError, AgentState};

struct AppState {
    controller: AgentController,
    /// AgentEvent 的 JSON 文本，供 /api/events 订阅
    event_bus: broadcast::Sender<String>,
}

#[derive(Deserialize)]
struct TaskRequest {
    task: String,
}

#[derive(Deserialize)]
struct TextRequest {
    text: String,
}

#[derive(Deserialize)]
struct LogsQuery {
    lines: Option<usize>,
}

#[derive(Serialize)]
struct Ack {
    ok: bool,
    message: String,
}

fn ack(message: impl Into<String>) -> Json<Ack> {
    Json(Ack {
        ok: true,
        message: message.into(),
    })
}

#[derive(Serialize)]
struct StatusResponse {
    running: bool,
    has_screenshot: bool,
    #[serde(flatten)]
    state: AgentState,
}

fn error_response(e: AgentError) -> (StatusCode, String) {
    match e {
        AgentError::Busy => (StatusCode::CONFLICT, e.to_string()),
        AgentError::FeedbackRejected(_) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// 把运行事件转发到 broadcast；没有订阅者时丢弃
fn spawn_event_forwarder(mut rx: mpsc::UnboundedReceiver<AgentEvent>, bus: broadcast::Sender<String>) {
    tokio::spawn(async move {
        while let Some(ev) = rx.recv().await {
            match serde_json::to_string(&ev) {
                Ok(json) => {
                    let _ = bus.send(json);
                }
                Err(e) => tracing::warn!(error = %e, "Failed to serialize agent event"),
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = match load_config(None) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load config ({}), using defaults", e);
            AppConfig::default()
        }
    };
    let logs = LogBuffer::new(cfg.app.log_buffer_lines);
    observability::init(Some(logs.clone()));

    let components = create_agent_components(&cfg)?;
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (event_bus, _) = broadcast::channel::<String>(256);
    spawn_event_forwarder(event_rx, event_bus.clone());

    let controller = AgentController::new(components)
        .with_event_tx(event_tx)
        .with_log_buffer(logs);
    let state = Arc::new(AppState {
        controller,
        event_bus,
    });

    let app = Router::new()
        .route("/task", post(api_task))
        .route("/status", get(api_status))
        .route("/feedback", post(api_feedback))
        .route("/user_input", post(api_feedback))
        .route("/cancel", post(api_cancel))
        .route("/kill", post(api_cancel))
        .route("/reset", post(api_reset))
        .route("/logs", get(api_logs))
        .route("/clear_logs", post(api_clear_logs))
        .route("/screenshot", get(api_screenshot))
        .route("/api/health", get(|| async { "OK" }))
        .route("/api/events", get(api_events_sse))
        .with_state(state);

    let port = std::env::var("MMAGENT_WEB_PORT")
        .ok()
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(cfg.web.port);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("mmagent control surface: http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// POST /task：提交任务，运行中返回 409
async fn api_task(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TaskRequest>,
) -> Result<(StatusCode, Json<Ack>), (StatusCode, String)> {
    let task = req.task.trim().to_string();
    if task.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "task is required".to_string()));
    }
    state.controller.submit(task.clone()).map_err(error_response)?;
    Ok((StatusCode::ACCEPTED, ack(format!("Task accepted: {}", task))))
}

/// GET /status：状态快照（截图只报告有无，字节走 /screenshot）
async fn api_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let mut snapshot = state.controller.status();
    let has_screenshot = snapshot.last_screenshot_bytes.take().is_some();
    Json(StatusResponse {
        running: state.controller.is_running(),
        has_screenshot,
        state: snapshot,
    })
}

/// POST /feedback 与 /user_input：反馈入队，下一轮执行前被消费
async fn api_feedback(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TextRequest>,
) -> Result<Json<Ack>, (StatusCode, String)> {
    let text = req.text.trim().to_string();
    if text.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "text is required".to_string()));
    }
    state.controller.feedback(text).map_err(error_response)?;
    Ok(ack("Feedback queued"))
}

/// POST /cancel（/kill）：停止当前运行；空闲时也返回成功
async fn api_cancel(State(state): State<Arc<AppState>>) -> Json<Ack> {
    if state.controller.cancel().await {
        ack("Agent stopped")
    } else {
        ack("Agent force-stopped after grace period")
    }
}

/// POST /reset：回到 idle；运行中返回 409
async fn api_reset(State(state): State<Arc<AppState>>) -> Result<Json<Ack>, (StatusCode, String)> {
    state.controller.reset().await.map_err(error_response)?;
    Ok(ack("Agent state reset"))
}

/// GET /logs?lines=N：最近 N 行日志（默认 100）
async fn api_logs(State(state): State<Arc<AppState>>, Query(q): Query<LogsQuery>) -> Json<Vec<String>> {
    Json(state.controller.logs(q.lines.unwrap_or(100)))
}

async fn api_clear_logs(State(state): State<Arc<AppState>>) -> Json<Ack> {
    state.controller.clear_logs();
    ack("Logs cleared")
}

/// GET /screenshot：最近一次观察的 PNG，没有时 404
async fn api_screenshot(State(state): State<Arc<AppState>>) -> Result<Response, (StatusCode, String)> {
    let bytes = state
        .controller
        .screenshot()
        .ok_or_else(|| (StatusCode::NOT_FOUND, "No screenshot captured yet".to_string()))?;
    let mut res = Response::new(Body::from(Bytes::from(bytes)));
    res.headers_mut()
        .insert(header::CONTENT_TYPE, header::HeaderValue::from_static("image/png"));
    Ok(res)
}

/// GET /api/events：运行事件 SSE
async fn api_events_sse(
    State(state): State<Arc<AppState>>,
) -> Sse<impl futures_util::Stream<Item = Result<Event, std::convert::Infallible>>> {
    let rx = state.event_bus.subscribe();
    let event_stream = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(msg) => return Some((Ok(Event::default().data(msg)), rx)),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(event_stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("keepalive"),
    )
}
