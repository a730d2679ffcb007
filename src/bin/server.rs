//! Hive HTTP 接口
//!
//! 启动: cargo run --bin hive-server --features server
//! 端口由 HIVE_PORT 指定，默认 8000

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use hive::config::{load_config, MachineInfo};
use hive::CoordinatorCache;

#[derive(Clone)]
struct AppState {
    cache: Arc<CoordinatorCache>,
}

#[derive(Deserialize)]
struct ChatRequest {
    machine_id: String,
    message: String,
}

#[derive(Serialize)]
struct ChatResponse {
    response: String,
    agent_count: usize,
    execution_time_ms: u64,
    machine_id: String,
    timestamp: String,
}

type ApiError = (StatusCode, String);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();

    let config_path = std::env::var("HIVE_CONFIG").ok().map(PathBuf::from);
    let cfg = load_config(config_path)?;
    let cache = Arc::new(CoordinatorCache::from_config(cfg).await?);
    let state = AppState {
        cache: cache.clone(),
    };

    let app = Router::new()
        .route("/api/chat", post(chat))
        .route("/api/chat/clear-cache", post(clear_cache))
        .route("/api/machines", get(list_machines))
        .route("/api/machines/:machine_id", get(get_machine))
        .route("/health", get(health))
        .with_state(state);

    let port = std::env::var("HIVE_PORT")
        .ok()
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(8000);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Hive server: http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    cache.tools().disconnect_all().await;
    Ok(())
}

async fn chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    if req.message.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "message is required".to_string()));
    }
    let resp = state.cache.execute_query(&req.machine_id, &req.message).await;
    if !resp.success {
        let error = resp.error.unwrap_or_else(|| "unknown error".to_string());
        let status = if state.cache.machine_info(&req.machine_id).is_none() {
            StatusCode::NOT_FOUND
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        return Err((status, error));
    }
    Ok(Json(ChatResponse {
        response: resp.response,
        agent_count: resp.agent_count,
        execution_time_ms: resp.execution_time_ms,
        machine_id: req.machine_id,
        timestamp: Utc::now().to_rfc3339(),
    }))
}

async fn clear_cache(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    let machine = params.get("machine_id").map(String::as_str);
    let cleared = state.cache.clear(machine).await;
    let message = match machine {
        Some(m) => format!("Cache cleared for machine {}", m),
        None => "All caches cleared".to_string(),
    };
    Json(json!({ "message": message, "cleared": cleared }))
}

async fn list_machines(State(state): State<AppState>) -> Json<Vec<MachineInfo>> {
    Json(state.cache.machine_infos())
}

async fn get_machine(
    State(state): State<AppState>,
    Path(machine_id): Path<String>,
) -> Result<Json<MachineInfo>, ApiError> {
    state
        .cache
        .machine_info(&machine_id)
        .map(Json)
        .ok_or((StatusCode::NOT_FOUND, format!("Machine {} not found", machine_id)))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "cached_coordinators": state.cache.cached_machines().await,
        "tool_servers": state.cache.tools().list_servers().await,
    }))
}
