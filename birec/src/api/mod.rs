//! HTTP/WS admin surface.
//!
//! A small axum router over the task manager and the settings manager:
//! task data and control, settings patching, and two WebSocket endpoints
//! streaming the event and exception buses as JSON.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tracing::debug;

use crate::event::{EventBus, ExceptionBus};
use crate::setting::SettingsManager;
use crate::task::TaskManager;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<TaskManager>,
    pub settings: Arc<SettingsManager>,
    pub api_key: Option<String>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/tasks", get(list_tasks).post(add_task))
        .route(
            "/api/v1/tasks/{room_id}",
            axum::routing::delete(remove_task),
        )
        .route("/api/v1/tasks/{room_id}/data", get(task_data))
        .route("/api/v1/tasks/{room_id}/start", post(start_task))
        .route("/api/v1/tasks/{room_id}/stop", post(stop_task))
        .route("/api/v1/tasks/{room_id}/cut", post(cut_task))
        .route("/api/v1/tasks/{room_id}/recorder/enable", post(enable_recorder))
        .route(
            "/api/v1/tasks/{room_id}/recorder/disable",
            post(disable_recorder),
        )
        .route("/api/v1/settings", get(get_settings).patch(patch_settings))
        .route(
            "/api/v1/settings/tasks/{room_id}",
            patch(patch_task_settings).get(get_task_settings),
        )
        .route("/ws/v1/events", get(ws_events))
        .route("/ws/v1/exceptions", get(ws_exceptions))
        .layer(CorsLayer::permissive())
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            check_api_key,
        ))
        .with_state(state)
}

async fn check_api_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    if let Some(expected) = &state.api_key {
        let provided = headers
            .get("x-api-key")
            .and_then(|value| value.to_str().ok());
        if provided != Some(expected.as_str()) {
            return (StatusCode::UNAUTHORIZED, "invalid api key").into_response();
        }
    }
    next.run(request).await
}

fn not_found(room_id: u64) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": format!("no task for room {room_id}")})),
    )
        .into_response()
}

async fn list_tasks(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.manager.statuses()))
}

async fn task_data(State(state): State<AppState>, Path(room_id): Path<u64>) -> Response {
    match state.manager.get(room_id) {
        Some(task) => Json(json!(task.status())).into_response(),
        None => not_found(room_id),
    }
}

async fn add_task(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let Some(room_id) = body.get("room_id").and_then(Value::as_u64) else {
        return (StatusCode::BAD_REQUEST, "room_id required").into_response();
    };
    match state.manager.add_task(room_id).await {
        Ok(task) => Json(json!({"room_id": task.room_id()})).into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, Json(json!({"error": e}))).into_response(),
    }
}

async fn remove_task(State(state): State<AppState>, Path(room_id): Path<u64>) -> Response {
    match state.manager.remove_task(room_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => (StatusCode::NOT_FOUND, Json(json!({"error": e}))).into_response(),
    }
}

async fn start_task(State(state): State<AppState>, Path(room_id): Path<u64>) -> Response {
    match state.manager.get(room_id) {
        Some(task) => {
            task.enable_monitor().await;
            task.enable_recorder().await;
            StatusCode::NO_CONTENT.into_response()
        }
        None => not_found(room_id),
    }
}

async fn stop_task(
    State(state): State<AppState>,
    Path(room_id): Path<u64>,
    body: Option<Json<Value>>,
) -> Response {
    let force = body
        .as_ref()
        .and_then(|b| b.get("force"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    match state.manager.get(room_id) {
        Some(task) => {
            task.disable_recorder(force).await;
            task.disable_monitor().await;
            StatusCode::NO_CONTENT.into_response()
        }
        None => not_found(room_id),
    }
}

async fn cut_task(State(state): State<AppState>, Path(room_id): Path<u64>) -> Response {
    match state.manager.get(room_id) {
        Some(task) => {
            if task.cut_stream() {
                StatusCode::NO_CONTENT.into_response()
            } else {
                (
                    StatusCode::CONFLICT,
                    Json(json!({"error": "cut refused: file too short or cut pending"})),
                )
                    .into_response()
            }
        }
        None => not_found(room_id),
    }
}

async fn enable_recorder(State(state): State<AppState>, Path(room_id): Path<u64>) -> Response {
    match state.manager.get(room_id) {
        Some(task) => {
            task.enable_recorder().await;
            StatusCode::NO_CONTENT.into_response()
        }
        None => not_found(room_id),
    }
}

async fn disable_recorder(
    State(state): State<AppState>,
    Path(room_id): Path<u64>,
    body: Option<Json<Value>>,
) -> Response {
    let force = body
        .as_ref()
        .and_then(|b| b.get("force"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    match state.manager.get(room_id) {
        Some(task) => {
            task.disable_recorder(force).await;
            StatusCode::NO_CONTENT.into_response()
        }
        None => not_found(room_id),
    }
}

async fn get_settings(State(state): State<AppState>) -> Json<Value> {
    Json(serde_json::to_value(state.settings.settings()).unwrap_or(Value::Null))
}

async fn patch_settings(State(state): State<AppState>, Json(patch): Json<Value>) -> Response {
    match state.settings.apply_patch(&patch) {
        Ok(settings) => {
            state.manager.apply_settings();
            Json(serde_json::to_value(settings).unwrap_or(Value::Null)).into_response()
        }
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

async fn get_task_settings(State(state): State<AppState>, Path(room_id): Path<u64>) -> Response {
    match state.settings.task_settings(room_id) {
        Some(settings) => {
            Json(serde_json::to_value(settings).unwrap_or(Value::Null)).into_response()
        }
        None => not_found(room_id),
    }
}

async fn patch_task_settings(
    State(state): State<AppState>,
    Path(room_id): Path<u64>,
    Json(patch): Json<Value>,
) -> Response {
    match state.settings.apply_task_patch(room_id, &patch) {
        Ok(settings) => {
            if let Err(e) = state.manager.apply_task_settings(room_id).await {
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"error": e.to_string()})),
                )
                    .into_response();
            }
            Json(serde_json::to_value(settings).unwrap_or(Value::Null)).into_response()
        }
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

async fn ws_events(upgrade: WebSocketUpgrade) -> Response {
    upgrade.on_upgrade(|socket| async {
        let receiver = EventBus::global().subscribe();
        stream_bus(socket, receiver, |event| event.to_wire()).await;
    })
}

async fn ws_exceptions(upgrade: WebSocketUpgrade) -> Response {
    upgrade.on_upgrade(|socket| async {
        let receiver = ExceptionBus::global().subscribe();
        stream_bus(socket, receiver, |record| {
            json!({"name": record.name, "detail": record.detail})
        })
        .await;
    })
}

async fn stream_bus<T: Clone>(
    mut socket: WebSocket,
    mut receiver: tokio::sync::broadcast::Receiver<T>,
    to_json: impl Fn(T) -> Value,
) {
    loop {
        tokio::select! {
            item = receiver.recv() => match item {
                Ok(item) => {
                    let text = to_json(item).to_string();
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        return;
                    }
                }
                // Lagged subscribers just skip what they missed.
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "websocket subscriber lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            },
            message = socket.recv() => match message {
                Some(Ok(_)) => {}
                _ => return,
            },
        }
    }
}
