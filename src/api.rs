use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use sysinfo::System;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::DaemonError;
use crate::events::{
    alerts_key, health_key, logs_key, metrics_key, AlertLevel, EventHub, TOPIC_STATUS,
};
use crate::instance_manager::{CreateInstanceInput, InstanceManager};
use crate::log_collector::{LogCollector, LogFilter, LogLevel};
use crate::monitor::{MonitorManager, MonitoringConfig};
use crate::port_manager::PortManager;
use crate::runtime_gateway::{runtime_id, DockerGateway};

#[derive(Clone)]
pub struct ApiState {
    pub instances: Arc<InstanceManager>,
    pub monitor: MonitorManager,
    pub logs: LogCollector,
    pub ports: Arc<PortManager>,
    pub events: Arc<EventHub>,
    pub docker: DockerGateway,
}

struct ApiError(DaemonError);

impl From<DaemonError> for ApiError {
    fn from(err: DaemonError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            DaemonError::NotFound(_) => StatusCode::NOT_FOUND,
            DaemonError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            DaemonError::InvalidDescriptor(_) => StatusCode::UNPROCESSABLE_ENTITY,
            DaemonError::PortsExhausted { .. } => StatusCode::CONFLICT,
            DaemonError::RuntimeUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            DaemonError::OperationTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = match &self.0 {
            DaemonError::InvalidDescriptor(details) => json!({
                "error": self.0.to_string(),
                "details": details,
            }),
            _ => json!({ "error": self.0.to_string() }),
        };

        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/status", get(daemon_status))
        .route("/instances", get(list_instances).post(create_instance))
        .route("/instances/{id}", get(get_instance).delete(delete_instance))
        .route("/instances/{id}/start", post(start_instance))
        .route("/instances/{id}/stop", post(stop_instance))
        .route("/instances/{id}/pause", post(pause_instance))
        .route("/instances/{id}/resume", post(resume_instance))
        .route("/instances/{id}/restart", post(restart_instance))
        .route("/instances/{id}/validate", post(validate_instance))
        .route("/instances/{id}/exec", post(exec_in_instance))
        .route("/instances/{id}/monitoring", get(monitoring_state))
        .route("/instances/{id}/logs", get(get_logs))
        .route("/instances/{id}/logs/export", post(export_logs))
        .route("/instances/{id}/metrics", get(get_metrics))
        .route("/instances/{id}/health", get(get_health))
        .route("/instances/{id}/health/check", post(get_health))
        .route(
            "/monitoring/config",
            get(get_monitoring_config).put(update_monitoring_config),
        )
        .route("/containers", get(list_containers))
        .route("/ports", get(port_stats))
        .route("/ports/range", put(set_port_range))
        .route("/ports/{port}", get(port_info))
        .route("/subscriptions", get(subscription_stats))
        .route("/maintenance/cleanup-orphans", post(cleanup_orphans))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn daemon_status(State(state): State<ApiState>) -> Json<Value> {
    let mut system = System::new();
    system.refresh_memory();
    system.refresh_cpu_usage();

    let runtime = match state.docker.version().await {
        Ok(version) => json!({
            "available": true,
            "version": version.version,
            "apiVersion": version.api_version,
            "os": version.os,
            "arch": version.arch,
        }),
        Err(e) => json!({ "available": false, "error": e.to_string() }),
    };

    let managed = state
        .docker
        .list_managed()
        .await
        .map(|c| c.len())
        .unwrap_or(0);

    Json(json!({
        "timestamp": Utc::now(),
        "cpuPercent": system.global_cpu_usage(),
        "memoryUsageMb": system.used_memory() / 1024 / 1024,
        "memoryTotalMb": system.total_memory() / 1024 / 1024,
        "uptimeSeconds": System::uptime(),
        "managedContainers": managed,
        "runtime": runtime,
    }))
}

async fn list_instances(State(state): State<ApiState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.instances.list().await?))
}

async fn create_instance(
    State(state): State<ApiState>,
    Json(input): Json<CreateInstanceInput>,
) -> ApiResult<impl IntoResponse> {
    let instance = state.instances.create(input).await?;
    Ok((StatusCode::CREATED, Json(instance)))
}

async fn get_instance(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.instances.get(&id).await?))
}

async fn start_instance(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.instances.start(&id).await?))
}

async fn stop_instance(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.instances.stop(&id).await?))
}

async fn pause_instance(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.instances.pause(&id).await?))
}

async fn resume_instance(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.instances.resume(&id).await?))
}

async fn restart_instance(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.instances.restart(&id).await?))
}

async fn validate_instance(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let errors = state.instances.validate_descriptor(&id).await?;
    Ok(Json(json!({ "valid": errors.is_empty(), "errors": errors })))
}

#[derive(Debug, Deserialize)]
struct ExecBody {
    argv: Vec<String>,
}

async fn exec_in_instance(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<ExecBody>,
) -> ApiResult<impl IntoResponse> {
    if body.argv.is_empty() {
        return Err(DaemonError::InvalidRequest("argv must be non-empty".to_string()).into());
    }
    // Existence check keeps the error a 404 instead of a runtime error.
    state.instances.get(&id).await?;
    let output = state
        .docker
        .exec_command(&runtime_id(&id), body.argv)
        .await?;
    Ok(Json(json!({
        "stdout": output.stdout,
        "stderr": output.stderr,
        "exitCode": output.exit_code,
    })))
}

async fn monitoring_state(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(json!({
        "monitoring": state.monitor.is_monitoring(&id).await,
        "logCollection": state.logs.is_collecting(&id).await,
        "bufferedLogEntries": state.logs.buffer_len(&id),
    })))
}

async fn list_containers(State(state): State<ApiState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.docker.list_managed().await?))
}

async fn port_info(
    State(state): State<ApiState>,
    Path(port): Path<u16>,
) -> Json<Value> {
    let range = state.ports.range();
    Json(json!({
        "port": port,
        "inRange": port >= range.min && port <= range.max,
        "available": state.ports.is_available(port).await,
    }))
}

async fn delete_instance(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let deleted = state.instances.delete(&id).await?;
    Ok(Json(json!({ "deleted": deleted })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogQuery {
    level: Option<String>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    search: Option<String>,
    limit: Option<usize>,
}

impl LogQuery {
    fn into_filter(self) -> Result<LogFilter, DaemonError> {
        let level = match self.level {
            Some(raw) => Some(LogLevel::parse(&raw).ok_or_else(|| {
                DaemonError::InvalidRequest(format!("unknown log level: {}", raw))
            })?),
            None => None,
        };
        Ok(LogFilter {
            level,
            start_time: self.start_time,
            end_time: self.end_time,
            search: self.search,
            limit: self.limit,
        })
    }
}

async fn get_logs(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(query): Query<LogQuery>,
) -> ApiResult<impl IntoResponse> {
    let filter = query.into_filter()?;
    Ok(Json(state.logs.query(&id, &filter)))
}

async fn export_logs(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    body: Option<Json<LogFilter>>,
) -> ApiResult<impl IntoResponse> {
    let filter = body.map(|Json(filter)| filter).unwrap_or_default();
    let path = state.logs.export(&id, &filter).await?;
    Ok(Json(json!({ "exportPath": path })))
}

async fn get_metrics(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.monitor.collect_metrics(&id).await?))
}

async fn get_health(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let instance = state.instances.get(&id).await?;
    let health = state
        .monitor
        .perform_health_check(&id, instance.port)
        .await;
    Ok(Json(health))
}

async fn get_monitoring_config(State(state): State<ApiState>) -> Json<MonitoringConfig> {
    Json(state.monitor.config())
}

async fn update_monitoring_config(
    State(state): State<ApiState>,
    Json(config): Json<MonitoringConfig>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.monitor.update_config(config)?))
}

async fn port_stats(State(state): State<ApiState>) -> Json<Value> {
    Json(json!({
        "range": state.ports.range(),
        "usage": state.ports.usage_stats().await,
    }))
}

#[derive(Debug, Deserialize)]
struct PortRangeBody {
    min: u16,
    max: u16,
}

async fn set_port_range(
    State(state): State<ApiState>,
    Json(body): Json<PortRangeBody>,
) -> ApiResult<impl IntoResponse> {
    state.ports.set_range(body.min, body.max)?;
    Ok(Json(json!({ "range": state.ports.range() })))
}

async fn subscription_stats(State(state): State<ApiState>) -> Json<HashMap<String, usize>> {
    Json(state.events.stats())
}

async fn cleanup_orphans(State(state): State<ApiState>) -> ApiResult<impl IntoResponse> {
    let cleaned = state.instances.cleanup_orphaned().await?;
    Ok(Json(json!({ "cleaned": cleaned })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WsRequest {
    #[serde(rename = "type")]
    kind: String,
    topic: Option<String>,
    instance_id: Option<String>,
    level: Option<String>,
}

/// Resolve a subscribe request to the hub key it binds to.
fn resolve_key(
    topic: &str,
    instance_id: Option<&str>,
    level: Option<&str>,
) -> Result<String, String> {
    match topic {
        "status" => Ok(TOPIC_STATUS.to_string()),
        "logs" | "metrics" | "health" => {
            let id = instance_id.ok_or_else(|| format!("{} requires instanceId", topic))?;
            Ok(match topic {
                "logs" => logs_key(id),
                "metrics" => metrics_key(id),
                _ => health_key(id),
            })
        }
        "alerts" => match level {
            Some(raw) => AlertLevel::parse(raw)
                .map(|level| alerts_key(Some(level)))
                .ok_or_else(|| format!("unknown alert level: {}", raw)),
            None => Ok(alerts_key(None)),
        },
        other => Err(format!("unknown topic: {}", other)),
    }
}

async fn ws_handler(State(state): State<ApiState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

/// One task per subscription forwards hub events into the socket; the
/// connection id ties them together so closing the socket drops every
/// registration at once.
async fn handle_socket(state: ApiState, socket: WebSocket) {
    let connection_id = Uuid::new_v4().to_string();
    debug!("Subscriber connected: {}", connection_id);

    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let mut forwarders: HashMap<String, JoinHandle<()>> = HashMap::new();

    while let Some(Ok(message)) = stream.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        let request: WsRequest = match serde_json::from_str(text.as_str()) {
            Ok(request) => request,
            Err(e) => {
                let _ = tx.send(json!({ "type": "error", "error": e.to_string() }).to_string());
                continue;
            }
        };

        match request.kind.as_str() {
            "subscribe" => {
                let Some(topic) = request.topic.as_deref() else {
                    let _ =
                        tx.send(json!({ "type": "error", "error": "topic required" }).to_string());
                    continue;
                };
                match resolve_key(topic, request.instance_id.as_deref(), request.level.as_deref())
                {
                    Ok(key) => {
                        if forwarders.contains_key(&key) {
                            continue;
                        }
                        let mut receiver = state.events.subscribe(&connection_id, &key);
                        let forward_tx = tx.clone();
                        let forward_key = key.clone();
                        let handle = tokio::spawn(async move {
                            loop {
                                match receiver.recv().await {
                                    Ok(event) => match serde_json::to_string(&event) {
                                        Ok(payload) => {
                                            if forward_tx.send(payload).is_err() {
                                                break;
                                            }
                                        }
                                        Err(e) => {
                                            warn!("Could not serialize event: {}", e);
                                        }
                                    },
                                    // A lagging subscriber loses its own
                                    // oldest events and keeps going.
                                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                                        warn!(
                                            "Subscriber lagged on {}, skipped {} events",
                                            forward_key, n
                                        );
                                    }
                                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                                }
                            }
                        });
                        forwarders.insert(key.clone(), handle);
                        let _ = tx.send(json!({ "type": "subscribed", "key": key }).to_string());
                    }
                    Err(e) => {
                        let _ = tx.send(json!({ "type": "error", "error": e }).to_string());
                    }
                }
            }
            "unsubscribe" => {
                let Some(topic) = request.topic.as_deref() else {
                    continue;
                };
                if let Ok(key) =
                    resolve_key(topic, request.instance_id.as_deref(), request.level.as_deref())
                {
                    if let Some(handle) = forwarders.remove(&key) {
                        handle.abort();
                    }
                    state.events.unsubscribe(&connection_id, &key);
                    let _ = tx.send(json!({ "type": "unsubscribed", "key": key }).to_string());
                }
            }
            other => {
                let _ = tx.send(
                    json!({ "type": "error", "error": format!("unknown message type: {}", other) })
                        .to_string(),
                );
            }
        }
    }

    for handle in forwarders.values() {
        handle.abort();
    }
    writer.abort();
    state.events.unsubscribe_connection(&connection_id);
    debug!("Subscriber disconnected: {}", connection_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_subscription_keys() {
        assert_eq!(resolve_key("status", None, None).unwrap(), "status");
        assert_eq!(
            resolve_key("logs", Some("abc"), None).unwrap(),
            "logs:abc"
        );
        assert_eq!(
            resolve_key("metrics", Some("abc"), None).unwrap(),
            "metrics:abc"
        );
        assert_eq!(
            resolve_key("health", Some("abc"), None).unwrap(),
            "health:abc"
        );
        assert_eq!(
            resolve_key("alerts", None, Some("error")).unwrap(),
            "alerts:ERROR"
        );
        assert_eq!(resolve_key("alerts", None, None).unwrap(), "alerts:all");
    }

    #[test]
    fn rejects_malformed_subscriptions() {
        assert!(resolve_key("logs", None, None).is_err());
        assert!(resolve_key("alerts", None, Some("loud")).is_err());
        assert!(resolve_key("nonsense", None, None).is_err());
    }
}
