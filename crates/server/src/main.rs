use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{DefaultBodyLimit, Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use connections_api::{
    connection_stats, decline_connection, list_connections, reconsider_connection, revoke_access,
    send_questionnaire, share_contact, ApiContext,
};
use serde::Deserialize;
use shared::{
    domain::{ConnectionId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        ConnectionRecord, ConnectionStats, DeclineRequest, QuestionnaireLink,
        SendQuestionnaireRequest, ServerEvent,
    },
};
use storage::Storage;
use tokio::sync::broadcast::error::RecvError;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info, warn};

mod app_state;
mod config;

use app_state::AppState;
use config::{load_settings, normalize_database_url};

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

#[derive(Debug, Deserialize)]
struct WsQuery {
    user_id: i64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let settings = load_settings();
    let database_url = normalize_database_url(&settings.database_url);
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    let api = ApiContext::new(storage).with_reconsider_policy(settings.reconsider_policy);
    let state = AppState { api };
    let app = build_router(Arc::new(state), settings.max_body_bytes);

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, policy = ?settings.reconsider_policy, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/users/:user_id/connections", get(http_list_connections))
        .route("/users/:user_id/connections/stats", get(http_connection_stats))
        .route("/connections/:connection_id/share", post(http_share_contact))
        .route("/connections/:connection_id/revoke", post(http_revoke_access))
        .route("/connections/:connection_id/decline", post(http_decline_connection))
        .route(
            "/connections/:connection_id/reconsider",
            post(http_reconsider_connection),
        )
        .route(
            "/connections/:connection_id/questionnaires",
            post(http_send_questionnaire),
        )
        .route("/ws", get(ws_handler))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .with_state(state)
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(err: ApiError) -> (StatusCode, Json<ApiError>) {
    (status_for(err.code), Json(err))
}

async fn healthz(State(state): State<Arc<AppState>>) -> ApiResult<&'static str> {
    state.api.storage.health_check().await.map_err(|e| {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiError::new(ErrorCode::Internal, e.to_string())),
        )
    })?;
    Ok("ok")
}

async fn http_list_connections(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<i64>,
) -> ApiResult<Json<Vec<ConnectionRecord>>> {
    let records = list_connections(&state.api, UserId(user_id))
        .await
        .map_err(reject)?;
    Ok(Json(records))
}

async fn http_connection_stats(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<i64>,
) -> ApiResult<Json<ConnectionStats>> {
    let stats = connection_stats(&state.api, UserId(user_id))
        .await
        .map_err(reject)?;
    Ok(Json(stats))
}

async fn http_share_contact(
    State(state): State<Arc<AppState>>,
    Path(connection_id): Path<i64>,
) -> ApiResult<StatusCode> {
    share_contact(&state.api, ConnectionId(connection_id))
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_revoke_access(
    State(state): State<Arc<AppState>>,
    Path(connection_id): Path<i64>,
) -> ApiResult<StatusCode> {
    revoke_access(&state.api, ConnectionId(connection_id))
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_decline_connection(
    State(state): State<Arc<AppState>>,
    Path(connection_id): Path<i64>,
    Json(req): Json<DeclineRequest>,
) -> ApiResult<StatusCode> {
    decline_connection(&state.api, ConnectionId(connection_id), &req.reason)
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_reconsider_connection(
    State(state): State<Arc<AppState>>,
    Path(connection_id): Path<i64>,
) -> ApiResult<StatusCode> {
    reconsider_connection(&state.api, ConnectionId(connection_id))
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_send_questionnaire(
    State(state): State<Arc<AppState>>,
    Path(connection_id): Path<i64>,
    Json(req): Json<SendQuestionnaireRequest>,
) -> ApiResult<Json<QuestionnaireLink>> {
    let link = send_questionnaire(&state.api, ConnectionId(connection_id), req.questionnaire_id)
        .await
        .map_err(reject)?;
    Ok(Json(link))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket, UserId(q.user_id)))
}

/// Forwards row changes that involve `user_id` until either side hangs up.
async fn ws_connection(
    state: Arc<AppState>,
    socket: axum::extract::ws::WebSocket,
    user_id: UserId,
) {
    use axum::extract::ws::Message;
    use futures::{SinkExt, StreamExt};

    let (mut sender, mut receiver) = socket.split();
    let mut changes = state.api.storage.subscribe_changes();
    info!(user_id = user_id.0, "ws: change subscriber connected");

    let send_task = tokio::spawn(async move {
        loop {
            let event = match changes.recv().await {
                Ok(change) if change.touches(user_id) => ServerEvent::ConnectionChanged {
                    connection_id: change.connection_id,
                    requester_id: change.requester_id,
                    responder_id: change.responder_id,
                },
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(user_id = user_id.0, skipped, "ws: subscriber lagged; requesting resync");
                    ServerEvent::Resync
                }
                Err(RecvError::Closed) => break,
            };
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(_msg)) = receiver.next().await {}

    send_task.abort();
    info!(user_id = user_id.0, "ws: change subscriber disconnected");
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
