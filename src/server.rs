//! Server entry points: MCP over stdio, and MCP plus a JSON/SSE API over HTTP.
//!
//! Both build one [`Daemon`] and start its heartbeat; the HTTP router shares it with
//! every MCP session through an `Arc`.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use rmcp::ServiceExt;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};

use crate::chat::{ChatEvent, ChatRequest};
use crate::config::CairnConfig;
use crate::daemon::Daemon;
use crate::error::CairnError;
use crate::tools::CairnTools;

/// Start the MCP server over stdio transport.
pub async fn serve_stdio(config: CairnConfig) -> Result<()> {
    tracing::info!("starting Cairn MCP server on stdio");

    let daemon = Arc::new(Daemon::open(config).await?);
    daemon.start_heartbeat();

    let tools = CairnTools::new(Arc::clone(&daemon));
    let server = tools.serve(rmcp::transport::stdio()).await?;
    tracing::info!("MCP server running, waiting for client");

    server.waiting().await?;
    daemon.shutdown().await;
    tracing::info!("MCP server shut down");

    Ok(())
}

/// Start the HTTP server: streamable-HTTP MCP at `/mcp` and the JSON API under `/api`.
pub async fn serve_http(config: CairnConfig) -> Result<()> {
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!(addr = %bind_addr, "starting Cairn HTTP server");

    let daemon = Arc::new(Daemon::open(config).await?);
    daemon.start_heartbeat();

    let mcp_daemon = Arc::clone(&daemon);
    let mcp = rmcp::transport::streamable_http_server::StreamableHttpService::new(
        move || Ok(CairnTools::new(Arc::clone(&mcp_daemon))),
        rmcp::transport::streamable_http_server::session::local::LocalSessionManager::default()
            .into(),
        Default::default(),
    );

    let router = api_router(Arc::clone(&daemon)).nest_service("/mcp", mcp);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "listening at http://{bind_addr} (MCP at /mcp)");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
            }
            tracing::info!("shutting down HTTP server");
        })
        .await?;

    daemon.shutdown().await;
    Ok(())
}

/// The `/api` routes over a shared daemon.
pub fn api_router(daemon: Arc<Daemon>) -> Router {
    Router::new()
        .route("/api/chat", post(chat))
        .route("/api/search", get(search))
        .route("/api/reindex", post(reindex))
        .route("/api/stats", get(stats))
        .route("/api/heartbeat/run", post(heartbeat_run))
        .route("/api/heartbeat/status", get(heartbeat_status))
        .route("/api/sessions/{id}/save", post(session_save))
        .route("/api/sessions/{id}", axum::routing::delete(session_discard))
        .with_state(daemon)
}

// --- errors ---

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        let status = match err.downcast_ref::<CairnError>() {
            Some(CairnError::Validation(_)) => StatusCode::BAD_REQUEST,
            Some(CairnError::LockContention { .. }) | Some(CairnError::LockTimeout { .. }) => {
                StatusCode::CONFLICT
            }
            Some(CairnError::Timeout { .. }) => StatusCode::GATEWAY_TIMEOUT,
            Some(CairnError::RebuildFailed(_)) | None => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %err, "request failed");
        }
        Self {
            status,
            message: format!("{err:#}"),
        }
    }
}

impl From<CairnError> for ApiError {
    fn from(err: CairnError) -> Self {
        anyhow::Error::from(err).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                error: self.message,
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

// --- handlers ---

/// Aborts the chat turn when the SSE response is dropped (client went away).
struct CancelOnDrop(tokio::task::AbortHandle);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn chat(
    State(daemon): State<Arc<Daemon>>,
    Json(request): Json<ChatRequest>,
) -> std::result::Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>, ApiError>
{
    if request.message.trim().is_empty() {
        return Err(ApiError::bad_request("message must not be empty"));
    }

    let turn = daemon.chat().start(request);
    let cancel = CancelOnDrop(turn.abort_handle());
    let stream = ReceiverStream::new(turn.events).map(move |event: ChatEvent| {
        let _keep = &cancel;
        let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".into());
        Ok(Event::default().event(event.name()).data(data))
    });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    ))
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    q: String,
    top_k: Option<usize>,
}

async fn search(
    State(daemon): State<Arc<Daemon>>,
    Query(query): Query<SearchQuery>,
) -> ApiResult<crate::retrieval::SearchResponse> {
    if query.q.trim().is_empty() {
        return Err(ApiError::bad_request("q must not be empty"));
    }
    Ok(Json(daemon.retriever().search(&query.q, query.top_k).await?))
}

#[derive(Debug, Default, Deserialize)]
struct ReindexQuery {
    #[serde(default)]
    full: bool,
}

async fn reindex(
    State(daemon): State<Arc<Daemon>>,
    Query(query): Query<ReindexQuery>,
) -> ApiResult<crate::index::IndexStats> {
    Ok(Json(daemon.reindex(query.full).await?))
}

async fn stats(State(daemon): State<Arc<Daemon>>) -> ApiResult<crate::index::IndexOverview> {
    Ok(Json(daemon.indexer().overview().await?))
}

async fn heartbeat_run(
    State(daemon): State<Arc<Daemon>>,
) -> ApiResult<crate::heartbeat::CycleReport> {
    Ok(Json(daemon.heartbeat().run_cycle().await?))
}

async fn heartbeat_status(
    State(daemon): State<Arc<Daemon>>,
) -> ApiResult<crate::heartbeat::HeartbeatStatus> {
    Ok(Json(daemon.heartbeat().status()?))
}

#[derive(Debug, Serialize)]
struct SessionEnded {
    session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    daily_log: Option<String>,
}

async fn session_save(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<String>,
) -> ApiResult<SessionEnded> {
    if daemon.sessions().get(&id).is_none() {
        return Err(ApiError::not_found(format!("unknown session: {id}")));
    }
    let path = daemon.sessions().save(&id).await?;
    Ok(Json(SessionEnded {
        session_id: id,
        daily_log: path.and_then(|p| daemon.workspace().relative(&p)),
    }))
}

async fn session_discard(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<String>,
) -> std::result::Result<StatusCode, ApiError> {
    if daemon.sessions().discard(&id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!("unknown session: {id}")))
    }
}
