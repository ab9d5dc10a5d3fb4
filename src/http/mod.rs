//! Admin HTTP surface: nudge lifecycle, reflections, kernel commands, health,
//! and metrics, over a shared [`AppState`] (no module-level globals). Grounded
//! in the teacher's proxy server wiring - `Router::new().route(...).with_state`,
//! bind, `axum::serve(..).with_graceful_shutdown(..)` - with the routes and
//! handlers themselves replaced end to end.

mod metrics;

use crate::daemon::{handle_command, AppState};
use crate::error::ApiError;
use crate::models::{Command, CommandResult, NudgeStatus};
use crate::store::fts;
use crate::store::persistence;
use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

fn metrics_internal_only() -> bool {
    match std::env::var("METRICS_INTERNAL_ONLY") {
        Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => false,
    }
}

pub fn router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/api/nudges/pending", get(get_pending_nudges))
        .route("/api/nudges/:id/ack", post(ack_nudge))
        .route("/api/nudges/:id/dismiss", post(dismiss_nudge))
        .route("/api/reflections/:kind/latest", get(latest_reflection))
        .route("/api/reflections/:kind/run", post(run_reflection))
        .route("/api/command", post(run_command))
        .route("/api/memories/search", get(search_memories))
        .route("/api/health", get(health))
        .route("/healthz", get(healthz));

    router = if metrics_internal_only() {
        router.route("/internal/metrics", get(metrics_text))
    } else {
        router.route("/metrics", get(metrics_text))
    };

    router.with_state(state)
}

pub async fn serve(state: AppState, shutdown_rx: tokio::sync::oneshot::Receiver<()>) -> Result<()> {
    let bind_addr = state.config.bind_addr;
    let app = router(state);

    let listener = TcpListener::bind(bind_addr).await.context("failed to bind admin surface")?;
    tracing::info!("admin surface listening on {bind_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.await.ok();
        })
        .await
        .context("admin surface error")?;

    tracing::info!("admin surface shut down gracefully");
    Ok(())
}

#[derive(Deserialize)]
struct PendingQuery {
    limit: Option<i64>,
}

async fn get_pending_nudges(State(state): State<AppState>, Query(params): Query<PendingQuery>) -> Result<impl IntoResponse, ApiError> {
    let limit = params.limit.unwrap_or(50);
    let conn = state.store.pool_conn()?;
    let nudges = persistence::list_pending_nudges(&conn, limit)?;
    Ok(Json(nudges))
}

/// Snippets are rendered at query time from the FTS index; cap them before they
/// leave the process rather than trusting every caller to do it client-side.
const SEARCH_SNIPPET_MAX_BYTES: usize = 480;

#[derive(Deserialize)]
struct SearchQuery {
    q: String,
    limit: Option<i64>,
    offset: Option<i64>,
    order_by_rank: Option<bool>,
}

async fn search_memories(State(state): State<AppState>, Query(params): Query<SearchQuery>) -> Result<impl IntoResponse, ApiError> {
    let limit = params.limit.unwrap_or(20);
    let offset = params.offset.unwrap_or(0);
    let order_by_rank = params.order_by_rank.unwrap_or(true);

    let conn = state.store.pool_conn()?;
    let mut hits = fts::search_with_gate(&conn, &params.q, limit, offset, order_by_rank, false, None)?;
    for hit in &mut hits {
        hit.snippet = fts::truncate_snippet(&hit.snippet, SEARCH_SNIPPET_MAX_BYTES).to_string();
    }
    Ok(Json(hits))
}

async fn ack_nudge(State(state): State<AppState>, Path(id): Path<i64>) -> Result<impl IntoResponse, ApiError> {
    set_nudge_status(state, id, NudgeStatus::Acked).await
}

async fn dismiss_nudge(State(state): State<AppState>, Path(id): Path<i64>) -> Result<impl IntoResponse, ApiError> {
    set_nudge_status(state, id, NudgeStatus::Dismissed).await
}

async fn set_nudge_status(state: AppState, id: i64, status: NudgeStatus) -> Result<impl IntoResponse, ApiError> {
    let now = chrono::Utc::now().timestamp();
    let nudge = state.store.with_connection(|conn| persistence::set_nudge_status(conn, id, status, now))?;
    match nudge {
        Some(nudge) => Ok(Json(nudge)),
        None => Err(ApiError::NotFound(format!("nudge {id} not found"))),
    }
}

async fn latest_reflection(State(state): State<AppState>, Path(kind): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let conn = state.store.pool_conn()?;
    let reflection = persistence::latest_reflection(&conn, &kind)?;
    match reflection {
        Some(reflection) => Ok(Json(reflection)),
        None => Err(ApiError::NotFound(format!("no reflection of kind {kind}"))),
    }
}

async fn run_reflection(State(state): State<AppState>, Path(kind): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let cmd = match kind.as_str() {
        "daily_journal" => Command::ReflectionRunDaily,
        "weekly_alignment_audit" => Command::ReflectionRunWeekly,
        other => return Err(ApiError::BadRequest(format!("unknown reflection kind: {other}"))),
    };
    let result = handle_command(&state, cmd)?;
    Ok(Json(result))
}

#[derive(Deserialize)]
struct CommandRequest {
    command: String,
}

async fn run_command(State(state): State<AppState>, Json(req): Json<CommandRequest>) -> Result<impl IntoResponse, ApiError> {
    let Some(cmd) = Command::parse(&req.command) else {
        return Err(ApiError::BadRequest(format!("unknown command: {}", req.command)));
    };
    let result: CommandResult = handle_command(&state, cmd)?;
    Ok(Json(result))
}

#[derive(Serialize)]
struct HealthResponse {
    kernel_online: bool,
    last_beat: i64,
    db_path: String,
    nudges_pending_count: i64,
    last_daily_reflection: Option<i64>,
}

async fn health(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let conn = state.store.pool_conn()?;
    let nudges_pending_count = persistence::pending_nudge_count(&conn)?;
    let last_daily_reflection = persistence::last_daily_reflection_ts(&conn)?;
    let last_beat = *state.last_beat.read().expect("last_beat lock poisoned");

    Ok(Json(HealthResponse {
        kernel_online: true,
        last_beat,
        db_path: state.store.db_path().display().to_string(),
        nudges_pending_count,
        last_daily_reflection,
    }))
}

/// Bare liveness probe: no body logic, just confirms the process is serving.
async fn healthz() -> &'static str {
    "ok"
}

async fn metrics_text(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let body = metrics::render(&state)?;
    Ok(([(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::daemon::Daemon;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    async fn test_state() -> (tempfile::TempDir, AppState, Daemon) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.db_path = dir.path().join("barth.db");
        let daemon = Daemon::start(config).unwrap();
        let state = daemon.state.clone();
        (dir, state, daemon)
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let (_dir, state, daemon) = test_state().await;
        let app = router(state);

        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        daemon.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn pending_nudges_starts_empty() {
        let (_dir, state, daemon) = test_state().await;
        let app = router(state);

        let response = app
            .oneshot(Request::builder().uri("/api/nudges/pending").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        daemon.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_nudge_ack_is_not_found() {
        let (_dir, state, daemon) = test_state().await;
        let app = router(state);

        let response = app
            .oneshot(Request::builder().method("POST").uri("/api/nudges/999/ack").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        daemon.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn command_dispatch_logs_hydration() {
        let (_dir, state, daemon) = test_state().await;
        let app = router(state);

        let body = serde_json::json!({"command": "water_log_250"}).to_string();
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/command")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        daemon.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn metrics_mode_toggle_moves_route() {
        std::env::set_var("METRICS_INTERNAL_ONLY", "1");
        let (_dir, state, daemon) = test_state().await;
        let app = router(state);

        let internal = app
            .clone()
            .oneshot(Request::builder().uri("/internal/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(internal.status(), StatusCode::OK);

        let public = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(public.status(), StatusCode::NOT_FOUND);

        std::env::remove_var("METRICS_INTERNAL_ONLY");
        daemon.shutdown().await.unwrap();
    }
}
