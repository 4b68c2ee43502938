//! HTTP server implementation using Axum.
//!
//! Handlers are thin: they translate requests into pool and session
//! calls, run the blocking work on the blocking thread pool, and map
//! every failure to a uniform 400 `{message}` body.

use crate::error::PoolError;
use crate::runtime::open_session;
use crate::state::AppState;
use crate::store::VmId;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::interval;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

// Request/Response types
#[derive(Deserialize)]
struct ScreenshotQuery {
    #[serde(rename = "vmId")]
    vm_id: VmId,
}

#[derive(Serialize)]
struct ScreenshotResponse {
    screenshot: String,
    vm_id: VmId,
}

#[derive(Deserialize)]
struct ResetRequest {
    task_config: serde_json::Value,
    timeout: u64,
}

#[derive(Serialize)]
struct ResetResponse {
    screenshot: String,
    problem: String,
    vm_id: VmId,
}

#[derive(Deserialize)]
struct StepRequest {
    action: String,
    vm_id: VmId,
}

#[derive(Serialize)]
struct StepResponse {
    screenshot: String,
    is_finish: bool,
    reward: f64,
}

/// A single VM id, or the literal `"all"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum VmSelector {
    Id(VmId),
    Keyword(String),
}

#[derive(Deserialize)]
struct ShutdownRequest {
    vm_id: VmSelector,
}

#[derive(Serialize)]
struct ShutdownResponse {
    vm_id: VmSelector,
}

#[derive(Serialize)]
struct VmInfo {
    vm_id: VmId,
    timeout: u64,
    lifetime: u64,
    visited: bool,
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
}

/// Uniform client-visible failure: HTTP 400 with `{message}`.
struct ApiError(String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (StatusCode::BAD_REQUEST, Json(ErrorBody { message: self.0 })).into_response()
    }
}

impl From<PoolError> for ApiError {
    fn from(e: PoolError) -> Self {
        ApiError(e.to_string())
    }
}

async fn run_blocking<T: Send + 'static>(
    f: impl FnOnce() -> Result<T, PoolError> + Send + 'static,
) -> Result<T, ApiError> {
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(ApiError::from),
        Err(e) => Err(ApiError(e.to_string())),
    }
}

/// Run the HTTP server on the given port with the provided state.
pub async fn run_server(port: u16, state: AppState) {
    if state.reaper_enabled {
        spawn_reaper(&state);
    }

    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/screenshot", get(screenshot))
        .route("/reset", post(reset))
        .route("/step", post(step))
        .route("/shutdown", post(shutdown))
        // Observability
        .route("/vms", get(list_vms))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn spawn_reaper(state: &AppState) {
    let pool = state.pool.clone();
    let period = Duration::from_secs(pool.sweep_interval());
    tokio::spawn(async move {
        let mut interval = interval(period);
        interval.tick().await; // first tick completes immediately
        loop {
            interval.tick().await;
            let pool = pool.clone();
            match tokio::task::spawn_blocking(move || pool.sweep()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => error!("Lease sweep failed: {}", e),
                Err(e) => error!("Lease sweep task failed: {}", e),
            }
        }
    });
}

async fn health() -> &'static str {
    "OK"
}

async fn screenshot(
    State(state): State<AppState>,
    Query(query): Query<ScreenshotQuery>,
) -> Result<Json<ScreenshotResponse>, ApiError> {
    let vm_id = query.vm_id;
    let pool = state.pool.clone();
    let backend = state.backend.clone();

    let frame = run_blocking(move || {
        let mut session = open_session(&pool, backend.as_ref(), vm_id)?;
        let frame = session.render()?;
        pool.touch(vm_id)?;
        Ok(frame)
    })
    .await?;

    info!(vm_id, "Captured screenshot");
    Ok(Json(ScreenshotResponse {
        screenshot: BASE64.encode(frame),
        vm_id,
    }))
}

async fn reset(
    State(state): State<AppState>,
    Json(req): Json<ResetRequest>,
) -> Result<Json<ResetResponse>, ApiError> {
    let pool = state.pool.clone();
    let backend = state.backend.clone();

    let (vm_id, observation) = run_blocking(move || {
        let vm_id = pool.allocate()?;
        let initialized = open_session(&pool, backend.as_ref(), vm_id)
            .and_then(|mut session| session.reset(&req.task_config))
            .and_then(|observation| {
                pool.set_lease(vm_id, req.timeout)?;
                Ok(observation)
            });
        match initialized {
            Ok(observation) => Ok((vm_id, observation)),
            Err(e) => {
                // Hand the slot back rather than leaking it until the reaper.
                if let Err(release_err) = pool.release(vm_id) {
                    error!(vm_id, "Failed to release VM after failed reset: {}", release_err);
                }
                Err(e)
            }
        }
    })
    .await?;

    info!(vm_id, "Reset VM");
    Ok(Json(ResetResponse {
        screenshot: BASE64.encode(observation.screenshot),
        problem: observation.instruction,
        vm_id,
    }))
}

async fn step(
    State(state): State<AppState>,
    Json(req): Json<StepRequest>,
) -> Result<Json<StepResponse>, ApiError> {
    let vm_id = req.vm_id;
    let pool = state.pool.clone();
    let backend = state.backend.clone();

    let response = run_blocking(move || {
        let mut session = open_session(&pool, backend.as_ref(), vm_id)?;
        pool.touch(vm_id)?;
        let outcome = session.step(&req.action)?;
        let reward = if outcome.done {
            let reward = session.evaluate()?;
            pool.release(vm_id)?;
            reward
        } else {
            outcome.reward
        };
        Ok(StepResponse {
            screenshot: BASE64.encode(outcome.screenshot),
            is_finish: outcome.done,
            reward,
        })
    })
    .await?;

    info!(vm_id, is_finish = response.is_finish, "Stepped VM");
    Ok(Json(response))
}

async fn shutdown(
    State(state): State<AppState>,
    Json(req): Json<ShutdownRequest>,
) -> Result<Json<ShutdownResponse>, ApiError> {
    let pool = state.pool.clone();

    match req.vm_id {
        VmSelector::Id(id) => run_blocking(move || pool.release(id)).await?,
        VmSelector::Keyword(ref word) if word == "all" => {
            run_blocking(move || pool.release_all().map(|_| ())).await?
        }
        VmSelector::Keyword(ref word) => {
            return Err(ApiError(format!("unknown shutdown target {:?}", word)))
        }
    }

    Ok(Json(ShutdownResponse { vm_id: req.vm_id }))
}

async fn list_vms(State(state): State<AppState>) -> Result<Json<Vec<VmInfo>>, ApiError> {
    let pool = state.pool.clone();
    let snapshot = run_blocking(move || pool.snapshot()).await?;

    let mut list: Vec<VmInfo> = snapshot
        .leased
        .iter()
        .map(|&vm_id| {
            let record = snapshot.leases.get(&vm_id);
            VmInfo {
                vm_id,
                timeout: record.map_or(0, |r| r.timeout),
                lifetime: record.map_or(0, |r| r.lifetime),
                visited: record.is_some_and(|r| r.visited),
            }
        })
        .collect();
    list.sort_by_key(|info| info.vm_id);
    Ok(Json(list))
}
