mod platform;

use anyhow::Result;
use atelier_agent::events::ProgressEvent;
use atelier_agent::gateway::HttpGateway;
use atelier_agent::play::run_play_flow;
use atelier_agent::sandbox::platform::SandboxPlatform;
use atelier_agent::sandbox::{HandleCache, SessionManager};
use atelier_agent::stream::{STREAM_HEADERS, sse_frame};
use atelier_agent::token::{HistoryMessage, PlayTokenPayload, RunTokenPayload, TokenSigner};
use atelier_agent::{RunnerDeps, resume_agent_flow, run_agent_flow};
use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{HeaderName, HeaderValue, StatusCode},
    response::Response,
    routing::{delete, get, post},
};
use clap::Parser;
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use uuid::Uuid;

use crate::platform::RemotePlatform;

const PROBE_TIMEOUT: Duration = Duration::from_secs(8);

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Address to bind the service to
    #[arg(long, default_value = "0.0.0.0:8081")]
    addr: String,
}

#[derive(Clone)]
struct ServerState {
    deps: RunnerDeps,
    platform: Arc<dyn SandboxPlatform>,
    gateway: Arc<HttpGateway>,
    probe_http: reqwest::Client,
}

#[derive(Deserialize)]
struct RunRequest {
    user_id: String,
    #[serde(default)]
    message_history: Vec<HistoryMessage>,
    query: String,
    project: indexmap::IndexMap<String, String>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Deserialize)]
struct PlayRequest {
    user_id: String,
    project: indexmap::IndexMap<String, String>,
    entry_path: String,
    #[serde(default)]
    runtime: Option<String>,
    #[serde(default)]
    env: Option<HashMap<String, String>>,
}

#[derive(Deserialize)]
struct TokenQuery {
    token: String,
}

#[derive(Deserialize)]
struct ResumeQuery {
    token: String,
    result: String,
}

#[derive(Deserialize)]
struct StopQuery {
    token: String,
    #[serde(default)]
    sandbox_id: Option<String>,
}

#[derive(Deserialize)]
struct ProbeQuery {
    url: String,
}

fn make_task_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let suffix = Uuid::new_v4().simple().to_string();
    format!("task_{}_{}", millis, &suffix[..8])
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("atelier_service=info,atelier_agent=info"));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let args = Args::parse();
    let http = reqwest::Client::new();
    let probe_http = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::limited(10))
        .timeout(PROBE_TIMEOUT)
        .build()?;

    let signer = Arc::new(TokenSigner::from_env());
    let gateway = Arc::new(HttpGateway::from_env(http.clone())?);
    let platform: Arc<dyn SandboxPlatform> = Arc::new(RemotePlatform::from_env(http.clone())?);
    let sessions = Arc::new(SessionManager::new(
        platform.clone(),
        Arc::new(HandleCache::new()),
    ));

    let state = ServerState {
        deps: RunnerDeps {
            chat: gateway.clone(),
            sessions,
            signer,
        },
        platform,
        gateway,
        probe_http,
    };

    let app = Router::new()
        .route("/", get(read_root))
        .route("/api/runs", post(create_run))
        .route("/api/runs/{run_id}/events", get(run_events))
        .route("/api/runs/{run_id}/resume", get(resume_run))
        .route("/api/play", post(create_play))
        .route("/api/play/probe", get(probe_url))
        .route("/api/play/{play_id}/events", get(play_events))
        .route("/api/play/{play_id}", delete(stop_play))
        .route("/api/models", get(list_models))
        .layer(CorsLayer::permissive())
        .with_state(state);

    info!(addr = %args.addr, "starting service");
    let listener = tokio::net::TcpListener::bind(&args.addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn read_root() -> Json<Value> {
    Json(json!({"hello": "atelier"}))
}

// ── runs ───────────────────────────────────────────────────────────────

async fn create_run(
    State(state): State<ServerState>,
    Json(request): Json<RunRequest>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let task_id = make_task_id();
    info!(
        task_id = %task_id,
        model = request.model.as_deref().unwrap_or("default"),
        query_len = request.query.len(),
        files = request.project.len(),
        "create_run"
    );

    let payload = RunTokenPayload {
        user_id: request.user_id,
        message_history: request.message_history,
        query: request.query,
        project: request.project,
        model: request.model,
    };
    let stream_token = state
        .deps
        .signer
        .sign(&payload)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(json!({"task_id": task_id, "stream_token": stream_token})))
}

async fn run_events(
    State(state): State<ServerState>,
    Path(run_id): Path<String>,
    Query(query): Query<TokenQuery>,
) -> Result<Response, (StatusCode, String)> {
    let payload: RunTokenPayload = state
        .deps
        .signer
        .verify(&query.token)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    let stream = run_agent_flow(state.deps.clone(), payload, run_id);
    Ok(sse_response(stream))
}

async fn resume_run(
    State(state): State<ServerState>,
    Path(run_id): Path<String>,
    Query(query): Query<ResumeQuery>,
) -> Result<Response, (StatusCode, String)> {
    let payload: RunTokenPayload = state
        .deps
        .signer
        .verify(&query.token)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    let stream = resume_agent_flow(state.deps.clone(), payload, run_id, query.result);
    Ok(sse_response(stream))
}

// ── play ───────────────────────────────────────────────────────────────

async fn create_play(
    State(state): State<ServerState>,
    Json(request): Json<PlayRequest>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let task_id = make_task_id();
    let payload = PlayTokenPayload {
        user_id: request.user_id,
        project: request.project,
        entry_path: request.entry_path,
        runtime: request.runtime,
        env: request.env.unwrap_or_default(),
    };
    let stream_token = state
        .deps
        .signer
        .sign(&payload)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(json!({"task_id": task_id, "stream_token": stream_token})))
}

async fn play_events(
    State(state): State<ServerState>,
    Path(play_id): Path<String>,
    Query(query): Query<TokenQuery>,
) -> Result<Response, (StatusCode, String)> {
    let payload: PlayTokenPayload = state
        .deps
        .signer
        .verify(&query.token)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    let stream = run_play_flow(state.platform.clone(), payload, play_id);
    Ok(sse_response(stream))
}

async fn stop_play(
    State(state): State<ServerState>,
    Path(_play_id): Path<String>,
    Query(query): Query<StopQuery>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let _: PlayTokenPayload = state
        .deps
        .signer
        .verify(&query.token)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    let Some(sandbox_id) = query.sandbox_id else {
        return Ok(Json(json!({"ok": false, "error": "missing sandbox_id"})));
    };
    match state.deps.sessions.stop_by_id(&sandbox_id).await {
        Ok(()) => Ok(Json(json!({"ok": true, "stopped": true}))),
        Err(e) => Ok(Json(json!({"ok": false, "error": e.to_string()}))),
    }
}

/// Server-side URL probe: HEAD first, then a body-less GET fallback for
/// servers that reject HEAD.
async fn probe_url(
    State(state): State<ServerState>,
    Query(query): Query<ProbeQuery>,
) -> Json<Value> {
    let status = match state.probe_http.head(&query.url).send().await {
        Ok(resp) => Some(resp.status().as_u16()),
        Err(_) => state
            .probe_http
            .get(&query.url)
            .send()
            .await
            .ok()
            .map(|resp| resp.status().as_u16()),
    };
    Json(json!({"ok": status.is_some(), "status": status}))
}

// ── models ─────────────────────────────────────────────────────────────

async fn list_models(State(state): State<ServerState>) -> Json<Value> {
    let models = state.gateway.list_models().await;
    Json(json!({"models": models}))
}

// ── streaming ──────────────────────────────────────────────────────────

/// Wrap a progress stream as an event-stream response: frames and headers
/// both come from the agent crate's stream layer.
fn sse_response(stream: impl Stream<Item = ProgressEvent> + Send + 'static) -> Response {
    let frames = stream.map(|event| Ok::<_, Infallible>(Bytes::from(sse_frame(&event))));
    let mut response = Response::new(Body::from_stream(frames));
    for (name, value) in STREAM_HEADERS {
        if let (Ok(name), Ok(value)) = (HeaderName::try_from(name), HeaderValue::try_from(value)) {
            response.headers_mut().insert(name, value);
        }
    }
    response
}
