use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use hexforge_engine::{CraftError, Engine, EventSink};
use hexforge_protocol::{
    Blueprint, CancelCraftRequest, CancelResponse, CraftEvent, CraftResponse, CraftingQueueItem,
    DepositRequest, ErrorKind, ErrorResponse, ItemStorage, LearnBlueprintRequest, LearnResponse,
    LoggedEvent, StartCraftRequest,
};
use serde::Deserialize;
use std::net::IpAddr;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{error, info};

pub mod config;
pub mod sweeper;
pub mod timers;

pub use config::{Cli, SeedFile, ServerConfig};

const MAX_EVENTS_PAGE: usize = 500;

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
}

/// Logs every committed crafting event; broadcast consumers read the event log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn publish(&self, event: &CraftEvent) {
        info!(
            kind = event.kind(),
            node_id = event.node_id(),
            session_id = event.session_id(),
            "craft event"
        );
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/nodes/{node_id}/crafting/queue", get(crafting_queue))
        .route("/api/nodes/{node_id}/crafting/start", post(start_craft))
        .route("/api/nodes/{node_id}/crafting/cancel", post(cancel_craft))
        .route("/api/nodes/{node_id}/blueprints", get(available_blueprints))
        .route("/api/nodes/{node_id}/blueprints/learn", post(learn_blueprint))
        .route("/api/nodes/{node_id}/storage/deposit", post(deposit))
        .route("/api/events", get(events))
        .with_state(Arc::new(state))
        // Local security: allow only loopback + Tailscale by default.
        .layer(middleware::from_fn(ip_allowlist))
        // Never use `Access-Control-Allow-Origin: *` here; it makes it easier for a random
        // website in your browser to drive crafting on a local node.
        .layer(local_only_cors())
}

#[derive(Debug)]
pub struct ApiError(CraftError);

impl From<CraftError> for ApiError {
    fn from(e: CraftError) -> Self {
        Self(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        Self(CraftError::Validation(e.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = match kind {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Unauthorized => StatusCode::FORBIDDEN,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Rule => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = if kind == ErrorKind::Internal {
            error!(error = ?self.0, "request failed");
            "internal error".to_string()
        } else {
            self.0.to_string()
        };
        (status, Json(ErrorResponse::new(kind, message))).into_response()
    }
}

type Shared = State<Arc<AppState>>;

async fn health() -> &'static str {
    "ok"
}

async fn crafting_queue(
    State(state): Shared,
    Path(node_id): Path<String>,
) -> Result<Json<Vec<CraftingQueueItem>>, ApiError> {
    Ok(Json(state.engine.get_crafting_queue(&node_id)?))
}

async fn start_craft(
    State(state): Shared,
    Path(node_id): Path<String>,
    body: Result<Json<StartCraftRequest>, JsonRejection>,
) -> Result<Json<CraftResponse>, ApiError> {
    let Json(req) = body?;
    let quantity = req.quantity.as_i64().ok_or_else(|| {
        CraftError::Validation("quantity must be a positive integer".to_string())
    })?;
    let out = state.engine.start_crafting(
        &node_id,
        &req.player_id,
        &req.session_id,
        &req.blueprint_id,
        quantity,
    )?;
    Ok(Json(CraftResponse {
        success: true,
        queue: out.queue,
        storage: out.storage,
    }))
}

async fn cancel_craft(
    State(state): Shared,
    Path(node_id): Path<String>,
    body: Result<Json<CancelCraftRequest>, JsonRejection>,
) -> Result<Json<CancelResponse>, ApiError> {
    let Json(req) = body?;
    let out = state
        .engine
        .cancel_craft(&node_id, &req.player_id, &req.queue_item_id)?;
    Ok(Json(CancelResponse {
        success: true,
        queue: out.queue,
        storage: out.storage,
        refunded: out.refunded,
    }))
}

async fn learn_blueprint(
    State(state): Shared,
    Path(node_id): Path<String>,
    body: Result<Json<LearnBlueprintRequest>, JsonRejection>,
) -> Result<Json<LearnResponse>, ApiError> {
    let Json(req) = body?;
    let out = state.engine.learn_blueprint(
        &node_id,
        &req.player_id,
        &req.session_id,
        &req.blueprint_item_id,
    )?;
    Ok(Json(LearnResponse {
        success: true,
        storage: out.storage,
        learned_blueprint_id: out.learned_blueprint_id,
        already_learned: out.already_learned,
    }))
}

#[derive(Debug, Deserialize)]
struct PlayerQuery {
    #[serde(default)]
    player_id: String,
    #[serde(default)]
    session_id: String,
}

async fn available_blueprints(
    State(state): Shared,
    Path(node_id): Path<String>,
    Query(q): Query<PlayerQuery>,
) -> Result<Json<Vec<Blueprint>>, ApiError> {
    Ok(Json(state.engine.available_blueprints_for_node(
        &node_id,
        &q.player_id,
        &q.session_id,
    )?))
}

async fn deposit(
    State(state): Shared,
    Path(node_id): Path<String>,
    body: Result<Json<DepositRequest>, JsonRejection>,
) -> Result<Json<ItemStorage>, ApiError> {
    let Json(req) = body?;
    Ok(Json(state.engine.deposit_items(&node_id, &req.items)?))
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    #[serde(default)]
    after: i64,
    #[serde(default)]
    limit: Option<usize>,
}

async fn events(
    State(state): Shared,
    Query(q): Query<EventsQuery>,
) -> Result<Json<Vec<LoggedEvent>>, ApiError> {
    let limit = q.limit.unwrap_or(100).clamp(1, MAX_EVENTS_PAGE);
    let page = state
        .engine
        .events_since(q.after, limit)
        .map_err(CraftError::Internal)?;
    Ok(Json(page))
}

pub async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    serve_listener(listener, &config, shutdown_signal()).await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "install ctrl-c handler");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

/// Wire the engine to both completion paths and serve until `shutdown` resolves.
pub async fn serve_listener(
    listener: tokio::net::TcpListener,
    config: &ServerConfig,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<SocketAddr> {
    let (scheduler, timer_rx) = timers::TokioScheduler::channel();
    let engine = Engine::new(config.db_path.clone())
        .with_scheduler(Arc::new(scheduler))
        .with_events(Arc::new(TracingSink))
        .with_catalog_ttl(config.catalog_ttl());
    // Fail fast if sqlite is unavailable.
    engine.open()?;

    if let Some(path) = &config.seed {
        let report = SeedFile::load(path)?.apply(&engine)?;
        info!(?report, seed = %path.display(), "seed applied");
    }

    let timer_task = tokio::spawn(timers::run_timers(engine.clone(), timer_rx));
    let rearmed = engine.rearm()?;
    let sweep_task = tokio::spawn(sweeper::run_sweeper(
        engine.clone(),
        config.sweep_settings(),
    ));

    let app = build_router(AppState { engine });
    let addr = listener.local_addr()?;
    info!(%addr, db = %config.db_path.display(), rearmed, "hexforge server listening");
    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await;

    sweep_task.abort();
    timer_task.abort();
    served?;
    Ok(addr)
}

async fn ip_allowlist(
    axum::extract::ConnectInfo(peer): axum::extract::ConnectInfo<SocketAddr>,
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let ip = peer.ip();
    if is_allowed_peer_ip(ip) {
        return next.run(req).await;
    }
    (StatusCode::FORBIDDEN, "forbidden").into_response()
}

fn is_allowed_peer_ip(ip: IpAddr) -> bool {
    if ip.is_loopback() {
        return true;
    }

    // Tailscale CGNAT range (100.64.0.0/10).
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            // 100.64.0.0 - 100.127.255.255
            o[0] == 100 && (64..=127).contains(&o[1])
        }
        IpAddr::V6(_v6) => false,
    }
}

fn local_only_cors() -> CorsLayer {
    use axum::http::header;
    use axum::http::HeaderValue;
    use axum::http::Method;

    CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
        .allow_origin(AllowOrigin::predicate(|origin: &HeaderValue, _req| {
            is_allowed_local_origin(origin)
        }))
}

fn is_allowed_local_origin(origin: &axum::http::HeaderValue) -> bool {
    let Ok(s) = origin.to_str() else {
        return false;
    };

    // Game clients in dev and local reverse proxies.
    is_http_origin_for_host(s, "localhost") || is_http_origin_for_host(s, "127.0.0.1")
}

fn is_http_origin_for_host(origin: &str, host: &str) -> bool {
    for scheme in ["http://", "https://"] {
        if let Some(rest) = origin.strip_prefix(scheme) {
            if let Some(after) = rest.strip_prefix(host) {
                // Origin is just scheme://host[:port]
                return after.is_empty() || after.starts_with(':');
            }
        }
    }
    false
}

#[cfg(test)]
mod tests;
