//! HTTP event surface.
//!
//! The messaging collaborator (a Telegram webhook bridge, a test client,
//! anything that speaks JSON) posts inbound events here and relays the
//! returned text back to the user.
//!
//! # Endpoints
//!
//! | Method | Path | Body | Response |
//! |--------|------|------|----------|
//! | `GET`  | `/`, `/health` | | `{status, version, started_at}` |
//! | `POST` | `/events/message` | `{user_id, text}` | `{reply}` |
//! | `POST` | `/events/archive?user_id=..&filename=..` | raw ZIP bytes | `{reply}` |
//! | `POST` | `/events/archive-url` | `{user_id, filename, url}` | `{reply}` |
//!
//! `user_id` may be a JSON string or number.
//!
//! # Authentication
//!
//! Every `/events/*` request must carry the messaging token in the
//! `X-Telegram-Bot-Api-Secret-Token` header. Only the liveness routes
//! are open, and only they answer cross-origin requests.
//!
//! # Error Contract
//!
//! Rejected requests get `{ "error": { "code": "..", "message": ".." } }`:
//!
//! | Status | Code |
//! |--------|------|
//! | 400 | `bad_request` |
//! | 401 | `unauthorized` |
//! | 413 | `payload_too_large` |
//!
//! Failures inside the relay are not HTTP errors; they come back as a
//! normal `{reply}` explaining the problem to the user.

use axum::{
    body::Bytes,
    extract::{
        rejection::{BytesRejection, JsonRejection, QueryRejection},
        DefaultBodyLimit, Query, Request, State,
    },
    http::{Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info};

use crate::config::{Config, ConfigError};
use crate::models::UserId;
use crate::relay::{InboundEvent, Relay};

const PURGE_INTERVAL: Duration = Duration::from_secs(300);

/// Header carrying the shared secret on event posts.
pub const SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

#[derive(Clone)]
struct AppState {
    relay: Arc<Relay>,
    secret: Arc<str>,
    started_at: DateTime<Utc>,
}

/// Builds the router around an existing relay. Event posts must present
/// `secret`; `body_limit` caps raw archive uploads.
pub fn router(relay: Arc<Relay>, secret: &str, body_limit: usize) -> Router {
    let state = AppState {
        relay,
        secret: Arc::from(secret),
        started_at: Utc::now(),
    };

    let events = Router::new()
        .route("/events/message", post(handle_message))
        .route("/events/archive", post(handle_archive))
        .route("/events/archive-url", post(handle_archive_url))
        .layer(DefaultBodyLimit::max(body_limit))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_secret,
        ));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET]);
    let liveness = Router::new()
        .route("/", get(handle_health))
        .route("/health", get(handle_health))
        .layer(cors);

    liveness.merge(events).with_state(state)
}

/// Serves the event surface until Ctrl-C.
///
/// Requires the serving credentials (completion keys and the messaging
/// token). Expired sessions are purged in the background.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    config.credentials.require_serving()?;
    let secret = config
        .credentials
        .messaging_token
        .as_deref()
        .ok_or(ConfigError::MissingCredential("TELEGRAM_BOT_TOKEN"))?;

    let relay = Arc::new(Relay::from_config(config)?);
    let body_limit = usize::try_from(config.intake.max_download_bytes).unwrap_or(usize::MAX);
    let app = router(relay.clone(), secret, body_limit);

    let sessions = relay.sessions().clone();
    let purger = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PURGE_INTERVAL);
        loop {
            ticker.tick().await;
            let purged = sessions.purge_expired();
            if purged > 0 {
                debug!(purged, "expired sessions purged");
            }
        }
    });

    let bind_addr = config.server.bind_addr();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "relay listening");
    println!("Relay listening on http://{}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    purger.abort();
    info!("relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    // If the handler cannot be installed, run until killed.
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

/// Maps an extractor rejection into the error envelope. Everything but an
/// oversized body is a plain bad request.
fn rejected(status: StatusCode, message: String) -> AppError {
    if status == StatusCode::PAYLOAD_TOO_LARGE {
        AppError {
            status,
            code: "payload_too_large".to_string(),
            message,
        }
    } else {
        bad_request(message)
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        rejected(rejection.status(), rejection.body_text())
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        rejected(rejection.status(), rejection.body_text())
    }
}

impl From<BytesRejection> for AppError {
    fn from(rejection: BytesRejection) -> Self {
        rejected(rejection.status(), rejection.body_text())
    }
}

// ============ Authentication ============

async fn require_secret(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let presented = request
        .headers()
        .get(SECRET_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if !constant_time_eq(presented, &state.secret) {
        debug!(path = %request.uri().path(), "event rejected: bad or missing secret");
        return Err(AppError {
            status: StatusCode::UNAUTHORIZED,
            code: "unauthorized".to_string(),
            message: format!("missing or invalid {} header", SECRET_HEADER),
        });
    }
    Ok(next.run(request).await)
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        diff |= x ^ y;
    }
    diff == 0
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    started_at: String,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "running",
        version: env!("CARGO_PKG_VERSION"),
        started_at: state.started_at.to_rfc3339(),
    })
}

// ============ POST /events/* ============

#[derive(Serialize)]
struct ReplyResponse {
    reply: String,
}

#[derive(Deserialize)]
struct MessageRequest {
    user_id: UserId,
    text: String,
}

async fn handle_message(
    State(state): State<AppState>,
    payload: Result<Json<MessageRequest>, JsonRejection>,
) -> Result<Json<ReplyResponse>, AppError> {
    let Json(req) = payload?;
    dispatch(
        &state,
        InboundEvent::Text {
            user: req.user_id,
            text: req.text,
        },
    )
    .await
}

#[derive(Deserialize)]
struct ArchiveQuery {
    user_id: UserId,
    filename: String,
}

async fn handle_archive(
    State(state): State<AppState>,
    query: Result<Query<ArchiveQuery>, QueryRejection>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<ReplyResponse>, AppError> {
    let Query(query) = query?;
    let body = body?;
    if body.is_empty() {
        return Err(bad_request("archive body must not be empty"));
    }
    dispatch(
        &state,
        InboundEvent::Archive {
            user: query.user_id,
            filename: query.filename,
            bytes: body.to_vec(),
        },
    )
    .await
}

#[derive(Deserialize)]
struct ArchiveUrlRequest {
    user_id: UserId,
    filename: String,
    url: String,
}

async fn handle_archive_url(
    State(state): State<AppState>,
    payload: Result<Json<ArchiveUrlRequest>, JsonRejection>,
) -> Result<Json<ReplyResponse>, AppError> {
    let Json(req) = payload?;
    if req.url.trim().is_empty() {
        return Err(bad_request("url must not be empty"));
    }
    dispatch(
        &state,
        InboundEvent::ArchiveUrl {
            user: req.user_id,
            filename: req.filename,
            url: req.url,
        },
    )
    .await
}

async fn dispatch(state: &AppState, event: InboundEvent) -> Result<Json<ReplyResponse>, AppError> {
    let reply = state.relay.handle(event).await;
    Ok(Json(ReplyResponse { reply: reply.text }))
}
