use std::{collections::BTreeMap, sync::Arc};

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use flare_core::{ChatMessage, CredentialRecord, Identity, SessionClaims};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use uuid::Uuid;

use crate::{
    auth::{Authenticated, SESSION_COOKIE},
    error::ApiError,
    state::AppState,
    ws::ws_handler,
};

pub const DEFAULT_ALERT_LIMIT: usize = 50;
pub const MAX_ALERT_LIMIT: usize = 500;

const WELCOME_BANNER: &str = "Welcome to Flare, the SOS alert relay!";

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(home_handler))
        .route("/ws", get(ws_handler))
        .route("/register", post(register_handler))
        .route("/login", post(login_handler))
        .route("/login/check", get(login_check_handler))
        .route("/alerts", get(alerts_handler))
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub identity: Identity,
    pub token: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    active_connections: usize,
    identities: BTreeMap<String, usize>,
    pending_fanout: usize,
    hub_running: bool,
}

#[derive(Debug, Deserialize)]
struct AlertsQuery {
    limit: Option<usize>,
}

async fn home_handler() -> &'static str {
    WELCOME_BANNER
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

fn parse_credentials(
    payload: Result<Json<Credentials>, JsonRejection>,
) -> Result<Credentials, ApiError> {
    let Json(credentials) = payload.map_err(|err| ApiError::BadRequest(err.body_text()))?;
    Ok(credentials)
}

async fn register_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<Credentials>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let credentials = parse_credentials(payload)?;
    let identity = Identity::new(&credentials.username)
        .map_err(|err| ApiError::BadRequest(err.to_string()))?;

    state
        .accounts
        .create_account(CredentialRecord::new(identity.clone(), &credentials.password))
        .await?;

    counter!("flare_accounts_registered_total", 1);
    info!(identity = %identity, "account registered");
    Ok((StatusCode::CREATED, Json(json!({ "identity": identity }))))
}

async fn login_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<Credentials>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let credentials = parse_credentials(payload)?;
    let identity = Identity::new(&credentials.username).map_err(|_| ApiError::Unauthorized)?;

    let record = state.accounts.find_account(&identity).await?;
    let verified = record
        .as_ref()
        .map(|record| record.verify(&credentials.password))
        .unwrap_or(false);
    if !verified {
        counter!("flare_logins_total", 1, "outcome" => "rejected");
        return Err(ApiError::Unauthorized);
    }

    let claims = SessionClaims::issue(identity, state.settings.session_ttl);
    state.accounts.store_session(&claims).await?;
    counter!("flare_logins_total", 1, "outcome" => "accepted");
    info!(identity = %claims.identity, "login accepted");

    let cookie = format!(
        "{SESSION_COOKIE}={}; Path=/; Max-Age={}; HttpOnly",
        claims.token,
        state.settings.session_ttl.whole_seconds().max(0)
    );
    let body = LoginResponse {
        identity: claims.identity,
        token: claims.token,
        expires_at: claims.expires_at,
    };
    Ok(([(header::SET_COOKIE, cookie)], Json(body)))
}

async fn login_check_handler(Authenticated(identity): Authenticated) -> impl IntoResponse {
    Json(json!({ "identity": identity }))
}

/// Most recent distress alerts, newest first.
async fn alerts_handler(
    State(state): State<Arc<AppState>>,
    Authenticated(_identity): Authenticated,
    Query(query): Query<AlertsQuery>,
) -> Result<Json<Vec<ChatMessage>>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_ALERT_LIMIT)
        .min(MAX_ALERT_LIMIT);
    let alerts = state.messages.recent_priority(limit).await?;
    Ok(Json(alerts))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let registry = state.registry();
    Json(StatsResponse {
        active_connections: registry.len(),
        identities: registry.identity_counts(),
        pending_fanout: state.hub.pending(),
        hub_running: !state.hub.is_closed(),
    })
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.render_metrics() {
        Some(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            "metrics recorder not installed",
        )
            .into_response(),
    }
}
