//! Turning a presented session token into an [`Identity`].

use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, Query},
    http::{header, request::Parts, HeaderMap},
};
use flare_core::Identity;
use metrics::counter;
use serde::Deserialize;
use time::OffsetDateTime;
use tracing::warn;
use uuid::Uuid;

use crate::{
    error::{ApiError, AuthError},
    state::AppState,
    store::AccountStore,
};

pub const SESSION_COOKIE: &str = "flare_session";

/// What a caller presented when connecting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionContext {
    pub token: Option<String>,
    pub remote_addr: Option<SocketAddr>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TokenQuery {
    pub token: Option<String>,
}

impl ConnectionContext {
    /// Picks the token from `Authorization: Bearer`, then the session cookie,
    /// then the `?token=` query parameter.
    pub fn from_request(
        headers: &HeaderMap,
        query_token: Option<String>,
        remote_addr: Option<SocketAddr>,
    ) -> Self {
        let token = bearer_token(headers)
            .or_else(|| cookie_value(headers, SESSION_COOKIE))
            .or(query_token)
            .filter(|token| !token.is_empty());
        Self { token, remote_addr }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, value)| *key == name && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, ctx: &ConnectionContext) -> Result<Identity, AuthError>;
}

/// Resolves login tokens issued by `POST /login`.
pub struct TokenIdentityResolver {
    accounts: Arc<dyn AccountStore>,
}

impl TokenIdentityResolver {
    pub fn new(accounts: Arc<dyn AccountStore>) -> Self {
        Self { accounts }
    }
}

#[async_trait]
impl IdentityResolver for TokenIdentityResolver {
    async fn resolve(&self, ctx: &ConnectionContext) -> Result<Identity, AuthError> {
        let raw = ctx.token.as_deref().ok_or(AuthError::MissingToken)?;
        let token = Uuid::parse_str(raw).map_err(|_| AuthError::MalformedToken)?;
        let claims = self
            .accounts
            .load_session(token)
            .await?
            .ok_or(AuthError::UnknownToken)?;
        claims.ensure_not_expired(OffsetDateTime::now_utc())?;
        Ok(claims.identity)
    }
}

pub fn record_auth_failure(err: &AuthError) {
    counter!(
        "flare_auth_failures_total",
        1,
        "reason" => err.metric_label()
    );
}

/// Extractor for routes that need a logged-in caller.
pub struct Authenticated(pub Identity);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for Authenticated {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let query_token = Query::<TokenQuery>::try_from_uri(&parts.uri)
            .ok()
            .and_then(|Query(query)| query.token);
        let ctx = ConnectionContext::from_request(&parts.headers, query_token, None);
        match state.resolver.resolve(&ctx).await {
            Ok(identity) => Ok(Authenticated(identity)),
            Err(err) => {
                record_auth_failure(&err);
                warn!(error = %err, path = %parts.uri.path(), "rejected request");
                Err(err.into())
            }
        }
    }
}
