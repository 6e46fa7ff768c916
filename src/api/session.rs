//! Session API endpoints.
//!
//! - POST `/login` - Check credentials, set the session cookie, return the token
//! - POST `/logout` - Clear the session cookie
//! - GET `/me` - Current identity
//! - GET `/status` - Whether auth is enabled and the caller is signed in

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header::SET_COOKIE},
    response::IntoResponse,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use super::error::ApiError;
use super::{ClientIp, HasClientIpSource};
use crate::Credentials;
use crate::audit::{AuditEvent, AuditSink};
use crate::auth::{
    ADMIN_ROLE, Auth, Identity, OptionalAuth, TokenResolver, clear_session_cookie, session_cookie,
};
use crate::impl_has_auth_backend;
use crate::rate_limit::{LOGIN_POLICY, RateLimiter};

#[derive(Clone)]
pub struct SessionState {
    pub resolver: Arc<TokenResolver>,
    pub rate_limiter: Arc<dyn RateLimiter>,
    pub audit: Arc<dyn AuditSink>,
    /// `None` when authentication is disabled
    pub credentials: Option<Arc<Credentials>>,
    pub session_ttl: std::time::Duration,
    pub secure_cookies: bool,
    pub ip_header: Option<axum::http::HeaderName>,
    pub allowed_locations: Vec<String>,
}

impl_has_auth_backend!(SessionState);

impl HasClientIpSource for SessionState {
    fn ip_header(&self) -> Option<&axum::http::HeaderName> {
        self.ip_header.as_ref()
    }
}

pub fn router(state: SessionState) -> Router {
    Router::new()
        .route("/login", post(login))
        .route("/logout", post(logout))
        .route("/me", get(me))
        .route("/status", get(status))
        .with_state(state)
}

#[derive(Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Serialize)]
struct LoginResponse {
    token: String,
    /// Unix seconds
    expires_at: u64,
    user: Identity,
}

async fn login(
    State(state): State<SessionState>,
    ClientIp(client_ip): ClientIp,
    Json(payload): Json<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let Some(credentials) = state.credentials.as_ref() else {
        return Err(ApiError::bad_request("Authentication is disabled"));
    };

    let limit_key = format!("login:{}", client_ip);
    if LOGIN_POLICY.exceeded(state.rate_limiter.as_ref(), &limit_key) {
        let retry_after = state.rate_limiter.reset_time(&limit_key);
        state.audit.record(AuditEvent::LoginRateLimited {
            client_ip,
            retry_after_secs: retry_after,
        });
        return Err(ApiError::too_many_requests(
            "Too many authentication attempts. Please wait before trying again.",
            retry_after,
        ));
    }

    if !credentials.matches(&payload.username, &payload.password) {
        state.audit.record(AuditEvent::LoginFailed {
            username: payload.username,
            client_ip,
        });
        return Err(ApiError::unauthorized("Invalid username or password"));
    }

    let identity = Identity {
        id: credentials.username.clone(),
        username: credentials.username.clone(),
        roles: vec![ADMIN_ROLE.to_string()],
        allowed_locations: state.allowed_locations.clone(),
    };

    let signed = state
        .resolver
        .jwt()
        .sign(&identity, state.session_ttl)
        .map_err(|e| ApiError::internal("Failed to sign session token", e))?;

    let cookie = session_cookie(
        &state.resolver.cookie_signer().sign(&signed.token),
        signed.duration,
        state.secure_cookies,
    );

    state.audit.record(AuditEvent::LoginSucceeded {
        username: identity.username.clone(),
        client_ip,
    });

    Ok((
        StatusCode::OK,
        [(SET_COOKIE, cookie)],
        Json(LoginResponse {
            token: signed.token,
            expires_at: signed.expires_at,
            user: identity,
        }),
    ))
}

async fn logout(
    State(state): State<SessionState>,
    OptionalAuth(identity): OptionalAuth,
    ClientIp(client_ip): ClientIp,
) -> impl IntoResponse {
    state.audit.record(AuditEvent::Logout {
        username: identity.map(|i| i.username),
        client_ip,
    });

    (
        StatusCode::NO_CONTENT,
        [(SET_COOKIE, clear_session_cookie(state.secure_cookies))],
    )
}

async fn me(Auth(identity): Auth) -> Json<Identity> {
    Json(identity)
}

#[derive(Serialize)]
struct StatusResponse {
    auth_disabled: bool,
    authenticated: bool,
    username: Option<String>,
}

async fn status(
    State(state): State<SessionState>,
    OptionalAuth(identity): OptionalAuth,
) -> Json<StatusResponse> {
    Json(StatusResponse {
        auth_disabled: state.credentials.is_none(),
        authenticated: identity.is_some(),
        username: identity.map(|i| i.username),
    })
}
