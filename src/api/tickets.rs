//! Ticket API endpoints.
//!
//! - POST `/` - Issue a one-time ticket for a progress stream
//! - GET `/metrics` - Ticket store size and counters (admin only)

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderName, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use super::error::ApiError;
use super::{ClientIp, HasClientIpSource};
use crate::audit::{AuditEvent, AuditSink};
use crate::auth::{ADMIN_ROLE, Auth, StreamResource, TICKET_QUERY_PARAM, TokenResolver};
use crate::impl_has_auth_backend;
use crate::rate_limit::{RateLimiter, TICKET_POLICY};
use crate::tickets::{ResourceType, TicketStore, TicketStoreSnapshot};

/// Longest accepted resource identifier (the S3 object key limit).
const MAX_RESOURCE_LEN: usize = 1024;

#[derive(Clone)]
pub struct TicketsState {
    pub resolver: Arc<TokenResolver>,
    pub tickets: Arc<TicketStore>,
    pub rate_limiter: Arc<dyn RateLimiter>,
    pub audit: Arc<dyn AuditSink>,
    pub ip_header: Option<HeaderName>,
    /// Prefix the API is mounted under, used to build stream URLs
    pub api_prefix: String,
}

impl_has_auth_backend!(TicketsState);

impl HasClientIpSource for TicketsState {
    fn ip_header(&self) -> Option<&HeaderName> {
        self.ip_header.as_ref()
    }
}

pub fn router(state: TicketsState) -> Router {
    Router::new()
        .route("/", post(issue_ticket))
        .route("/metrics", get(metrics))
        .with_state(state)
}

#[derive(Deserialize)]
struct IssueTicketRequest {
    resource: String,
    resource_type: ResourceType,
}

#[derive(Serialize)]
struct IssueTicketResponse {
    ticket: String,
    /// Unix milliseconds
    expires_at: u64,
    /// Stream URL with the ticket attached
    url: String,
}

async fn issue_ticket(
    State(state): State<TicketsState>,
    Auth(identity): Auth,
    ClientIp(client_ip): ClientIp,
    Json(payload): Json<IssueTicketRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if payload.resource.trim().is_empty() {
        return Err(ApiError::bad_request("Resource cannot be empty"));
    }
    if payload.resource.len() > MAX_RESOURCE_LEN {
        return Err(ApiError::bad_request("Resource is too long"));
    }

    let limit_key = format!("ticket:{}", client_ip);
    if TICKET_POLICY.exceeded(state.rate_limiter.as_ref(), &limit_key) {
        let retry_after = state.rate_limiter.reset_time(&limit_key);
        state.audit.record(AuditEvent::TicketRateLimited {
            username: identity.username,
            client_ip,
            retry_after_secs: retry_after,
        });
        return Err(ApiError::too_many_requests(
            "Too many ticket requests. Please wait before trying again.",
            retry_after,
        ));
    }

    let issued = state
        .tickets
        .issue(&identity, &payload.resource, payload.resource_type);

    let target = StreamResource {
        resource: payload.resource,
        resource_type: payload.resource_type,
    };
    let url = format!(
        "{}{}?{}={}",
        state.api_prefix,
        target.path(),
        TICKET_QUERY_PARAM,
        issued.ticket
    );

    state.audit.record(AuditEvent::TicketIssued {
        username: identity.username,
        resource: target.resource,
        resource_type: target.resource_type,
        client_ip,
    });

    Ok((
        StatusCode::CREATED,
        Json(IssueTicketResponse {
            ticket: issued.ticket,
            expires_at: issued.expires_at,
            url,
        }),
    ))
}

async fn metrics(
    State(state): State<TicketsState>,
    Auth(identity): Auth,
) -> Result<Json<TicketStoreSnapshot>, ApiError> {
    if !identity.has_role(ADMIN_ROLE) {
        return Err(ApiError::forbidden("Insufficient permissions"));
    }
    Ok(Json(state.tickets.snapshot()))
}
