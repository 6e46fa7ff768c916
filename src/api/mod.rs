mod error;
mod progress;
mod session;
#[cfg(feature = "test-mode")]
mod test;
mod tickets;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::FromRequestParts,
    http::{HeaderName, request::Parts},
};
use tracing::warn;

use crate::Credentials;
use crate::audit::AuditSink;
use crate::auth::{TokenResolver, extract_client_ip};
use crate::progress::ProgressHub;
use crate::rate_limit::RateLimiter;
use crate::tickets::TicketStore;

pub use error::ApiError;

/// Everything the API handlers share.
#[derive(Clone)]
pub struct ApiContext {
    pub resolver: Arc<TokenResolver>,
    pub tickets: Arc<TicketStore>,
    pub rate_limiter: Arc<dyn RateLimiter>,
    pub audit: Arc<dyn AuditSink>,
    pub progress: ProgressHub,
    /// `None` when authentication is disabled
    pub credentials: Option<Arc<Credentials>>,
    pub session_ttl: Duration,
    pub secure_cookies: bool,
    pub ip_header: Option<HeaderName>,
    pub allowed_locations: Vec<String>,
    /// Prefix the router returned by [`create_api_router`] is nested under
    pub api_prefix: String,
}

/// Create the API router.
pub fn create_api_router(ctx: ApiContext) -> Router {
    let session_state = session::SessionState {
        resolver: ctx.resolver.clone(),
        rate_limiter: ctx.rate_limiter.clone(),
        audit: ctx.audit.clone(),
        credentials: ctx.credentials,
        session_ttl: ctx.session_ttl,
        secure_cookies: ctx.secure_cookies,
        ip_header: ctx.ip_header.clone(),
        allowed_locations: ctx.allowed_locations,
    };

    let tickets_state = tickets::TicketsState {
        resolver: ctx.resolver.clone(),
        tickets: ctx.tickets.clone(),
        rate_limiter: ctx.rate_limiter,
        audit: ctx.audit,
        ip_header: ctx.ip_header,
        api_prefix: ctx.api_prefix,
    };

    #[cfg(feature = "test-mode")]
    let test_state = test::TestState {
        tickets: ctx.tickets.clone(),
    };

    let progress_state = progress::ProgressState {
        resolver: ctx.resolver,
        progress: ctx.progress,
    };

    let router = Router::new()
        .nest("/auth", session::router(session_state))
        .nest("/tickets", tickets::router(tickets_state))
        .merge(progress::router(progress_state));

    #[cfg(feature = "test-mode")]
    let router = router.nest("/test", test::router(test_state));

    router
}

/// State types that know where the client address comes from.
pub(crate) trait HasClientIpSource {
    fn ip_header(&self) -> Option<&HeaderName>;
}

/// Client address of the request, used as the rate-limit key.
pub(crate) struct ClientIp(pub String);

impl<S> FromRequestParts<S> for ClientIp
where
    S: HasClientIpSource + Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        extract_client_ip(&*parts, state.ip_header())
            .map(ClientIp)
            .map_err(|reason| {
                warn!(reason, "Could not determine client IP");
                ApiError::forbidden("Unable to determine client IP.")
            })
    }
}
