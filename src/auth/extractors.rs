//! Axum extractors and middleware for authentication.

use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, Request, State},
    http::request::Parts,
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::errors::{AuthFailure, FailureCategory};
use super::resolver::TokenResolver;
use super::state::HasAuthBackend;
use super::types::Identity;

/// Resolve the request's identity and remember it on the request.
///
/// Later hooks on the same request get the stored identity back instead of
/// resolving again, so a one-time ticket is only ever redeemed once.
fn authenticate(parts: &mut Parts, resolver: &TokenResolver) -> Result<Identity, AuthFailure> {
    let identity = resolver.resolve(parts)?;
    parts.extensions.insert(identity.clone());
    Ok(identity)
}

/// Extractor for endpoints that require authentication.
/// Returns JSON errors on failure.
pub struct Auth(pub Identity);

impl<S> FromRequestParts<S> for Auth
where
    S: HasAuthBackend + Send + Sync,
{
    type Rejection = AuthFailure;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        authenticate(parts, state.resolver()).map(Auth)
    }
}

/// Optional authentication extractor.
/// Anonymous or invalid credentials give `None`; malformed requests and
/// internal errors are still rejected.
pub struct OptionalAuth(pub Option<Identity>);

impl<S> FromRequestParts<S> for OptionalAuth
where
    S: HasAuthBackend + Send + Sync,
{
    type Rejection = AuthFailure;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match authenticate(parts, state.resolver()) {
            Ok(identity) => Ok(OptionalAuth(Some(identity))),
            Err(failure) if failure.category() == FailureCategory::Unauthorized => {
                Ok(OptionalAuth(None))
            }
            Err(failure) => Err(failure),
        }
    }
}

/// Middleware that rejects unauthenticated requests before they reach a handler.
pub async fn require_identity(
    State(resolver): State<Arc<TokenResolver>>,
    request: Request,
    next: Next,
) -> Response {
    let (mut parts, body) = request.into_parts();
    match authenticate(&mut parts, &resolver) {
        Ok(_) => next.run(Request::from_parts(parts, body)).await,
        Err(failure) => failure.into_response(),
    }
}
