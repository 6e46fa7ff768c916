//! Credential resolution.
//!
//! Every request is attributed to an [`Identity`] by trying the credential
//! sources in a fixed order, stopping at the first one that gives a
//! definitive answer:
//!
//! 1. an identity already attached to the request by an earlier hook
//! 2. the fixed privileged identity, when authentication is disabled
//! 3. the signed session cookie
//! 4. an `Authorization: Bearer` header
//! 5. a one-time `ticket` query parameter on a streaming path

use std::sync::Arc;

use axum::extract::OriginalUri;
use axum::http::{HeaderMap, Uri, header, request::Parts};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use tracing::{debug, error};

use super::cookie::{CookieSigner, SESSION_COOKIE_NAME, get_cookie};
use super::errors::AuthFailure;
use super::types::Identity;
use crate::jwt::{JwtCodec, VerifyError};
use crate::tickets::{ResourceType, TicketStore};

/// Query parameter carrying a one-time ticket.
pub const TICKET_QUERY_PARAM: &str = "ticket";

const BEARER_PREFIX: &str = "Bearer ";

/// Characters left unescaped in a path segment, matching `encodeURIComponent`.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// A streaming resource addressed by a request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamResource {
    pub resource: String,
    pub resource_type: ResourceType,
}

impl StreamResource {
    /// Map a request path to the streaming resource it addresses.
    ///
    /// Recognized shapes (optionally behind a base path):
    /// - `/api/transfers/{job_id}/progress`
    /// - `/api/uploads/{encoded_key}/progress`
    pub fn from_path(path: &str) -> Option<Self> {
        let segments: Vec<&str> = path.split('/').collect();
        let (kind, raw) = match segments.as_slice() {
            [.., "api", kind, raw, "progress"] if !raw.is_empty() => (*kind, *raw),
            _ => return None,
        };

        let resource_type = match kind {
            "transfers" => ResourceType::Transfer,
            "uploads" => ResourceType::Upload,
            _ => return None,
        };

        let resource = percent_decode_str(raw).decode_utf8().ok()?.into_owned();
        Some(Self {
            resource,
            resource_type,
        })
    }

    /// Path of the progress stream for this resource, relative to the API root.
    pub fn path(&self) -> String {
        let kind = match self.resource_type {
            ResourceType::Transfer => "transfers",
            ResourceType::Upload => "uploads",
        };
        format!(
            "/{}/{}/progress",
            kind,
            utf8_percent_encode(&self.resource, PATH_SEGMENT)
        )
    }
}

/// Where a session token candidate came from, for diagnostics.
#[derive(Debug, Clone, Copy)]
enum TokenSource {
    Cookie,
    Header,
}

/// Decides who is making a request.
pub struct TokenResolver {
    jwt: Arc<JwtCodec>,
    tickets: Arc<TicketStore>,
    cookies: CookieSigner,
    auth_disabled: bool,
}

impl TokenResolver {
    pub fn new(
        jwt: Arc<JwtCodec>,
        tickets: Arc<TicketStore>,
        cookies: CookieSigner,
        auth_disabled: bool,
    ) -> Self {
        Self {
            jwt,
            tickets,
            cookies,
            auth_disabled,
        }
    }

    pub fn jwt(&self) -> &JwtCodec {
        &self.jwt
    }

    pub fn tickets(&self) -> &TicketStore {
        &self.tickets
    }

    pub fn cookie_signer(&self) -> &CookieSigner {
        &self.cookies
    }

    pub fn auth_disabled(&self) -> bool {
        self.auth_disabled
    }

    /// Resolve the identity behind a request.
    pub fn resolve(&self, parts: &Parts) -> Result<Identity, AuthFailure> {
        if let Some(identity) = parts.extensions.get::<Identity>() {
            return Ok(identity.clone());
        }

        if self.auth_disabled {
            return Ok(Identity::privileged());
        }

        let candidate = self
            .cookie_token(&parts.headers)
            .map(|token| (token, TokenSource::Cookie))
            .or_else(|| bearer_token(&parts.headers).map(|token| (token, TokenSource::Header)));
        if let Some((token, source)) = candidate {
            return self.verify_session_token(token, source, request_uri(parts));
        }

        let uri = request_uri(parts);
        if let Some(ticket) = ticket_param(uri) {
            return self.redeem_ticket(&ticket, uri.path());
        }

        Err(AuthFailure::MissingCredential)
    }

    /// Session token from the cookie, if its signature verifies.
    fn cookie_token<'a>(&self, headers: &'a HeaderMap) -> Option<&'a str> {
        let signed = get_cookie(headers, SESSION_COOKIE_NAME)?;
        let token = self.cookies.unsign(signed);
        if token.is_none() {
            debug!("Ignoring session cookie with invalid signature");
        }
        token
    }

    fn verify_session_token(
        &self,
        token: &str,
        source: TokenSource,
        uri: &Uri,
    ) -> Result<Identity, AuthFailure> {
        self.jwt
            .verify(token)
            .map_err(|e| failure_from_verify(e, source, uri))
    }

    fn redeem_ticket(&self, ticket: &str, path: &str) -> Result<Identity, AuthFailure> {
        let Some(target) = StreamResource::from_path(path) else {
            debug!(path = %path, "Ticket presented on a non-streaming path");
            return Err(AuthFailure::TicketPathUnrecognized);
        };

        let record = self
            .tickets
            .validate_and_consume(ticket, &target.resource, target.resource_type)
            .ok_or(AuthFailure::TicketRejected)?;

        Ok(Identity {
            id: record.user_id,
            username: record.username,
            roles: record.roles,
            allowed_locations: Vec::new(),
        })
    }
}

/// Map a token verification error to the failure reported to the client.
fn failure_from_verify(error: VerifyError, source: TokenSource, uri: &Uri) -> AuthFailure {
    match error {
        VerifyError::Expired => AuthFailure::TokenExpired,
        VerifyError::Malformed => AuthFailure::TokenMalformed,
        VerifyError::InvalidPayload => AuthFailure::InvalidPayload,
        VerifyError::Other(reason) => {
            error!(
                source = ?source,
                path = %uri.path(),
                error = %reason,
                "Unexpected session token verification failure"
            );
            AuthFailure::Internal
        }
    }
}

/// The URI as the client sent it, before any router nesting stripped a prefix.
fn request_uri(parts: &Parts) -> &Uri {
    parts
        .extensions
        .get::<OriginalUri>()
        .map(|original| &original.0)
        .unwrap_or(&parts.uri)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix(BEARER_PREFIX)
}

fn ticket_param(uri: &Uri) -> Option<String> {
    url::form_urlencoded::parse(uri.query()?.as_bytes())
        .find(|(key, _)| key == TICKET_QUERY_PARAM)
        .map(|(_, value)| value.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::FailureCategory;
    use crate::jwt::SESSION_TOKEN_DURATION;
    use axum::http::StatusCode;
    use axum::http::Request;
    use std::time::Duration;

    struct Fixture {
        resolver: TokenResolver,
        jwt: Arc<JwtCodec>,
        tickets: Arc<TicketStore>,
        cookies: CookieSigner,
    }

    fn fixture(auth_disabled: bool) -> Fixture {
        let jwt = Arc::new(JwtCodec::new(b"resolver-test-secret"));
        let tickets = Arc::new(TicketStore::default());
        let cookies = CookieSigner::new(b"resolver-cookie-secret").unwrap();
        Fixture {
            resolver: TokenResolver::new(
                jwt.clone(),
                tickets.clone(),
                cookies.clone(),
                auth_disabled,
            ),
            jwt,
            tickets,
            cookies,
        }
    }

    fn identity(name: &str) -> Identity {
        Identity {
            id: format!("{}-id", name),
            username: name.to_string(),
            roles: vec!["user".to_string()],
            allowed_locations: vec!["s3://bucket".to_string()],
        }
    }

    fn request_parts(builder: axum::http::request::Builder) -> Parts {
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn test_no_credentials() {
        let f = fixture(false);
        let parts = request_parts(Request::get("/api/auth/me"));
        assert_eq!(
            f.resolver.resolve(&parts),
            Err(AuthFailure::MissingCredential)
        );
    }

    #[test]
    fn test_auth_disabled_returns_privileged_identity() {
        let f = fixture(true);
        let parts = request_parts(Request::get("/api/auth/me").header(header::AUTHORIZATION, "Bearer junk"));
        assert_eq!(f.resolver.resolve(&parts), Ok(Identity::privileged()));
    }

    #[test]
    fn test_existing_identity_short_circuits() {
        let f = fixture(true);
        let mut parts = request_parts(Request::get("/api/auth/me"));
        parts.extensions.insert(identity("carol"));
        assert_eq!(f.resolver.resolve(&parts), Ok(identity("carol")));
    }

    #[test]
    fn test_cookie_wins_over_header_and_ticket() {
        let f = fixture(false);
        let cookie_token = f.jwt.sign(&identity("alice"), SESSION_TOKEN_DURATION).unwrap();
        let header_token = f.jwt.sign(&identity("bob"), SESSION_TOKEN_DURATION).unwrap();
        let ticket = f
            .tickets
            .issue(&identity("dave"), "job-1", ResourceType::Transfer);

        let parts = request_parts(
            Request::get(format!(
                "/api/transfers/job-1/progress?ticket={}",
                ticket.ticket
            ))
            .header(
                header::COOKIE,
                format!("{}={}", SESSION_COOKIE_NAME, f.cookies.sign(&cookie_token.token)),
            )
            .header(
                header::AUTHORIZATION,
                format!("Bearer {}", header_token.token),
            ),
        );

        assert_eq!(f.resolver.resolve(&parts), Ok(identity("alice")));
        // Ticket was never looked at.
        assert_eq!(f.tickets.size(), 1);
        assert_eq!(f.tickets.metrics().validated, 0);
        assert_eq!(f.tickets.metrics().not_found, 0);
    }

    #[test]
    fn test_unsigned_cookie_falls_through_to_header() {
        let f = fixture(false);
        let cookie_token = f.jwt.sign(&identity("alice"), SESSION_TOKEN_DURATION).unwrap();
        let header_token = f.jwt.sign(&identity("bob"), SESSION_TOKEN_DURATION).unwrap();

        let parts = request_parts(
            Request::get("/api/auth/me")
                .header(
                    header::COOKIE,
                    format!("{}={}", SESSION_COOKIE_NAME, cookie_token.token),
                )
                .header(
                    header::AUTHORIZATION,
                    format!("Bearer {}", header_token.token),
                ),
        );

        assert_eq!(f.resolver.resolve(&parts), Ok(identity("bob")));
    }

    #[test]
    fn test_unsigned_cookie_alone_is_missing_credential() {
        let f = fixture(false);
        let parts = request_parts(
            Request::get("/api/auth/me")
                .header(header::COOKIE, format!("{}=forged.value", SESSION_COOKIE_NAME)),
        );
        assert_eq!(
            f.resolver.resolve(&parts),
            Err(AuthFailure::MissingCredential)
        );
    }

    #[test]
    fn test_header_without_bearer_prefix_is_ignored() {
        let f = fixture(false);
        let token = f.jwt.sign(&identity("bob"), SESSION_TOKEN_DURATION).unwrap();
        let parts = request_parts(
            Request::get("/api/auth/me")
                .header(header::AUTHORIZATION, format!("Basic {}", token.token)),
        );
        assert_eq!(
            f.resolver.resolve(&parts),
            Err(AuthFailure::MissingCredential)
        );
    }

    #[test]
    fn test_token_failures_are_distinguished() {
        let f = fixture(false);
        let other = JwtCodec::new(b"some-other-secret");
        let foreign = other.sign(&identity("bob"), SESSION_TOKEN_DURATION).unwrap();

        let parts = request_parts(
            Request::get("/api/auth/me")
                .header(header::AUTHORIZATION, format!("Bearer {}", foreign.token)),
        );
        assert_eq!(
            f.resolver.resolve(&parts),
            Err(AuthFailure::TokenMalformed)
        );

        let expired = jsonwebtoken::encode(
            &jsonwebtoken::Header::default(),
            &serde_json::json!({
                "id": "1", "username": "bob", "roles": [], "iat": 1, "exp": 2,
            }),
            &jsonwebtoken::EncodingKey::from_secret(b"resolver-test-secret"),
        )
        .unwrap();
        let parts = request_parts(
            Request::get("/api/auth/me")
                .header(header::AUTHORIZATION, format!("Bearer {}", expired)),
        );
        assert_eq!(f.resolver.resolve(&parts), Err(AuthFailure::TokenExpired));

        let no_roles = jsonwebtoken::encode(
            &jsonwebtoken::Header::default(),
            &serde_json::json!({ "id": "1", "username": "bob", "exp": 4_000_000_000u64 }),
            &jsonwebtoken::EncodingKey::from_secret(b"resolver-test-secret"),
        )
        .unwrap();
        let parts = request_parts(
            Request::get("/api/auth/me")
                .header(header::AUTHORIZATION, format!("Bearer {}", no_roles)),
        );
        assert_eq!(f.resolver.resolve(&parts), Err(AuthFailure::InvalidPayload));
    }

    #[test]
    fn test_ticket_on_transfer_path() {
        let f = fixture(false);
        let ticket = f
            .tickets
            .issue(&identity("alice"), "job-1", ResourceType::Transfer);

        let parts = request_parts(Request::get(format!(
            "/api/transfers/job-1/progress?ticket={}",
            ticket.ticket
        )));

        let resolved = f.resolver.resolve(&parts).unwrap();
        assert_eq!(resolved.id, "alice-id");
        assert_eq!(resolved.username, "alice");
        assert_eq!(resolved.roles, vec!["user".to_string()]);
        assert!(resolved.allowed_locations.is_empty());

        // Single use.
        assert_eq!(
            f.resolver.resolve(&parts),
            Err(AuthFailure::TicketRejected)
        );
    }

    #[test]
    fn test_ticket_on_upload_path_with_encoded_key() {
        let f = fixture(false);
        let key = "photos/2024 trip/a+b.png";
        let ticket = f
            .tickets
            .issue(&identity("alice"), key, ResourceType::Upload);

        let target = StreamResource {
            resource: key.to_string(),
            resource_type: ResourceType::Upload,
        };
        let parts = request_parts(Request::get(format!(
            "/api{}?ticket={}",
            target.path(),
            ticket.ticket
        )));

        assert!(f.resolver.resolve(&parts).is_ok());
    }

    #[test]
    fn test_ticket_on_unrecognized_path_is_bad_request() {
        let f = fixture(false);
        let ticket = f
            .tickets
            .issue(&identity("alice"), "job-1", ResourceType::Transfer);

        let parts = request_parts(Request::get(format!(
            "/api/buckets/job-1?ticket={}",
            ticket.ticket
        )));

        assert_eq!(
            f.resolver.resolve(&parts),
            Err(AuthFailure::TicketPathUnrecognized)
        );
        assert_eq!(f.tickets.size(), 1);
    }

    #[test]
    fn test_ticket_for_other_resource_type_is_rejected() {
        let f = fixture(false);
        let ticket = f
            .tickets
            .issue(&identity("alice"), "job-1", ResourceType::Transfer);

        let parts = request_parts(Request::get(format!(
            "/api/uploads/job-1/progress?ticket={}",
            ticket.ticket
        )));

        assert_eq!(
            f.resolver.resolve(&parts),
            Err(AuthFailure::TicketRejected)
        );
        assert_eq!(f.tickets.metrics().invalid_type, 1);
    }

    #[test]
    fn test_expired_ticket_is_rejected() {
        let f = fixture(false);
        let ticket = f.tickets.issue_with_ttl(
            &identity("alice"),
            "job-1",
            ResourceType::Transfer,
            Duration::ZERO,
        );
        std::thread::sleep(Duration::from_millis(5));

        let parts = request_parts(Request::get(format!(
            "/api/transfers/job-1/progress?ticket={}",
            ticket.ticket
        )));
        assert_eq!(
            f.resolver.resolve(&parts),
            Err(AuthFailure::TicketRejected)
        );
        assert_eq!(f.tickets.size(), 0);
    }

    #[test]
    fn test_original_uri_is_used_under_nesting() {
        let f = fixture(false);
        let ticket = f
            .tickets
            .issue(&identity("alice"), "job-9", ResourceType::Transfer);
        let full: Uri = format!("/api/transfers/job-9/progress?ticket={}", ticket.ticket)
            .parse()
            .unwrap();

        // Inside a nested router the visible URI has its prefix stripped.
        let mut parts = request_parts(Request::get(format!(
            "/job-9/progress?ticket={}",
            ticket.ticket
        )));
        parts.extensions.insert(OriginalUri(full));

        assert!(f.resolver.resolve(&parts).is_ok());
    }

    #[test]
    fn test_stream_resource_shapes() {
        assert_eq!(
            StreamResource::from_path("/api/transfers/job-1/progress"),
            Some(StreamResource {
                resource: "job-1".to_string(),
                resource_type: ResourceType::Transfer,
            })
        );
        assert_eq!(
            StreamResource::from_path("/console/api/uploads/a%2Fb%20c.txt/progress"),
            Some(StreamResource {
                resource: "a/b c.txt".to_string(),
                resource_type: ResourceType::Upload,
            })
        );
        assert_eq!(StreamResource::from_path("/api/transfers//progress"), None);
        assert_eq!(StreamResource::from_path("/api/transfers/job-1"), None);
        assert_eq!(StreamResource::from_path("/api/jobs/job-1/progress"), None);
        assert_eq!(StreamResource::from_path("/transfers/job-1/progress"), None);
    }

    #[test]
    fn test_stream_path_encodes_key() {
        let target = StreamResource {
            resource: "dir/file name.txt".to_string(),
            resource_type: ResourceType::Upload,
        };
        assert_eq!(target.path(), "/uploads/dir%2Ffile%20name.txt/progress");
    }

    #[test]
    fn test_unexpected_verify_error_is_internal() {
        let uri: Uri = "/api/auth/me".parse().unwrap();
        let unmapped = VerifyError::from(jsonwebtoken::errors::Error::from(
            jsonwebtoken::errors::ErrorKind::InvalidKeyFormat,
        ));
        assert!(matches!(unmapped, VerifyError::Other(_)));

        let failure = failure_from_verify(unmapped, TokenSource::Header, &uri);
        assert_eq!(failure, AuthFailure::Internal);
        assert_eq!(failure.category(), FailureCategory::Internal);
        assert_eq!(failure.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(failure.message(), "authentication failed");

        assert_eq!(
            failure_from_verify(VerifyError::Expired, TokenSource::Cookie, &uri),
            AuthFailure::TokenExpired
        );
        assert_eq!(
            failure_from_verify(VerifyError::Malformed, TokenSource::Cookie, &uri),
            AuthFailure::TokenMalformed
        );
        assert_eq!(
            failure_from_verify(VerifyError::InvalidPayload, TokenSource::Header, &uri),
            AuthFailure::InvalidPayload
        );
    }
}
