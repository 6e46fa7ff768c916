//! Request authentication.
//!
//! A [`TokenResolver`] attributes each request to an [`Identity`] from, in
//! order: an identity already resolved for the request, the auth-disabled
//! fallback, the signed session cookie, a bearer header, or a one-time ticket.

mod cookie;
mod errors;
mod extractors;
mod ip;
mod resolver;
mod state;
mod types;

pub use cookie::{
    CookieSigner, SESSION_COOKIE_NAME, clear_session_cookie, get_cookie, session_cookie,
};
pub use errors::{AuthFailure, FailureCategory};
pub use extractors::{Auth, OptionalAuth, require_identity};
pub use ip::{HasHeadersAndExtensions, extract_client_ip};
pub use resolver::{StreamResource, TICKET_QUERY_PARAM, TokenResolver};
pub use state::HasAuthBackend;
pub use types::{ADMIN_ROLE, ALL_LOCATIONS, Identity};
