pub mod api;
pub mod audit;
pub mod auth;
pub mod cleanup;
pub mod cli;
pub mod jwt;
pub mod progress;
pub mod rate_limit;
pub mod tickets;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use api::{ApiContext, create_api_router};
use audit::{AuditSink, TracingAuditSink};
use auth::{CookieSigner, TokenResolver};
use axum::Router;
use axum::http::HeaderName;
use cleanup::{SweeperHandle, spawn_sweeper};
use jwt::JwtCodec;
use progress::ProgressHub;
use rate_limit::{GovernorRateLimiter, RateLimiter};
use subtle::ConstantTimeEq;
use tickets::TicketStore;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Path the API router is mounted under.
pub const API_PREFIX: &str = "/api";

/// The single local account allowed to sign in.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// Compare both fields without short-circuiting on the first mismatch.
    pub fn matches(&self, username: &str, password: &str) -> bool {
        let username_ok = self.username.as_bytes().ct_eq(username.as_bytes());
        let password_ok = self.password.as_bytes().ct_eq(password.as_bytes());
        (username_ok & password_ok).into()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum AuthMode {
    /// Sign in with the configured account
    Local(Credentials),
    /// Every request is treated as the privileged identity
    Disabled,
}

pub struct ServerConfig {
    pub auth: AuthMode,
    /// Secret for signing session tokens. A random one is generated when unset,
    /// which invalidates sessions on restart.
    pub jwt_secret: Option<Vec<u8>>,
    /// Secret for signing the session cookie. Falls back to the JWT secret.
    pub cookie_secret: Option<Vec<u8>>,
    /// Whether to set Secure flag on cookies (should be true in production with HTTPS)
    pub secure_cookies: bool,
    pub session_ttl: Duration,
    pub ticket_ttl: Duration,
    pub sweep_interval: Duration,
    /// Header holding the client address when running behind a proxy
    pub ip_header: Option<HeaderName>,
    /// Locations granted to the signed-in account
    pub allowed_locations: Vec<String>,
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |secret: &Option<Vec<u8>>| secret.as_ref().map(|_| "<redacted>");
        f.debug_struct("ServerConfig")
            .field("auth", &self.auth)
            .field("jwt_secret", &redact(&self.jwt_secret))
            .field("cookie_secret", &redact(&self.cookie_secret))
            .field("secure_cookies", &self.secure_cookies)
            .field("session_ttl", &self.session_ttl)
            .field("ticket_ttl", &self.ticket_ttl)
            .field("sweep_interval", &self.sweep_interval)
            .field("ip_header", &self.ip_header)
            .field("allowed_locations", &self.allowed_locations)
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            auth: AuthMode::Disabled,
            jwt_secret: None,
            cookie_secret: None,
            secure_cookies: false,
            session_ttl: jwt::SESSION_TOKEN_DURATION,
            ticket_ttl: tickets::DEFAULT_TICKET_TTL,
            sweep_interval: cleanup::DEFAULT_SWEEP_INTERVAL,
            ip_header: None,
            allowed_locations: vec![auth::ALL_LOCATIONS.to_string()],
        }
    }
}

/// Errors building the shared services.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("invalid cookie signing key: {0}")]
    CookieKey(hmac::digest::InvalidLength),
}

/// Shared services behind the router.
#[derive(Clone)]
pub struct AppServices {
    pub resolver: Arc<TokenResolver>,
    pub tickets: Arc<TicketStore>,
    pub rate_limiter: Arc<dyn RateLimiter>,
    pub audit: Arc<dyn AuditSink>,
    pub progress: ProgressHub,
}

impl AppServices {
    pub fn new(config: &ServerConfig) -> Result<Self, StartupError> {
        let jwt = match &config.jwt_secret {
            Some(secret) => JwtCodec::new(secret),
            None => {
                warn!("No JWT secret configured, using a random one; sessions end on restart");
                JwtCodec::ephemeral()
            }
        };

        let cookie_key = config
            .cookie_secret
            .clone()
            .or_else(|| config.jwt_secret.clone())
            .unwrap_or_else(|| rand::random::<[u8; 32]>().to_vec());

        let auth_disabled = matches!(config.auth, AuthMode::Disabled);
        if auth_disabled {
            warn!("Authentication is disabled; every request is treated as an administrator");
        }

        let cookies = CookieSigner::new(&cookie_key).map_err(StartupError::CookieKey)?;
        let tickets = Arc::new(TicketStore::new(config.ticket_ttl));
        let resolver = Arc::new(TokenResolver::new(
            Arc::new(jwt),
            tickets.clone(),
            cookies,
            auth_disabled,
        ));

        Ok(Self {
            resolver,
            tickets,
            rate_limiter: Arc::new(GovernorRateLimiter::new()),
            audit: Arc::new(TracingAuditSink),
            progress: ProgressHub::new(),
        })
    }

    /// Start the background sweep of expired tickets.
    pub fn start_sweeper(&self, interval: Duration) -> SweeperHandle {
        spawn_sweeper(
            Arc::downgrade(&self.tickets),
            self.rate_limiter.clone(),
            interval,
        )
    }
}

/// Create the application router with the given configuration.
pub fn create_app(config: &ServerConfig, services: &AppServices) -> Router {
    let credentials = match &config.auth {
        AuthMode::Local(credentials) => Some(Arc::new(credentials.clone())),
        AuthMode::Disabled => None,
    };

    let api_router = create_api_router(ApiContext {
        resolver: services.resolver.clone(),
        tickets: services.tickets.clone(),
        rate_limiter: services.rate_limiter.clone(),
        audit: services.audit.clone(),
        progress: services.progress.clone(),
        credentials,
        session_ttl: config.session_ttl,
        secure_cookies: config.secure_cookies,
        ip_header: config.ip_header.clone(),
        allowed_locations: config.allowed_locations.clone(),
        api_prefix: API_PREFIX.to_string(),
    });

    Router::new().nest(API_PREFIX, api_router)
}

/// Run the server on the given listener until Ctrl+C or SIGTERM.
pub async fn run_server(config: ServerConfig, listener: TcpListener) -> Result<(), std::io::Error> {
    serve_with_shutdown(config, listener, shutdown_signal()).await
}

/// Run the server until `signal` completes.
///
/// Open progress streams are ended when the signal fires, so graceful
/// shutdown does not wait on them.
pub async fn serve_with_shutdown<F>(
    config: ServerConfig,
    listener: TcpListener,
    signal: F,
) -> Result<(), std::io::Error>
where
    F: Future<Output = ()> + Send + 'static,
{
    let services = AppServices::new(&config).map_err(std::io::Error::other)?;
    let sweeper = services.start_sweeper(config.sweep_interval);
    let app = create_app(&config, &services);

    let progress = services.progress.clone();
    let shutdown = async move {
        signal.await;
        progress.close();
    };

    let make_service = app.into_make_service_with_connect_info::<SocketAddr>();
    let result = axum::serve(listener, make_service)
        .with_graceful_shutdown(shutdown)
        .await;

    sweeper.shutdown().await;
    info!("Server stopped");
    result
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
