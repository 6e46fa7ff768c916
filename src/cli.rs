//! CLI argument parsing, validation, and startup helpers.

use std::time::Duration;

use axum::http::HeaderName;
use clap::Parser;
use thiserror::Error;
use tracing::info;

use crate::auth::ALL_LOCATIONS;
use crate::{AuthMode, Credentials, ServerConfig};

const MIN_SECRET_LENGTH: usize = 32;

const JWT_SECRET_ENV: &str = "JWT_SECRET";
const COOKIE_SECRET_ENV: &str = "COOKIE_SECRET";
const PASSWORD_ENV: &str = "BUCKETGATE_PASSWORD";

#[derive(clap::ValueEnum, Clone, Debug, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
    Compact,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "bucketgate",
    about = "Authentication gateway for the storage console API"
)]
pub struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "8080")]
    pub port: u16,

    /// Account allowed to sign in. The password is read from BUCKETGATE_PASSWORD
    #[arg(short, long, env = "BUCKETGATE_USERNAME")]
    pub username: Option<String>,

    /// Disable authentication. Only safe behind a proxy that authenticates for us
    #[arg(long)]
    pub no_auth: bool,

    /// Path to file containing JWT secret. Prefer using JWT_SECRET env var instead
    #[arg(long)]
    pub jwt_secret_file: Option<String>,

    /// Path to file containing the cookie signing secret (defaults to the JWT secret)
    #[arg(long)]
    pub cookie_secret_file: Option<String>,

    /// Session lifetime in seconds
    #[arg(long, default_value = "86400", value_parser = clap::value_parser!(u64).range(1..))]
    pub session_ttl: u64,

    /// Ticket lifetime in seconds
    #[arg(long, default_value = "60", value_parser = clap::value_parser!(u64).range(1..))]
    pub ticket_ttl: u64,

    /// Seconds between sweeps of expired tickets
    #[arg(long, default_value = "60", value_parser = clap::value_parser!(u64).range(1..))]
    pub sweep_interval: u64,

    /// Set the Secure flag on cookies (enable when served over HTTPS)
    #[arg(long)]
    pub secure_cookies: bool,

    /// Header carrying the client IP, e.g. x-forwarded-for. Requires a trusted proxy
    #[arg(long, value_parser = validate_header_name)]
    pub client_ip_header: Option<HeaderName>,

    /// Location the signed-in account may access. Repeat for several
    #[arg(long = "allowed-location", default_value = ALL_LOCATIONS)]
    pub allowed_locations: Vec<String>,

    /// Log output format
    #[arg(short, long, default_value = "pretty")]
    pub log_format: LogFormat,
}

fn validate_header_name(s: &str) -> Result<HeaderName, String> {
    HeaderName::from_bytes(s.trim().as_bytes())
        .map_err(|_| format!("Invalid header name: {}", s))
}

/// Startup configuration problems.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {name} from {path}: {source}")]
    SecretFile {
        name: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{name} is shorter than {min} characters, use a longer secret")]
    SecretTooShort { name: &'static str, min: usize },
    #[error("no credentials configured: set --username and BUCKETGATE_PASSWORD, or pass --no-auth")]
    MissingCredentials,
    #[error("--username is set but BUCKETGATE_PASSWORD is empty or missing")]
    MissingPassword,
    #[error("--no-auth cannot be combined with --username")]
    CredentialsWithNoAuth,
}

/// Secrets read from the environment or from files.
#[derive(Default)]
pub struct Secrets {
    pub password: Option<String>,
    pub jwt_secret: Option<Vec<u8>>,
    pub cookie_secret: Option<Vec<u8>>,
}

/// Initialize logging based on the specified format.
pub fn init_logging(format: &LogFormat) {
    match format {
        LogFormat::Pretty => tracing_subscriber::fmt::init(),
        LogFormat::Json => tracing_subscriber::fmt().json().init(),
        LogFormat::Compact => tracing_subscriber::fmt().compact().init(),
    }
}

/// Read and clear an environment variable.
fn take_env(name: &str) -> Option<String> {
    let value = std::env::var(name).ok()?;
    // Clear the environment variable to prevent leaking
    // SAFETY: We're single-threaded at this point during startup,
    // and no other code is reading this environment variable.
    unsafe { std::env::remove_var(name) };
    Some(value)
}

/// Load a signing secret from an environment variable or file.
///
/// Returns `Ok(None)` when neither is set.
pub fn load_secret(
    name: &'static str,
    env_var: &str,
    file: Option<&str>,
) -> Result<Option<Vec<u8>>, ConfigError> {
    let secret = if let Some(secret) = take_env(env_var) {
        secret
    } else if let Some(path) = file {
        std::fs::read_to_string(path)
            .map_err(|source| ConfigError::SecretFile {
                name,
                path: path.to_string(),
                source,
            })?
            .trim()
            .to_string()
    } else {
        return Ok(None);
    };

    if secret.len() < MIN_SECRET_LENGTH {
        return Err(ConfigError::SecretTooShort {
            name,
            min: MIN_SECRET_LENGTH,
        });
    }

    Ok(Some(secret.into_bytes()))
}

/// Load every secret the server needs from the environment and secret files.
pub fn load_secrets(args: &Args) -> Result<Secrets, ConfigError> {
    Ok(Secrets {
        password: take_env(PASSWORD_ENV),
        jwt_secret: load_secret("JWT secret", JWT_SECRET_ENV, args.jwt_secret_file.as_deref())?,
        cookie_secret: load_secret(
            "cookie secret",
            COOKIE_SECRET_ENV,
            args.cookie_secret_file.as_deref(),
        )?,
    })
}

/// Build ServerConfig from validated arguments.
pub fn build_config(args: Args, secrets: Secrets) -> Result<ServerConfig, ConfigError> {
    let auth = match (args.no_auth, args.username) {
        (true, Some(_)) => return Err(ConfigError::CredentialsWithNoAuth),
        (true, None) => AuthMode::Disabled,
        (false, None) => return Err(ConfigError::MissingCredentials),
        (false, Some(username)) => {
            let password = secrets
                .password
                .filter(|p| !p.is_empty())
                .ok_or(ConfigError::MissingPassword)?;
            info!(username = %username, "Local sign-in enabled");
            AuthMode::Local(Credentials { username, password })
        }
    };

    Ok(ServerConfig {
        auth,
        jwt_secret: secrets.jwt_secret,
        cookie_secret: secrets.cookie_secret,
        secure_cookies: args.secure_cookies,
        session_ttl: Duration::from_secs(args.session_ttl),
        ticket_ttl: Duration::from_secs(args.ticket_ttl),
        sweep_interval: Duration::from_secs(args.sweep_interval),
        ip_header: args.client_ip_header,
        allowed_locations: args.allowed_locations,
    })
}
