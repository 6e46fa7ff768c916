//! Security audit events.
//!
//! Routes report security-relevant events to an [`AuditSink`]. Recording is
//! fire-and-forget: a sink must never fail into the caller.

use serde::Serialize;
use tracing::info;

use crate::tickets::ResourceType;

/// A security-relevant event.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    LoginSucceeded {
        username: String,
        client_ip: String,
    },
    LoginFailed {
        username: String,
        client_ip: String,
    },
    LoginRateLimited {
        client_ip: String,
        retry_after_secs: u64,
    },
    Logout {
        username: Option<String>,
        client_ip: String,
    },
    TicketIssued {
        username: String,
        resource: String,
        resource_type: ResourceType,
        client_ip: String,
    },
    TicketRateLimited {
        username: String,
        client_ip: String,
        retry_after_secs: u64,
    },
}

impl AuditEvent {
    pub fn name(&self) -> &'static str {
        match self {
            AuditEvent::LoginSucceeded { .. } => "login_succeeded",
            AuditEvent::LoginFailed { .. } => "login_failed",
            AuditEvent::LoginRateLimited { .. } => "login_rate_limited",
            AuditEvent::Logout { .. } => "logout",
            AuditEvent::TicketIssued { .. } => "ticket_issued",
            AuditEvent::TicketRateLimited { .. } => "ticket_rate_limited",
        }
    }
}

/// Destination for audit events.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Writes audit events to the `audit` tracing target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        match serde_json::to_string(&event) {
            Ok(details) => info!(target: "audit", event = event.name(), %details),
            Err(e) => info!(target: "audit", event = event.name(), error = %e, "Unserializable audit event"),
        }
    }
}
