//! Single-use, resource-scoped tickets for streaming connections.
//!
//! A ticket lets a browser open a server-push stream without putting its
//! session token in a URL. Tickets are issued to an already authenticated
//! caller for one `(resource, resource type)` pair, live for a short time, and
//! are consumed by the first successful validation.
//!
//! Every ticket ends in one of two terminal states: consumed by
//! [`TicketStore::validate_and_consume`], or expired (detected lazily during a
//! validation attempt or removed by [`TicketStore::sweep`]).

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::auth::Identity;

/// Default ticket lifetime.
pub const DEFAULT_TICKET_TTL: Duration = Duration::from_secs(60);

/// Number of random bytes behind each ticket (256 bits).
const TICKET_BYTES: usize = 32;

/// Characters of a ticket that may appear in logs.
const LOG_PREFIX_LEN: usize = 8;

/// Kind of streaming resource a ticket is scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    /// Progress of a copy/move job
    Transfer,
    /// Progress of an object upload
    Upload,
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceType::Transfer => write!(f, "transfer"),
            ResourceType::Upload => write!(f, "upload"),
        }
    }
}

/// Everything the store remembers about an issued ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TicketRecord {
    pub user_id: String,
    pub username: String,
    pub roles: Vec<String>,
    pub resource: String,
    pub resource_type: ResourceType,
    /// Unix milliseconds
    pub created_at: u64,
    /// Unix milliseconds
    pub expires_at: u64,
}

/// Result of issuing a ticket.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedTicket {
    pub ticket: String,
    /// Unix milliseconds
    pub expires_at: u64,
}

/// Process-lifetime ticket counters.
#[derive(Debug, Default)]
struct TicketMetrics {
    generated: AtomicU64,
    validated: AtomicU64,
    expired: AtomicU64,
    invalid_resource: AtomicU64,
    invalid_type: AtomicU64,
    not_found: AtomicU64,
}

/// Point-in-time copy of the ticket counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TicketMetricsSnapshot {
    pub generated: u64,
    pub validated: u64,
    pub expired: u64,
    pub invalid_resource: u64,
    pub invalid_type: u64,
    pub not_found: u64,
}

/// Store size plus counters, for monitoring.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TicketStoreSnapshot {
    pub size: usize,
    pub metrics: TicketMetricsSnapshot,
}

impl TicketMetrics {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> TicketMetricsSnapshot {
        TicketMetricsSnapshot {
            generated: self.generated.load(Ordering::Relaxed),
            validated: self.validated.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            invalid_resource: self.invalid_resource.load(Ordering::Relaxed),
            invalid_type: self.invalid_type.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
        }
    }

    #[cfg(any(test, feature = "test-mode"))]
    fn reset(&self) {
        for counter in [
            &self.generated,
            &self.validated,
            &self.expired,
            &self.invalid_resource,
            &self.invalid_type,
            &self.not_found,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// In-memory map of outstanding tickets.
///
/// All operations are in-memory and complete under a single lock
/// acquisition, so a ticket can never be consumed twice.
pub struct TicketStore {
    tickets: Mutex<HashMap<String, TicketRecord>>,
    metrics: TicketMetrics,
    default_ttl: Duration,
}

impl Default for TicketStore {
    fn default() -> Self {
        Self::new(DEFAULT_TICKET_TTL)
    }
}

impl TicketStore {
    /// Create an empty store whose tickets live for `default_ttl`.
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            tickets: Mutex::new(HashMap::new()),
            metrics: TicketMetrics::default(),
            default_ttl,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    // Every critical section leaves the map consistent, so a poisoned lock is still usable.
    fn tickets(&self) -> MutexGuard<'_, HashMap<String, TicketRecord>> {
        self.tickets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Issue a ticket for `identity` scoped to one resource, using the default TTL.
    pub fn issue(
        &self,
        identity: &Identity,
        resource: &str,
        resource_type: ResourceType,
    ) -> IssuedTicket {
        self.issue_with_ttl(identity, resource, resource_type, self.default_ttl)
    }

    /// Issue a ticket with an explicit TTL.
    pub fn issue_with_ttl(
        &self,
        identity: &Identity,
        resource: &str,
        resource_type: ResourceType,
        ttl: Duration,
    ) -> IssuedTicket {
        let created_at = unix_millis();
        let expires_at = created_at.saturating_add(ttl.as_millis() as u64);

        let record = TicketRecord {
            user_id: identity.id.clone(),
            username: identity.username.clone(),
            roles: identity.roles.clone(),
            resource: resource.to_string(),
            resource_type,
            created_at,
            expires_at,
        };

        let ticket = {
            let mut tickets = self.tickets();
            loop {
                let candidate = generate_ticket();
                if let Entry::Vacant(slot) = tickets.entry(candidate.clone()) {
                    slot.insert(record);
                    break candidate;
                }
            }
        };

        TicketMetrics::bump(&self.metrics.generated);
        debug!(
            ticket = log_prefix(&ticket),
            user = %identity.username,
            resource = %resource,
            resource_type = %resource_type,
            "Issued ticket"
        );

        IssuedTicket { ticket, expires_at }
    }

    /// Validate a ticket for a resource and consume it on success.
    ///
    /// A ticket presented for the wrong resource or resource type is rejected
    /// but stays in the store until it is consumed or expires.
    pub fn validate_and_consume(
        &self,
        ticket: &str,
        resource: &str,
        resource_type: ResourceType,
    ) -> Option<TicketRecord> {
        let now = unix_millis();
        let mut tickets = self.tickets();

        let Entry::Occupied(entry) = tickets.entry(ticket.to_string()) else {
            TicketMetrics::bump(&self.metrics.not_found);
            debug!(ticket = log_prefix(ticket), "Ticket not found");
            return None;
        };

        let record = entry.get();
        if now > record.expires_at {
            entry.remove();
            TicketMetrics::bump(&self.metrics.expired);
            debug!(ticket = log_prefix(ticket), "Ticket expired");
            return None;
        }

        if record.resource_type != resource_type {
            TicketMetrics::bump(&self.metrics.invalid_type);
            debug!(
                ticket = log_prefix(ticket),
                expected = %record.resource_type,
                presented = %resource_type,
                "Ticket presented for wrong resource type"
            );
            return None;
        }

        if record.resource != resource {
            TicketMetrics::bump(&self.metrics.invalid_resource);
            debug!(
                ticket = log_prefix(ticket),
                expected = %record.resource,
                presented = %resource,
                "Ticket presented for wrong resource"
            );
            return None;
        }

        let record = entry.remove();
        TicketMetrics::bump(&self.metrics.validated);
        Some(record)
    }

    /// Remove every expired ticket. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = unix_millis();
        let mut tickets = self.tickets();
        let before = tickets.len();
        tickets.retain(|_, record| record.expires_at >= now);
        before - tickets.len()
    }

    /// Number of outstanding tickets.
    pub fn size(&self) -> usize {
        self.tickets().len()
    }

    pub fn metrics(&self) -> TicketMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn snapshot(&self) -> TicketStoreSnapshot {
        TicketStoreSnapshot {
            size: self.size(),
            metrics: self.metrics(),
        }
    }

    #[cfg(any(test, feature = "test-mode"))]
    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }

    #[cfg(any(test, feature = "test-mode"))]
    pub fn clear(&self) {
        self.tickets().clear();
    }

    /// Move a ticket's expiry into the past. Returns false if the ticket is unknown.
    #[cfg(any(test, feature = "test-mode"))]
    pub fn force_expire(&self, ticket: &str) -> bool {
        match self.tickets().get_mut(ticket) {
            Some(record) => {
                record.expires_at = unix_millis().saturating_sub(1000);
                true
            }
            None => false,
        }
    }
}

/// Generate a URL-safe ticket string from 256 random bits.
fn generate_ticket() -> String {
    let bytes: [u8; TICKET_BYTES] = rand::random();
    URL_SAFE_NO_PAD.encode(bytes)
}

fn log_prefix(ticket: &str) -> &str {
    ticket.get(..LOG_PREFIX_LEN).unwrap_or(ticket)
}

/// Current time in Unix milliseconds.
pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
