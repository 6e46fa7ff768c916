//! Test-mode only API endpoints.
//!
//! These endpoints are only available when compiled with the `test-mode` feature.
//! They let e2e tests reset ticket state between runs and shouldn't be exposed in production.

use std::sync::Arc;

use axum::{Router, extract::State, http::StatusCode, routing::post};
use tracing::info;

use crate::tickets::TicketStore;

#[derive(Clone)]
pub struct TestState {
    pub tickets: Arc<TicketStore>,
}

pub fn router(state: TestState) -> Router {
    Router::new()
        .route("/tickets/reset-metrics", post(reset_metrics))
        .route("/tickets/clear", post(clear_tickets))
        .with_state(state)
}

/// Zero every ticket counter.
async fn reset_metrics(State(state): State<TestState>) -> StatusCode {
    state.tickets.reset_metrics();
    StatusCode::NO_CONTENT
}

/// Drop all outstanding tickets.
async fn clear_tickets(State(state): State<TestState>) -> StatusCode {
    let removed = state.tickets.size();
    state.tickets.clear();
    info!(count = removed, "Cleared tickets");
    StatusCode::NO_CONTENT
}
