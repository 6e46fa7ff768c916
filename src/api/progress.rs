//! Server-sent progress streams.
//!
//! Browsers cannot attach headers to an `EventSource`, so besides the session
//! cookie these endpoints also accept a one-time `?ticket=` issued by the
//! tickets API for exactly this resource.
//!
//! - GET `/transfers/{job_id}/progress`
//! - GET `/uploads/{key}/progress`

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, State},
    middleware,
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
};
use futures::{Stream, StreamExt, stream};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};

use crate::auth::{Auth, Identity, TokenResolver, require_identity};
use crate::impl_has_auth_backend;
use crate::progress::{ProgressEvent, ProgressHub};
use crate::tickets::ResourceType;

/// State for progress stream endpoints.
#[derive(Clone)]
pub struct ProgressState {
    pub resolver: Arc<TokenResolver>,
    pub progress: ProgressHub,
}

impl_has_auth_backend!(ProgressState);

/// First event on every stream.
#[derive(Debug, Serialize)]
struct Connected<'a> {
    username: &'a str,
    resource: &'a str,
    resource_type: ResourceType,
}

pub fn router(state: ProgressState) -> Router {
    Router::new()
        .route("/transfers/{job_id}/progress", get(transfer_progress))
        .route("/uploads/{key}/progress", get(upload_progress))
        .route_layer(middleware::from_fn_with_state(
            state.resolver.clone(),
            require_identity,
        ))
        .with_state(state)
}

async fn transfer_progress(
    State(state): State<ProgressState>,
    Auth(identity): Auth,
    Path(job_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    progress_stream(&state.progress, identity, ResourceType::Transfer, job_id)
}

async fn upload_progress(
    State(state): State<ProgressState>,
    Auth(identity): Auth,
    Path(key): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    progress_stream(&state.progress, identity, ResourceType::Upload, key)
}

fn progress_stream(
    hub: &ProgressHub,
    identity: Identity,
    resource_type: ResourceType,
    resource: String,
) -> Sse<impl Stream<Item = Result<Event, Infallible>> + use<>> {
    // Subscribe before responding so nothing published afterwards is missed.
    let subscription = hub.subscribe(resource_type, &resource);

    info!(
        username = %identity.username,
        %resource_type,
        resource = %resource,
        "Progress stream opened"
    );

    let connected = Event::default().event("connected").data(
        serde_json::to_string(&Connected {
            username: &identity.username,
            resource: &resource,
            resource_type,
        })
        .unwrap_or_default(),
    );

    // Dropping the stream drops the subscription, which releases the channel.
    let updates = stream::unfold(Some(subscription), |subscription| async move {
        let mut subscription = subscription?;
        loop {
            match subscription.recv().await {
                Ok(event) => {
                    let next = if event.done { None } else { Some(subscription) };
                    return Some((Ok(progress_event(&event)), next));
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Progress subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    let stream = stream::once(async move { Ok(connected) }).chain(updates);
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn progress_event(event: &ProgressEvent) -> Event {
    Event::default()
        .event("progress")
        .data(serde_json::to_string(event).unwrap_or_default())
}
