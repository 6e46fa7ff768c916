//! Progress fan-out for streaming endpoints.
//!
//! Workers publish progress for a transfer job or upload; every open stream
//! for that resource receives it. Channels are created on first use and
//! dropped once the resource reports completion or its last subscriber goes
//! away. Closing the hub ends every stream so the server can shut down.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};

use crate::tickets::ResourceType;

/// Buffered events per resource before slow subscribers start lagging.
const CHANNEL_CAPACITY: usize = 64;

/// One progress update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    /// Bytes (or objects) processed so far
    pub transferred: u64,
    /// Total, if known
    pub total: Option<u64>,
    /// Set on the final event for the resource
    pub done: bool,
    /// Failure description, if the operation failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

type ChannelKey = (ResourceType, String);

#[derive(Default)]
struct HubState {
    channels: HashMap<ChannelKey, broadcast::Sender<ProgressEvent>>,
    closed: bool,
}

/// Per-resource broadcast channels.
#[derive(Clone, Default)]
pub struct ProgressHub {
    state: Arc<Mutex<HubState>>,
}

impl ProgressHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe to progress for a resource.
    ///
    /// After [`ProgressHub::close`] the subscription is already finished.
    pub fn subscribe(&self, resource_type: ResourceType, resource: &str) -> Subscription {
        let key = (resource_type, resource.to_string());
        let mut state = self.state();

        let receiver = if state.closed {
            broadcast::channel(1).1
        } else {
            state
                .channels
                .entry(key.clone())
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                .subscribe()
        };

        Subscription {
            hub: self.clone(),
            key,
            receiver: Some(receiver),
        }
    }

    /// Publish progress. Returns how many subscribers received it.
    pub fn publish(&self, resource_type: ResourceType, resource: &str, event: ProgressEvent) -> usize {
        let key = (resource_type, resource.to_string());
        let mut state = self.state();
        let done = event.done;

        let delivered = state
            .channels
            .get(&key)
            .and_then(|sender| sender.send(event).ok())
            .unwrap_or(0);

        if done {
            state.channels.remove(&key);
        }
        delivered
    }

    /// Drop every channel and refuse new ones. Open subscriptions end after
    /// draining what was already published.
    pub fn close(&self) {
        let mut state = self.state();
        state.closed = true;
        state.channels.clear();
    }

    /// Number of resources with an open channel.
    pub fn channel_count(&self) -> usize {
        self.state().channels.len()
    }
}

/// A live subscription to one resource.
///
/// Dropping the last subscription for a resource removes its channel.
pub struct Subscription {
    hub: ProgressHub,
    key: ChannelKey,
    receiver: Option<broadcast::Receiver<ProgressEvent>>,
}

impl Subscription {
    /// Wait for the next event. `Closed` once the resource finished or the hub closed.
    pub async fn recv(&mut self) -> Result<ProgressEvent, RecvError> {
        match self.receiver.as_mut() {
            Some(receiver) => receiver.recv().await,
            None => Err(RecvError::Closed),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut state = self.hub.state();
        drop(self.receiver.take());

        let idle = state
            .channels
            .get(&self.key)
            .is_some_and(|sender| sender.receiver_count() == 0);
        if idle {
            state.channels.remove(&self.key);
        }
    }
}
