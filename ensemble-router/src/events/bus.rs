//! Event bus for router notifications
//!
//! Pub/sub over a Tokio broadcast channel. Publishing never blocks and never
//! fails: with no subscribers the event is simply dropped, and a lagging
//! subscriber loses the oldest events rather than stalling the router.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::types::EnsembleEvent;
use crate::types::ProviderId;

/// Channel capacity for broadcast
const CHANNEL_CAPACITY: usize = 256;

/// Shared reference to EventBus
pub type SharedEventBus = Arc<EventBus>;

/// Event bus backed by a broadcast channel
#[derive(Debug)]
pub struct EventBus {
    sender: broadcast::Sender<EnsembleEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Create a shared reference to this event bus
    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    /// Publish an event to all current subscribers
    pub fn publish(&self, event: EnsembleEvent) {
        let event_type = event.event_type();
        match self.sender.send(event) {
            Ok(count) => debug!(event_type, receivers = count, "Event published"),
            Err(_) => debug!(event_type, "Event published (no receivers)"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EnsembleEvent> {
        self.sender.subscribe()
    }

    /// Subscribe to events accepted by `filter`
    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver {
        FilteredReceiver {
            receiver: self.subscribe(),
            filter,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Narrows a subscription to some providers and event kinds.
///
/// Empty lists accept everything.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    providers: Vec<ProviderId>,
    kinds: Vec<&'static str>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept events about `provider`. May be called repeatedly.
    pub fn provider(mut self, provider: impl Into<ProviderId>) -> Self {
        self.providers.push(provider.into());
        self
    }

    /// Accept events whose `event_type()` is one of `kinds`.
    pub fn kinds(mut self, kinds: &[&'static str]) -> Self {
        self.kinds.extend_from_slice(kinds);
        self
    }

    pub fn matches(&self, event: &EnsembleEvent) -> bool {
        let provider_ok = self.providers.is_empty()
            || event
                .provider()
                .is_some_and(|p| self.providers.contains(p));
        let kind_ok = self.kinds.is_empty() || self.kinds.contains(&event.event_type());
        provider_ok && kind_ok
    }
}

/// Receiver that yields only events accepted by its filter.
///
/// Lag is logged and skipped; the receiver resumes at the oldest retained
/// event. `None` means the bus is gone.
pub struct FilteredReceiver {
    receiver: broadcast::Receiver<EnsembleEvent>,
    filter: EventFilter,
}

impl FilteredReceiver {
    pub async fn recv(&mut self) -> Option<EnsembleEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Filtered subscriber lagged, events skipped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
