//! Operational event bus.
//!
//! Each subscriber gets its own bounded channel. Publishing never waits: if a
//! subscriber's buffer is full the event is dropped for that subscriber only
//! (and counted), so a slow consumer can never stall the data layer.
//!
//! # Example
//!
//! ```
//! use fund_data_layer::events::{DataLayerEvent, EventBus};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let bus = EventBus::new(16);
//! let mut sub = bus.subscribe();
//! bus.publish(DataLayerEvent::DataSourceSwitched { from: None, to: "primary".into() });
//! assert!(matches!(sub.recv().await, Some(DataLayerEvent::DataSourceSwitched { .. })));
//!
//! bus.unsubscribe(sub.id());
//! assert!(sub.recv().await.is_none());
//! # }
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

use crate::source::SourceHealth;
use crate::sync::SyncOperationRecord;

#[derive(Debug, Clone, PartialEq)]
pub enum DataLayerEvent {
    /// The source serving production traffic changed
    DataSourceSwitched { from: Option<String>, to: String },
    SyncCompleted { record: SyncOperationRecord },
    /// A self-check found problems
    HealthDegraded { issues: Vec<String> },
    SourceHealthChanged {
        source_id: String,
        from: SourceHealth,
        to: SourceHealth,
    },
}

impl DataLayerEvent {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DataSourceSwitched { .. } => "data_source_switched",
            Self::SyncCompleted { .. } => "sync_completed",
            Self::HealthDegraded { .. } => "health_degraded",
            Self::SourceHealthChanged { .. } => "source_health_changed",
        }
    }
}

/// Receiving end of a subscription. Ends (`recv` → `None`) after
/// [`EventBus::unsubscribe`] or [`EventBus::close`].
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    receiver: mpsc::Receiver<DataLayerEvent>,
}

impl Subscription {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<DataLayerEvent> {
        self.receiver.recv().await
    }

    /// Next buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<DataLayerEvent> {
        self.receiver.try_recv().ok()
    }
}

#[derive(Debug)]
pub struct EventBus {
    subscribers: DashMap<u64, mpsc::Sender<DataLayerEvent>>,
    next_id: AtomicU64,
    capacity: usize,
    closed: AtomicBool,
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
            closed: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if !self.closed.load(Ordering::Acquire) {
            self.subscribers.insert(id, tx);
        }
        Subscription { id, receiver: rx }
    }

    /// Returns whether the subscription existed.
    pub fn unsubscribe(&self, id: u64) -> bool {
        self.subscribers.remove(&id).is_some()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Deliver to every subscriber without blocking. Returns the number of
    /// subscribers that received the event.
    pub fn publish(&self, event: DataLayerEvent) -> usize {
        if self.closed.load(Ordering::Acquire) {
            return 0;
        }
        let kind = event.kind();
        let mut delivered = 0;
        let mut gone = Vec::new();

        for sub in self.subscribers.iter() {
            match sub.value().try_send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    crate::metrics::record_event(kind, true);
                }
                Err(TrySendError::Full(_)) => {
                    debug!(subscriber = *sub.key(), kind, "Subscriber buffer full, event dropped");
                    crate::metrics::record_event(kind, false);
                }
                Err(TrySendError::Closed(_)) => gone.push(*sub.key()),
            }
        }

        for id in gone {
            self.subscribers.remove(&id);
        }
        delivered
    }

    /// Stop accepting events and end every subscription.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.subscribers.clear();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
