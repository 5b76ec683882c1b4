//! Event system for grid operations
//!
//! Services emit a [`GridEvent`] after each state change they commit.
//! Subscribers use them for audit logging and live UI refreshes.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, trace};

use crate::types::{CellId, Identity, Lamports};

/// Grid events emitted by services
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GridEvent {
    CellsInitialized {
        created: usize,
    },
    CellPurchased {
        cell_id: CellId,
        label: u16,
        buyer: Identity,
        price: Lamports,
        purchase_count: u64,
    },
    RepricingPass {
        purchase_count: u64,
        repriced: usize,
        skipped: usize,
    },
    ImageAttached {
        cell_id: CellId,
        label: u16,
        url: String,
    },
}

/// Trait for event listeners
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &GridEvent);
}

/// Event bus for broadcasting grid events
pub struct EventBus {
    sender: broadcast::Sender<GridEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: GridEvent) {
        trace!(event = ?event, "Emitting grid event");
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GridEvent> {
        self.sender.subscribe()
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

/// Audit trail listener
pub struct LoggingEventListener;

impl EventListener for LoggingEventListener {
    fn on_event(&self, event: &GridEvent) {
        match event {
            GridEvent::CellsInitialized { created } => {
                info!(created, "Cells initialized");
            }
            GridEvent::CellPurchased {
                label,
                buyer,
                price,
                purchase_count,
                ..
            } => {
                info!(
                    cell = label,
                    buyer = %buyer.short(),
                    price = %price,
                    purchase_count,
                    "Cell purchased"
                );
            }
            GridEvent::RepricingPass {
                purchase_count,
                repriced,
                skipped,
            } => {
                info!(purchase_count, repriced, skipped, "Prices escalated");
            }
            GridEvent::ImageAttached { label, url, .. } => {
                debug!(cell = label, url = %url, "Image attached");
            }
        }
    }
}

/// Spawn a background task that logs all events
pub fn spawn_logging_listener(event_bus: Arc<EventBus>) -> tokio::task::JoinHandle<()> {
    let mut receiver = event_bus.subscribe();
    let listener = LoggingEventListener;

    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => listener.on_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Event listener lagged, skipped events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed, stopping listener");
                    break;
                }
            }
        }
    })
}
