//! Service layer for gridmarket
//!
//! Services hold the grid rules between HTTP handlers and the cell store:
//! - Identity checks
//! - Purchase orchestration and repricing
//! - Image validation and upload
//! - Event emission for audit logging
//!
//! ## Architecture
//!
//! ```text
//! HTTP Handlers (thin)
//!     ↓
//! Service Layer (purchase, assets)
//!     ↓
//! Cell Store (conditional writes)
//!     ↓
//! RecordStore / BlobStore
//! ```

pub mod assets;
pub mod events;
pub mod purchase;

pub use assets::{AssetAttachmentService, AttachmentLimits};
pub use events::{spawn_logging_listener, EventBus, EventListener, GridEvent};
pub use purchase::{PurchaseCoordinator, RepricingReport};

use std::sync::Arc;

use crate::blobs::BlobStore;
use crate::cells::{CellStore, InitReport};
use crate::error::Result;
use crate::pricing::PricingPolicy;
use crate::store::RecordStore;

/// Service container for dependency injection
///
/// Pass this to the HTTP server for handler access.
pub struct Services {
    pub cells: CellStore,
    pub purchases: Arc<PurchaseCoordinator>,
    pub assets: Arc<AssetAttachmentService>,
    pub blobs: Arc<dyn BlobStore>,
    pub events: Arc<EventBus>,
}

impl Services {
    /// Wire all services over the given stores
    pub fn new(
        records: Arc<dyn RecordStore>,
        blobs: Arc<dyn BlobStore>,
        policy: PricingPolicy,
        limits: AttachmentLimits,
    ) -> Self {
        let events = Arc::new(EventBus::new());
        let cells = CellStore::new(records, policy.base_price);

        Self {
            purchases: Arc::new(PurchaseCoordinator::new(cells.clone(), policy, events.clone())),
            assets: Arc::new(AssetAttachmentService::new(
                cells.clone(),
                blobs.clone(),
                limits,
                events.clone(),
            )),
            cells,
            blobs,
            events,
        }
    }

    /// Create the grid if needed
    pub async fn initialize(&self) -> Result<InitReport> {
        let report = self.cells.initialize().await?;
        if report.created > 0 {
            self.events.emit(GridEvent::CellsInitialized {
                created: report.created,
            });
        }
        Ok(report)
    }
}
