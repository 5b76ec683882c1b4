//! gridmarket - Grid ownership and dynamic pricing engine
//!
//! A fixed 10x10 grid of cells. Each cell can be bought once by a wallet
//! identity; its owner may then attach an image to it. Every tenth purchase
//! escalates the price of every still-unowned cell by 1.75x.
//!
//! ## Architecture
//!
//! ```text
//! HttpServer
//!     ↓
//! Services (PurchaseCoordinator, AssetAttachmentService, EventBus)
//!     ↓
//! CellStore ──── PricingPolicy
//!     ↓
//! RecordStore (memory | sled)      BlobStore (memory | filesystem)
//! ```
//!
//! The cell store's conditional ownership write is the only concurrency
//! gate: of two buyers racing for one cell, exactly one wins and the other
//! sees [`GridError::AlreadySold`].
//!
//! ## Storage Layout
//!
//! ```text
//! ./data/
//! ├── grid.sled/             # Cell records and counters
//! └── assets/
//!     └── cells/{cell_id}/   # Uploaded images, {millis}-{hash}.{ext}
//! ```

pub mod blobs;
pub mod cells;
pub mod config;
pub mod error;
pub mod http;
pub mod identity;
pub mod pricing;
pub mod services;
pub mod store;
pub mod types;
pub mod view;

// Re-exports
pub use blobs::{BlobStore, FsBlobStore, InMemoryBlobStore};
pub use cells::{CellStore, InitReport};
pub use config::Args;
pub use error::{BlobError, GridError, StoreError};
pub use http::HttpServer;
pub use identity::{IdentityProvider, RequestIdentity, WalletSession};
pub use pricing::PricingPolicy;
pub use services::{
    AssetAttachmentService, AttachmentLimits, EventBus, GridEvent, PurchaseCoordinator, Services,
};
pub use store::{MemoryRecordStore, RecordStore, SledRecordStore};
pub use types::{AssetRef, Cell, CellId, Identity, Lamports, PurchaseReceipt};
pub use view::{GridProjection, GridSnapshot, SortKey};
