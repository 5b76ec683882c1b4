//! Error types for gridmarket
//!
//! Three layers:
//! - [`StoreError`] - record store outcomes (conditional write failures, I/O)
//! - [`BlobError`] - blob store failures
//! - [`GridError`] - what callers of the engine see

use thiserror::Error;

use crate::types::CellId;

/// Errors reported by a [`RecordStore`](crate::store::RecordStore)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Cell not found: {0}")]
    NotFound(CellId),

    #[error("Cell already owned: {0}")]
    AlreadyOwned(CellId),

    #[error("Price of owned cell is frozen: {0}")]
    ImmutablePrice(CellId),

    #[error("Cell has no owner: {0}")]
    NoOwner(CellId),

    #[error("Caller does not own cell: {0}")]
    NotOwner(CellId),

    #[error("A cell already exists at index {0}")]
    DuplicateIndex(u8),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Codec error: {0}")]
    Codec(String),
}

impl From<sled::Error> for StoreError {
    fn from(e: sled::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StoreError::Codec(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StoreError::Codec(e.to_string())
    }
}

/// Errors reported by a [`BlobStore`](crate::blobs::BlobStore)
#[derive(Error, Debug)]
pub enum BlobError {
    #[error("Invalid asset path: {0}")]
    InvalidPath(String),

    #[error("Asset not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Engine-level errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GridError {
    #[error("Wallet not connected")]
    NotAuthenticated,

    #[error("Cell not found: {0}")]
    NotFound(String),

    #[error("Cell #{label} is already sold")]
    AlreadySold { cell_id: CellId, label: u16 },

    #[error("You are not the owner of this cell")]
    NotOwner,

    #[error("Invalid image: {0}")]
    InvalidImage(String),

    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// A conditional write no caller expected to lose
    #[error("Write conflicts with current cell state: {0}")]
    Conflict(String),
}

impl GridError {
    /// Expected outcomes of user actions, reported to the caller but never
    /// logged as system errors
    pub fn is_business_outcome(&self) -> bool {
        matches!(
            self,
            GridError::NotAuthenticated
                | GridError::NotFound(_)
                | GridError::AlreadySold { .. }
                | GridError::NotOwner
                | GridError::InvalidImage(_)
        )
    }

    /// Infrastructure failures the caller may retry; state is left unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(self, GridError::UploadFailed(_) | GridError::StoreUnavailable(_))
    }
}

impl From<StoreError> for GridError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => GridError::NotFound(id.to_string()),
            StoreError::NotOwner(_) | StoreError::NoOwner(_) => GridError::NotOwner,
            // Callers that can lose an ownership race map AlreadyOwned
            // themselves, since they know the cell's label.
            e @ (StoreError::AlreadyOwned(_)
            | StoreError::ImmutablePrice(_)
            | StoreError::DuplicateIndex(_)) => GridError::Conflict(e.to_string()),
            e @ (StoreError::Unavailable(_) | StoreError::Codec(_)) => {
                GridError::StoreUnavailable(e.to_string())
            }
        }
    }
}

impl From<BlobError> for GridError {
    fn from(e: BlobError) -> Self {
        GridError::UploadFailed(e.to_string())
    }
}

/// Result alias for engine operations
pub type Result<T> = std::result::Result<T, GridError>;
