//! Record store abstraction
//!
//! The engine never talks to a database directly. It talks to a
//! [`RecordStore`], which exposes select/insert/update over cell records plus
//! durable counters. Every single-record write carries a [`Precondition`]
//! that the store checks atomically with the write; this conditional write is
//! what keeps two buyers from owning the same cell.
//!
//! ## Backends
//!
//! - [`MemoryRecordStore`] - sharded in-memory map, per-record locking
//! - [`SledRecordStore`] - sled trees with compare-and-swap retry loops

pub mod memory;
pub mod sled_store;

pub use memory::MemoryRecordStore;
pub use sled_store::SledRecordStore;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::types::{AssetRef, Cell, CellId, Identity, Lamports};

/// Counter tracking committed purchases
pub const PURCHASE_COUNTER: &str = "purchases";

/// Which records a select returns
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellFilter {
    All,
    Unowned,
    Owned,
    OwnedBy(Identity),
}

impl CellFilter {
    pub fn matches(&self, cell: &Cell) -> bool {
        match self {
            CellFilter::All => true,
            CellFilter::Unowned => cell.owner.is_none(),
            CellFilter::Owned => cell.owner.is_some(),
            CellFilter::OwnedBy(identity) => cell.is_owned_by(identity),
        }
    }
}

/// Sort order for a select
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CellOrder {
    #[default]
    Index,
    /// Newest purchase first, unowned cells last, ties by index
    NewestPurchase,
}

impl CellOrder {
    pub fn sort(&self, cells: &mut [Cell]) {
        match self {
            CellOrder::Index => cells.sort_by_key(|c| c.index),
            CellOrder::NewestPurchase => cells.sort_by(|a, b| {
                match (a.purchased_at, b.purchased_at) {
                    (Some(x), Some(y)) => y.cmp(&x),
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => std::cmp::Ordering::Equal,
                }
                .then(a.index.cmp(&b.index))
            }),
        }
    }
}

/// Condition on the stored record that must hold for a write to apply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    Any,
    Unowned,
    Owned,
    OwnedBy(Identity),
}

impl Precondition {
    /// Check the condition against the current record
    pub fn check(&self, cell: &Cell) -> Result<(), StoreError> {
        match self {
            Precondition::Any => Ok(()),
            Precondition::Unowned if cell.owner.is_some() => Err(StoreError::AlreadyOwned(cell.id)),
            Precondition::Unowned => Ok(()),
            Precondition::Owned if cell.owner.is_none() => Err(StoreError::NoOwner(cell.id)),
            Precondition::Owned => Ok(()),
            Precondition::OwnedBy(identity) => match &cell.owner {
                None => Err(StoreError::NoOwner(cell.id)),
                Some(owner) if owner == identity => Ok(()),
                Some(_) => Err(StoreError::NotOwner(cell.id)),
            },
        }
    }
}

/// Partial update of a cell record; `None` fields are left unchanged
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CellPatch {
    pub price: Option<Lamports>,
    pub owner: Option<Identity>,
    pub image_ref: Option<AssetRef>,
    pub purchased_at: Option<DateTime<Utc>>,
    pub receipt_id: Option<Uuid>,
}

impl CellPatch {
    /// Ownership transition, stamped with purchase time and receipt
    pub fn claim(owner: Identity, purchased_at: DateTime<Utc>, receipt_id: Uuid) -> Self {
        Self {
            owner: Some(owner),
            purchased_at: Some(purchased_at),
            receipt_id: Some(receipt_id),
            ..Default::default()
        }
    }

    pub fn price(price: Lamports) -> Self {
        Self {
            price: Some(price),
            ..Default::default()
        }
    }

    pub fn image(image_ref: AssetRef) -> Self {
        Self {
            image_ref: Some(image_ref),
            ..Default::default()
        }
    }

    pub fn apply(&self, cell: &mut Cell) {
        if let Some(price) = self.price {
            cell.price = price;
        }
        if let Some(owner) = &self.owner {
            cell.owner = Some(owner.clone());
        }
        if let Some(image_ref) = &self.image_ref {
            cell.image_ref = Some(image_ref.clone());
        }
        if let Some(at) = self.purchased_at {
            cell.purchased_at = Some(at);
        }
        if let Some(receipt_id) = self.receipt_id {
            cell.receipt_id = Some(receipt_id);
        }
    }
}

/// Result of a bulk insert
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsertOutcome {
    pub inserted: usize,
    /// Records dropped because their index was already taken
    pub skipped: usize,
}

/// Persistence capability consumed by the cell store
///
/// Implementations must make each single-record `update` atomic: the
/// precondition is evaluated against the record as it is at commit time.
#[async_trait::async_trait]
pub trait RecordStore: Send + Sync {
    /// Select records matching a filter
    async fn select(&self, filter: CellFilter, order: CellOrder) -> Result<Vec<Cell>, StoreError>;

    /// Get one record by id
    async fn get(&self, id: CellId) -> Result<Option<Cell>, StoreError>;

    /// Insert records; `index` is a unique key, duplicates are skipped
    async fn insert(&self, records: Vec<Cell>) -> Result<InsertOutcome, StoreError>;

    /// Conditionally update one record, returning the record as written
    async fn update(
        &self,
        id: CellId,
        precondition: Precondition,
        patch: CellPatch,
    ) -> Result<Cell, StoreError>;

    /// Apply the same conditional patch to several records independently
    async fn update_many(
        &self,
        ids: &[CellId],
        precondition: Precondition,
        patch: CellPatch,
    ) -> Result<Vec<(CellId, Result<Cell, StoreError>)>, StoreError> {
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            let result = self.update(*id, precondition.clone(), patch.clone()).await;
            results.push((*id, result));
        }
        Ok(results)
    }

    /// Atomically increment a named counter, returning the new value
    async fn increment_counter(&self, name: &str) -> Result<u64, StoreError>;

    /// Read a named counter (0 if never written)
    async fn counter(&self, name: &str) -> Result<u64, StoreError>;

    /// Overwrite a named counter
    async fn set_counter(&self, name: &str, value: u64) -> Result<(), StoreError>;
}
