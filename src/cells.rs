//! Cell store
//!
//! The single source of truth for ownership and price. Wraps a
//! [`RecordStore`] and turns the grid rules into conditional writes:
//!
//! - ownership moves None -> Some exactly once (`Precondition::Unowned`)
//! - price only moves while unowned (`Precondition::Unowned`)
//! - the image only moves for the owner (`Precondition::OwnedBy`)

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::{
    CellFilter, CellOrder, CellPatch, Precondition, RecordStore, PURCHASE_COUNTER,
};
use crate::types::{AssetRef, Cell, CellId, Identity, Lamports, GRID_CELLS};
use crate::view::GridSnapshot;

/// What `initialize` found and did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitReport {
    /// Cells that already existed
    pub existing: usize,
    /// Cells created by this call
    pub created: usize,
}

/// Durable grid state
#[derive(Clone)]
pub struct CellStore {
    records: Arc<dyn RecordStore>,
    base_price: Lamports,
}

impl CellStore {
    pub fn new(records: Arc<dyn RecordStore>, base_price: Lamports) -> Self {
        Self { records, base_price }
    }

    /// Ensure all grid cells exist; existing cells are left untouched.
    ///
    /// Safe to call on a live grid. It never touches the purchase counter.
    pub async fn initialize(&self) -> Result<InitReport, StoreError> {
        let existing = self.records.select(CellFilter::All, CellOrder::Index).await?;
        let mut taken = [false; GRID_CELLS];
        for cell in &existing {
            if let Some(slot) = taken.get_mut(cell.index as usize) {
                *slot = true;
            }
        }

        let missing: Vec<Cell> = (0..GRID_CELLS as u8)
            .filter(|i| !taken[*i as usize])
            .map(|i| Cell::new(i, self.base_price))
            .collect();

        let created = if missing.is_empty() {
            0
        } else {
            let outcome = self.records.insert(missing).await?;
            if outcome.skipped > 0 {
                debug!(skipped = outcome.skipped, "Another initializer created some cells first");
            }
            outcome.inserted
        };

        if created > 0 {
            info!(created, existing = existing.len(), "Grid initialized");
        }

        Ok(InitReport {
            existing: existing.len(),
            created,
        })
    }

    /// Bring the purchase counter back in line with the number of owned
    /// cells, repairing a crash between an ownership write and the counter
    /// increment. Returns the reconciled count.
    ///
    /// Startup only: a purchase between its ownership write and its
    /// increment would be counted twice.
    pub async fn reconcile_purchase_counter(&self) -> Result<u64, StoreError> {
        let owned = self.owned_count().await?;
        let counter = self.purchase_count().await?;
        if counter != owned {
            warn!(counter, owned, "Purchase counter out of sync, reconciling with owned cells");
            self.sync_purchase_counter(owned).await?;
        }
        Ok(owned)
    }

    /// All cells ordered by index
    pub async fn list_all(&self) -> Result<Vec<Cell>, StoreError> {
        self.records.select(CellFilter::All, CellOrder::Index).await
    }

    /// Unowned cells ordered by index
    pub async fn list_available(&self) -> Result<Vec<Cell>, StoreError> {
        self.records.select(CellFilter::Unowned, CellOrder::Index).await
    }

    /// Cells owned by `identity`, newest purchase first
    pub async fn list_owned_by(&self, identity: &Identity) -> Result<Vec<Cell>, StoreError> {
        self.records
            .select(CellFilter::OwnedBy(identity.clone()), CellOrder::NewestPurchase)
            .await
    }

    pub async fn get_by_id(&self, id: CellId) -> Result<Cell, StoreError> {
        self.records.get(id).await?.ok_or(StoreError::NotFound(id))
    }

    /// Read-only projection of the whole grid
    pub async fn snapshot(&self) -> Result<GridSnapshot, StoreError> {
        Ok(GridSnapshot::new(self.list_all().await?))
    }

    /// Claim an unowned cell. Fails with `AlreadyOwned` if anyone got
    /// there first; this write is the arbiter between racing buyers.
    pub async fn set_owner(&self, id: CellId, identity: &Identity) -> Result<Cell, StoreError> {
        let patch = CellPatch::claim(identity.clone(), Utc::now(), Uuid::new_v4());
        self.records.update(id, Precondition::Unowned, patch).await
    }

    /// Set the price of an unowned cell
    pub async fn set_price(&self, id: CellId, price: Lamports) -> Result<Cell, StoreError> {
        self.records
            .update(id, Precondition::Unowned, CellPatch::price(price))
            .await
            .map_err(|e| match e {
                StoreError::AlreadyOwned(id) => StoreError::ImmutablePrice(id),
                other => other,
            })
    }

    /// Set the same price on several unowned cells, each independently
    pub async fn set_prices(
        &self,
        ids: &[CellId],
        price: Lamports,
    ) -> Result<Vec<(CellId, Result<Cell, StoreError>)>, StoreError> {
        let results = self
            .records
            .update_many(ids, Precondition::Unowned, CellPatch::price(price))
            .await?;
        Ok(results
            .into_iter()
            .map(|(id, result)| {
                let result = result.map_err(|e| match e {
                    StoreError::AlreadyOwned(id) => StoreError::ImmutablePrice(id),
                    other => other,
                });
                (id, result)
            })
            .collect())
    }

    /// Point an owned cell at a new asset. Only the owner may do this.
    pub async fn set_image_ref(
        &self,
        id: CellId,
        owner: &Identity,
        image_ref: AssetRef,
    ) -> Result<Cell, StoreError> {
        self.records
            .update(id, Precondition::OwnedBy(owner.clone()), CellPatch::image(image_ref))
            .await
    }

    /// Count a committed purchase, returning the new total
    pub async fn record_purchase(&self) -> Result<u64, StoreError> {
        self.records.increment_counter(PURCHASE_COUNTER).await
    }

    pub async fn purchase_count(&self) -> Result<u64, StoreError> {
        self.records.counter(PURCHASE_COUNTER).await
    }

    /// Overwrite the purchase counter
    pub async fn sync_purchase_counter(&self, count: u64) -> Result<(), StoreError> {
        self.records.set_counter(PURCHASE_COUNTER, count).await
    }

    pub async fn owned_count(&self) -> Result<u64, StoreError> {
        Ok(self
            .records
            .select(CellFilter::Owned, CellOrder::Index)
            .await?
            .len() as u64)
    }
}
