//! In-memory record store
//!
//! Backed by sharded concurrent maps. A conditional update holds the write
//! guard of exactly one record while it checks and applies, so writes to
//! different cells never contend on a global lock.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use super::{CellFilter, CellOrder, CellPatch, InsertOutcome, Precondition, RecordStore};
use crate::error::StoreError;
use crate::types::{Cell, CellId};

/// Record store for tests and single-process development
#[derive(Default)]
pub struct MemoryRecordStore {
    cells: DashMap<CellId, Cell>,
    /// Unique index: grid position -> cell id
    by_index: DashMap<u8, CellId>,
    counters: DashMap<String, u64>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

#[async_trait::async_trait]
impl RecordStore for MemoryRecordStore {
    async fn select(&self, filter: CellFilter, order: CellOrder) -> Result<Vec<Cell>, StoreError> {
        let mut cells: Vec<Cell> = self
            .cells
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        order.sort(&mut cells);
        Ok(cells)
    }

    async fn get(&self, id: CellId) -> Result<Option<Cell>, StoreError> {
        Ok(self.cells.get(&id).map(|entry| entry.value().clone()))
    }

    async fn insert(&self, records: Vec<Cell>) -> Result<InsertOutcome, StoreError> {
        let mut outcome = InsertOutcome::default();
        for cell in records {
            match self.by_index.entry(cell.index) {
                Entry::Occupied(_) => {
                    debug!(index = cell.index, "Index already taken, skipping insert");
                    outcome.skipped += 1;
                }
                Entry::Vacant(slot) => {
                    slot.insert(cell.id);
                    self.cells.insert(cell.id, cell);
                    outcome.inserted += 1;
                }
            }
        }
        Ok(outcome)
    }

    async fn update(
        &self,
        id: CellId,
        precondition: Precondition,
        patch: CellPatch,
    ) -> Result<Cell, StoreError> {
        let mut entry = self.cells.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        precondition.check(entry.value())?;
        patch.apply(entry.value_mut());
        Ok(entry.value().clone())
    }

    async fn increment_counter(&self, name: &str) -> Result<u64, StoreError> {
        let mut counter = self.counters.entry(name.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn counter(&self, name: &str) -> Result<u64, StoreError> {
        Ok(self.counters.get(name).map(|c| *c).unwrap_or(0))
    }

    async fn set_counter(&self, name: &str, value: u64) -> Result<(), StoreError> {
        self.counters.insert(name.to_string(), value);
        Ok(())
    }
}
