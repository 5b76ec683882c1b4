//! Persistent record store backed by sled
//!
//! Layout:
//!
//! ```text
//! cells       cell id (16 bytes)  -> Cell (MessagePack)
//! cell_index  grid index (1 byte) -> cell id
//! counters    name                -> u64 (big endian)
//! ```
//!
//! Inserts update `cells` and `cell_index` in one transaction. Conditional
//! writes read the record, check the precondition, then compare-and-swap the
//! encoded bytes. A lost swap means another writer got
//! there first, so the loop re-reads and re-checks.

use std::path::Path;

use sled::transaction::{TransactionError, TransactionResult, Transactional};
use sled::Tree;
use tracing::{debug, info};

use super::{CellFilter, CellOrder, CellPatch, InsertOutcome, Precondition, RecordStore};
use crate::error::StoreError;
use crate::types::{Cell, CellId};

/// Attempts before a contended conditional write gives up
const MAX_CAS_RETRIES: usize = 64;

/// Cell records persisted in a local sled database
pub struct SledRecordStore {
    db: sled::Db,
    cells: Tree,
    cell_index: Tree,
    counters: Tree,
}

impl SledRecordStore {
    /// Open or create the store at the given directory
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path.as_ref())?;
        let store = Self::from_db(db)?;
        info!(path = %path.as_ref().display(), "Opened cell database");
        Ok(store)
    }

    /// Open a throwaway store (for tests)
    pub fn open_temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StoreError> {
        let cells = db.open_tree("cells")?;
        let cell_index = db.open_tree("cell_index")?;
        let counters = db.open_tree("counters")?;
        Ok(Self {
            db,
            cells,
            cell_index,
            counters,
        })
    }

    /// Flush pending writes to disk
    pub async fn flush(&self) -> Result<(), StoreError> {
        self.db.flush_async().await?;
        Ok(())
    }

    fn decode(bytes: &[u8]) -> Result<Cell, StoreError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    fn encode(cell: &Cell) -> Result<Vec<u8>, StoreError> {
        Ok(rmp_serde::to_vec(cell)?)
    }

    fn decode_counter(bytes: &[u8]) -> u64 {
        <[u8; 8]>::try_from(bytes)
            .map(u64::from_be_bytes)
            .unwrap_or(0)
    }

    /// Insert a cell unless its index is taken. Both trees change in one
    /// transaction, so an index entry never exists without its record.
    fn insert_one(&self, cell: &Cell) -> Result<bool, StoreError> {
        let id_key = cell.id.as_uuid().as_bytes().to_vec();
        let index_key = [cell.index];
        let encoded = Self::encode(cell)?;

        let result: TransactionResult<bool, ()> =
            (&self.cells, &self.cell_index).transaction(|(cells, index)| {
                if index.get(index_key)?.is_some() {
                    return Ok(false);
                }
                index.insert(&index_key[..], id_key.as_slice())?;
                cells.insert(id_key.as_slice(), encoded.as_slice())?;
                Ok(true)
            });

        result.map_err(|e| match e {
            TransactionError::Abort(()) => {
                StoreError::Unavailable(format!("insert at index {} aborted", cell.index))
            }
            TransactionError::Storage(e) => e.into(),
        })
    }
}

#[async_trait::async_trait]
impl RecordStore for SledRecordStore {
    async fn select(&self, filter: CellFilter, order: CellOrder) -> Result<Vec<Cell>, StoreError> {
        let mut cells = Vec::new();
        for item in self.cells.iter() {
            let (_, value) = item?;
            let cell = Self::decode(&value)?;
            if filter.matches(&cell) {
                cells.push(cell);
            }
        }
        order.sort(&mut cells);
        Ok(cells)
    }

    async fn get(&self, id: CellId) -> Result<Option<Cell>, StoreError> {
        match self.cells.get(id.as_uuid().as_bytes())? {
            Some(value) => Ok(Some(Self::decode(&value)?)),
            None => Ok(None),
        }
    }

    async fn insert(&self, records: Vec<Cell>) -> Result<InsertOutcome, StoreError> {
        let mut outcome = InsertOutcome::default();
        for cell in &records {
            if self.insert_one(cell)? {
                outcome.inserted += 1;
            } else {
                debug!(index = cell.index, "Index already taken, skipping insert");
                outcome.skipped += 1;
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
        let key = id.as_uuid().as_bytes();

        for attempt in 0..MAX_CAS_RETRIES {
            let current = self.cells.get(key)?.ok_or(StoreError::NotFound(id))?;
            let mut cell = Self::decode(&current)?;
            precondition.check(&cell)?;
            patch.apply(&mut cell);
            let encoded = Self::encode(&cell)?;

            match self.cells.compare_and_swap(key, Some(&current), Some(encoded))? {
                Ok(()) => return Ok(cell),
                Err(_) => {
                    debug!(cell = %id, attempt, "Conditional write lost a race, retrying");
                }
            }
        }

        Err(StoreError::Unavailable(format!(
            "conditional write on {} kept conflicting",
            id
        )))
    }

    async fn increment_counter(&self, name: &str) -> Result<u64, StoreError> {
        let updated = self.counters.update_and_fetch(name.as_bytes(), |old| {
            let next = old.map(Self::decode_counter).unwrap_or(0) + 1;
            Some(next.to_be_bytes().to_vec())
        })?;
        Ok(updated.map(|v| Self::decode_counter(&v)).unwrap_or(0))
    }

    async fn counter(&self, name: &str) -> Result<u64, StoreError> {
        Ok(self
            .counters
            .get(name.as_bytes())?
            .map(|v| Self::decode_counter(&v))
            .unwrap_or(0))
    }

    async fn set_counter(&self, name: &str, value: u64) -> Result<(), StoreError> {
        self.counters.insert(name.as_bytes(), value.to_be_bytes().to_vec())?;
        Ok(())
    }
}
