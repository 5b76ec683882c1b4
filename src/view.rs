//! Grid view model
//!
//! Derives render-ready projections from a [`GridSnapshot`]. Snapshots are
//! immutable; every read of the cell store produces a new one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use uuid::Uuid;

use crate::types::{Cell, CellId, Identity, Lamports};

/// All cells at a point in time, ordered by index
#[derive(Debug, Clone)]
pub struct GridSnapshot {
    cells: Vec<Cell>,
    taken_at: DateTime<Utc>,
}

impl GridSnapshot {
    pub fn new(mut cells: Vec<Cell>) -> Self {
        cells.sort_by_key(|c| c.index);
        Self {
            cells,
            taken_at: Utc::now(),
        }
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }

    pub fn owned_count(&self) -> usize {
        self.cells.iter().filter(|c| c.is_owned()).count()
    }
}

/// Ordering for the marketplace listing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    #[default]
    Index,
    PriceAsc,
    PriceDesc,
}

impl SortKey {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "index" | "all" => Some(SortKey::Index),
            "price_asc" => Some(SortKey::PriceAsc),
            "price_desc" => Some(SortKey::PriceDesc),
            _ => None,
        }
    }

    /// Sort cells; ties always fall back to index ascending
    pub fn apply(&self, cells: &mut [DisplayCell]) {
        match self {
            SortKey::Index => cells.sort_by_key(|c| c.index),
            SortKey::PriceAsc => cells.sort_by_key(|c| (c.price, c.index)),
            SortKey::PriceDesc => cells.sort_by_key(|c| (Reverse(c.price), c.index)),
        }
    }
}

/// Read-only projection of one cell for rendering
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisplayCell {
    pub id: CellId,
    pub index: u8,
    /// 1-based number shown to users
    pub label: u16,
    pub price: Lamports,
    pub price_sol: String,
    pub is_owned: bool,
    pub is_mine: bool,
    pub owner_short: Option<String>,
    pub image_url: Option<String>,
}

impl DisplayCell {
    pub fn from_cell(cell: &Cell, caller: Option<&Identity>) -> Self {
        Self {
            id: cell.id,
            index: cell.index,
            label: cell.label(),
            price: cell.price,
            price_sol: cell.price.to_sol_string(),
            is_owned: cell.is_owned(),
            is_mine: caller.map(|c| cell.is_owned_by(c)).unwrap_or(false),
            owner_short: cell.owner.as_ref().map(Identity::short),
            image_url: cell.image_ref.as_ref().map(|r| r.url.clone()),
        }
    }
}

/// Full grid plus the filtered marketplace listing
#[derive(Debug, Clone, Serialize)]
pub struct GridProjection {
    pub full_grid: Vec<DisplayCell>,
    pub available: Vec<DisplayCell>,
    pub owned_count: usize,
    pub taken_at: DateTime<Utc>,
}

/// Project a snapshot for `caller`, ordering `available` by `sort`
pub fn project(snapshot: &GridSnapshot, caller: Option<&Identity>, sort: SortKey) -> GridProjection {
    let full_grid: Vec<DisplayCell> = snapshot
        .cells()
        .iter()
        .map(|cell| DisplayCell::from_cell(cell, caller))
        .collect();

    let mut available: Vec<DisplayCell> = full_grid.iter().filter(|c| !c.is_owned).cloned().collect();
    sort.apply(&mut available);

    GridProjection {
        owned_count: full_grid.len() - available.len(),
        full_grid,
        available,
        taken_at: snapshot.taken_at(),
    }
}

/// One purchase in a buyer's history
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    pub receipt_id: Option<Uuid>,
    pub cell_id: CellId,
    pub label: u16,
    /// Price paid (owned prices are frozen)
    pub price: Lamports,
    pub price_sol: String,
    pub purchased_at: Option<DateTime<Utc>>,
    pub image_url: Option<String>,
}

/// History entries for a buyer's cells, kept in the order given.
///
/// Pass the result of [`CellStore::list_owned_by`](crate::cells::CellStore::list_owned_by),
/// which is already newest first.
pub fn history(owned: &[Cell]) -> Vec<HistoryEntry> {
    owned
        .iter()
        .map(|cell| HistoryEntry {
            receipt_id: cell.receipt_id,
            cell_id: cell.id,
            label: cell.label(),
            price: cell.price,
            price_sol: cell.price.to_sol_string(),
            purchased_at: cell.purchased_at,
            image_url: cell.image_ref.as_ref().map(|r| r.url.clone()),
        })
        .collect()
}
