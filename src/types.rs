//! Core domain types
//!
//! A [`Cell`] is one purchasable unit of the grid. Prices are carried as
//! integer [`Lamports`] so escalation never accumulates float error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Cells per grid side
pub const GRID_SIDE: u8 = 10;

/// Total number of cells in the grid
pub const GRID_CELLS: usize = (GRID_SIDE as usize) * (GRID_SIDE as usize);

/// Lamports per SOL
pub const LAMPORTS_PER_SOL: u64 = 1_000_000_000;

/// Stable, opaque cell identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CellId(Uuid);

impl CellId {
    /// Generate a fresh identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CellId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CellId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Wallet identity (base58 public key as reported by the wallet adapter)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Build an identity, rejecting blank strings
    pub fn parse(raw: impl AsRef<str>) -> Option<Self> {
        let trimmed = raw.as_ref().trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for display: `AbCdEf...UvWxYz`
    pub fn short(&self) -> String {
        let chars: Vec<char> = self.0.chars().collect();
        if chars.len() <= 12 {
            return self.0.clone();
        }
        let head: String = chars[..6].iter().collect();
        let tail: String = chars[chars.len() - 6..].iter().collect();
        format!("{}...{}", head, tail)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Amount in lamports (1 SOL = 10^9 lamports)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Lamports(pub u64);

impl Lamports {
    pub const fn new(amount: u64) -> Self {
        Self(amount)
    }

    pub fn get(&self) -> u64 {
        self.0
    }

    /// Decimal SOL representation with trailing zeros trimmed, e.g. `0.0875`
    pub fn to_sol_string(&self) -> String {
        let whole = self.0 / LAMPORTS_PER_SOL;
        let frac = self.0 % LAMPORTS_PER_SOL;
        if frac == 0 {
            return whole.to_string();
        }
        let frac = format!("{:09}", frac);
        format!("{}.{}", whole, frac.trim_end_matches('0'))
    }
}

impl fmt::Display for Lamports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} SOL", self.to_sol_string())
    }
}

/// Reference to an uploaded asset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRef {
    /// Path inside the blob store
    pub path: String,
    /// Public URL the asset is served from
    pub url: String,
}

/// One grid cell as persisted in the record store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    pub id: CellId,
    /// Fixed display position, 0..GRID_CELLS
    pub index: u8,
    /// Current price while unowned; the price paid once owned
    pub price: Lamports,
    pub owner: Option<Identity>,
    pub image_ref: Option<AssetRef>,
    /// Stamped by the ownership write
    pub purchased_at: Option<DateTime<Utc>>,
    /// Stamped by the ownership write
    pub receipt_id: Option<Uuid>,
}

impl Cell {
    /// A fresh, unowned cell
    pub fn new(index: u8, price: Lamports) -> Self {
        Self {
            id: CellId::new(),
            index,
            price,
            owner: None,
            image_ref: None,
            purchased_at: None,
            receipt_id: None,
        }
    }

    /// Human-facing cell number (1-based)
    pub fn label(&self) -> u16 {
        self.index as u16 + 1
    }

    pub fn is_owned(&self) -> bool {
        self.owner.is_some()
    }

    pub fn is_owned_by(&self, identity: &Identity) -> bool {
        self.owner.as_ref() == Some(identity)
    }
}

/// Result of a successful purchase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseReceipt {
    pub receipt_id: Uuid,
    pub cell_id: CellId,
    pub index: u8,
    pub label: u16,
    pub price_at_purchase: Lamports,
    pub buyer: Identity,
    pub purchased_at: DateTime<Utc>,
    /// Purchase count after this purchase committed
    pub purchase_count: u64,
    /// Whether this purchase triggered a repricing pass
    pub repriced: bool,
}
