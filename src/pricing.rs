//! Pricing policy
//!
//! Every `reprice_interval`-th committed purchase triggers a repricing pass
//! that multiplies the price of each still-unowned cell by the escalation
//! multiplier. Each cell escalates from its own current price, so repeated
//! passes compound per cell.

use serde::{Deserialize, Serialize};

use crate::types::Lamports;

/// 0.05 SOL
pub const BASE_PRICE: Lamports = Lamports::new(50_000_000);

/// 1.75x, in basis points
pub const DEFAULT_MULTIPLIER_BPS: u32 = 17_500;

/// Purchases between repricing passes
pub const DEFAULT_REPRICE_INTERVAL: u64 = 10;

const BPS_DENOMINATOR: u128 = 10_000;

/// Stateless escalation rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingPolicy {
    /// Price of every cell at initialization
    pub base_price: Lamports,
    /// Escalation multiplier in basis points (10_000 = 1x)
    pub multiplier_bps: u32,
    /// A pass fires when the purchase count is a positive multiple of this
    pub reprice_interval: u64,
}

impl Default for PricingPolicy {
    fn default() -> Self {
        Self {
            base_price: BASE_PRICE,
            multiplier_bps: DEFAULT_MULTIPLIER_BPS,
            reprice_interval: DEFAULT_REPRICE_INTERVAL,
        }
    }
}

impl PricingPolicy {
    /// Next price tier for a cell, rounded down to the lamport.
    /// Saturates at `u64::MAX` rather than wrapping.
    pub fn next_price(&self, current: Lamports) -> Lamports {
        let scaled = (current.get() as u128) * (self.multiplier_bps as u128) / BPS_DENOMINATOR;
        Lamports(u64::try_from(scaled).unwrap_or(u64::MAX))
    }

    /// Whether the purchase that brought the count to `purchase_count`
    /// triggers a repricing pass
    pub fn should_reprice(&self, purchase_count: u64) -> bool {
        self.reprice_interval > 0 && purchase_count > 0 && purchase_count % self.reprice_interval == 0
    }
}
