//! Purchase service - orchestrates a single cell purchase
//!
//! The ownership write in the cell store decides who wins a cell. Everything
//! after it (counter increment, repricing pass) runs only for the winner.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cells::CellStore;
use crate::error::{GridError, Result, StoreError};
use crate::identity::IdentityProvider;
use crate::pricing::PricingPolicy;
use crate::types::{CellId, Identity, Lamports, PurchaseReceipt};

use super::events::{EventBus, GridEvent};

/// Price tiers written concurrently during a pass
const REPRICE_CONCURRENCY: usize = 8;

/// Outcome of one repricing pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepricingReport {
    pub purchase_count: u64,
    /// Cells whose price was escalated
    pub repriced: usize,
    /// Cells whose price write failed or raced with a purchase
    pub skipped: usize,
}

/// Purchase coordinator
pub struct PurchaseCoordinator {
    cells: CellStore,
    policy: PricingPolicy,
    events: Arc<EventBus>,
    // Passes must not overlap or a cell could escalate once for two passes.
    // Purchases never take this lock.
    reprice_lock: Mutex<()>,
}

impl PurchaseCoordinator {
    pub fn new(cells: CellStore, policy: PricingPolicy, events: Arc<EventBus>) -> Self {
        Self {
            cells,
            policy,
            events,
            reprice_lock: Mutex::new(()),
        }
    }

    pub fn policy(&self) -> &PricingPolicy {
        &self.policy
    }

    /// Purchase on behalf of whatever identity the provider reports
    pub async fn purchase_as(
        &self,
        provider: &dyn IdentityProvider,
        cell_id: CellId,
    ) -> Result<PurchaseReceipt> {
        let identity = provider.current_identity().filter(|_| provider.is_connected());
        self.purchase(cell_id, identity.as_ref()).await
    }

    /// Buy `cell_id` for `buyer`
    pub async fn purchase(&self, cell_id: CellId, buyer: Option<&Identity>) -> Result<PurchaseReceipt> {
        let buyer = match buyer {
            Some(buyer) => buyer,
            None => {
                debug!(cell = %cell_id, "Purchase rejected: wallet not connected");
                return Err(GridError::NotAuthenticated);
            }
        };

        let cell = self.cells.get_by_id(cell_id).await.map_err(|e| {
            if matches!(e, StoreError::NotFound(_)) {
                debug!(cell = %cell_id, "Purchase rejected: unknown cell");
            }
            GridError::from(e)
        })?;

        // Linearization point: only one buyer's write can succeed
        let owned = match self.cells.set_owner(cell_id, buyer).await {
            Ok(owned) => owned,
            Err(StoreError::AlreadyOwned(_)) => {
                debug!(cell = cell.label(), buyer = %buyer.short(), "Purchase rejected: already sold");
                return Err(GridError::AlreadySold {
                    cell_id,
                    label: cell.label(),
                });
            }
            Err(e) => {
                error!(cell = %cell_id, error = %e, "Ownership write failed");
                return Err(e.into());
            }
        };

        let purchase_count = match self.cells.record_purchase().await {
            Ok(count) => count,
            Err(e) => {
                // The sale stands. Owned cells still give the count, and the
                // counter is rewritten so the next sale increments from it.
                error!(cell = %cell_id, error = %e, "Counter update failed, recounting owned cells");
                let recount = self.cells.owned_count().await?;
                if let Err(e) = self.cells.sync_purchase_counter(recount).await {
                    warn!(recount, error = %e, "Could not rewrite purchase counter");
                }
                recount
            }
        };

        let repriced = self.policy.should_reprice(purchase_count);
        if repriced {
            self.run_repricing_pass(purchase_count).await;
        }

        self.events.emit(GridEvent::CellPurchased {
            cell_id,
            label: owned.label(),
            buyer: buyer.clone(),
            price: owned.price,
            purchase_count,
        });

        Ok(PurchaseReceipt {
            receipt_id: owned.receipt_id.unwrap_or_else(Uuid::new_v4),
            cell_id,
            index: owned.index,
            label: owned.label(),
            price_at_purchase: owned.price,
            buyer: buyer.clone(),
            purchased_at: owned.purchased_at.unwrap_or_else(Utc::now),
            purchase_count,
            repriced,
        })
    }

    /// Escalate every unowned cell from its own current price.
    ///
    /// Cells are grouped by current price so each group is one bulk write.
    /// Individual failures are logged and skipped; a pass never fails a
    /// purchase.
    pub async fn run_repricing_pass(&self, purchase_count: u64) -> RepricingReport {
        let _guard = self.reprice_lock.lock().await;
        let mut report = RepricingReport {
            purchase_count,
            ..Default::default()
        };

        let unowned = match self.cells.list_available().await {
            Ok(cells) => cells,
            Err(e) => {
                warn!(purchase_count, error = %e, "Repricing pass skipped: could not list cells");
                return report;
            }
        };
        if unowned.is_empty() {
            debug!(purchase_count, "Repricing pass: no unowned cells");
            return report;
        }

        let mut tiers: BTreeMap<Lamports, Vec<CellId>> = BTreeMap::new();
        for cell in &unowned {
            tiers.entry(cell.price).or_default().push(cell.id);
        }

        let outcomes: Vec<_> = stream::iter(tiers)
            .map(|(current, ids)| {
                let next = self.policy.next_price(current);
                async move {
                    let result = self.cells.set_prices(&ids, next).await;
                    (ids, next, result)
                }
            })
            .buffer_unordered(REPRICE_CONCURRENCY)
            .collect()
            .await;

        for (ids, next, result) in outcomes {
            match result {
                Ok(results) => {
                    for (id, result) in results {
                        match result {
                            Ok(_) => report.repriced += 1,
                            Err(StoreError::ImmutablePrice(_)) => {
                                debug!(cell = %id, "Cell sold during repricing, price left frozen");
                                report.skipped += 1;
                            }
                            Err(e) => {
                                warn!(cell = %id, price = %next, error = %e, "Skipping price update");
                                report.skipped += 1;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(cells = ids.len(), price = %next, error = %e, "Skipping price tier");
                    report.skipped += ids.len();
                }
            }
        }

        info!(
            purchase_count,
            repriced = report.repriced,
            skipped = report.skipped,
            "Repricing pass complete"
        );
        self.events.emit(GridEvent::RepricingPass {
            purchase_count,
            repriced: report.repriced,
            skipped: report.skipped,
        });

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{RequestIdentity, WalletSession};
    use crate::pricing::BASE_PRICE;
    use crate::store::MemoryRecordStore;
    use crate::types::Cell;

    async fn setup() -> (PurchaseCoordinator, CellStore, Vec<Cell>) {
        let cells = CellStore::new(Arc::new(MemoryRecordStore::new()), BASE_PRICE);
        cells.initialize().await.unwrap();
        let grid = cells.list_all().await.unwrap();
        let coordinator =
            PurchaseCoordinator::new(cells.clone(), PricingPolicy::default(), Arc::new(EventBus::new()));
        (coordinator, cells, grid)
    }

    fn who(name: &str) -> Identity {
        Identity::parse(name).unwrap()
    }

    #[tokio::test]
    async fn test_purchase_returns_receipt() {
        let (coordinator, cells, grid) = setup().await;

        let receipt = coordinator.purchase(grid[4].id, Some(&who("ana"))).await.unwrap();
        assert_eq!(receipt.cell_id, grid[4].id);
        assert_eq!(receipt.label, 5);
        assert_eq!(receipt.price_at_purchase, BASE_PRICE);
        assert_eq!(receipt.purchase_count, 1);
        assert!(!receipt.repriced);

        let stored = cells.get_by_id(grid[4].id).await.unwrap();
        assert_eq!(stored.receipt_id, Some(receipt.receipt_id));
        assert_eq!(stored.purchased_at, Some(receipt.purchased_at));
    }

    #[tokio::test]
    async fn test_purchase_without_wallet() {
        let (coordinator, cells, grid) = setup().await;

        let result = coordinator.purchase(grid[0].id, None).await;
        assert_eq!(result, Err(GridError::NotAuthenticated));

        let session = WalletSession::disconnected();
        let result = coordinator.purchase_as(&session, grid[0].id).await;
        assert_eq!(result, Err(GridError::NotAuthenticated));

        assert_eq!(cells.owned_count().await.unwrap(), 0);
        assert_eq!(cells.purchase_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_purchase_as_provider() {
        let (coordinator, _cells, grid) = setup().await;
        let provider = RequestIdentity::from_header(Some("bea"));

        let receipt = coordinator.purchase_as(&provider, grid[1].id).await.unwrap();
        assert_eq!(receipt.buyer, who("bea"));
    }

    #[tokio::test]
    async fn test_purchase_unknown_cell() {
        let (coordinator, _cells, _grid) = setup().await;
        let result = coordinator.purchase(CellId::new(), Some(&who("cal"))).await;
        assert!(matches!(result, Err(GridError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_second_purchase_is_already_sold() {
        let (coordinator, cells, grid) = setup().await;

        coordinator.purchase(grid[7].id, Some(&who("dee"))).await.unwrap();
        let result = coordinator.purchase(grid[7].id, Some(&who("eli"))).await;
        assert_eq!(
            result,
            Err(GridError::AlreadySold {
                cell_id: grid[7].id,
                label: 8
            })
        );
        assert_eq!(cells.get_by_id(grid[7].id).await.unwrap().owner, Some(who("dee")));
        assert_eq!(cells.purchase_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_tenth_purchase_escalates_unowned() {
        let (coordinator, cells, grid) = setup().await;

        for (i, cell) in grid.iter().take(9).enumerate() {
            let receipt = coordinator
                .purchase(cell.id, Some(&who(&format!("buyer-{i}"))))
                .await
                .unwrap();
            assert!(!receipt.repriced);
        }
        let tenth = coordinator.purchase(grid[9].id, Some(&who("buyer-9"))).await.unwrap();
        assert!(tenth.repriced);
        assert_eq!(tenth.price_at_purchase, BASE_PRICE);

        for cell in cells.list_all().await.unwrap() {
            if cell.index < 10 {
                assert_eq!(cell.price, BASE_PRICE);
            } else {
                assert_eq!(cell.price, Lamports(87_500_000));
            }
        }
    }

    #[tokio::test]
    async fn test_pass_escalates_each_cell_from_its_own_price() {
        let (coordinator, cells, grid) = setup().await;
        cells.set_price(grid[50].id, Lamports(1_000)).await.unwrap();

        let report = coordinator.run_repricing_pass(10).await;
        assert_eq!(report.repriced, 100);
        assert_eq!(report.skipped, 0);
        assert_eq!(cells.get_by_id(grid[50].id).await.unwrap().price, Lamports(1_750));
        assert_eq!(cells.get_by_id(grid[51].id).await.unwrap().price, Lamports(87_500_000));
    }

    #[tokio::test]
    async fn test_pass_with_no_unowned_cells() {
        let (coordinator, cells, grid) = setup().await;
        for cell in &grid {
            cells.set_owner(cell.id, &who("fay")).await.unwrap();
        }
        let report = coordinator.run_repricing_pass(100).await;
        assert_eq!(report.repriced, 0);
        assert_eq!(report.skipped, 0);
    }

    #[tokio::test]
    async fn test_purchase_emits_event() {
        let (coordinator, _cells, grid) = setup().await;
        let mut events = coordinator.events.subscribe();

        coordinator.purchase(grid[2].id, Some(&who("gus"))).await.unwrap();
        match events.recv().await.unwrap() {
            GridEvent::CellPurchased { label, purchase_count, .. } => {
                assert_eq!(label, 3);
                assert_eq!(purchase_count, 1);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
