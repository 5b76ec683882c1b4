//! Integration tests for purchases, repricing and image attachment
//!
//! These run the full service stack over the in-memory and sled record
//! stores.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use gridmarket::blobs::StoredBlob;
use gridmarket::store::{CellFilter, CellOrder, CellPatch, InsertOutcome, Precondition};
use gridmarket::{
    AttachmentLimits, BlobError, BlobStore, Cell, CellId, GridError, Identity, InMemoryBlobStore,
    Lamports, MemoryRecordStore, PricingPolicy, RecordStore, Services, SledRecordStore, StoreError,
};
use tempfile::TempDir;

const BASE: Lamports = Lamports(50_000_000);
const TIER_1: Lamports = Lamports(87_500_000);
const TIER_2: Lamports = Lamports(153_125_000);

fn who(name: &str) -> Identity {
    Identity::parse(name).unwrap()
}

/// Services over a fresh in-memory grid
async fn memory_services() -> Arc<Services> {
    services_over(Arc::new(MemoryRecordStore::new()), Arc::new(InMemoryBlobStore::default())).await
}

async fn services_over(records: Arc<dyn RecordStore>, blobs: Arc<dyn BlobStore>) -> Arc<Services> {
    let services = Services::new(records, blobs, PricingPolicy::default(), AttachmentLimits::default());
    services.initialize().await.unwrap();
    Arc::new(services)
}

async fn grid(services: &Services) -> Vec<Cell> {
    services.cells.list_all().await.unwrap()
}

/// No cell may carry an image without an owner
async fn assert_image_implies_owner(services: &Services) {
    for cell in grid(services).await {
        if cell.owner.is_none() {
            assert!(cell.image_ref.is_none(), "cell {} has an image but no owner", cell.label());
        }
    }
}

#[tokio::test]
async fn test_ten_purchases_escalate_remaining_cells() {
    let services = memory_services().await;
    let cells = grid(&services).await;

    for (i, cell) in cells.iter().take(10).enumerate() {
        let buyer = who(&format!("wallet-{i}"));
        let receipt = services.purchases.purchase(cell.id, Some(&buyer)).await.unwrap();
        assert_eq!(receipt.price_at_purchase, BASE);
        assert_eq!(receipt.purchase_count, i as u64 + 1);
        assert_eq!(receipt.repriced, i == 9);
    }

    for cell in grid(&services).await {
        if cell.index < 10 {
            assert_eq!(cell.price, BASE, "owned cell {} repriced", cell.label());
            assert!(cell.owner.is_some());
        } else {
            assert_eq!(cell.price, TIER_1, "cell {} not escalated", cell.label());
            assert_eq!(cell.price.to_sol_string(), "0.0875");
        }
    }
    assert_image_implies_owner(&services).await;
}

#[tokio::test]
async fn test_twentieth_purchase_compounds() {
    let services = memory_services().await;
    let cells = grid(&services).await;

    for cell in cells.iter().take(20) {
        services.purchases.purchase(cell.id, Some(&who("collector"))).await.unwrap();
    }

    for cell in grid(&services).await {
        let expected = match cell.index {
            0..=9 => BASE,
            10..=19 => TIER_1,
            _ => TIER_2,
        };
        assert_eq!(cell.price, expected, "cell {}", cell.label());
    }
    assert_eq!(services.cells.purchase_count().await.unwrap(), 20);
}

/// Two buyers race for cell #42; exactly one wins
async fn race_two_buyers_for_one_cell(services: Arc<Services>) {
    let target = grid(&services).await.remove(41);
    assert_eq!(target.label(), 42);
    let id = target.id;

    let mut handles = Vec::new();
    for name in ["alice", "bob"] {
        let services = services.clone();
        handles.push(tokio::spawn(async move {
            services.purchases.purchase(id, Some(&who(name))).await
        }));
    }

    let mut receipts = Vec::new();
    let mut sold = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(receipt) => receipts.push(receipt),
            Err(GridError::AlreadySold { label, .. }) => {
                assert_eq!(label, 42);
                sold += 1;
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(receipts.len(), 1);
    assert_eq!(sold, 1);
    assert_eq!(receipts[0].price_at_purchase, BASE);

    let stored = services.cells.get_by_id(id).await.unwrap();
    assert_eq!(stored.owner, Some(receipts[0].buyer.clone()));
    assert_eq!(services.cells.purchase_count().await.unwrap(), 1);
}

/// Three buyers race for each of the first 30 cells
async fn race_many_buyers(services: Arc<Services>) {
    let cells = grid(&services).await;

    let mut handles = Vec::new();
    for buyer in 0..3 {
        for cell in cells.iter().take(30) {
            let services = services.clone();
            let id = cell.id;
            handles.push(tokio::spawn(async move {
                services
                    .purchases
                    .purchase(id, Some(&who(&format!("racer-{buyer}"))))
                    .await
            }));
        }
    }

    let mut won = HashSet::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(receipt) => assert!(won.insert(receipt.cell_id), "cell sold twice"),
            Err(GridError::AlreadySold { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(won.len(), 30);
    assert_eq!(services.cells.owned_count().await.unwrap(), 30);
    assert_eq!(services.cells.purchase_count().await.unwrap(), 30);
    // Three passes, each exactly once
    for cell in grid(&services).await.iter().filter(|c| c.owner.is_none()) {
        assert_eq!(cell.price, Lamports(267_968_750));
    }
}

async fn sled_services() -> Arc<Services> {
    let records = Arc::new(SledRecordStore::open_temporary().unwrap());
    services_over(records, Arc::new(InMemoryBlobStore::default())).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_purchase_of_one_cell() {
    race_two_buyers_for_one_cell(memory_services().await).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_purchase_of_one_cell_sled() {
    race_two_buyers_for_one_cell(sled_services().await).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_buyers_race_for_every_cell() {
    race_many_buyers(memory_services().await).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_buyers_race_for_every_cell_sled() {
    race_many_buyers(sled_services().await).await;
}

#[tokio::test]
async fn test_attach_image_by_non_owner_leaves_ref() {
    let services = memory_services().await;
    let cell = grid(&services).await.remove(0);
    services.purchases.purchase(cell.id, Some(&who("owner"))).await.unwrap();

    let original = services
        .assets
        .attach_image(cell.id, Some(&who("owner")), b"first", "image/png")
        .await
        .unwrap();

    let result = services
        .assets
        .attach_image(cell.id, Some(&who("intruder")), b"second", "image/png")
        .await;
    assert_eq!(result, Err(GridError::NotOwner));

    let stored = services.cells.get_by_id(cell.id).await.unwrap();
    assert_eq!(stored.image_ref, Some(original));
    assert_image_implies_owner(&services).await;
}

/// Blob store whose uploads always fail
struct BrokenBlobStore;

#[async_trait]
impl BlobStore for BrokenBlobStore {
    async fn upload(&self, _path: &str, _data: &[u8], _content_type: &str) -> Result<(), BlobError> {
        Err(BlobError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk full")))
    }

    fn public_url_for(&self, path: &str) -> String {
        format!("memory://broken/{path}")
    }

    async fn read(&self, path: &str) -> Result<StoredBlob, BlobError> {
        Err(BlobError::NotFound(path.to_string()))
    }
}

#[tokio::test]
async fn test_upload_failure_keeps_prior_image() {
    let records: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
    let working = services_over(records.clone(), Arc::new(InMemoryBlobStore::default())).await;
    let cell = grid(&working).await.remove(8);
    working.purchases.purchase(cell.id, Some(&who("maker"))).await.unwrap();
    let original = working
        .assets
        .attach_image(cell.id, Some(&who("maker")), b"v1", "image/webp")
        .await
        .unwrap();

    // Same records, broken blob store
    let broken = services_over(records, Arc::new(BrokenBlobStore)).await;
    let result = broken
        .assets
        .attach_image(cell.id, Some(&who("maker")), b"v2", "image/webp")
        .await;

    match result {
        Err(e @ GridError::UploadFailed(_)) => assert!(e.is_retryable()),
        other => panic!("expected UploadFailed, got {other:?}"),
    }
    let stored = broken.cells.get_by_id(cell.id).await.unwrap();
    assert_eq!(stored.image_ref, Some(original));
}

/// Record store that refuses price writes for chosen cells
struct FlakyRecordStore {
    inner: MemoryRecordStore,
    failing: HashSet<CellId>,
}

#[async_trait]
impl RecordStore for FlakyRecordStore {
    async fn select(&self, filter: CellFilter, order: CellOrder) -> Result<Vec<Cell>, StoreError> {
        self.inner.select(filter, order).await
    }

    async fn get(&self, id: CellId) -> Result<Option<Cell>, StoreError> {
        self.inner.get(id).await
    }

    async fn insert(&self, records: Vec<Cell>) -> Result<InsertOutcome, StoreError> {
        self.inner.insert(records).await
    }

    async fn update(
        &self,
        id: CellId,
        precondition: Precondition,
        patch: CellPatch,
    ) -> Result<Cell, StoreError> {
        if patch.price.is_some() && self.failing.contains(&id) {
            return Err(StoreError::Unavailable("write timed out".into()));
        }
        self.inner.update(id, precondition, patch).await
    }

    async fn increment_counter(&self, name: &str) -> Result<u64, StoreError> {
        self.inner.increment_counter(name).await
    }

    async fn counter(&self, name: &str) -> Result<u64, StoreError> {
        self.inner.counter(name).await
    }

    async fn set_counter(&self, name: &str, value: u64) -> Result<(), StoreError> {
        self.inner.set_counter(name, value).await
    }
}

#[tokio::test]
async fn test_repricing_skips_failed_writes() {
    let inner = MemoryRecordStore::new();
    let seed: Vec<Cell> = (0..100u8).map(|i| Cell::new(i, BASE)).collect();
    let failing: HashSet<CellId> = seed[50..53].iter().map(|c| c.id).collect();
    inner.insert(seed.clone()).await.unwrap();

    let services = services_over(
        Arc::new(FlakyRecordStore { inner, failing }),
        Arc::new(InMemoryBlobStore::default()),
    )
    .await;

    let report = services.purchases.run_repricing_pass(10).await;
    assert_eq!(report.repriced, 97);
    assert_eq!(report.skipped, 3);

    for cell in grid(&services).await {
        let expected = if (50..53).contains(&cell.index) { BASE } else { TIER_1 };
        assert_eq!(cell.price, expected, "cell {}", cell.label());
    }
}

/// Record store whose counter increment fails on one chosen call
struct DroppedIncrementStore {
    inner: MemoryRecordStore,
    fail_on_call: u64,
    calls: AtomicU64,
}

#[async_trait]
impl RecordStore for DroppedIncrementStore {
    async fn select(&self, filter: CellFilter, order: CellOrder) -> Result<Vec<Cell>, StoreError> {
        self.inner.select(filter, order).await
    }

    async fn get(&self, id: CellId) -> Result<Option<Cell>, StoreError> {
        self.inner.get(id).await
    }

    async fn insert(&self, records: Vec<Cell>) -> Result<InsertOutcome, StoreError> {
        self.inner.insert(records).await
    }

    async fn update(
        &self,
        id: CellId,
        precondition: Precondition,
        patch: CellPatch,
    ) -> Result<Cell, StoreError> {
        self.inner.update(id, precondition, patch).await
    }

    async fn increment_counter(&self, name: &str) -> Result<u64, StoreError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_on_call {
            return Err(StoreError::Unavailable("counter write timed out".into()));
        }
        self.inner.increment_counter(name).await
    }

    async fn counter(&self, name: &str) -> Result<u64, StoreError> {
        self.inner.counter(name).await
    }

    async fn set_counter(&self, name: &str, value: u64) -> Result<(), StoreError> {
        self.inner.set_counter(name, value).await
    }
}

#[tokio::test]
async fn test_failed_increment_on_tenth_sale_still_reprices() {
    let services = services_over(
        Arc::new(DroppedIncrementStore {
            inner: MemoryRecordStore::new(),
            fail_on_call: 10,
            calls: AtomicU64::new(0),
        }),
        Arc::new(InMemoryBlobStore::default()),
    )
    .await;
    let cells = grid(&services).await;

    for cell in cells.iter().take(9) {
        services.purchases.purchase(cell.id, Some(&who("steady"))).await.unwrap();
    }

    let tenth = services.purchases.purchase(cells[9].id, Some(&who("steady"))).await.unwrap();
    assert_eq!(tenth.purchase_count, 10);
    assert!(tenth.repriced);
    assert_eq!(services.cells.get_by_id(cells[50].id).await.unwrap().price, TIER_1);
    assert_eq!(services.cells.purchase_count().await.unwrap(), 10);

    let eleventh = services.purchases.purchase(cells[10].id, Some(&who("steady"))).await.unwrap();
    assert_eq!(eleventh.purchase_count, 11);
    assert!(!eleventh.repriced);
    assert_eq!(services.cells.get_by_id(cells[50].id).await.unwrap().price, TIER_1);

    for cell in cells.iter().take(20).skip(11) {
        services.purchases.purchase(cell.id, Some(&who("steady"))).await.unwrap();
    }
    assert_eq!(services.cells.purchase_count().await.unwrap(), 20);
    assert_eq!(services.cells.get_by_id(cells[50].id).await.unwrap().price, TIER_2);
}

#[tokio::test]
async fn test_sled_grid_survives_restart() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("grid.sled");

    let bought = {
        let records = Arc::new(SledRecordStore::open(&path).unwrap());
        let services = services_over(records.clone(), Arc::new(InMemoryBlobStore::default())).await;
        let cells = grid(&services).await;
        for cell in cells.iter().take(3) {
            services.purchases.purchase(cell.id, Some(&who("keeper"))).await.unwrap();
        }
        records.flush().await.unwrap();
        cells[..3].iter().map(|c| c.id).collect::<Vec<_>>()
    };

    let records = Arc::new(SledRecordStore::open(&path).unwrap());
    let services = Services::new(
        records,
        Arc::new(InMemoryBlobStore::default()),
        PricingPolicy::default(),
        AttachmentLimits::default(),
    );
    let report = services.initialize().await.unwrap();
    assert_eq!(report.created, 0);
    assert_eq!(report.existing, 100);
    assert_eq!(services.cells.reconcile_purchase_counter().await.unwrap(), 3);
    assert_eq!(services.cells.purchase_count().await.unwrap(), 3);

    for id in bought {
        let cell = services.cells.get_by_id(id).await.unwrap();
        assert_eq!(cell.owner, Some(who("keeper")));
        assert!(cell.receipt_id.is_some());
    }
}
