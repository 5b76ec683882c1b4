//! gridmarket - Grid ownership and dynamic pricing server

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gridmarket::{
    config::{Args, StorageBackend},
    services::{spawn_logging_listener, Services},
    BlobStore, FsBlobStore, HttpServer, MemoryRecordStore, RecordStore, SledRecordStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    // Initialize tracing/logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("gridmarket={},info", args.log_level).into());
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let policy = args.pricing_policy();
    let public_url = args.public_url();

    info!("======================================");
    info!("  gridmarket");
    info!("======================================");
    info!("Listen: {}", args.listen);
    info!("Storage: {:?}", args.storage);
    info!("Assets: {} -> {}", args.assets_dir.display(), public_url);
    info!("Base price: {}", policy.base_price);
    info!(
        "Escalation: x{}.{:04} every {} purchases",
        policy.multiplier_bps / 10_000,
        policy.multiplier_bps % 10_000,
        policy.reprice_interval
    );
    info!("======================================");

    let (records, sled_store): (Arc<dyn RecordStore>, Option<Arc<SledRecordStore>>) = match args.storage {
        StorageBackend::Memory => {
            info!("Using in-memory record store; the grid resets on restart");
            (Arc::new(MemoryRecordStore::new()) as Arc<dyn RecordStore>, None)
        }
        StorageBackend::Sled => {
            let path = args.data_dir.join("grid.sled");
            let store = Arc::new(SledRecordStore::open(&path)?);
            (store.clone() as Arc<dyn RecordStore>, Some(store))
        }
    };

    let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(&args.assets_dir, &public_url).await?);

    let services = Arc::new(Services::new(
        records,
        blobs,
        policy,
        args.attachment_limits(),
    ));
    let listener = spawn_logging_listener(services.events.clone());

    let report = services.initialize().await?;
    // Nothing is serving yet, so no purchase can be between its two writes
    let purchases = services.cells.reconcile_purchase_counter().await?;
    info!(
        existing = report.existing,
        created = report.created,
        purchases,
        "Grid ready"
    );

    let http_server = Arc::new(HttpServer::new(services.clone(), args.listen));

    info!("Press Ctrl+C to stop.");

    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
    };

    tokio::select! {
        result = http_server.run() => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
            }
        }
        _ = shutdown => {}
    }

    if let Some(store) = sled_store {
        if let Err(e) = store.flush().await {
            error!(error = %e, "Failed to flush record store");
        }
    }

    listener.abort();

    if let Ok(snapshot) = services.cells.snapshot().await {
        info!(
            cells = snapshot.cells().len(),
            owned = snapshot.owned_count(),
            "Final grid stats"
        );
    }

    Ok(())
}
