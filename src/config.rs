//! Configuration for gridmarket
//!
//! CLI arguments and environment variable handling using clap.

use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::pricing::{PricingPolicy, BASE_PRICE, DEFAULT_MULTIPLIER_BPS, DEFAULT_REPRICE_INTERVAL};
use crate::services::assets::{AttachmentLimits, DEFAULT_MAX_IMAGE_BYTES};
use crate::types::Lamports;

/// Where cell records live
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StorageBackend {
    /// Process memory; the grid resets on restart
    Memory,
    /// sled database under the data directory
    Sled,
}

/// gridmarket - 10x10 grid of purchasable cells with escalating prices
#[derive(Parser, Debug, Clone)]
#[command(name = "gridmarket")]
#[command(about = "Grid ownership and dynamic pricing server")]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "GRID_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Record store backend
    #[arg(long, env = "GRID_STORAGE", value_enum, default_value = "sled")]
    pub storage: StorageBackend,

    /// Directory for the sled database
    #[arg(long, env = "GRID_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Directory uploaded images are written to
    #[arg(long, env = "GRID_ASSETS_DIR", default_value = "./data/assets")]
    pub assets_dir: PathBuf,

    /// Public base URL for uploaded images
    /// Defaults to this server's /assets route
    #[arg(long, env = "GRID_PUBLIC_URL")]
    pub public_url: Option<String>,

    /// Starting price of every cell, in lamports
    #[arg(long, env = "GRID_BASE_PRICE", default_value_t = BASE_PRICE.get())]
    pub base_price: u64,

    /// Price escalation multiplier in basis points (17500 = 1.75x)
    #[arg(long, env = "GRID_PRICE_MULTIPLIER_BPS", default_value_t = DEFAULT_MULTIPLIER_BPS)]
    pub multiplier_bps: u32,

    /// Purchases between repricing passes
    #[arg(long, env = "GRID_REPRICE_INTERVAL", default_value_t = DEFAULT_REPRICE_INTERVAL)]
    pub reprice_interval: u64,

    /// Largest accepted image upload in bytes
    #[arg(long, env = "GRID_MAX_IMAGE_BYTES", default_value_t = DEFAULT_MAX_IMAGE_BYTES)]
    pub max_image_bytes: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    pub log_json: bool,
}

impl Args {
    /// Public base URL for assets (falls back to the local /assets route)
    pub fn public_url(&self) -> String {
        match &self.public_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => {
                let host = if self.listen.ip().is_unspecified() {
                    "localhost".to_string()
                } else {
                    self.listen.ip().to_string()
                };
                format!("http://{}:{}/assets", host, self.listen.port())
            }
        }
    }

    pub fn pricing_policy(&self) -> PricingPolicy {
        PricingPolicy {
            base_price: Lamports(self.base_price),
            multiplier_bps: self.multiplier_bps,
            reprice_interval: self.reprice_interval,
        }
    }

    pub fn attachment_limits(&self) -> AttachmentLimits {
        AttachmentLimits {
            max_bytes: self.max_image_bytes,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.base_price == 0 {
            return Err("GRID_BASE_PRICE must be greater than zero".to_string());
        }

        if self.multiplier_bps < 10_000 {
            return Err("GRID_PRICE_MULTIPLIER_BPS must be at least 10000 (1x)".to_string());
        }

        if self.reprice_interval == 0 {
            return Err("GRID_REPRICE_INTERVAL must be greater than zero".to_string());
        }

        if self.max_image_bytes == 0 {
            return Err("GRID_MAX_IMAGE_BYTES must be greater than zero".to_string());
        }

        if let Some(url) = &self.public_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err("GRID_PUBLIC_URL must be an http(s) URL".to_string());
            }
        }

        Ok(())
    }
}
