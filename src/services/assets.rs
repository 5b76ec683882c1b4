//! Asset attachment service - binds an uploaded image to an owned cell
//!
//! The upload happens before the reference is written, so a failed upload
//! leaves the previous image in place.

use std::sync::Arc;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info};

use crate::blobs::{extension_for, BlobStore};
use crate::cells::CellStore;
use crate::error::{GridError, Result};
use crate::types::{AssetRef, CellId, Identity};

use super::events::{EventBus, GridEvent};

/// 5 MiB
pub const DEFAULT_MAX_IMAGE_BYTES: usize = 5 * 1024 * 1024;

/// Hex characters of the content hash kept in the asset name
const HASH_PREFIX_LEN: usize = 8;

/// Upload constraints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentLimits {
    pub max_bytes: usize,
}

impl Default for AttachmentLimits {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_IMAGE_BYTES,
        }
    }
}

/// Strip parameters and normalize case: `Image/PNG; q=1` -> `image/png`
pub fn normalize_mime(raw: &str) -> String {
    raw.split(';').next().unwrap_or("").trim().to_ascii_lowercase()
}

/// Blob path for a new image on `cell_id`
pub fn asset_path(cell_id: CellId, data: &[u8], mime: &str) -> String {
    let digest = hex::encode(Sha256::digest(data));
    format!(
        "cells/{}/{}-{}.{}",
        cell_id,
        Utc::now().timestamp_millis(),
        &digest[..HASH_PREFIX_LEN],
        extension_for(mime)
    )
}

/// Asset attachment service
pub struct AssetAttachmentService {
    cells: CellStore,
    blobs: Arc<dyn BlobStore>,
    limits: AttachmentLimits,
    events: Arc<EventBus>,
}

impl AssetAttachmentService {
    pub fn new(
        cells: CellStore,
        blobs: Arc<dyn BlobStore>,
        limits: AttachmentLimits,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            cells,
            blobs,
            limits,
            events,
        }
    }

    pub fn limits(&self) -> AttachmentLimits {
        self.limits
    }

    /// Upload `data` and point the caller's cell at it
    pub async fn attach_image(
        &self,
        cell_id: CellId,
        caller: Option<&Identity>,
        data: &[u8],
        mime_hint: &str,
    ) -> Result<AssetRef> {
        let caller = caller.ok_or(GridError::NotAuthenticated)?;

        let cell = self.cells.get_by_id(cell_id).await?;
        if !cell.is_owned_by(caller) {
            debug!(cell = cell.label(), caller = %caller.short(), "Image rejected: caller is not the owner");
            return Err(GridError::NotOwner);
        }

        let mime = normalize_mime(mime_hint);
        self.validate_image(data, &mime)?;

        let path = asset_path(cell_id, data, &mime);
        if let Err(e) = self.blobs.upload(&path, data, &mime).await {
            error!(cell = %cell_id, path = %path, error = %e, "Image upload failed");
            return Err(e.into());
        }

        let asset = AssetRef {
            url: self.blobs.public_url_for(&path),
            path,
        };

        // Old assets are left in the blob store
        self.cells.set_image_ref(cell_id, caller, asset.clone()).await?;

        info!(cell = cell.label(), url = %asset.url, size = data.len(), "Image attached");
        self.events.emit(GridEvent::ImageAttached {
            cell_id,
            label: cell.label(),
            url: asset.url.clone(),
        });

        Ok(asset)
    }

    fn validate_image(&self, data: &[u8], mime: &str) -> Result<()> {
        if !mime.starts_with("image/") || mime.len() == "image/".len() {
            return Err(GridError::InvalidImage(format!("unsupported content type '{}'", mime)));
        }
        if data.is_empty() {
            return Err(GridError::InvalidImage("empty upload".into()));
        }
        if data.len() > self.limits.max_bytes {
            return Err(GridError::InvalidImage(format!(
                "{} bytes exceeds limit of {}",
                data.len(),
                self.limits.max_bytes
            )));
        }
        Ok(())
    }
}
