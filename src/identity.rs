//! Identity providers
//!
//! The engine only ever reads identity: whether a wallet is connected and
//! which public key it reports. Where that comes from (a browser wallet
//! adapter, a request header) is up to the provider.

use std::sync::RwLock;

use tracing::debug;

use crate::error::GridError;
use crate::types::Identity;

/// Header carrying the caller's wallet identity on HTTP requests
pub const IDENTITY_HEADER: &str = "x-wallet-identity";

/// Read-only view of the caller's wallet connection
pub trait IdentityProvider: Send + Sync {
    fn is_connected(&self) -> bool;

    fn current_identity(&self) -> Option<Identity>;

    /// The connected identity, or `NotAuthenticated`
    fn require_identity(&self) -> Result<Identity, GridError> {
        if !self.is_connected() {
            return Err(GridError::NotAuthenticated);
        }
        self.current_identity().ok_or(GridError::NotAuthenticated)
    }
}

/// Wallet connection held for the lifetime of a client session
#[derive(Debug, Default)]
pub struct WalletSession {
    identity: RwLock<Option<Identity>>,
}

impl WalletSession {
    /// A session with no wallet connected
    pub fn disconnected() -> Self {
        Self::default()
    }

    /// A session already connected to `identity`
    pub fn connected(identity: Identity) -> Self {
        Self {
            identity: RwLock::new(Some(identity)),
        }
    }

    pub fn connect(&self, identity: Identity) {
        debug!(identity = %identity.short(), "Wallet connected");
        if let Ok(mut guard) = self.identity.write() {
            *guard = Some(identity);
        }
    }

    pub fn disconnect(&self) {
        if let Ok(mut guard) = self.identity.write() {
            *guard = None;
        }
    }
}

impl IdentityProvider for WalletSession {
    fn is_connected(&self) -> bool {
        self.identity.read().map(|g| g.is_some()).unwrap_or(false)
    }

    fn current_identity(&self) -> Option<Identity> {
        self.identity.read().ok().and_then(|g| g.clone())
    }
}

/// Identity asserted by a single request
#[derive(Debug, Clone, Default)]
pub struct RequestIdentity(Option<Identity>);

impl RequestIdentity {
    /// Parse the raw header value; blank or missing means not connected
    pub fn from_header(value: Option<&str>) -> Self {
        Self(value.and_then(Identity::parse))
    }
}

impl IdentityProvider for RequestIdentity {
    fn is_connected(&self) -> bool {
        self.0.is_some()
    }

    fn current_identity(&self) -> Option<Identity> {
        self.0.clone()
    }
}
