//! Abstract storage interfaces for pluggable backends

use async_trait::async_trait;

use crate::error::Result;
use crate::storage::credentials::Credentials;

/// Client-local persistence for the access/refresh credential pair.
///
/// Read by the request gateway and the connection manager at startup and
/// after every renewal.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Load the stored credentials, `None` when logged out
    async fn load(&self) -> Result<Option<Credentials>>;

    /// Replace the stored credentials
    async fn save(&self, credentials: &Credentials) -> Result<()>;

    /// Forget the stored credentials
    async fn clear(&self) -> Result<()>;
}
