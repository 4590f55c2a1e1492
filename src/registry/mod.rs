//! Registry module for Docker Hub and OCI registry interactions
//!
//! Every backend implements [`Registry`], which the syncer drives through
//! `Arc<dyn Registry>` without knowing which backend it holds.

pub mod auth;
pub mod dockerhub;
pub mod factory;
pub mod generic;
pub mod keychain;
pub mod manifest;
pub mod pagination;
pub mod reference;
pub mod transfer;
pub mod transport;

use crate::error::{Result, SyncerError};
use async_trait::async_trait;
use std::future::Future;
use tokio_util::sync::CancellationToken;

pub use auth::Credential;
pub use dockerhub::{DockerHubRegistry, DockerHubRegistryBuilder};
pub use factory::{ConfiguredRegistries, RegistryFactory, RegistryResolver};
pub use generic::GenericRegistry;
pub use keychain::Keychain;
pub use reference::{ImageRef, normalize_dockerhub_image};

/// Capabilities shared by every registry backend.
///
/// All network operations take a cancellation token and return
/// [`SyncerError::Cancelled`] promptly once it fires.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Validate the configured credentials
    async fn authenticate(&self, cancel: &CancellationToken) -> Result<()>;

    /// Every tag of `image`, in the order the registry lists them
    async fn list_tags(&self, cancel: &CancellationToken, image: &str) -> Result<Vec<String>>;

    /// `Ok(false)` exactly when the registry reports the tag as not found
    async fn image_exists(&self, cancel: &CancellationToken, image: &str, tag: &str)
    -> Result<bool>;

    /// Manifest digest of a tag, `None` when it does not exist
    async fn image_digest(
        &self,
        cancel: &CancellationToken,
        image: &str,
        tag: &str,
    ) -> Result<Option<String>>;

    /// Fetch the full image into the content store, returning its manifest digest
    async fn pull_image(&self, cancel: &CancellationToken, image: &str, tag: &str)
    -> Result<String>;

    /// Upload an image previously pulled under `digest`
    async fn push_image(
        &self,
        cancel: &CancellationToken,
        image: &str,
        tag: &str,
        digest: &str,
    ) -> Result<()>;

    /// Check the registry answers with the configured credentials.
    /// Unlike [`authenticate`](Registry::authenticate), this always touches the network.
    async fn ping(&self, cancel: &CancellationToken) -> Result<()> {
        self.authenticate(cancel).await
    }

    fn registry_url(&self) -> &str;
}

/// Run `fut` unless `cancel` fires first
pub async fn with_cancel<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SyncerError::Cancelled),
        result = fut => result,
    }
}
