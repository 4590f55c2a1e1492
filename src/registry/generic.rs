//! Destination registry speaking plain OCI distribution
//!
//! ECR, ACR, GCR, GHCR, Harbor and self-hosted registries are all handled the
//! same way; only the credential differs.

use crate::error::Result;
use crate::registry::auth::Credential;
use crate::registry::pagination::{PageSource, TagPage, TagPager};
use crate::registry::reference::registry_endpoint;
use crate::registry::transport::OciTransport;
use crate::registry::{Registry, transfer};
use crate::store::ContentStore;
use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct GenericRegistry {
    registry: String,
    transport: OciTransport,
    store: Arc<ContentStore>,
}

impl GenericRegistry {
    pub fn new(
        registry: impl Into<String>,
        credential: Credential,
        client: Client,
        store: Arc<ContentStore>,
    ) -> Self {
        let registry = registry.into();
        let endpoint = registry_endpoint(&registry);
        Self {
            transport: OciTransport::new(client, endpoint, credential),
            registry,
            store,
        }
    }

    pub fn endpoint(&self) -> &str {
        self.transport.endpoint()
    }

    pub fn credential(&self) -> &Credential {
        self.transport.credential()
    }
}

/// Tag pages of one repository, following `Link` headers
struct RepositoryTags<'a> {
    transport: &'a OciTransport,
    repository: &'a str,
}

#[async_trait]
impl PageSource for RepositoryTags<'_> {
    async fn fetch_page(&self, url: &str, cancel: &CancellationToken) -> Result<TagPage> {
        self.transport
            .list_tags_page(cancel, self.repository, url)
            .await
    }
}

#[async_trait]
impl Registry for GenericRegistry {
    async fn authenticate(&self, cancel: &CancellationToken) -> Result<()> {
        if self.credential().is_anonymous() {
            debug!(registry = %self.registry, "using anonymous registry access");
            return Ok(());
        }
        self.transport.ping(cancel).await?;
        debug!(registry = %self.registry, mode = self.credential().mode(), "registry credentials accepted");
        Ok(())
    }

    async fn ping(&self, cancel: &CancellationToken) -> Result<()> {
        self.transport.ping(cancel).await?;
        debug!(registry = %self.registry, mode = self.credential().mode(), "registry reachable");
        Ok(())
    }

    async fn list_tags(&self, cancel: &CancellationToken, image: &str) -> Result<Vec<String>> {
        let source = RepositoryTags {
            transport: &self.transport,
            repository: image,
        };
        TagPager::new(&source, self.transport.tags_url(image))
            .collect_all(cancel)
            .await
    }

    async fn image_exists(&self, cancel: &CancellationToken, image: &str, tag: &str) -> Result<bool> {
        Ok(self.transport.head_manifest(cancel, image, tag).await?.is_some())
    }

    async fn image_digest(
        &self,
        cancel: &CancellationToken,
        image: &str,
        tag: &str,
    ) -> Result<Option<String>> {
        let head = self.transport.head_manifest(cancel, image, tag).await?;
        Ok(head.map(|head| head.digest))
    }

    async fn pull_image(&self, cancel: &CancellationToken, image: &str, tag: &str) -> Result<String> {
        transfer::pull_to_store(&self.transport, &self.store, cancel, image, tag).await
    }

    async fn push_image(
        &self,
        cancel: &CancellationToken,
        image: &str,
        tag: &str,
        digest: &str,
    ) -> Result<()> {
        transfer::push_from_store(&self.transport, &self.store, cancel, image, tag, digest).await
    }

    fn registry_url(&self) -> &str {
        &self.registry
    }
}
