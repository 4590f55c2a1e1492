//! Building registry backends from configuration

use crate::config::{Config, DestinationConfig, SourceConfig};
use crate::error::handlers::NetworkErrorHandler;
use crate::error::{Result, SyncerError};
use crate::registry::dockerhub::DockerHubRegistry;
use crate::registry::generic::GenericRegistry;
use crate::registry::keychain::Keychain;
use crate::registry::reference::{DOCKER_HUB_REGISTRY, split_registry_path};
use crate::registry::Registry;
use crate::store::ContentStore;
use async_trait::async_trait;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Idle read timeout when none is configured
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client for registry traffic.
///
/// `timeout` bounds each wait for data rather than a whole request, so large
/// blobs may stream for as long as they keep making progress.
pub fn transfer_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .connect_timeout(CONNECT_TIMEOUT.min(timeout))
        .read_timeout(timeout)
        .user_agent(concat!("syncerd/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| NetworkErrorHandler::handle_network_error(&e, "HTTP client setup"))
}

/// Creates registries that share one HTTP client, content store and keychain
#[derive(Clone)]
pub struct RegistryFactory {
    client: Client,
    store: Arc<ContentStore>,
    keychain: Arc<Keychain>,
    hub_url: Option<String>,
    hub_endpoint: Option<String>,
}

impl RegistryFactory {
    pub fn new(store: Arc<ContentStore>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: transfer_client(timeout)?,
            store,
            keychain: Arc::new(Keychain::from_default_location()),
            hub_url: None,
            hub_endpoint: None,
        })
    }

    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    pub fn with_keychain(mut self, keychain: Keychain) -> Self {
        self.keychain = Arc::new(keychain);
        self
    }

    /// Point Docker Hub sources at another REST API and distribution endpoint
    pub fn with_hub_url(mut self, hub_url: impl Into<String>, endpoint: impl Into<String>) -> Self {
        self.hub_url = Some(hub_url.into());
        self.hub_endpoint = Some(endpoint.into());
        self
    }

    pub fn store(&self) -> &Arc<ContentStore> {
        &self.store
    }

    pub fn create_source_registry(
        &self,
        registry_type: &str,
        registry: &str,
        username: &str,
        password: &str,
        token: &str,
    ) -> Result<Arc<dyn Registry>> {
        match registry_type {
            "dockerhub" | "docker.io" => {
                let registry = if registry.trim().is_empty() {
                    DOCKER_HUB_REGISTRY
                } else {
                    registry
                };
                let mut builder = DockerHubRegistry::builder(registry)
                    .with_credentials(username, password, token)
                    .with_client(self.client.clone())
                    .with_store(self.store.clone());
                if let Some(hub_url) = &self.hub_url {
                    builder = builder.with_hub_url(hub_url.clone());
                }
                if let Some(endpoint) = &self.hub_endpoint {
                    builder = builder.with_endpoint(endpoint.clone());
                }
                Ok(Arc::new(builder.build()?))
            }
            other => Err(SyncerError::UnsupportedRegistryType(format!(
                "unsupported source registry type: {}",
                other
            ))),
        }
    }

    /// Every destination type is a generic OCI registry; `registry_type`,
    /// `region` and `auth` are accepted but do not change behavior.
    pub async fn create_destination_registry(
        &self,
        registry_type: &str,
        registry: &str,
        region: &str,
        auth: &HashMap<String, String>,
    ) -> Result<Arc<dyn Registry>> {
        if registry.trim().is_empty() {
            return Err(SyncerError::Config(
                "destination registry is required".to_string(),
            ));
        }
        let (registry, _) = split_registry_path(registry);
        let credential = self.keychain.resolve(&registry).await;
        debug!(
            registry = %registry,
            registry_type,
            region,
            auth_keys = auth.len(),
            credential = credential.mode(),
            "creating destination registry"
        );
        Ok(Arc::new(GenericRegistry::new(
            registry,
            credential,
            self.client.clone(),
            self.store.clone(),
        )))
    }

    pub async fn test_connection(
        &self,
        cancel: &CancellationToken,
        registry: &dyn Registry,
    ) -> Result<()> {
        registry.ping(cancel).await
    }
}

/// Source of registry instances for the syncer
#[async_trait]
pub trait RegistryResolver: Send + Sync {
    fn source(&self) -> Result<Arc<dyn Registry>>;
    /// May run a credential helper
    async fn destination(&self, name: &str) -> Result<Arc<dyn Registry>>;
}

/// Resolves registries from the loaded configuration through a factory
pub struct ConfiguredRegistries {
    factory: RegistryFactory,
    source: SourceConfig,
    destinations: HashMap<String, DestinationConfig>,
}

impl ConfiguredRegistries {
    pub fn new(factory: RegistryFactory, config: &Config) -> Self {
        Self {
            factory,
            source: config.source.clone(),
            destinations: config
                .destinations
                .iter()
                .map(|d| (d.name.clone(), d.clone()))
                .collect(),
        }
    }

    pub fn factory(&self) -> &RegistryFactory {
        &self.factory
    }
}

#[async_trait]
impl RegistryResolver for ConfiguredRegistries {
    fn source(&self) -> Result<Arc<dyn Registry>> {
        self.factory.create_source_registry(
            &self.source.registry_type,
            &self.source.registry,
            &self.source.username,
            &self.source.password,
            &self.source.token,
        )
    }

    async fn destination(&self, name: &str) -> Result<Arc<dyn Registry>> {
        let destination = self
            .destinations
            .get(name)
            .ok_or_else(|| SyncerError::Config(format!("unknown destination {:?}", name)))?;
        self.factory.create_destination_registry(
            &destination.registry_type,
            &destination.registry,
            &destination.region,
            &destination.auth,
        )
        .await
    }
}
