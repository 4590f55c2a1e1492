//! Docker Hub source registry
//!
//! Authentication and tag listing go through the Docker Hub REST API;
//! existence checks and pulls go through the OCI distribution endpoint.
//! Docker Hub is read-only here: pushing always fails.

use crate::error::handlers::{HttpErrorHandler, NetworkErrorHandler};
use crate::error::{Result, SyncerError};
use crate::registry::auth::Credential;
use crate::registry::factory::{DEFAULT_TIMEOUT, transfer_client};
use crate::registry::pagination::{PageSource, TagPage, TagPager};
use crate::registry::reference::{DOCKER_HUB_REGISTRY, normalize_dockerhub_image, registry_endpoint};
use crate::registry::transport::OciTransport;
use crate::registry::{Registry, transfer, with_cancel};
use crate::store::ContentStore;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Docker Hub REST API base
pub const HUB_API_URL: &str = "https://hub.docker.com";

const TAGS_PAGE_SIZE: u32 = 100;

#[derive(Debug, Deserialize)]
struct HubTag {
    name: String,
}

#[derive(Debug, Deserialize)]
struct HubTagsResponse {
    #[serde(default)]
    results: Vec<HubTag>,
    #[serde(default)]
    next: Option<String>,
}

pub struct DockerHubRegistryBuilder {
    registry: String,
    username: String,
    password: String,
    token: String,
    hub_url: String,
    endpoint: Option<String>,
    client: Option<Client>,
    store: Option<Arc<ContentStore>>,
}

impl DockerHubRegistryBuilder {
    pub fn new(registry: impl Into<String>) -> Self {
        Self {
            registry: registry.into(),
            username: String::new(),
            password: String::new(),
            token: String::new(),
            hub_url: HUB_API_URL.to_string(),
            endpoint: None,
            client: None,
            store: None,
        }
    }

    pub fn with_credentials(mut self, username: &str, password: &str, token: &str) -> Self {
        self.username = username.to_string();
        self.password = password.to_string();
        self.token = token.to_string();
        self
    }

    /// Override the REST API base, e.g. to point at a local fake
    pub fn with_hub_url(mut self, hub_url: impl Into<String>) -> Self {
        self.hub_url = hub_url.into();
        self
    }

    /// Override the OCI distribution endpoint
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_store(mut self, store: Arc<ContentStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> Result<DockerHubRegistry> {
        let credential = Credential::from_parts(&self.username, &self.password, &self.token)?;
        let registry = if self.registry.trim().is_empty() {
            DOCKER_HUB_REGISTRY.to_string()
        } else {
            self.registry.trim().to_string()
        };
        let client = match self.client {
            Some(client) => client,
            None => transfer_client(DEFAULT_TIMEOUT)?,
        };
        let store = match self.store {
            Some(store) => store,
            None => Arc::new(ContentStore::temporary()?),
        };
        let endpoint = self
            .endpoint
            .unwrap_or_else(|| registry_endpoint(&registry));

        Ok(DockerHubRegistry {
            transport: OciTransport::new(client.clone(), endpoint, credential.clone()),
            hub_url: self.hub_url.trim_end_matches('/').to_string(),
            registry,
            credential,
            client,
            store,
        })
    }
}

pub struct DockerHubRegistry {
    registry: String,
    hub_url: String,
    credential: Credential,
    client: Client,
    transport: OciTransport,
    store: Arc<ContentStore>,
}

impl DockerHubRegistry {
    pub fn builder(registry: impl Into<String>) -> DockerHubRegistryBuilder {
        DockerHubRegistryBuilder::new(registry)
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    fn tags_url(&self, image: &str) -> String {
        format!(
            "{}/v2/repositories/{}/tags?page_size={}",
            self.hub_url, image, TAGS_PAGE_SIZE
        )
    }

    async fn login(&self, cancel: &CancellationToken, username: &str, password: &str) -> Result<()> {
        let url = format!("{}/v2/users/login/", self.hub_url);
        let body = serde_json::json!({ "username": username, "password": password });
        let response = with_cancel(cancel, async {
            self.client
                .post(&url)
                .json(&body)
                .send()
                .await
                .map_err(|e| NetworkErrorHandler::handle_network_error(&e, "Docker Hub login"))
        })
        .await?;

        match response.status() {
            StatusCode::OK => Ok(()),
            StatusCode::UNAUTHORIZED => Err(SyncerError::Auth(
                "docker hub authentication failed: invalid credentials".to_string(),
            )),
            status => Err(SyncerError::Auth(format!(
                "docker hub authentication failed: {}",
                status
            ))),
        }
    }

    async fn probe_token(&self, cancel: &CancellationToken, token: &str) -> Result<()> {
        let url = format!("{}/v2/repositories/library/", self.hub_url);
        let response = with_cancel(cancel, async {
            self.client
                .get(&url)
                .bearer_auth(token)
                .send()
                .await
                .map_err(|e| NetworkErrorHandler::handle_network_error(&e, "Docker Hub token probe"))
        })
        .await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(SyncerError::Auth(
                "docker hub token authentication failed".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl PageSource for DockerHubRegistry {
    async fn fetch_page(&self, url: &str, cancel: &CancellationToken) -> Result<TagPage> {
        let request = self.credential.apply(self.client.get(url));
        let response = with_cancel(cancel, async {
            request
                .send()
                .await
                .map_err(|e| NetworkErrorHandler::handle_network_error(&e, "list tags"))
        })
        .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(HttpErrorHandler::handle_registry_error(status, &text, "list tags"));
        }

        let page: HubTagsResponse = with_cancel(cancel, async {
            let bytes = response
                .bytes()
                .await
                .map_err(|e| NetworkErrorHandler::handle_network_error(&e, "list tags"))?;
            serde_json::from_slice(&bytes)
                .map_err(|e| SyncerError::Decode(format!("invalid tag page from {}: {}", url, e)))
        })
        .await?;

        Ok(TagPage {
            tags: page.results.into_iter().map(|tag| tag.name).collect(),
            next: page.next,
        })
    }
}

#[async_trait]
impl Registry for DockerHubRegistry {
    async fn authenticate(&self, cancel: &CancellationToken) -> Result<()> {
        match &self.credential {
            Credential::Anonymous => {
                debug!("using anonymous Docker Hub access");
                Ok(())
            }
            Credential::Basic { username, password } => {
                self.login(cancel, username, password).await?;
                info!(username = %username, "authenticated with Docker Hub");
                Ok(())
            }
            Credential::Bearer { token } => self.probe_token(cancel, token).await,
            Credential::IdentityToken { .. } => Err(SyncerError::Config(
                "identity tokens cannot log in to Docker Hub".to_string(),
            )),
        }
    }

    async fn list_tags(&self, cancel: &CancellationToken, image: &str) -> Result<Vec<String>> {
        let image = normalize_dockerhub_image(image);
        let mut pager = TagPager::new(self, self.tags_url(&image));
        let tags = pager.collect_all(cancel).await?;
        debug!(image = %image, tags = tags.len(), pages = pager.pages_fetched(), "listed Docker Hub tags");
        Ok(tags)
    }

    async fn image_exists(&self, cancel: &CancellationToken, image: &str, tag: &str) -> Result<bool> {
        Ok(self.image_digest(cancel, image, tag).await?.is_some())
    }

    async fn image_digest(
        &self,
        cancel: &CancellationToken,
        image: &str,
        tag: &str,
    ) -> Result<Option<String>> {
        let image = normalize_dockerhub_image(image);
        let head = self.transport.head_manifest(cancel, &image, tag).await?;
        Ok(head.map(|head| head.digest))
    }

    async fn pull_image(&self, cancel: &CancellationToken, image: &str, tag: &str) -> Result<String> {
        let image = normalize_dockerhub_image(image);
        transfer::pull_to_store(&self.transport, &self.store, cancel, &image, tag).await
    }

    async fn push_image(
        &self,
        _cancel: &CancellationToken,
        _image: &str,
        _tag: &str,
        _digest: &str,
    ) -> Result<()> {
        Err(SyncerError::UnsupportedOperation(
            "push not supported for source registry".to_string(),
        ))
    }

    async fn ping(&self, cancel: &CancellationToken) -> Result<()> {
        self.authenticate(cancel).await?;
        self.transport.ping(cancel).await
    }

    fn registry_url(&self) -> &str {
        &self.registry
    }
}
