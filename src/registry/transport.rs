//! OCI distribution transport
//!
//! Speaks the Docker Registry API v2 / OCI Distribution protocol for one
//! registry endpoint: manifests, blobs, uploads and tag listing. Requests
//! that hit a `401` with a `WWW-Authenticate` challenge are authorized
//! (token fetched from the realm, or basic auth) and retried once.

use crate::digest::DigestUtils;
use crate::error::handlers::{HttpErrorHandler, NetworkErrorHandler};
use crate::error::{Result, SyncerError};
use crate::registry::auth::{AuthChallenge, Credential, TokenCache, TokenResponse, parse_challenge};
use crate::registry::manifest::{Descriptor, accept_header};
use crate::registry::pagination::TagPage;
use crate::registry::with_cancel;
use crate::store::ContentStore;
use reqwest::header::{ACCEPT, CONTENT_LENGTH, CONTENT_TYPE, LINK, LOCATION, WWW_AUTHENTICATE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

const DOCKER_CONTENT_DIGEST: &str = "docker-content-digest";

/// `client_id` sent with OAuth2 token requests
const OAUTH_CLIENT_ID: &str = "syncerd";

/// Digest and media type of a manifest, as reported by a `HEAD`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestHead {
    pub digest: String,
    pub media_type: Option<String>,
}

/// A manifest body with its verified digest
#[derive(Debug, Clone)]
pub struct FetchedManifest {
    pub bytes: Vec<u8>,
    pub media_type: Option<String>,
    pub digest: String,
}

#[derive(Debug, Deserialize)]
struct TagListResponse {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

pub fn pull_scope(repository: &str) -> String {
    format!("repository:{}:pull", repository)
}

pub fn push_scope(repository: &str) -> String {
    format!("repository:{}:pull,push", repository)
}

#[derive(Debug)]
pub struct OciTransport {
    client: Client,
    endpoint: String,
    credential: Credential,
    tokens: TokenCache,
    basic_challenged: AtomicBool,
}

impl OciTransport {
    pub fn new(client: Client, endpoint: impl Into<String>, credential: Credential) -> Self {
        Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            credential,
            tokens: TokenCache::new(),
            basic_challenged: AtomicBool::new(false),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    fn manifest_url(&self, repository: &str, reference: &str) -> String {
        format!("{}/v2/{}/manifests/{}", self.endpoint, repository, reference)
    }

    fn blob_url(&self, repository: &str, digest: &str) -> String {
        format!("{}/v2/{}/blobs/{}", self.endpoint, repository, digest)
    }

    pub fn tags_url(&self, repository: &str) -> String {
        format!("{}/v2/{}/tags/list", self.endpoint, repository)
    }

    fn authorize(&self, request: RequestBuilder, scope: &str) -> RequestBuilder {
        if let Credential::Bearer { token } = &self.credential {
            return request.bearer_auth(token);
        }
        if let Some(token) = self.tokens.get(scope) {
            return request.bearer_auth(token);
        }
        if self.basic_challenged.load(Ordering::Relaxed) {
            return self.credential.apply(request);
        }
        request
    }

    async fn dispatch(
        &self,
        cancel: &CancellationToken,
        operation: &str,
        request: RequestBuilder,
    ) -> Result<Response> {
        with_cancel(cancel, async {
            request
                .send()
                .await
                .map_err(|e| NetworkErrorHandler::handle_network_error(&e, operation))
        })
        .await
    }

    /// Send a request, answering one authentication challenge.
    ///
    /// `build` is called again for the retry, so it must produce an identical request.
    async fn send<F>(
        &self,
        cancel: &CancellationToken,
        scope: &str,
        operation: &str,
        build: F,
    ) -> Result<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        let response = self
            .dispatch(cancel, operation, self.authorize(build(), scope))
            .await?;

        if response.status() != StatusCode::UNAUTHORIZED
            || matches!(self.credential, Credential::Bearer { .. })
        {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_challenge);

        match challenge {
            Some(AuthChallenge::Bearer {
                realm,
                service,
                scope: challenge_scope,
            }) => {
                let token_scope = challenge_scope.as_deref().unwrap_or(scope);
                self.fetch_token(cancel, &realm, service.as_deref(), token_scope, scope)
                    .await?;
            }
            Some(AuthChallenge::Basic) if matches!(self.credential, Credential::Basic { .. }) => {
                self.basic_challenged.store(true, Ordering::Relaxed);
            }
            _ => return Ok(response),
        }

        trace!(operation, scope, "retrying after authentication challenge");
        self.dispatch(cancel, operation, self.authorize(build(), scope))
            .await
    }

    async fn fetch_token(
        &self,
        cancel: &CancellationToken,
        realm: &str,
        service: Option<&str>,
        token_scope: &str,
        cache_scope: &str,
    ) -> Result<()> {
        let mut params = Vec::new();
        if let Some(service) = service {
            params.push(("service", service));
        }
        if !token_scope.is_empty() {
            params.push(("scope", token_scope));
        }

        // Identity tokens go through the OAuth2 refresh grant, everything else through GET
        let request = match &self.credential {
            Credential::IdentityToken { token } => {
                let mut form = vec![
                    ("grant_type", "refresh_token"),
                    ("refresh_token", token.as_str()),
                    ("client_id", OAUTH_CLIENT_ID),
                ];
                form.extend(params);
                self.client.post(realm).form(&form)
            }
            credential => credential.apply(self.client.get(realm).query(&params)),
        };
        let response = self.dispatch(cancel, "token request", request).await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(HttpErrorHandler::handle_auth_error(status, &text));
        }

        let body: TokenResponse = with_cancel(cancel, async {
            response
                .json()
                .await
                .map_err(|e| NetworkErrorHandler::handle_network_error(&e, "token response"))
        })
        .await?;
        let (token, lifetime) = body.into_token()?;
        debug!(realm, scope = token_scope, "obtained registry token");
        self.tokens.insert(cache_scope, token, lifetime);
        Ok(())
    }

    async fn check_status(response: Response, operation: &str) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        Err(HttpErrorHandler::handle_registry_error(status, &text, operation))
    }

    /// `GET /v2/`, authorizing against whatever challenge the registry issues
    pub async fn ping(&self, cancel: &CancellationToken) -> Result<()> {
        let url = format!("{}/v2/", self.endpoint);
        let response = self
            .send(cancel, "", "registry ping", || self.client.get(&url))
            .await?;
        Self::check_status(response, "registry ping").await?;
        Ok(())
    }

    /// Digest of a manifest without downloading it; `None` when not found
    pub async fn head_manifest(
        &self,
        cancel: &CancellationToken,
        repository: &str,
        reference: &str,
    ) -> Result<Option<ManifestHead>> {
        let url = self.manifest_url(repository, reference);
        let scope = pull_scope(repository);
        let response = self
            .send(cancel, &scope, "manifest lookup", || {
                self.client.head(&url).header(ACCEPT, accept_header())
            })
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::check_status(response, "manifest lookup").await?;

        let media_type = header_string(&response, CONTENT_TYPE.as_str());
        match header_string(&response, DOCKER_CONTENT_DIGEST) {
            Some(digest) => Ok(Some(ManifestHead { digest, media_type })),
            None => {
                // Some registries omit the digest header on HEAD
                let manifest = self.get_manifest(cancel, repository, reference).await?;
                Ok(Some(ManifestHead {
                    digest: manifest.digest,
                    media_type: manifest.media_type,
                }))
            }
        }
    }

    /// Download a manifest and verify it against the reported or requested digest
    pub async fn get_manifest(
        &self,
        cancel: &CancellationToken,
        repository: &str,
        reference: &str,
    ) -> Result<FetchedManifest> {
        let url = self.manifest_url(repository, reference);
        let scope = pull_scope(repository);
        let operation = format!("fetch manifest {}:{}", repository, reference);
        let response = self
            .send(cancel, &scope, &operation, || {
                self.client.get(&url).header(ACCEPT, accept_header())
            })
            .await?;
        let response = Self::check_status(response, &operation).await?;

        let media_type = header_string(&response, CONTENT_TYPE.as_str());
        let reported = header_string(&response, DOCKER_CONTENT_DIGEST);
        let bytes = with_cancel(cancel, async {
            response
                .bytes()
                .await
                .map_err(|e| NetworkErrorHandler::handle_network_error(&e, &operation))
        })
        .await?
        .to_vec();

        let digest = DigestUtils::compute_docker_digest(&bytes);
        let expected = if reference.starts_with("sha256:") {
            Some(reference.to_string())
        } else {
            reported
        };
        if let Some(expected) = expected {
            if expected != digest {
                return Err(SyncerError::Decode(format!(
                    "manifest digest mismatch for {}:{}: expected {}, computed {}",
                    repository, reference, expected, digest
                )));
            }
        }

        Ok(FetchedManifest {
            bytes,
            media_type,
            digest,
        })
    }

    pub async fn put_manifest(
        &self,
        cancel: &CancellationToken,
        repository: &str,
        reference: &str,
        media_type: &str,
        bytes: &[u8],
    ) -> Result<Option<String>> {
        let url = self.manifest_url(repository, reference);
        let scope = push_scope(repository);
        let operation = format!("push manifest {}:{}", repository, reference);
        let response = self
            .send(cancel, &scope, &operation, || {
                self.client
                    .put(&url)
                    .header(CONTENT_TYPE, media_type)
                    .body(bytes.to_vec())
            })
            .await?;
        let response = Self::check_status(response, &operation).await?;
        Ok(header_string(&response, DOCKER_CONTENT_DIGEST))
    }

    pub async fn blob_exists(
        &self,
        cancel: &CancellationToken,
        repository: &str,
        digest: &str,
        scope: &str,
    ) -> Result<bool> {
        let url = self.blob_url(repository, digest);
        let response = self
            .send(cancel, scope, "blob lookup", || self.client.head(&url))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        Self::check_status(response, "blob lookup").await?;
        Ok(true)
    }

    /// Stream a blob into the store unless it is already there
    pub async fn download_blob(
        &self,
        cancel: &CancellationToken,
        store: &ContentStore,
        repository: &str,
        blob: &Descriptor,
    ) -> Result<()> {
        if store.has_blob(&blob.digest, blob.size).await {
            trace!(digest = %blob.digest, "blob already in content store");
            return Ok(());
        }

        let url = self.blob_url(repository, &blob.digest);
        let scope = pull_scope(repository);
        let operation = format!("download blob {}", DigestUtils::format_digest_short(&blob.digest));
        let response = self
            .send(cancel, &scope, &operation, || self.client.get(&url))
            .await?;
        let response = Self::check_status(response, &operation).await?;

        let written = with_cancel(cancel, store.write_blob(&blob.digest, response.bytes_stream()))
            .await?;
        debug!(digest = %blob.digest, bytes = written, "downloaded blob");
        Ok(())
    }

    /// Upload a stored blob with a monolithic `POST` + `PUT`, skipping blobs the registry has
    pub async fn upload_blob(
        &self,
        cancel: &CancellationToken,
        store: &ContentStore,
        repository: &str,
        digest: &str,
    ) -> Result<()> {
        let scope = push_scope(repository);
        if self.blob_exists(cancel, repository, digest, &scope).await? {
            trace!(digest, "blob already present at destination");
            return Ok(());
        }

        let url = format!("{}/v2/{}/blobs/uploads/", self.endpoint, repository);
        let operation = format!("upload blob {}", DigestUtils::format_digest_short(digest));
        let response = self
            .send(cancel, &scope, &operation, || {
                self.client.post(&url).header(CONTENT_LENGTH, 0)
            })
            .await?;
        let response = Self::check_status(response, &operation).await?;

        let location = header_string(&response, LOCATION.as_str()).ok_or_else(|| {
            SyncerError::Decode(format!("{}: upload session has no Location", operation))
        })?;
        let mut upload_url = url::Url::parse(&self.endpoint)?.join(&location)?;
        upload_url.query_pairs_mut().append_pair("digest", digest);

        let (file, size) = store.open_blob(digest).await?;
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        // A streamed body cannot be replayed, so the session token from the POST is reused
        let request = self.authorize(
            self.client
                .put(upload_url)
                .header(CONTENT_TYPE, "application/octet-stream")
                .header(CONTENT_LENGTH, size)
                .body(body),
            &scope,
        );
        let response = self.dispatch(cancel, &operation, request).await?;
        Self::check_status(response, &operation).await?;
        debug!(digest, bytes = size, "uploaded blob");
        Ok(())
    }

    /// One page of `GET /v2/<name>/tags/list`
    pub async fn list_tags_page(
        &self,
        cancel: &CancellationToken,
        repository: &str,
        url: &str,
    ) -> Result<TagPage> {
        let scope = pull_scope(repository);
        let response = self
            .send(cancel, &scope, "list tags", || self.client.get(url))
            .await?;
        let response = Self::check_status(response, "list tags").await?;

        let next = header_string(&response, LINK.as_str())
            .and_then(|link| parse_next_link(&link))
            .map(|next| self.resolve(&next))
            .transpose()?;
        let body: TagListResponse = with_cancel(cancel, async {
            response
                .json()
                .await
                .map_err(|e| NetworkErrorHandler::handle_network_error(&e, "list tags"))
        })
        .await?;

        Ok(TagPage {
            tags: body.tags.unwrap_or_default(),
            next,
        })
    }

    fn resolve(&self, reference: &str) -> Result<String> {
        Ok(url::Url::parse(&self.endpoint)?.join(reference)?.to_string())
    }
}

fn header_string(response: &Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Target of the `rel="next"` entry of a `Link` header
pub fn parse_next_link(header: &str) -> Option<String> {
    header.split(',').find_map(|part| {
        let (target, params) = part.split_once(';')?;
        let is_next = params
            .split(';')
            .any(|p| p.trim().replace(' ', "") == "rel=\"next\"" || p.trim() == "rel=next");
        if !is_next {
            return None;
        }
        let target = target.trim().strip_prefix('<')?.strip_suffix('>')?;
        Some(target.to_string())
    })
}
