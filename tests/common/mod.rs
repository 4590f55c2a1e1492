//! In-process fakes for the Docker Hub REST API and an OCI distribution registry

#![allow(dead_code)]

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{Form, Path, Query, State};
use axum::http::{HeaderMap, Method, Response, StatusCode, Uri, header};
use axum::routing::{get, post};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use syncerd::digest::DigestUtils;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

async fn serve(app: Router) -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), handle)
}

fn respond(status: StatusCode, headers: &[(&str, String)], body: Vec<u8>) -> Response<Body> {
    let mut builder = Response::builder().status(status);
    for (name, value) in headers {
        builder = builder.header(*name, value.as_str());
    }
    builder.body(Body::from(body)).unwrap()
}

/// A single-platform image (or an index of them) with every blob it references
#[derive(Debug, Clone)]
pub struct TestImage {
    pub manifest: Vec<u8>,
    pub media_type: String,
    pub digest: String,
    pub blobs: Vec<(String, Vec<u8>)>,
    pub children: Vec<TestImage>,
}

impl TestImage {
    pub fn new(layers: &[&[u8]]) -> Self {
        let config = br#"{"architecture":"amd64","os":"linux"}"#.to_vec();
        let descriptor = |media_type: &str, data: &[u8]| {
            json!({
                "mediaType": media_type,
                "digest": DigestUtils::compute_docker_digest(data),
                "size": data.len(),
            })
        };
        let manifest = json!({
            "schemaVersion": 2,
            "mediaType": OCI_MANIFEST,
            "config": descriptor("application/vnd.oci.image.config.v1+json", &config),
            "layers": layers
                .iter()
                .map(|layer| descriptor("application/vnd.oci.image.layer.v1.tar+gzip", layer))
                .collect::<Vec<_>>(),
        });
        let manifest = serde_json::to_vec(&manifest).unwrap();

        let mut blobs = vec![(DigestUtils::compute_docker_digest(&config), config)];
        for layer in layers {
            blobs.push((DigestUtils::compute_docker_digest(layer), layer.to_vec()));
        }

        Self {
            digest: DigestUtils::compute_docker_digest(&manifest),
            manifest,
            media_type: OCI_MANIFEST.to_string(),
            blobs,
            children: Vec::new(),
        }
    }

    pub fn index(children: Vec<TestImage>) -> Self {
        let manifest = json!({
            "schemaVersion": 2,
            "mediaType": OCI_INDEX,
            "manifests": children
                .iter()
                .map(|child| json!({
                    "mediaType": child.media_type,
                    "digest": child.digest,
                    "size": child.manifest.len(),
                }))
                .collect::<Vec<_>>(),
        });
        let manifest = serde_json::to_vec(&manifest).unwrap();
        Self {
            digest: DigestUtils::compute_docker_digest(&manifest),
            manifest,
            media_type: OCI_INDEX.to_string(),
            blobs: Vec::new(),
            children,
        }
    }

    /// An image manifest served verbatim, with no blobs behind it
    pub fn raw(manifest: serde_json::Value) -> Self {
        let manifest = serde_json::to_vec(&manifest).unwrap();
        Self {
            digest: DigestUtils::compute_docker_digest(&manifest),
            manifest,
            media_type: OCI_MANIFEST.to_string(),
            blobs: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn all_blobs(&self) -> Vec<(String, Vec<u8>)> {
        let mut blobs = self.blobs.clone();
        for child in &self.children {
            blobs.extend(child.all_blobs());
        }
        blobs
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRequest {
    pub scope: Option<String>,
    pub basic_auth: bool,
    /// Set for OAuth2 `refresh_token` grants
    pub refresh_token: Option<String>,
}

#[derive(Default)]
pub struct RegistryState {
    pub base_url: String,
    /// (repository, tag or digest) -> (media type, bytes)
    pub manifests: HashMap<(String, String), (String, Vec<u8>)>,
    pub blobs: HashMap<String, Vec<u8>>,
    pub uploads: HashMap<String, String>,
    pub required_token: Option<String>,
    pub manifest_status: Option<StatusCode>,
    pub tags_page_size: usize,
    pub requests: Vec<String>,
    pub token_requests: Vec<TokenRequest>,
}

type SharedRegistry = Arc<Mutex<RegistryState>>;

/// Minimal OCI distribution registry kept in memory
pub struct FakeRegistry {
    pub base_url: String,
    pub state: SharedRegistry,
    handle: JoinHandle<()>,
}

impl FakeRegistry {
    pub async fn start() -> Self {
        Self::start_inner(None).await
    }

    /// Every `/v2` request must carry `Bearer <token>`, obtainable from `/token`
    pub async fn start_with_token(token: &str) -> Self {
        Self::start_inner(Some(token.to_string())).await
    }

    async fn start_inner(required_token: Option<String>) -> Self {
        let state: SharedRegistry = Arc::new(Mutex::new(RegistryState {
            required_token,
            tags_page_size: 2,
            ..Default::default()
        }));
        let app = Router::new()
            .route("/token", get(registry_token).post(registry_oauth_token))
            .fallback(registry_api)
            .with_state(state.clone());
        let (base_url, handle) = serve(app).await;
        state.lock().unwrap().base_url = base_url.clone();
        Self {
            base_url,
            state,
            handle,
        }
    }

    pub fn put_image(&self, repository: &str, tag: &str, image: &TestImage) {
        let mut state = self.state.lock().unwrap();
        for (digest, data) in image.all_blobs() {
            state.blobs.insert(digest, data);
        }
        for child in &image.children {
            state.manifests.insert(
                (repository.to_string(), child.digest.clone()),
                (child.media_type.clone(), child.manifest.clone()),
            );
        }
        let entry = (image.media_type.clone(), image.manifest.clone());
        state
            .manifests
            .insert((repository.to_string(), image.digest.clone()), entry.clone());
        state
            .manifests
            .insert((repository.to_string(), tag.to_string()), entry);
    }

    pub fn manifest(&self, repository: &str, reference: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .manifests
            .get(&(repository.to_string(), reference.to_string()))
            .map(|(_, bytes)| bytes.clone())
    }

    pub fn has_blob(&self, digest: &str) -> bool {
        self.state.lock().unwrap().blobs.contains_key(digest)
    }

    pub fn fail_manifests_with(&self, status: StatusCode) {
        self.state.lock().unwrap().manifest_status = Some(status);
    }

    pub fn requests(&self) -> Vec<String> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn count_requests(&self, prefix: &str) -> usize {
        self.requests().iter().filter(|r| r.starts_with(prefix)).count()
    }

    pub fn token_requests(&self) -> Vec<TokenRequest> {
        self.state.lock().unwrap().token_requests.clone()
    }
}

impl Drop for FakeRegistry {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn registry_token(
    State(state): State<SharedRegistry>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response<Body> {
    let basic_auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("Basic "));
    let mut state = state.lock().unwrap();
    state.token_requests.push(TokenRequest {
        scope: params.get("scope").cloned(),
        basic_auth,
        refresh_token: None,
    });
    let token = state.required_token.clone().unwrap_or_default();
    let body = serde_json::to_vec(&json!({ "token": token, "expires_in": 300 })).unwrap();
    respond(StatusCode::OK, &[("content-type", "application/json".into())], body)
}

async fn registry_oauth_token(
    State(state): State<SharedRegistry>,
    Form(form): Form<HashMap<String, String>>,
) -> Response<Body> {
    let mut state = state.lock().unwrap();
    state.token_requests.push(TokenRequest {
        scope: form.get("scope").cloned(),
        basic_auth: false,
        refresh_token: form.get("refresh_token").cloned(),
    });
    if form.get("grant_type").map(String::as_str) != Some("refresh_token") {
        return respond(StatusCode::BAD_REQUEST, &[], Vec::new());
    }
    let token = state.required_token.clone().unwrap_or_default();
    let body = serde_json::to_vec(&json!({ "access_token": token, "expires_in": 300 })).unwrap();
    respond(StatusCode::OK, &[("content-type", "application/json".into())], body)
}

async fn registry_api(
    State(state): State<SharedRegistry>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response<Body> {
    let mut state = state.lock().unwrap();
    let path = uri.path().to_string();
    state.requests.push(format!("{} {}", method, path));

    let Some(rest) = path.strip_prefix("/v2/") else {
        return respond(StatusCode::NOT_FOUND, &[], Vec::new());
    };

    if let Some(token) = state.required_token.clone() {
        let presented = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if presented != format!("Bearer {}", token) {
            let scope = repository_of(rest)
                .map(|repo| format!(",scope=\"repository:{}:pull\"", repo))
                .unwrap_or_default();
            let challenge = format!(
                "Bearer realm=\"{}/token\",service=\"fake-registry\"{}",
                state.base_url, scope
            );
            return respond(
                StatusCode::UNAUTHORIZED,
                &[("www-authenticate", challenge)],
                Vec::new(),
            );
        }
    }

    if rest.is_empty() {
        return respond(StatusCode::OK, &[], b"{}".to_vec());
    }

    if let Some((repo, reference)) = rest.split_once("/manifests/") {
        return manifest_endpoint(&mut state, &method, repo, reference, &headers, body);
    }
    if let Some((repo, session)) = rest.split_once("/blobs/uploads/") {
        return upload_endpoint(&mut state, &method, repo, session, &uri, body);
    }
    if let Some((_, digest)) = rest.split_once("/blobs/") {
        return match state.blobs.get(digest) {
            Some(data) => {
                let body = if method == Method::HEAD { Vec::new() } else { data.clone() };
                respond(
                    StatusCode::OK,
                    &[("content-length", data.len().to_string())],
                    body,
                )
            }
            None => respond(StatusCode::NOT_FOUND, &[], Vec::new()),
        };
    }
    if let Some(repo) = rest.strip_suffix("/tags/list") {
        return tags_endpoint(&state, repo, &uri);
    }
    respond(StatusCode::NOT_FOUND, &[], Vec::new())
}

fn repository_of(rest: &str) -> Option<&str> {
    ["/manifests/", "/blobs/", "/tags/list"]
        .iter()
        .find_map(|marker| rest.split_once(marker).map(|(repo, _)| repo))
}

fn manifest_endpoint(
    state: &mut RegistryState,
    method: &Method,
    repo: &str,
    reference: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Response<Body> {
    if *method == Method::PUT {
        let media_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let digest = DigestUtils::compute_docker_digest(&body);
        let entry = (media_type, body.to_vec());
        state
            .manifests
            .insert((repo.to_string(), digest.clone()), entry.clone());
        state
            .manifests
            .insert((repo.to_string(), reference.to_string()), entry);
        return respond(
            StatusCode::CREATED,
            &[("docker-content-digest", digest)],
            Vec::new(),
        );
    }

    if let Some(status) = state.manifest_status {
        return respond(status, &[], b"injected failure".to_vec());
    }

    match state.manifests.get(&(repo.to_string(), reference.to_string())) {
        Some((media_type, bytes)) => {
            let digest = DigestUtils::compute_docker_digest(bytes);
            let body = if *method == Method::HEAD { Vec::new() } else { bytes.clone() };
            respond(
                StatusCode::OK,
                &[
                    ("content-type", media_type.clone()),
                    ("docker-content-digest", digest),
                ],
                body,
            )
        }
        None => respond(
            StatusCode::NOT_FOUND,
            &[("content-type", "application/json".into())],
            br#"{"errors":[{"code":"MANIFEST_UNKNOWN"}]}"#.to_vec(),
        ),
    }
}

fn upload_endpoint(
    state: &mut RegistryState,
    method: &Method,
    repo: &str,
    session: &str,
    uri: &Uri,
    body: Bytes,
) -> Response<Body> {
    if *method == Method::POST && session.is_empty() {
        let id = uuid::Uuid::new_v4().to_string();
        state.uploads.insert(id.clone(), repo.to_string());
        return respond(
            StatusCode::ACCEPTED,
            &[("location", format!("/v2/{}/blobs/uploads/{}", repo, id))],
            Vec::new(),
        );
    }

    if *method == Method::PUT && state.uploads.remove(session).is_some() {
        let digest = uri
            .query()
            .and_then(|q| {
                url::form_urlencoded::parse(q.as_bytes())
                    .find(|(key, _)| key == "digest")
                    .map(|(_, value)| value.into_owned())
            })
            .unwrap_or_default();
        if DigestUtils::compute_docker_digest(&body) != digest {
            return respond(StatusCode::BAD_REQUEST, &[], b"DIGEST_INVALID".to_vec());
        }
        state.blobs.insert(digest.clone(), body.to_vec());
        return respond(
            StatusCode::CREATED,
            &[("docker-content-digest", digest)],
            Vec::new(),
        );
    }

    respond(StatusCode::NOT_FOUND, &[], b"BLOB_UPLOAD_UNKNOWN".to_vec())
}

fn tags_endpoint(state: &RegistryState, repo: &str, uri: &Uri) -> Response<Body> {
    let mut tags: Vec<String> = state
        .manifests
        .keys()
        .filter(|(r, reference)| r == repo && !reference.starts_with("sha256:"))
        .map(|(_, tag)| tag.clone())
        .collect();
    tags.sort();
    if tags.is_empty() {
        return respond(StatusCode::NOT_FOUND, &[], b"NAME_UNKNOWN".to_vec());
    }

    let last = uri.query().and_then(|q| {
        url::form_urlencoded::parse(q.as_bytes())
            .find(|(key, _)| key == "last")
            .map(|(_, value)| value.into_owned())
    });
    let remaining: Vec<String> = tags
        .into_iter()
        .filter(|tag| last.as_ref().is_none_or(|last| tag > last))
        .collect();
    let page: Vec<String> = remaining.iter().take(state.tags_page_size).cloned().collect();

    let mut headers = vec![("content-type", "application/json".to_string())];
    if remaining.len() > page.len() {
        if let Some(last) = page.last() {
            headers.push((
                "link",
                format!("</v2/{}/tags/list?last={}>; rel=\"next\"", repo, last),
            ));
        }
    }
    let body = serde_json::to_vec(&json!({ "name": repo, "tags": page })).unwrap();
    respond(StatusCode::OK, &headers, body)
}

#[derive(Default)]
pub struct HubState {
    pub base_url: String,
    pub tags: HashMap<String, Vec<String>>,
    pub page_size: usize,
    pub authorization: Vec<Option<String>>,
    pub paths: Vec<String>,
}

type SharedHub = Arc<Mutex<HubState>>;

/// Docker Hub REST API: login, token probe and paginated tag listing
pub struct FakeHub {
    pub base_url: String,
    pub state: SharedHub,
    handle: JoinHandle<()>,
}

pub const HUB_USER: &str = "hubuser";
pub const HUB_PASSWORD: &str = "hubpass";
pub const HUB_TOKEN: &str = "dckr_pat_good";
/// Repository whose `next` cursor points back at the first page
pub const LOOPING_REPOSITORY: &str = "loop/forever";

impl FakeHub {
    pub async fn start() -> Self {
        let state: SharedHub = Arc::new(Mutex::new(HubState {
            page_size: 2,
            ..Default::default()
        }));
        let app = Router::new()
            .route("/v2/users/login/", post(hub_login))
            .route("/v2/repositories/library/", get(hub_probe))
            .route("/v2/repositories/{namespace}/{name}/tags", get(hub_tags))
            .with_state(state.clone());
        let (base_url, handle) = serve(app).await;
        state.lock().unwrap().base_url = base_url.clone();
        Self {
            base_url,
            state,
            handle,
        }
    }

    pub fn set_tags(&self, repository: &str, tags: &[&str]) {
        self.state.lock().unwrap().tags.insert(
            repository.to_string(),
            tags.iter().map(|t| t.to_string()).collect(),
        );
    }

    pub fn authorization(&self) -> Vec<Option<String>> {
        self.state.lock().unwrap().authorization.clone()
    }

    pub fn paths(&self) -> Vec<String> {
        self.state.lock().unwrap().paths.clone()
    }
}

impl Drop for FakeHub {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn hub_login(body: Bytes) -> Response<Body> {
    let credentials: serde_json::Value = serde_json::from_slice(&body).unwrap_or_default();
    if credentials["username"] == HUB_USER && credentials["password"] == HUB_PASSWORD {
        respond(StatusCode::OK, &[], br#"{"token":"jwt"}"#.to_vec())
    } else if credentials["username"] == "locked" {
        respond(StatusCode::FORBIDDEN, &[], Vec::new())
    } else {
        respond(StatusCode::UNAUTHORIZED, &[], Vec::new())
    }
}

async fn hub_probe(headers: HeaderMap) -> Response<Body> {
    let authorized = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        == Some(format!("Bearer {}", HUB_TOKEN).as_str());
    if authorized {
        respond(StatusCode::OK, &[], br#"{"results":[]}"#.to_vec())
    } else {
        respond(StatusCode::UNAUTHORIZED, &[], Vec::new())
    }
}

async fn hub_tags(
    State(state): State<SharedHub>,
    Path((namespace, name)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response<Body> {
    let mut state = state.lock().unwrap();
    let repository = format!("{}/{}", namespace, name);
    state.paths.push(format!("/v2/repositories/{}/tags", repository));
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.authorization.push(authorization);

    let first_page = format!(
        "{}/v2/repositories/{}/tags?page_size=100",
        state.base_url, repository
    );
    if repository == LOOPING_REPOSITORY {
        let body = json!({ "results": [{ "name": "again" }], "next": first_page });
        return respond(StatusCode::OK, &[], serde_json::to_vec(&body).unwrap());
    }

    let Some(tags) = state.tags.get(&repository) else {
        return respond(StatusCode::NOT_FOUND, &[], br#"{"message":"not found"}"#.to_vec());
    };
    let page: usize = params
        .get("page")
        .and_then(|p| p.parse().ok())
        .unwrap_or(1);
    let start = (page - 1) * state.page_size;
    let results: Vec<serde_json::Value> = tags
        .iter()
        .skip(start)
        .take(state.page_size)
        .map(|name| json!({ "name": name }))
        .collect();
    let next = (start + state.page_size < tags.len())
        .then(|| format!("{}&page={}", first_page, page + 1));

    let body = json!({ "count": tags.len(), "results": results, "next": next });
    respond(StatusCode::OK, &[], serde_json::to_vec(&body).unwrap())
}
