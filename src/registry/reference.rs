//! Image references and registry naming rules

use std::fmt;

/// Canonical registry name for Docker Hub
pub const DOCKER_HUB_REGISTRY: &str = "docker.io";

/// OCI distribution endpoint serving Docker Hub content
pub const DOCKER_HUB_ENDPOINT: &str = "https://registry-1.docker.io";

const DOCKER_HUB_ALIASES: &[&str] = &[
    "docker.io",
    "index.docker.io",
    "registry-1.docker.io",
    "registry.hub.docker.com",
];

/// Fully qualified reference to one tag of an image
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef {
    pub registry: String,
    pub image: String,
    pub tag: String,
}

impl ImageRef {
    pub fn new(
        registry: impl Into<String>,
        image: impl Into<String>,
        tag: impl Into<String>,
    ) -> Self {
        Self {
            registry: registry.into(),
            image: image.into(),
            tag: tag.into(),
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}:{}",
            strip_scheme(&self.registry),
            self.image,
            self.tag
        )
    }
}

/// Normalize a Docker Hub image name.
///
/// `docker.io/` and `index.docker.io/` prefixes are dropped, and single
/// component names live under the `library/` namespace.
pub fn normalize_dockerhub_image(image: &str) -> String {
    let image = image.trim().trim_matches('/');
    let image = image.strip_prefix("docker.io/").unwrap_or(image);
    let image = image.strip_prefix("index.docker.io/").unwrap_or(image);

    if image.contains('/') {
        image.to_string()
    } else {
        format!("library/{}", image)
    }
}

/// Strip the Docker Hub host prefixes without adding a namespace
pub fn strip_dockerhub_prefix(image: &str) -> &str {
    let image = image.trim().trim_matches('/');
    let image = image.strip_prefix("docker.io/").unwrap_or(image);
    image.strip_prefix("index.docker.io/").unwrap_or(image)
}

/// Whether `registry` names Docker Hub (an empty name counts as Docker Hub)
pub fn is_dockerhub_registry(registry: &str) -> bool {
    let host = registry_host(registry);
    host.is_empty() || DOCKER_HUB_ALIASES.contains(&host)
}

/// Remove an `http://` or `https://` prefix
pub fn strip_scheme(registry: &str) -> &str {
    registry
        .strip_prefix("https://")
        .or_else(|| registry.strip_prefix("http://"))
        .unwrap_or(registry)
}

/// Host (with port) part of a registry name, without scheme or path
pub fn registry_host(registry: &str) -> &str {
    let rest = strip_scheme(registry.trim());
    rest.split('/').next().unwrap_or(rest)
}

/// Split `host[/namespace...]` into the registry (scheme kept) and the namespace path
pub fn split_registry_path(registry: &str) -> (String, Option<String>) {
    let registry = registry.trim().trim_end_matches('/');
    let scheme_len = registry.len() - strip_scheme(registry).len();
    let rest = &registry[scheme_len..];

    match rest.split_once('/') {
        Some((host, path)) if !path.is_empty() => (
            format!("{}{}", &registry[..scheme_len], host),
            Some(path.to_string()),
        ),
        _ => (registry.to_string(), None),
    }
}

/// Base URL of the OCI distribution API for a registry.
///
/// An explicit scheme is honoured, Docker Hub aliases map to the Hub
/// registry endpoint, everything else is served over HTTPS.
pub fn registry_endpoint(registry: &str) -> String {
    let registry = registry.trim().trim_end_matches('/');
    if registry.starts_with("http://") || registry.starts_with("https://") {
        let (base, _) = split_registry_path(registry);
        return base;
    }
    if is_dockerhub_registry(registry) {
        return DOCKER_HUB_ENDPOINT.to_string();
    }
    format!("https://{}", registry_host(registry))
}
