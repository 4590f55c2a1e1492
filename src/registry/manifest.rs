//! Manifest media types and the subset of manifest structure needed to walk an image graph

use crate::digest::DigestUtils;
use crate::error::{Result, SyncerError};
use serde::Deserialize;

pub const DOCKER_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_LIST_V2: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const OCI_MANIFEST_V1: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_INDEX_V1: &str = "application/vnd.oci.image.index.v1+json";

/// Accept header for manifest requests, indexes first so multi-platform tags resolve to the index
pub fn accept_header() -> String {
    [
        OCI_INDEX_V1,
        DOCKER_MANIFEST_LIST_V2,
        OCI_MANIFEST_V1,
        DOCKER_MANIFEST_V2,
    ]
    .join(", ")
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    #[serde(default)]
    pub media_type: Option<String>,
    pub digest: String,
    pub size: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawManifest {
    schema_version: u32,
    #[serde(default)]
    media_type: Option<String>,
    #[serde(default)]
    manifests: Option<Vec<Descriptor>>,
    #[serde(default)]
    config: Option<Descriptor>,
    #[serde(default)]
    layers: Option<Vec<Descriptor>>,
}

/// What a manifest points at
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestKind {
    /// Multi-platform index or manifest list
    Index { manifests: Vec<Descriptor> },
    /// Single-platform image manifest
    Image {
        config: Descriptor,
        layers: Vec<Descriptor>,
    },
}

/// A parsed manifest along with the media type it should be served as
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedManifest {
    pub media_type: String,
    pub kind: ManifestKind,
}

fn check_digests<'a>(descriptors: impl IntoIterator<Item = &'a Descriptor>) -> Result<()> {
    match descriptors
        .into_iter()
        .find(|d| !DigestUtils::is_valid_docker_digest(&d.digest))
    {
        Some(bad) => Err(SyncerError::Decode(format!(
            "manifest references malformed digest {:?}",
            bad.digest
        ))),
        None => Ok(()),
    }
}

/// Parse manifest bytes. `content_type` is the response header, used when the
/// body itself carries no `mediaType`.
pub fn parse_manifest(bytes: &[u8], content_type: Option<&str>) -> Result<ParsedManifest> {
    let raw: RawManifest = serde_json::from_slice(bytes)
        .map_err(|e| SyncerError::Decode(format!("invalid manifest: {}", e)))?;

    if raw.schema_version != 2 {
        return Err(SyncerError::Decode(format!(
            "unsupported manifest schema version {}",
            raw.schema_version
        )));
    }

    let content_type = content_type
        .map(|ct| ct.split(';').next().unwrap_or(ct).trim())
        .filter(|ct| !ct.is_empty());

    match (raw.manifests, raw.config) {
        (Some(manifests), _) => {
            check_digests(&manifests)?;
            Ok(ParsedManifest {
                media_type: raw
                    .media_type
                    .or(content_type.map(str::to_string))
                    .unwrap_or_else(|| OCI_INDEX_V1.to_string()),
                kind: ManifestKind::Index { manifests },
            })
        }
        (None, Some(config)) => {
            let layers = raw.layers.unwrap_or_default();
            check_digests(std::iter::once(&config).chain(&layers))?;
            Ok(ParsedManifest {
                media_type: raw
                    .media_type
                    .or(content_type.map(str::to_string))
                    .unwrap_or_else(|| OCI_MANIFEST_V1.to_string()),
                kind: ManifestKind::Image { config, layers },
            })
        }
        (None, None) => Err(SyncerError::Decode(
            "manifest has neither config nor child manifests".to_string(),
        )),
    }
}
