//! Moving whole images between a registry and the content store

use crate::error::{Result, SyncerError};
use crate::registry::manifest::{Descriptor, ManifestKind, ParsedManifest, parse_manifest};
use crate::registry::transport::OciTransport;
use crate::store::ContentStore;
use futures::{StreamExt, TryStreamExt, stream};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Blobs moved in parallel for a single image
const BLOB_CONCURRENCY: usize = 4;

fn image_blobs(kind: &ManifestKind) -> Vec<Descriptor> {
    match kind {
        ManifestKind::Image { config, layers } => {
            std::iter::once(config).chain(layers).cloned().collect()
        }
        ManifestKind::Index { .. } => Vec::new(),
    }
}

async fn download_blobs(
    transport: &OciTransport,
    store: &ContentStore,
    cancel: &CancellationToken,
    repository: &str,
    manifest: &ParsedManifest,
) -> Result<()> {
    stream::iter(image_blobs(&manifest.kind))
        .map(move |blob| async move {
            transport.download_blob(cancel, store, repository, &blob).await
        })
        .buffer_unordered(BLOB_CONCURRENCY)
        .try_collect::<Vec<()>>()
        .await?;
    Ok(())
}

async fn upload_blobs(
    transport: &OciTransport,
    store: &ContentStore,
    cancel: &CancellationToken,
    repository: &str,
    manifest: &ParsedManifest,
) -> Result<()> {
    stream::iter(image_blobs(&manifest.kind))
        .map(move |blob| async move {
            transport.upload_blob(cancel, store, repository, &blob.digest).await
        })
        .buffer_unordered(BLOB_CONCURRENCY)
        .try_collect::<Vec<()>>()
        .await?;
    Ok(())
}

fn nested_index(digest: &str) -> SyncerError {
    SyncerError::Decode(format!("nested image index {} is not supported", digest))
}

/// Pull `repository:tag` (every platform of an index) into the store.
///
/// Returns the digest of the tag's top-level manifest.
pub async fn pull_to_store(
    transport: &OciTransport,
    store: &ContentStore,
    cancel: &CancellationToken,
    repository: &str,
    tag: &str,
) -> Result<String> {
    let root = transport.get_manifest(cancel, repository, tag).await?;
    let parsed = parse_manifest(&root.bytes, root.media_type.as_deref())?;

    if let ManifestKind::Index { manifests } = &parsed.kind {
        for child in manifests {
            let fetched = transport.get_manifest(cancel, repository, &child.digest).await?;
            let content_type = child.media_type.as_deref().or(fetched.media_type.as_deref());
            let child_manifest = parse_manifest(&fetched.bytes, content_type)?;
            if matches!(child_manifest.kind, ManifestKind::Index { .. }) {
                return Err(nested_index(&child.digest));
            }
            download_blobs(transport, store, cancel, repository, &child_manifest).await?;
            store
                .put_manifest(&fetched.digest, &child_manifest.media_type, &fetched.bytes)
                .await?;
        }
    } else {
        download_blobs(transport, store, cancel, repository, &parsed).await?;
    }

    store
        .put_manifest(&root.digest, &parsed.media_type, &root.bytes)
        .await?;
    debug!(repository, tag, digest = %root.digest, "pulled image into content store");
    Ok(root.digest)
}

/// Push the stored image `digest` to `repository:tag`.
///
/// Blobs and child manifests go first so the tag never points at missing content.
pub async fn push_from_store(
    transport: &OciTransport,
    store: &ContentStore,
    cancel: &CancellationToken,
    repository: &str,
    tag: &str,
    digest: &str,
) -> Result<()> {
    let root = store.get_manifest(digest).await?;
    let parsed = parse_manifest(&root.bytes, Some(&root.media_type))?;

    if let ManifestKind::Index { manifests } = &parsed.kind {
        for child in manifests {
            let stored = store.get_manifest(&child.digest).await?;
            let child_manifest = parse_manifest(&stored.bytes, Some(&stored.media_type))?;
            if matches!(child_manifest.kind, ManifestKind::Index { .. }) {
                return Err(nested_index(&child.digest));
            }
            upload_blobs(transport, store, cancel, repository, &child_manifest).await?;
            transport
                .put_manifest(cancel, repository, &child.digest, &stored.media_type, &stored.bytes)
                .await?;
        }
    } else {
        upload_blobs(transport, store, cancel, repository, &parsed).await?;
    }

    let pushed = transport
        .put_manifest(cancel, repository, tag, &root.media_type, &root.bytes)
        .await?;
    if let Some(pushed) = pushed.filter(|pushed| pushed != digest) {
        return Err(SyncerError::Decode(format!(
            "registry stored {}:{} as {}, expected {}",
            repository, tag, pushed, digest
        )));
    }
    debug!(repository, tag, digest, "pushed image from content store");
    Ok(())
}
