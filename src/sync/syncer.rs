//! One synchronization pass over every configured mapping
//!
//! A run resolves and authenticates each registry once, plans every mapping
//! (candidate tags, destination availability), then checks, pulls and pushes
//! tags through a bounded pool. Outcomes come back in mapping order, then tag
//! order, whatever order the work finished in.

use crate::config::Config;
use crate::error::{Result, SyncFailure, SyncerError};
use crate::registry::{ConfiguredRegistries, ImageRef, Registry, RegistryFactory, RegistryResolver};
use crate::store::ContentStore;
use crate::sync::{SyncMapping, SyncOutcome, SyncReport};
use chrono::Utc;
use futures::{StreamExt, stream};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    /// Mappings planned and tags synced in parallel
    pub concurrency: usize,
    /// Compare manifest digests of existing tags instead of trusting existence
    pub verify_digests: bool,
    /// Keep pulled content between runs
    pub keep_cache: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            verify_digests: false,
            keep_cache: false,
        }
    }
}

type Connected = std::result::Result<Arc<dyn Registry>, SyncerError>;

enum WorkItem {
    Done(SyncOutcome),
    Pending {
        mapping: Arc<SyncMapping>,
        source: Arc<dyn Registry>,
        destination: Arc<dyn Registry>,
        tag: String,
    },
}

struct MappingPlan {
    items: Vec<WorkItem>,
    aborted: bool,
}

impl MappingPlan {
    fn aborted(items: Vec<WorkItem>) -> Self {
        Self {
            items,
            aborted: true,
        }
    }
}

pub struct Syncer {
    resolver: Arc<dyn RegistryResolver>,
    mappings: Vec<Arc<SyncMapping>>,
    options: SyncOptions,
    store: Option<Arc<ContentStore>>,
}

impl Syncer {
    /// Build a syncer, its content store and registry factory from configuration
    pub fn new(config: &Config) -> Result<Self> {
        let store = match &config.sync.cache_dir {
            Some(dir) => ContentStore::new(dir)?,
            None => ContentStore::temporary()?,
        };
        let store = Arc::new(store);
        let factory = RegistryFactory::new(store.clone(), config.sync.timeout())?;
        let resolver = ConfiguredRegistries::new(factory, config);
        let options = SyncOptions {
            concurrency: config.sync.concurrency,
            verify_digests: config.sync.verify_digests,
            keep_cache: config.sync.keep_cache,
        };
        Ok(Self::from_parts(Arc::new(resolver), config.mappings()?, options).with_store(store))
    }

    pub fn from_parts(
        resolver: Arc<dyn RegistryResolver>,
        mappings: Vec<SyncMapping>,
        options: SyncOptions,
    ) -> Self {
        Self {
            resolver,
            mappings: mappings.into_iter().map(Arc::new).collect(),
            options,
            store: None,
        }
    }

    /// Content store to clear after each run (unless `keep_cache`)
    pub fn with_store(mut self, store: Arc<ContentStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn mappings(&self) -> &[Arc<SyncMapping>] {
        &self.mappings
    }

    pub fn resolver(&self) -> &Arc<dyn RegistryResolver> {
        &self.resolver
    }

    fn concurrency(&self) -> usize {
        self.options.concurrency.max(1)
    }

    /// Run one pass over every mapping.
    ///
    /// Per-tag failures are recorded in the report. The run fails when a
    /// mapping could not be processed at all, or when every mapping failed;
    /// the partial report travels with the error.
    pub async fn sync_all(
        &self,
        cancel: &CancellationToken,
    ) -> std::result::Result<SyncReport, SyncFailure> {
        let mut report = SyncReport::new(Utc::now());
        info!(mappings = self.mappings.len(), "starting sync run");

        let source = self.connect_source(cancel).await;
        let mut destinations: HashMap<&str, Connected> = HashMap::new();
        if source.is_ok() {
            for mapping in &self.mappings {
                if !destinations.contains_key(mapping.destination.as_str()) {
                    let connected = self.connect_destination(cancel, &mapping.destination).await;
                    destinations.insert(mapping.destination.as_str(), connected);
                }
            }
        }

        let (source, destinations) = (&source, &destinations);
        let plans: Vec<MappingPlan> = stream::iter(self.mappings.iter().cloned())
            .map(move |mapping| async move {
                self.plan_mapping(cancel, &mapping, source, destinations).await
            })
            .buffered(self.concurrency())
            .collect()
            .await;

        let spans: Vec<(bool, usize)> = plans
            .iter()
            .map(|plan| (plan.aborted, plan.items.len()))
            .collect();
        let items = plans.into_iter().flat_map(|plan| plan.items);

        report.outcomes = stream::iter(items)
            .map(move |item| async move {
                match item {
                    WorkItem::Done(outcome) => outcome,
                    WorkItem::Pending {
                        mapping,
                        source,
                        destination,
                        tag,
                    } => {
                        self.sync_tag(cancel, source.as_ref(), destination.as_ref(), mapping, tag)
                            .await
                    }
                }
            })
            .buffered(self.concurrency())
            .collect()
            .await;
        report.finished_at = Utc::now();

        self.release_store().await;

        let error = self.run_error(&report, &spans);
        match error {
            Some(error) => {
                error!(summary = %report, error = %error, "sync run failed");
                Err(SyncFailure { report, error })
            }
            None => {
                info!(summary = %report, "sync run finished");
                Ok(report)
            }
        }
    }

    async fn connect_source(&self, cancel: &CancellationToken) -> Connected {
        let source = self.resolver.source()?;
        source.authenticate(cancel).await.map_err(|e| {
            error!(registry = source.registry_url(), error = %e, "source registry unavailable");
            e
        })?;
        Ok(source)
    }

    async fn connect_destination(&self, cancel: &CancellationToken, name: &str) -> Connected {
        let destination = self.resolver.destination(name).await.map_err(|e| {
            error!(destination = name, error = %e, "cannot create destination registry");
            e
        })?;
        destination.authenticate(cancel).await.map_err(|e| {
            error!(destination = name, error = %e, "destination registry unavailable");
            e
        })?;
        Ok(destination)
    }

    async fn plan_mapping(
        &self,
        cancel: &CancellationToken,
        mapping: &Arc<SyncMapping>,
        source: &Connected,
        destinations: &HashMap<&str, Connected>,
    ) -> MappingPlan {
        let abort = |error: SyncerError| {
            MappingPlan::aborted(vec![WorkItem::Done(SyncOutcome::failed(
                mapping.clone(),
                None,
                error,
            ))])
        };

        let source = match source {
            Ok(source) => source,
            Err(e) => return abort(e.clone()),
        };

        let tags = if mapping.tags.is_empty() {
            match source.list_tags(cancel, &mapping.source_image).await {
                Ok(tags) => tags,
                Err(e) => {
                    warn!(mapping = %mapping, error = %e, "failed to list source tags");
                    return abort(e);
                }
            }
        } else {
            mapping.tags.clone()
        };
        let tags = mapping.filter_tags(tags);
        debug!(mapping = %mapping, candidates = tags.len(), "planned mapping");

        let destination = match destinations.get(mapping.destination.as_str()) {
            Some(Ok(destination)) => destination.clone(),
            Some(Err(e)) => {
                if tags.is_empty() {
                    return abort(e.clone());
                }
                let items = tags
                    .into_iter()
                    .map(|tag| {
                        WorkItem::Done(SyncOutcome::failed(mapping.clone(), Some(tag), e.clone()))
                    })
                    .collect();
                return MappingPlan::aborted(items);
            }
            None => {
                return abort(SyncerError::Config(format!(
                    "destination {:?} was not resolved",
                    mapping.destination
                )));
            }
        };

        let items = tags
            .into_iter()
            .map(|tag| WorkItem::Pending {
                mapping: mapping.clone(),
                source: source.clone(),
                destination: destination.clone(),
                tag,
            })
            .collect();
        MappingPlan {
            items,
            aborted: false,
        }
    }

    async fn sync_tag(
        &self,
        cancel: &CancellationToken,
        source: &dyn Registry,
        destination: &dyn Registry,
        mapping: Arc<SyncMapping>,
        tag: String,
    ) -> SyncOutcome {
        if cancel.is_cancelled() {
            return SyncOutcome::failed(mapping, Some(tag), SyncerError::Cancelled);
        }
        match self.try_sync_tag(cancel, source, destination, &mapping, &tag).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_not_found() => {
                info!(mapping = %mapping, tag = %tag, error = %e, "tag no longer available");
                SyncOutcome::failed(mapping, Some(tag), e)
            }
            Err(e) => {
                warn!(mapping = %mapping, tag = %tag, error = %e, "tag sync failed");
                SyncOutcome::failed(mapping, Some(tag), e)
            }
        }
    }

    async fn try_sync_tag(
        &self,
        cancel: &CancellationToken,
        source: &dyn Registry,
        destination: &dyn Registry,
        mapping: &Arc<SyncMapping>,
        tag: &str,
    ) -> Result<SyncOutcome> {
        let target = ImageRef::new(destination.registry_url(), &mapping.destination_image, tag);
        if self.options.verify_digests {
            let existing = destination
                .image_digest(cancel, &mapping.destination_image, tag)
                .await?;
            if let Some(existing) = existing {
                let current = source.image_digest(cancel, &mapping.source_image, tag).await?;
                if current.as_deref() == Some(existing.as_str()) {
                    debug!(target = %target, digest = %existing, "tag up to date");
                    return Ok(SyncOutcome::skipped(mapping.clone(), tag.to_string(), Some(existing)));
                }
                info!(target = %target, destination_digest = %existing, "digest changed at source, re-syncing");
            }
        } else if destination
            .image_exists(cancel, &mapping.destination_image, tag)
            .await?
        {
            debug!(target = %target, "tag already at destination");
            return Ok(SyncOutcome::skipped(mapping.clone(), tag.to_string(), None));
        }

        let digest = source.pull_image(cancel, &mapping.source_image, tag).await?;
        destination
            .push_image(cancel, &mapping.destination_image, tag, &digest)
            .await?;
        let source_ref = ImageRef::new(source.registry_url(), &mapping.source_image, tag);
        info!(source = %source_ref, target = %target, digest = %digest, "synced tag");
        Ok(SyncOutcome::synced(mapping.clone(), tag.to_string(), digest))
    }

    async fn release_store(&self) {
        if self.options.keep_cache {
            return;
        }
        if let Some(store) = &self.store {
            if let Err(e) = store.clear().await {
                warn!(error = %e, "failed to clear content store");
            }
        }
    }

    /// `spans` holds (aborted, outcome count) per mapping, in report order
    fn run_error(&self, report: &SyncReport, spans: &[(bool, usize)]) -> Option<SyncerError> {
        let total = spans.len();
        let mut offset = 0;
        let mut aborted = 0;
        let mut failed = 0;
        for (was_aborted, len) in spans {
            let outcomes = &report.outcomes[offset..offset + len];
            offset += len;
            if *was_aborted {
                aborted += 1;
                failed += 1;
            } else if !outcomes.is_empty() && outcomes.iter().all(SyncOutcome::is_failed) {
                failed += 1;
            }
        }

        if total > 0 && failed == total {
            Some(SyncerError::Sync(format!("all {} mappings failed", total)))
        } else if aborted > 0 {
            Some(SyncerError::Sync(format!("{} of {} mappings failed", failed, total)))
        } else {
            None
        }
    }
}
