//! Configuration loading, environment overrides and validation

use crate::error::{Result, SyncerError};
use crate::registry::auth::Credential;
use crate::registry::reference::{
    DOCKER_HUB_REGISTRY, normalize_dockerhub_image, split_registry_path, strip_dockerhub_prefix,
};
use crate::sync::{SyncMapping, TagFilter};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_CONFIG_PATH: &str = "./syncerd.yaml";

/// Every 21 days at midnight UTC
pub const DEFAULT_SCHEDULE: &str = "0 0 */21 * *";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub schedule: String,
    pub sync: SyncSettings,
    pub source: SourceConfig,
    pub destinations: Vec<DestinationConfig>,
    pub images: Vec<ImageConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub concurrency: usize,
    pub timeout_secs: u64,
    pub cache_dir: Option<PathBuf>,
    pub keep_cache: bool,
    pub verify_digests: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            timeout_secs: 300,
            cache_dir: None,
            keep_cache: false,
            verify_digests: false,
        }
    }
}

impl SyncSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    #[serde(rename = "type")]
    pub registry_type: String,
    pub registry: String,
    pub username: String,
    pub password: String,
    pub token: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            registry_type: "dockerhub".to_string(),
            registry: DOCKER_HUB_REGISTRY.to_string(),
            username: String::new(),
            password: String::new(),
            token: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DestinationConfig {
    pub name: String,
    #[serde(rename = "type", default)]
    pub registry_type: String,
    pub registry: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub auth: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Destination names; empty means every destination
    #[serde(default)]
    pub destinations: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_filter: Option<String>,
}

impl Config {
    /// Read, override from the environment and validate a configuration file
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
        let contents = std::fs::read_to_string(path).map_err(|e| {
            SyncerError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;

        let mut config = Self::from_yaml(&contents)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        debug!(
            path = %path.display(),
            destinations = config.destinations.len(),
            images = config.images.len(),
            "loaded configuration"
        );
        Ok(config)
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Apply `SYNCERD_*` overrides; `lookup` is normally `std::env::var`
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(schedule) = lookup("SYNCERD_SCHEDULE") {
            self.schedule = schedule;
        }
        if let Some(concurrency) = lookup("SYNCERD_CONCURRENCY") {
            self.sync.concurrency = concurrency.trim().parse().map_err(|_| {
                SyncerError::Config(format!(
                    "SYNCERD_CONCURRENCY must be a positive integer, got {:?}",
                    concurrency
                ))
            })?;
        }
        if let Some(cache_dir) = lookup("SYNCERD_CACHE_DIR").filter(|d| !d.is_empty()) {
            self.sync.cache_dir = Some(PathBuf::from(cache_dir));
        }
        if let Some(username) = lookup("SYNCERD_SOURCE_USERNAME") {
            self.source.username = username;
        }
        if let Some(password) = lookup("SYNCERD_SOURCE_PASSWORD") {
            self.source.password = password;
        }
        if let Some(token) = lookup("SYNCERD_SOURCE_TOKEN") {
            self.source.token = token;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.destinations.is_empty() {
            return Err(SyncerError::Config(
                "at least one destination is required".to_string(),
            ));
        }
        if self.images.is_empty() {
            return Err(SyncerError::Config("at least one image is required".to_string()));
        }
        if self.sync.concurrency == 0 {
            return Err(SyncerError::Config(
                "sync.concurrency must be greater than zero".to_string(),
            ));
        }
        if self.sync.timeout_secs == 0 {
            return Err(SyncerError::Config(
                "sync.timeout_secs must be greater than zero".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for destination in &self.destinations {
            if destination.name.trim().is_empty() {
                return Err(SyncerError::Config("destination name is required".to_string()));
            }
            if !names.insert(destination.name.as_str()) {
                return Err(SyncerError::Config(format!(
                    "duplicate destination name {:?}",
                    destination.name
                )));
            }
            if destination.registry.trim().is_empty() {
                return Err(SyncerError::Config(format!(
                    "destination {:?} has no registry",
                    destination.name
                )));
            }
        }

        for image in &self.images {
            if image.name.trim().is_empty() {
                return Err(SyncerError::Config("image name is required".to_string()));
            }
            if let Some(unknown) = image
                .destinations
                .iter()
                .find(|name| !names.contains(name.as_str()))
            {
                return Err(SyncerError::Config(format!(
                    "image {:?} references unknown destination {:?}",
                    image.name, unknown
                )));
            }
            if let Some(pattern) = &image.tag_filter {
                TagFilter::new(pattern)?;
            }
        }

        Credential::from_parts(
            &self.source.username,
            &self.source.password,
            &self.source.token,
        )?;
        Ok(())
    }

    /// Cron expression to run on, falling back to [`DEFAULT_SCHEDULE`]
    pub fn schedule(&self) -> &str {
        let schedule = self.schedule.trim();
        if schedule.is_empty() {
            DEFAULT_SCHEDULE
        } else {
            schedule
        }
    }

    pub fn destination(&self, name: &str) -> Option<&DestinationConfig> {
        self.destinations.iter().find(|d| d.name == name)
    }

    /// Expand images across their destinations, in declaration order
    pub fn mappings(&self) -> Result<Vec<SyncMapping>> {
        let mut mappings = Vec::new();
        for image in &self.images {
            let filter = image.tag_filter.as_deref().map(TagFilter::new).transpose()?;
            let targets: Vec<&DestinationConfig> = if image.destinations.is_empty() {
                self.destinations.iter().collect()
            } else {
                image
                    .destinations
                    .iter()
                    .filter_map(|name| self.destination(name))
                    .collect()
            };

            let target = image
                .target
                .as_deref()
                .map(|t| t.trim().trim_matches('/'))
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| strip_dockerhub_prefix(&image.name));

            for destination in targets {
                let (registry, namespace) = split_registry_path(&destination.registry);
                let destination_image = match namespace {
                    Some(namespace) => format!("{}/{}", namespace, target),
                    None => target.to_string(),
                };
                let mut mapping = SyncMapping::new(
                    normalize_dockerhub_image(&image.name),
                    destination.name.clone(),
                    registry,
                    destination_image,
                )
                .with_tags(image.tags.clone());
                if let Some(filter) = &filter {
                    mapping = mapping.with_tag_filter(filter.clone());
                }
                mappings.push(mapping);
            }
        }
        Ok(mappings)
    }
}
