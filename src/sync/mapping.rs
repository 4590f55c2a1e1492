//! Image mappings: which source image goes to which destination

use crate::error::Result;
use regex::Regex;
use std::fmt;

/// Regular expression selecting which tags to sync
#[derive(Debug, Clone)]
pub struct TagFilter {
    pattern: Regex,
}

impl TagFilter {
    pub fn new(pattern: &str) -> Result<Self> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
        })
    }

    /// Unanchored match; use `^...$` in the pattern to match whole tags
    pub fn matches(&self, tag: &str) -> bool {
        self.pattern.is_match(tag)
    }

    pub fn as_str(&self) -> &str {
        self.pattern.as_str()
    }
}

impl PartialEq for TagFilter {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for TagFilter {}

/// One source image synchronized to one destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncMapping {
    /// Normalized Docker Hub image, e.g. `library/nginx`
    pub source_image: String,
    /// Name of the destination entry in the configuration
    pub destination: String,
    pub destination_registry: String,
    pub destination_image: String,
    pub tag_filter: Option<TagFilter>,
    /// Explicit tags; when non-empty the source tag listing is skipped
    pub tags: Vec<String>,
}

impl SyncMapping {
    pub fn new(
        source_image: impl Into<String>,
        destination: impl Into<String>,
        destination_registry: impl Into<String>,
        destination_image: impl Into<String>,
    ) -> Self {
        Self {
            source_image: source_image.into(),
            destination: destination.into(),
            destination_registry: destination_registry.into(),
            destination_image: destination_image.into(),
            tag_filter: None,
            tags: Vec::new(),
        }
    }

    pub fn with_tag_filter(mut self, filter: TagFilter) -> Self {
        self.tag_filter = Some(filter);
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Narrow `tags` by the filter, keeping their order
    pub fn filter_tags(&self, tags: Vec<String>) -> Vec<String> {
        match &self.tag_filter {
            Some(filter) => tags.into_iter().filter(|tag| filter.matches(tag)).collect(),
            None => tags,
        }
    }
}

impl fmt::Display for SyncMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} ({}/{})",
            self.source_image, self.destination, self.destination_registry, self.destination_image
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(names: &[&str]) -> Vec<String> {
        names.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn test_filter_keeps_order() {
        let mapping = SyncMapping::new("library/nginx", "ghcr", "ghcr.io", "nginx")
            .with_tag_filter(TagFilter::new(r"^1\.2[0-9]").unwrap());
        assert_eq!(
            mapping.filter_tags(tags(&["1.25", "latest", "1.19", "1.24-alpine"])),
            tags(&["1.25", "1.24-alpine"])
        );
    }

    #[test]
    fn test_no_filter_keeps_everything() {
        let mapping = SyncMapping::new("library/nginx", "ghcr", "ghcr.io", "nginx");
        assert_eq!(mapping.filter_tags(tags(&["a", "b"])), tags(&["a", "b"]));
    }

    #[test]
    fn test_invalid_filter_is_config_error() {
        assert!(TagFilter::new("([").unwrap_err().is_config());
    }

    #[test]
    fn test_display() {
        let mapping = SyncMapping::new("library/nginx", "ghcr", "ghcr.io", "my-org/nginx");
        assert_eq!(mapping.to_string(), "library/nginx -> ghcr (ghcr.io/my-org/nginx)");
    }
}
