//! Research data sources.
//!
//! A source is anything that turns a query into raw idea records: a search
//! API, a forum scraper, a package index. The research pipeline looks sources
//! up by id in a [`SourceRegistry`] and consults [`SourceSettings`] to decide
//! which of the requested ones actually run.

pub mod simulated;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub use simulated::SimulatedSource;

/// Errors a source can raise while fetching.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("Source '{source_id}' is unavailable: {message}")]
    Unavailable { source_id: String, message: String },
}

/// What one fetch produced, and what it cost.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchReport {
    pub items: Vec<serde_json::Value>,
    pub prompt_units: u64,
    pub completion_units: u64,
}

/// A blocking fetch capability keyed by source id.
pub trait SourceFetcher: Send + Sync {
    fn id(&self) -> &str;

    /// Fetch raw records for `query`. Called on a worker thread.
    fn fetch(&self, query: &str) -> Result<FetchReport, SourceError>;
}

/// Broad grouping of a catalogued source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceCategory {
    SearchTrends,
    Social,
    Content,
    Tech,
    News,
    Economy,
}

/// Static metadata about a well-known source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SourceInfo {
    pub id: &'static str,
    pub name: &'static str,
    pub category: SourceCategory,
    pub enabled_default: bool,
}

/// Sources the research pipeline knows about out of the box.
pub const SOURCE_CATALOG: &[SourceInfo] = &[
    SourceInfo { id: "google_trends", name: "Google Trends", category: SourceCategory::SearchTrends, enabled_default: true },
    SourceInfo { id: "google_search", name: "Google Search", category: SourceCategory::SearchTrends, enabled_default: true },
    SourceInfo { id: "wikipedia", name: "Wikipedia Trends", category: SourceCategory::SearchTrends, enabled_default: false },
    SourceInfo { id: "reddit", name: "Reddit", category: SourceCategory::Social, enabled_default: true },
    SourceInfo { id: "hackernews", name: "Hacker News", category: SourceCategory::Social, enabled_default: true },
    SourceInfo { id: "devto", name: "DEV.to", category: SourceCategory::Social, enabled_default: false },
    SourceInfo { id: "bluesky", name: "Bluesky", category: SourceCategory::Social, enabled_default: false },
    SourceInfo { id: "youtube", name: "YouTube", category: SourceCategory::Content, enabled_default: true },
    SourceInfo { id: "github", name: "GitHub Trending", category: SourceCategory::Tech, enabled_default: true },
    SourceInfo { id: "packages", name: "npm/PyPI Trends", category: SourceCategory::Tech, enabled_default: false },
    SourceInfo { id: "news", name: "GNews", category: SourceCategory::News, enabled_default: false },
    SourceInfo { id: "economic", name: "Economic Data", category: SourceCategory::Economy, enabled_default: false },
];

/// Catalog entry for `id`, if it is a well-known source.
pub fn source_info(id: &str) -> Option<&'static SourceInfo> {
    SOURCE_CATALOG.iter().find(|info| info.id == id)
}

/// Explicit per-source enable toggles.
///
/// A source without a toggle falls back to its catalog default; sources outside
/// the catalog are enabled unless toggled off.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSettings {
    toggles: HashMap<String, bool>,
}

impl SourceSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable every source, catalogued or not, unless toggled off afterwards.
    pub fn all_enabled() -> Self {
        let toggles = SOURCE_CATALOG
            .iter()
            .map(|info| (info.id.to_string(), true))
            .collect();
        Self { toggles }
    }

    pub fn with_toggle(mut self, source_id: impl Into<String>, enabled: bool) -> Self {
        self.set(source_id, enabled);
        self
    }

    pub fn set(&mut self, source_id: impl Into<String>, enabled: bool) {
        self.toggles.insert(source_id.into(), enabled);
    }

    pub fn is_enabled(&self, source_id: &str) -> bool {
        self.toggles
            .get(source_id)
            .copied()
            .or_else(|| source_info(source_id).map(|info| info.enabled_default))
            .unwrap_or(true)
    }
}

/// Map from source id to fetch capability.
#[derive(Default, Clone)]
pub struct SourceRegistry {
    fetchers: HashMap<String, Arc<dyn SourceFetcher>>,
}

impl std::fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRegistry")
            .field("sources", &self.ids())
            .finish()
    }
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fetcher under its id, replacing any previous one.
    pub fn register(&mut self, fetcher: Arc<dyn SourceFetcher>) -> Option<Arc<dyn SourceFetcher>> {
        self.fetchers.insert(fetcher.id().to_string(), fetcher)
    }

    pub fn with_source(mut self, fetcher: Arc<dyn SourceFetcher>) -> Self {
        self.register(fetcher);
        self
    }

    pub fn get(&self, source_id: &str) -> Option<Arc<dyn SourceFetcher>> {
        self.fetchers.get(source_id).cloned()
    }

    pub fn contains(&self, source_id: &str) -> bool {
        self.fetchers.contains_key(source_id)
    }

    pub fn len(&self) -> usize {
        self.fetchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fetchers.is_empty()
    }

    /// Sorted ids of all registered sources.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.fetchers.keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    /// Fetchers for the `selected` ids that exist and are enabled, in request
    /// order without duplicates. Everything else is skipped with a warning.
    pub fn resolve(&self, selected: &[String], settings: &SourceSettings) -> Vec<Arc<dyn SourceFetcher>> {
        let mut seen = HashSet::new();
        let mut fetchers = Vec::with_capacity(selected.len());

        for source_id in selected {
            if !seen.insert(source_id.as_str()) {
                continue;
            }
            let Some(fetcher) = self.get(source_id) else {
                warn!(source_id = %source_id, "Unknown source");
                continue;
            };
            if !settings.is_enabled(source_id) {
                warn!(source_id = %source_id, "Source disabled, skipping");
                continue;
            }
            fetchers.push(fetcher);
        }

        fetchers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(ids: &[&str]) -> SourceRegistry {
        ids.iter().fold(SourceRegistry::new(), |reg, id| {
            reg.with_source(Arc::new(SimulatedSource::new(*id)))
        })
    }

    fn ids(fetchers: &[Arc<dyn SourceFetcher>]) -> Vec<String> {
        fetchers.iter().map(|f| f.id().to_string()).collect()
    }

    #[test]
    fn test_catalog_defaults() {
        let settings = SourceSettings::new();
        assert!(settings.is_enabled("reddit"));
        assert!(settings.is_enabled("hackernews"));
        assert!(!settings.is_enabled("wikipedia"));
        assert!(!settings.is_enabled("news"));
        // Uncatalogued sources run unless toggled off.
        assert!(settings.is_enabled("internal_survey"));
    }

    #[test]
    fn test_toggles_override_defaults() {
        let settings = SourceSettings::new()
            .with_toggle("reddit", false)
            .with_toggle("wikipedia", true);
        assert!(!settings.is_enabled("reddit"));
        assert!(settings.is_enabled("wikipedia"));
    }

    #[test]
    fn test_all_enabled() {
        let settings = SourceSettings::all_enabled();
        assert!(SOURCE_CATALOG.iter().all(|info| settings.is_enabled(info.id)));
    }

    #[test]
    fn test_resolve_skips_unknown_disabled_and_duplicates() {
        let reg = registry(&["reddit", "hackernews", "wikipedia"]);
        let selected: Vec<String> = ["hackernews", "missing", "wikipedia", "reddit", "hackernews"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let resolved = reg.resolve(&selected, &SourceSettings::new());
        assert_eq!(ids(&resolved), vec!["hackernews", "reddit"]);
    }

    #[test]
    fn test_register_replaces() {
        let mut reg = registry(&["reddit"]);
        let previous = reg.register(Arc::new(SimulatedSource::new("reddit").with_items(1)));
        assert!(previous.is_some());
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.ids(), vec!["reddit"]);
    }

    #[test]
    fn test_source_info_lookup() {
        let info = source_info("github").expect("catalogued");
        assert_eq!(info.category, SourceCategory::Tech);
        assert!(source_info("nope").is_none());
    }
}
