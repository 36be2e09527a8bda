//! Semantic discovery client over the vector index and metadata provider.
//!
//! Every call is blocking on an external service, carries its own timeout, and
//! is recorded through the optional [`DiscoveryTracker`]. Failures never reach
//! the caller: search errors yield an empty list, lookups yield `None`, and
//! the orchestrator decides what a gap means.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use genpipe_shared::{
    AttemptErrorKind, DiscoveryConfig, GenPipeError, RawSourceDescriptor, Result, SourceDescriptor,
    SourceRef, SourceShape,
};

use crate::instrumentation::DiscoveryTracker;

/// Default timeout in seconds for one discovery RPC.
const DEFAULT_TIMEOUT_SECS: u64 = 15;

// ---------------------------------------------------------------------------
// Collaborator contracts
// ---------------------------------------------------------------------------

/// One raw hit from the vector index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub score: f32,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Column-level schema for a source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub columns: Vec<String>,
    #[serde(default)]
    pub row_count: u64,
    #[serde(default)]
    pub dtypes: BTreeMap<String, String>,
    #[serde(default)]
    pub sample: Vec<serde_json::Value>,
}

/// Processing pipeline status for a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingStatus {
    #[serde(default)]
    pub stages: Vec<String>,
    #[serde(default)]
    pub files_by_stage: BTreeMap<String, u64>,
    pub overall_status: String,
}

/// Vector/semantic index. Must return an empty list, not an error, on no match.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn search(&self, text: &str, top_k: usize) -> Result<Vec<SearchHit>>;
}

/// Schema/status provider backed by the file-parsing layer.
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    async fn schema(&self, source_id: &str) -> Result<Option<Schema>>;
    async fn status(&self, source_id: &str) -> Result<Option<ProcessingStatus>>;
    async fn descriptor(&self, source_id: &str) -> Result<Option<RawSourceDescriptor>>;
}

// ---------------------------------------------------------------------------
// Client output
// ---------------------------------------------------------------------------

/// A ranked discovery candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceCandidate {
    pub id: String,
    pub relevance: f32,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl SourceCandidate {
    pub fn to_source_ref(&self) -> SourceRef {
        SourceRef {
            id: self.id.clone(),
            name: self
                .metadata
                .get("label")
                .and_then(|v| v.as_str())
                .map(String::from),
        }
    }
}

/// Everything discovered about one candidate.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredSource {
    pub candidate: SourceCandidate,
    /// Only fetched for candidates inside the schema window.
    pub schema: Option<Schema>,
    pub status: Option<ProcessingStatus>,
    pub descriptor: Option<SourceDescriptor>,
}

/// Output of [`DiscoveryClient::discover`]. Contains every candidate.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DiscoveryReport {
    pub query: String,
    pub sources: Vec<DiscoveredSource>,
}

impl DiscoveryReport {
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Raw descriptors keyed by source id, ready for normalization.
    pub fn descriptors(&self) -> BTreeMap<String, SourceDescriptor> {
        self.sources
            .iter()
            .filter_map(|s| s.descriptor.clone().map(|d| (d.id.clone(), d)))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Configuration for one discovery pass.
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    pub top_k: usize,
    pub min_relevance: f32,
    /// Number of top-ranked candidates that get a schema lookup.
    pub schema_window: usize,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self::from(&DiscoveryConfig::default())
    }
}

impl From<&DiscoveryConfig> for DiscoveryOptions {
    fn from(config: &DiscoveryConfig) -> Self {
        Self {
            top_k: config.top_k,
            min_relevance: config.min_relevance,
            schema_window: config.schema_window,
        }
    }
}

// ---------------------------------------------------------------------------
// Ranking
// ---------------------------------------------------------------------------

/// Keep the best score per id, drop hits below `min_relevance`, sort by
/// relevance descending then id ascending, and keep the first `top_k`.
pub fn rank_candidates(hits: Vec<SearchHit>, top_k: usize, min_relevance: f32) -> Vec<SourceCandidate> {
    let mut best: BTreeMap<String, SearchHit> = BTreeMap::new();
    for hit in hits {
        if hit.score.is_nan() || hit.score < min_relevance {
            continue;
        }
        match best.get(&hit.id) {
            Some(existing) if existing.score >= hit.score => {}
            _ => {
                best.insert(hit.id.clone(), hit);
            }
        }
    }

    let mut ranked: Vec<SourceCandidate> = best
        .into_values()
        .map(|h| SourceCandidate {
            id: h.id,
            relevance: h.score,
            metadata: h.metadata,
        })
        .collect();
    ranked.sort_by(|a, b| {
        b.relevance
            .total_cmp(&a.relevance)
            .then_with(|| a.id.cmp(&b.id))
    });
    ranked.truncate(top_k);
    ranked
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Thin, failure-tolerant wrapper over the discovery collaborators.
#[derive(Clone)]
pub struct DiscoveryClient {
    index: Arc<dyn VectorIndex>,
    metadata: Arc<dyn MetadataProvider>,
    timeout: Duration,
    tracker: Option<DiscoveryTracker>,
}

impl DiscoveryClient {
    pub fn new(index: Arc<dyn VectorIndex>, metadata: Arc<dyn MetadataProvider>) -> Self {
        Self {
            index,
            metadata,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            tracker: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Record every call into `tracker`.
    pub fn with_tracker(mut self, tracker: DiscoveryTracker) -> Self {
        self.tracker = Some(tracker);
        self
    }

    async fn call<T>(&self, operation: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(GenPipeError::timeout(operation, self.timeout)),
        }
    }

    fn tracker(&self) -> DiscoveryTracker {
        // Untracked clients record into a throwaway tracker.
        self.tracker.clone().unwrap_or_default()
    }

    /// Ranked candidates for a free-text query. Empty on any failure.
    #[instrument(skip(self))]
    pub async fn find_sources(&self, query: &str, top_k: usize, min_relevance: f32) -> Vec<SourceCandidate> {
        let attempt = self.tracker().track("find_sources", query, None);

        match self.call("search", self.index.search(query, top_k)).await {
            Ok(hits) => {
                let raw = hits.len();
                let ranked = rank_candidates(hits, top_k, min_relevance);
                debug!(raw, kept = ranked.len(), "search results ranked");
                if ranked.is_empty() {
                    attempt.fail(
                        AttemptErrorKind::NotFound,
                        format!("no candidates at relevance >= {min_relevance}"),
                    );
                } else {
                    attempt.succeed(ranked.len());
                }
                ranked
            }
            Err(e) => {
                warn!(error = %e, "vector search failed, returning no candidates");
                attempt.fail_with(&e);
                Vec::new()
            }
        }
    }

    /// Schema for a source, or `None` when absent or unavailable.
    pub async fn get_schema(&self, source_id: &str) -> Option<Schema> {
        let attempt = self.tracker().track("get_schema", source_id, None);
        match self.call("schema", self.metadata.schema(source_id)).await {
            Ok(Some(schema)) => {
                attempt.succeed(schema.columns.len());
                Some(schema)
            }
            Ok(None) => {
                attempt.fail(AttemptErrorKind::NotFound, "no schema");
                None
            }
            Err(e) => {
                warn!(source_id, error = %e, "schema lookup failed");
                attempt.fail_with(&e);
                None
            }
        }
    }

    /// Processing status for a source, or `None` when absent or unavailable.
    pub async fn get_status(&self, source_id: &str) -> Option<ProcessingStatus> {
        let mut attempt = self.tracker().track("get_status", source_id, None);
        match self.call("status", self.metadata.status(source_id)).await {
            Ok(Some(status)) => {
                for stage in status.files_by_stage.keys() {
                    attempt.searched(stage.clone());
                }
                attempt.succeed(status.stages.len());
                Some(status)
            }
            Ok(None) => {
                attempt.fail(AttemptErrorKind::NotFound, "no status");
                None
            }
            Err(e) => {
                warn!(source_id, error = %e, "status lookup failed");
                attempt.fail_with(&e);
                None
            }
        }
    }

    /// Typed descriptor for a source. Payloads with neither shape are
    /// recorded as a pattern mismatch and dropped.
    pub async fn get_descriptor(&self, source_id: &str, expected_location: Option<&str>) -> Option<SourceDescriptor> {
        let mut attempt = self.tracker().track("get_descriptor", source_id, expected_location);
        if let Some(expected) = expected_location {
            attempt.expect_location(expected);
        }

        let raw = match self.call("descriptor", self.metadata.descriptor(source_id)).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                attempt.fail(AttemptErrorKind::NotFound, "no descriptor");
                return None;
            }
            Err(e) => {
                warn!(source_id, error = %e, "descriptor lookup failed");
                attempt.fail_with(&e);
                return None;
            }
        };

        match SourceDescriptor::from_raw(source_id, raw) {
            Ok(descriptor) => {
                let locations = descriptor_locations(&descriptor);
                for loc in &locations {
                    attempt.searched(loc.clone());
                }
                if let Some(first) = locations.first() {
                    attempt.found_location(first.clone());
                }
                attempt.succeed(locations.len());
                Some(descriptor)
            }
            Err(e) => {
                warn!(source_id, error = %e, "descriptor has no recognizable shape");
                attempt.fail_with(&e);
                None
            }
        }
    }

    /// Rank candidates for `query` and describe every one of them.
    ///
    /// Schemas are fetched only for the first `schema_window` candidates, but
    /// every ranked candidate is returned.
    #[instrument(skip(self, opts), fields(query = %query))]
    pub async fn discover(&self, query: &str, opts: &DiscoveryOptions) -> DiscoveryReport {
        let candidates = self.find_sources(query, opts.top_k, opts.min_relevance).await;
        let report = self.describe(query, candidates, opts.schema_window).await;
        info!(found = report.sources.len(), "semantic discovery complete");
        report
    }

    /// Describe sources the router already chose, bypassing the index.
    pub async fn describe_routed(&self, intent: &str, sources: &[SourceRef], opts: &DiscoveryOptions) -> DiscoveryReport {
        let candidates = sources
            .iter()
            .map(|s| SourceCandidate {
                id: s.id.clone(),
                relevance: 1.0,
                metadata: serde_json::json!({ "routed": true }),
            })
            .collect();
        self.describe(intent, candidates, opts.schema_window).await
    }

    async fn describe(&self, query: &str, candidates: Vec<SourceCandidate>, schema_window: usize) -> DiscoveryReport {
        let mut sources = Vec::with_capacity(candidates.len());
        // Sequential; the provider is never called speculatively.
        for (rank, candidate) in candidates.into_iter().enumerate() {
            let schema = if rank < schema_window {
                self.get_schema(&candidate.id).await
            } else {
                None
            };
            let status = self.get_status(&candidate.id).await;
            let descriptor = self.get_descriptor(&candidate.id, None).await;
            sources.push(DiscoveredSource {
                candidate,
                schema,
                status,
                descriptor,
            });
        }

        DiscoveryReport {
            query: query.to_string(),
            sources,
        }
    }
}

fn descriptor_locations(descriptor: &SourceDescriptor) -> Vec<String> {
    match &descriptor.shape {
        SourceShape::Flat(flat) => match &flat.all_locations {
            Some(all) => all.keys().cloned().collect(),
            None if !flat.location.is_empty() => vec![flat.location.clone()],
            None => Vec::new(),
        },
        SourceShape::Layered(layered) => layered.directory_structure.keys().cloned().collect(),
    }
}
