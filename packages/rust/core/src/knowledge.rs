//! Knowledge assembly with a per-session cache.
//!
//! One [`KnowledgeBundle`] is fetched per session and shared by reference
//! between the design and build views. A retried stage reuses the cached
//! bundle; only an explicit [`KnowledgeAssembler::clear_cache`] forces a
//! fresh fetch.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, info, instrument, warn};

use genpipe_discovery::Schema;
use genpipe_shared::{CanonicalSource, GenPipeError, Result, SessionId};

use crate::stages::Stage;

// ---------------------------------------------------------------------------
// Categories and context
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeCategory {
    Patterns,
    Principles,
    FrameworkConstraints,
    BoostSignals,
}

impl KnowledgeCategory {
    /// Categories fetched for every bundle.
    pub const BASE: [KnowledgeCategory; 3] = [
        KnowledgeCategory::Patterns,
        KnowledgeCategory::Principles,
        KnowledgeCategory::FrameworkConstraints,
    ];

    /// Key used in stage views.
    pub fn view_key(&self) -> &'static str {
        match self {
            Self::Patterns => "patterns",
            Self::Principles => "principles",
            Self::FrameworkConstraints => "frameworkConstraints",
            Self::BoostSignals => "boostSignals",
        }
    }

    /// Categories included in a stage's view, in view order.
    pub fn for_stage(stage: Stage) -> &'static [KnowledgeCategory] {
        match stage {
            Stage::Design => &[Self::Patterns, Self::Principles],
            Stage::Build => &[Self::Principles, Self::FrameworkConstraints],
        }
    }
}

impl fmt::Display for KnowledgeCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.view_key())
    }
}

/// What the pipeline knows about the data behind an intent.
#[derive(Debug, Clone, Default)]
pub struct DataContext {
    pub intent: String,
    pub sources: BTreeMap<String, CanonicalSource>,
    pub schemas: BTreeMap<String, Schema>,
    /// Whether sources came from the deterministic router.
    pub routed: bool,
}

impl DataContext {
    pub fn new(intent: impl Into<String>) -> Self {
        Self {
            intent: intent.into(),
            ..Default::default()
        }
    }

    /// Live data summary handed to the generation stages.
    pub fn live_summary(&self) -> Value {
        let sources: Vec<Value> = self
            .sources
            .values()
            .map(|s| {
                let locations: Map<String, Value> = s
                    .locations
                    .iter()
                    .map(|(kind, stats)| {
                        (
                            kind.to_string(),
                            json!({
                                "fileCount": stats.file_count,
                                "sizeBytes": stats.size_bytes,
                                "rowCount": stats.row_count,
                            }),
                        )
                    })
                    .collect();
                json!({
                    "id": s.id,
                    "label": s.label,
                    "preferredLocation": s.available_in.first().map(|k| k.to_string()),
                    "locations": locations,
                    "columns": self.schemas.get(&s.id).map(|schema| schema.columns.clone()),
                })
            })
            .collect();

        json!({
            "intent": self.intent,
            "routed": self.routed,
            "sources": sources,
        })
    }
}

// ---------------------------------------------------------------------------
// Store contract
// ---------------------------------------------------------------------------

/// Domain knowledge store consulted once per session.
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    async fn fetch(&self, category: KnowledgeCategory, context: &DataContext) -> Result<Vec<String>>;
}

/// Fixed in-memory knowledge, used when no external store is configured.
#[derive(Debug, Clone, Default)]
pub struct StaticKnowledgeStore {
    fragments: BTreeMap<KnowledgeCategory, Vec<String>>,
}

impl StaticKnowledgeStore {
    pub fn new(fragments: BTreeMap<KnowledgeCategory, Vec<String>>) -> Self {
        Self { fragments }
    }

    /// Built-in dashboard-generation guidance.
    pub fn builtin() -> Self {
        let entries = [
            (
                KnowledgeCategory::Patterns,
                vec![
                    "Lead with one headline metric card per data source.",
                    "Pair every chart with a table showing the same rows.",
                    "Put filters above the components they affect.",
                ],
            ),
            (
                KnowledgeCategory::Principles,
                vec![
                    "Show every available data location; let the user pick.",
                    "Label units and time ranges explicitly.",
                    "Never invent values for missing data.",
                ],
            ),
            (
                KnowledgeCategory::FrameworkConstraints,
                vec![
                    "Components are React function components in .tsx files.",
                    "Relative imports must resolve to a file in the artifact.",
                    "Guard array methods with an explicit array type.",
                ],
            ),
            (
                KnowledgeCategory::BoostSignals,
                vec!["Prefer processed locations when row counts are known."],
            ),
        ];
        Self::new(
            entries
                .into_iter()
                .map(|(cat, items)| (cat, items.into_iter().map(String::from).collect()))
                .collect(),
        )
    }
}

#[async_trait]
impl KnowledgeStore for StaticKnowledgeStore {
    async fn fetch(&self, category: KnowledgeCategory, _context: &DataContext) -> Result<Vec<String>> {
        Ok(self.fragments.get(&category).cloned().unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Bundle and views
// ---------------------------------------------------------------------------

/// Category fragments fetched for one session.
#[derive(Debug, Clone, Serialize)]
pub struct KnowledgeBundle {
    pub session: SessionId,
    pub fragments: BTreeMap<KnowledgeCategory, Vec<String>>,
    pub live_data: Value,
    /// Categories whose fetch failed; present in `fragments` as empty lists.
    pub gaps: Vec<KnowledgeCategory>,
    pub fetched_at: DateTime<Utc>,
}

impl KnowledgeBundle {
    pub fn fragments_for(&self, category: KnowledgeCategory) -> &[String] {
        self.fragments.get(&category).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_boost(&self) -> bool {
        self.fragments.contains_key(&KnowledgeCategory::BoostSignals)
    }
}

/// Stage-specific projection of a bundle.
#[derive(Debug, Clone)]
pub struct KnowledgeView {
    pub stage: Stage,
    pub bundle: Arc<KnowledgeBundle>,
    pub fields: Map<String, Value>,
}

impl KnowledgeView {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn to_json(&self) -> Value {
        Value::Object(self.fields.clone())
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// Bundles keyed by session; sessions never see or clear each other's entry.
#[derive(Debug, Default)]
pub struct KnowledgeCache {
    entries: Mutex<HashMap<SessionId, Arc<KnowledgeBundle>>>,
}

impl KnowledgeCache {
    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, Arc<KnowledgeBundle>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, session: &SessionId) -> Option<Arc<KnowledgeBundle>> {
        self.lock().get(session).cloned()
    }

    pub fn insert(&self, bundle: Arc<KnowledgeBundle>) {
        self.lock().insert(bundle.session.clone(), bundle);
    }

    /// Returns whether an entry was present.
    pub fn remove(&self, session: &SessionId) -> bool {
        self.lock().remove(session).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

// ---------------------------------------------------------------------------
// Assembler
// ---------------------------------------------------------------------------

pub struct KnowledgeAssembler {
    store: Arc<dyn KnowledgeStore>,
    cache: KnowledgeCache,
    timeout: Duration,
}

impl KnowledgeAssembler {
    pub fn new(store: Arc<dyn KnowledgeStore>, timeout: Duration) -> Self {
        Self {
            store,
            cache: KnowledgeCache::default(),
            timeout,
        }
    }

    pub fn cache(&self) -> &KnowledgeCache {
        &self.cache
    }

    /// Fetch (or reuse) the session's bundle.
    ///
    /// With `use_cache` an existing bundle is returned as the same `Arc`
    /// without touching the store. A failed or timed-out category becomes an
    /// empty fragment list and is listed in `gaps`.
    #[instrument(skip_all, fields(session = %session, enable_boost = enable_boost, use_cache = use_cache))]
    pub async fn assemble(
        &self,
        session: &SessionId,
        context: &DataContext,
        enable_boost: bool,
        use_cache: bool,
    ) -> Arc<KnowledgeBundle> {
        if use_cache {
            if let Some(bundle) = self.cache.get(session) {
                debug!("knowledge cache hit");
                return bundle;
            }
            debug!("knowledge cache miss");
        }

        let mut categories = KnowledgeCategory::BASE.to_vec();
        if enable_boost {
            categories.push(KnowledgeCategory::BoostSignals);
        }

        let mut fragments = BTreeMap::new();
        let mut gaps = Vec::new();
        for category in categories {
            let fetched = match tokio::time::timeout(self.timeout, self.store.fetch(category, context)).await {
                Ok(result) => result,
                Err(_) => Err(GenPipeError::timeout(format!("knowledge fetch ({category})"), self.timeout)),
            };
            match fetched {
                Ok(items) => {
                    fragments.insert(category, items);
                }
                Err(e) => {
                    warn!(%category, error = %e, "knowledge fetch failed, continuing without it");
                    fragments.insert(category, Vec::new());
                    gaps.push(category);
                }
            }
        }

        let bundle = Arc::new(KnowledgeBundle {
            session: session.clone(),
            fragments,
            live_data: context.live_summary(),
            gaps,
            fetched_at: Utc::now(),
        });
        info!(
            categories = bundle.fragments.len(),
            gaps = bundle.gaps.len(),
            "knowledge bundle assembled"
        );
        self.cache.insert(bundle.clone());
        bundle
    }

    /// Drop the session's cached bundle. Idempotent.
    pub fn clear_cache(&self, session: &SessionId) {
        if self.cache.remove(session) {
            debug!(%session, "knowledge cache cleared");
        }
    }

    /// Project a bundle for one stage. `extra` keys win over bundle keys.
    pub fn view_for(&self, bundle: &Arc<KnowledgeBundle>, stage: Stage, extra: Map<String, Value>) -> KnowledgeView {
        view_for(bundle, stage, extra)
    }
}

/// Stage projection, usable without an assembler.
pub fn view_for(bundle: &Arc<KnowledgeBundle>, stage: Stage, extra: Map<String, Value>) -> KnowledgeView {
    let mut fields = Map::new();
    for category in KnowledgeCategory::for_stage(stage) {
        fields.insert(category.view_key().into(), json!(bundle.fragments_for(*category)));
    }
    fields.insert("liveDataContext".into(), bundle.live_data.clone());
    if bundle.has_boost() {
        fields.insert(
            KnowledgeCategory::BoostSignals.view_key().into(),
            json!(bundle.fragments_for(KnowledgeCategory::BoostSignals)),
        );
    }
    fields.extend(extra);

    KnowledgeView {
        stage,
        bundle: bundle.clone(),
        fields,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts fetches; fails the listed categories.
    #[derive(Default)]
    struct CountingStore {
        calls: AtomicUsize,
        failing: Vec<KnowledgeCategory>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl KnowledgeStore for CountingStore {
        async fn fetch(&self, category: KnowledgeCategory, _ctx: &DataContext) -> Result<Vec<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.failing.contains(&category) {
                return Err(GenPipeError::Network("store unavailable".into()));
            }
            Ok(vec![format!("{category} fragment")])
        }
    }

    fn assembler(store: Arc<CountingStore>) -> KnowledgeAssembler {
        KnowledgeAssembler::new(store, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn cached_bundle_is_reused_without_refetch() {
        let store = Arc::new(CountingStore::default());
        let asm = assembler(store.clone());
        let session = SessionId::new();
        let ctx = DataContext::new("oil by county");

        let first = asm.assemble(&session, &ctx, false, true).await;
        let second = asm.assemble(&session, &ctx, false, true).await;

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn clear_cache_forces_fresh_fetch() {
        let store = Arc::new(CountingStore::default());
        let asm = assembler(store.clone());
        let session = SessionId::new();
        let ctx = DataContext::new("oil");

        let first = asm.assemble(&session, &ctx, false, true).await;
        asm.clear_cache(&session);
        asm.clear_cache(&session);
        let second = asm.assemble(&session, &ctx, false, true).await;

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(store.calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn use_cache_false_refetches() {
        let store = Arc::new(CountingStore::default());
        let asm = assembler(store.clone());
        let session = SessionId::new();
        let ctx = DataContext::new("oil");

        asm.assemble(&session, &ctx, false, true).await;
        asm.assemble(&session, &ctx, false, false).await;
        assert_eq!(store.calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn sessions_do_not_share_bundles() {
        let store = Arc::new(CountingStore::default());
        let asm = assembler(store.clone());
        let (a, b) = (SessionId::new(), SessionId::new());
        let ctx = DataContext::new("oil");

        let bundle_a = asm.assemble(&a, &ctx, false, true).await;
        let bundle_b = asm.assemble(&b, &ctx, false, true).await;
        assert!(!Arc::ptr_eq(&bundle_a, &bundle_b));

        asm.clear_cache(&a);
        assert!(asm.cache().get(&a).is_none());
        assert!(Arc::ptr_eq(&asm.cache().get(&b).unwrap(), &bundle_b));
    }

    #[tokio::test]
    async fn views_are_disjoint_and_share_the_bundle() {
        let store = Arc::new(CountingStore::default());
        let asm = assembler(store);
        let session = SessionId::new();
        let bundle = asm.assemble(&session, &DataContext::new("oil"), true, true).await;

        let design = asm.view_for(&bundle, Stage::Design, Map::new());
        let build = asm.view_for(&bundle, Stage::Build, Map::new());

        assert!(Arc::ptr_eq(&design.bundle, &build.bundle));
        for key in ["patterns", "principles", "liveDataContext", "boostSignals"] {
            assert!(design.get(key).is_some(), "design view missing {key}");
        }
        assert!(design.get("frameworkConstraints").is_none());
        for key in ["principles", "frameworkConstraints", "liveDataContext", "boostSignals"] {
            assert!(build.get(key).is_some(), "build view missing {key}");
        }
        assert!(build.get("patterns").is_none());
    }

    #[tokio::test]
    async fn boost_signals_only_when_enabled() {
        let asm = assembler(Arc::new(CountingStore::default()));
        let bundle = asm.assemble(&SessionId::new(), &DataContext::new("oil"), false, true).await;
        let view = asm.view_for(&bundle, Stage::Design, Map::new());
        assert!(view.get("boostSignals").is_none());
    }

    #[tokio::test]
    async fn caller_extra_wins_on_conflict() {
        let asm = assembler(Arc::new(CountingStore::default()));
        let bundle = asm.assemble(&SessionId::new(), &DataContext::new("oil"), false, true).await;

        let mut extra = Map::new();
        extra.insert("principles".into(), json!(["override"]));
        extra.insert("designSpec".into(), json!({"title": "t"}));
        let view = asm.view_for(&bundle, Stage::Build, extra);

        assert_eq!(view.get("principles"), Some(&json!(["override"])));
        assert!(view.get("designSpec").is_some());
    }

    #[tokio::test]
    async fn failed_category_becomes_gap() {
        let store = Arc::new(CountingStore {
            failing: vec![KnowledgeCategory::Patterns],
            ..Default::default()
        });
        let asm = assembler(store);
        let bundle = asm.assemble(&SessionId::new(), &DataContext::new("oil"), false, true).await;

        assert_eq!(bundle.gaps, vec![KnowledgeCategory::Patterns]);
        assert!(bundle.fragments_for(KnowledgeCategory::Patterns).is_empty());
        assert_eq!(bundle.fragments_for(KnowledgeCategory::Principles).len(), 1);
    }

    #[tokio::test]
    async fn slow_store_times_out_per_category() {
        let store = Arc::new(CountingStore {
            delay: Some(Duration::from_millis(200)),
            ..Default::default()
        });
        let asm = KnowledgeAssembler::new(store, Duration::from_millis(10));
        let bundle = asm.assemble(&SessionId::new(), &DataContext::new("oil"), false, true).await;
        assert_eq!(bundle.gaps.len(), 3);
    }

    #[tokio::test]
    async fn builtin_store_covers_every_category() {
        let store = StaticKnowledgeStore::builtin();
        let ctx = DataContext::new("oil");
        for category in [
            KnowledgeCategory::Patterns,
            KnowledgeCategory::Principles,
            KnowledgeCategory::FrameworkConstraints,
            KnowledgeCategory::BoostSignals,
        ] {
            assert!(!store.fetch(category, &ctx).await.unwrap().is_empty());
        }
    }
}
