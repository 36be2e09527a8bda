//! In-memory source catalog, for offline runs with a descriptor file.
//!
//! Serves descriptors as a [`MetadataProvider`] and answers searches with a
//! token-overlap score so the discovery client works without a live index.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;

use genpipe_shared::{RawSourceDescriptor, Result, SourceRef};

use crate::client::{MetadataProvider, ProcessingStatus, Schema, SearchHit, VectorIndex};

#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    descriptors: BTreeMap<String, RawSourceDescriptor>,
}

impl StaticCatalog {
    pub fn new(descriptors: BTreeMap<String, RawSourceDescriptor>) -> Self {
        Self { descriptors }
    }

    /// Every catalogued source, in id order.
    pub fn sources(&self) -> Vec<SourceRef> {
        self.descriptors
            .iter()
            .map(|(id, raw)| SourceRef {
                id: id.clone(),
                name: raw.label.clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

fn tokens(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

#[async_trait]
impl VectorIndex for StaticCatalog {
    async fn search(&self, text: &str, top_k: usize) -> Result<Vec<SearchHit>> {
        let query = tokens(text);
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let mut hits: Vec<SearchHit> = self
            .descriptors
            .iter()
            .filter_map(|(id, raw)| {
                let mut doc = tokens(id);
                if let Some(label) = &raw.label {
                    doc.extend(tokens(label));
                }
                let overlap = query.intersection(&doc).count();
                (overlap > 0).then(|| SearchHit {
                    id: id.clone(),
                    score: overlap as f32 / query.len() as f32,
                    metadata: serde_json::json!({ "label": raw.label }),
                })
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        hits.truncate(top_k);
        Ok(hits)
    }
}

#[async_trait]
impl MetadataProvider for StaticCatalog {
    async fn schema(&self, _source_id: &str) -> Result<Option<Schema>> {
        Ok(None)
    }

    async fn status(&self, _source_id: &str) -> Result<Option<ProcessingStatus>> {
        Ok(None)
    }

    async fn descriptor(&self, source_id: &str) -> Result<Option<RawSourceDescriptor>> {
        Ok(self.descriptors.get(source_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> StaticCatalog {
        let fixture = std::fs::read_to_string("../../../fixtures/sources/descriptors.fixture.json")
            .expect("read descriptor fixture");
        StaticCatalog::new(serde_json::from_str(&fixture).expect("parse fixture"))
    }

    #[tokio::test]
    async fn search_scores_by_token_overlap() {
        let catalog = catalog();
        let hits = catalog.search("Railroad Commission production", 5).await.unwrap();
        assert_eq!(hits[0].id, "rrc");
        assert!(hits[0].score > 0.0 && hits[0].score <= 1.0);

        assert!(catalog.search("   ", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn serves_descriptors() {
        let catalog = catalog();
        assert_eq!(catalog.len(), 3);
        assert!(catalog.descriptor("fracfocus").await.unwrap().is_some());
        assert!(catalog.descriptor("nope").await.unwrap().is_none());
        assert!(catalog.schema("rrc").await.unwrap().is_none());
        assert_eq!(catalog.sources().len(), 3);
    }
}
