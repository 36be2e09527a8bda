//! Remote collaborators: generation stages and the knowledge store.
//!
//! - `POST {base}/design` with `{"requirements", "knowledge"}` returns a design
//! - `POST {base}/build` with `{"design", "knowledge"}` returns `{"files": {..}}`
//! - `POST {knowledge}/fragments` with `{"category", "intent", "sources"}`
//!   returns `{"fragments": [..]}`; 404 means the category has nothing
//!
//! Every stage failure, including a malformed body, is a stage failure.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use url::Url;

use genpipe_discovery::http::build_client;
use genpipe_shared::{GenPipeError, Result};

use crate::knowledge::{DataContext, KnowledgeCategory, KnowledgeStore, KnowledgeView};
use crate::stages::{Artifact, BuildStage, DesignSpec, DesignStage, Origin, Requirements, Stage};

#[derive(Serialize)]
struct DesignRequest<'a> {
    requirements: &'a Requirements,
    knowledge: serde_json::Value,
}

#[derive(Serialize)]
struct BuildRequest<'a> {
    design: &'a DesignSpec,
    knowledge: serde_json::Value,
}

#[derive(Deserialize)]
struct BuildResponse {
    files: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct HttpGenerationStage {
    client: Client,
    base: Url,
}

impl HttpGenerationStage {
    pub fn new(base: Url, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            base,
        })
    }

    async fn post<B: Serialize + Sync, T: DeserializeOwned>(&self, stage: Stage, body: &B) -> Result<T> {
        let url = format!("{}/{stage}", self.base.as_str().trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| GenPipeError::protocol(stage.to_string(), format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(GenPipeError::protocol(
                stage.to_string(),
                format!("{url}: HTTP {status} {}", detail.trim()),
            ));
        }

        response.json::<T>().await.map_err(|e| {
            GenPipeError::protocol(stage.to_string(), format!("{url}: invalid response: {e}"))
        })
    }
}

#[async_trait]
impl DesignStage for HttpGenerationStage {
    #[instrument(skip_all, fields(base = %self.base))]
    async fn design(&self, requirements: &Requirements, knowledge: &KnowledgeView) -> Result<DesignSpec> {
        let mut design: DesignSpec = self
            .post(
                Stage::Design,
                &DesignRequest {
                    requirements,
                    knowledge: knowledge.to_json(),
                },
            )
            .await?;
        design.origin = Origin::Primary;
        debug!(components = design.components.len(), "remote design received");
        Ok(design)
    }
}

#[async_trait]
impl BuildStage for HttpGenerationStage {
    #[instrument(skip_all, fields(base = %self.base))]
    async fn build(&self, design: &DesignSpec, knowledge: &KnowledgeView) -> Result<Artifact> {
        let response: BuildResponse = self
            .post(
                Stage::Build,
                &BuildRequest {
                    design,
                    knowledge: knowledge.to_json(),
                },
            )
            .await?;
        debug!(files = response.files.len(), "remote build received");
        Ok(Artifact {
            files: response.files,
            origin: Origin::Primary,
        })
    }
}

// ---------------------------------------------------------------------------
// Knowledge store
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct FragmentRequest<'a> {
    category: KnowledgeCategory,
    intent: &'a str,
    sources: Vec<&'a str>,
}

#[derive(Deserialize)]
struct FragmentResponse {
    #[serde(default)]
    fragments: Vec<String>,
}

/// Knowledge store reached over HTTP, one request per category.
#[derive(Debug, Clone)]
pub struct HttpKnowledgeStore {
    client: Client,
    base: Url,
}

impl HttpKnowledgeStore {
    pub fn new(base: Url, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            base,
        })
    }
}

#[async_trait]
impl KnowledgeStore for HttpKnowledgeStore {
    #[instrument(skip(self, context), fields(base = %self.base))]
    async fn fetch(&self, category: KnowledgeCategory, context: &DataContext) -> Result<Vec<String>> {
        let url = format!("{}/fragments", self.base.as_str().trim_end_matches('/'));
        let body = FragmentRequest {
            category,
            intent: &context.intent,
            sources: context.sources.keys().map(String::as_str).collect(),
        };
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| GenPipeError::Network(format!("{url}: {e}")))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!(%category, "no fragments for category");
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(GenPipeError::Network(format!("{url}: HTTP {status}")));
        }

        let parsed = response
            .json::<FragmentResponse>()
            .await
            .map_err(|e| GenPipeError::parse(format!("{url}: invalid fragments response: {e}")))?;
        Ok(parsed.fragments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Utc;
    use genpipe_shared::SessionId;
    use serde_json::{Map, json};
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::knowledge::{KnowledgeAssembler, KnowledgeBundle, view_for};

    fn view(stage: Stage) -> KnowledgeView {
        let bundle = Arc::new(KnowledgeBundle {
            session: SessionId::new(),
            fragments: BTreeMap::new(),
            live_data: json!({ "sources": [] }),
            gaps: vec![],
            fetched_at: Utc::now(),
        });
        view_for(&bundle, stage, Map::new())
    }

    fn stage(server: &MockServer) -> HttpGenerationStage {
        HttpGenerationStage::new(Url::parse(&server.uri()).unwrap(), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn design_posts_requirements_and_knowledge() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/design"))
            .and(body_partial_json(json!({ "requirements": { "intent": "gas wells" } })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "title": "Gas wells",
                "components": [{ "name": "RrcTable", "kind": "table", "source_id": "rrc" }],
                "origin": "legacy"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let design = stage(&server)
            .design(&Requirements::parse("gas wells"), &view(Stage::Design))
            .await
            .unwrap();
        assert_eq!(design.components[0].name, "RrcTable");
        assert_eq!(design.origin, Origin::Primary);
    }

    #[tokio::test]
    async fn build_returns_files() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/build"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "files": { "App.tsx": "export {};" } })),
            )
            .mount(&server)
            .await;

        let design = DesignSpec {
            title: "t".into(),
            components: vec![],
            origin: Origin::Primary,
        };
        let artifact = stage(&server).build(&design, &view(Stage::Build)).await.unwrap();
        assert_eq!(artifact.entry_file(), Some("App.tsx"));
    }

    #[tokio::test]
    async fn server_errors_are_stage_failures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/design"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let err = stage(&server)
            .design(&Requirements::parse("x"), &view(Stage::Design))
            .await
            .unwrap_err();
        assert!(err.is_stage_failure());
        assert!(err.to_string().contains("overloaded"));
        assert!(err.to_string().starts_with("design failed"));
    }

    #[tokio::test]
    async fn malformed_body_is_stage_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/build"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let design = DesignSpec {
            title: "t".into(),
            components: vec![],
            origin: Origin::Primary,
        };
        let err = stage(&server)
            .build(&design, &view(Stage::Build))
            .await
            .unwrap_err();
        assert!(matches!(err, GenPipeError::Protocol { .. }));
    }

    fn knowledge(server: &MockServer) -> HttpKnowledgeStore {
        HttpKnowledgeStore::new(Url::parse(&server.uri()).unwrap(), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn knowledge_posts_category_intent_and_sources() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/fragments"))
            .and(body_partial_json(json!({
                "category": "framework_constraints",
                "intent": "oil by county",
                "sources": ["rrc"]
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "fragments": ["Use .tsx components."] })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let mut ctx = DataContext::new("oil by county");
        ctx.sources.insert(
            "rrc".into(),
            genpipe_shared::CanonicalSource {
                id: "rrc".into(),
                label: "rrc".into(),
                shape: genpipe_shared::ShapeKind::Flat,
                locations: BTreeMap::new(),
                available_in: vec![],
                tree: None,
                normalized_at: Utc::now(),
            },
        );
        let fragments = knowledge(&server)
            .fetch(KnowledgeCategory::FrameworkConstraints, &ctx)
            .await
            .unwrap();
        assert_eq!(fragments, vec!["Use .tsx components."]);
    }

    #[tokio::test]
    async fn knowledge_404_is_empty_not_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/fragments"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let fragments = knowledge(&server)
            .fetch(KnowledgeCategory::Patterns, &DataContext::new("oil"))
            .await
            .unwrap();
        assert!(fragments.is_empty());
    }

    #[tokio::test]
    async fn failing_knowledge_service_leaves_gaps_in_the_bundle() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/fragments"))
            .and(body_partial_json(json!({ "category": "patterns" })))
            .respond_with(ResponseTemplate::new(500))
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/fragments"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "fragments": ["ok"] })))
            .mount(&server)
            .await;

        let asm = KnowledgeAssembler::new(Arc::new(knowledge(&server)), Duration::from_secs(5));
        let session = SessionId::new();
        let bundle = asm.assemble(&session, &DataContext::new("oil"), false, true).await;

        assert_eq!(bundle.gaps, vec![KnowledgeCategory::Patterns]);
        assert_eq!(bundle.fragments_for(KnowledgeCategory::Principles), ["ok".to_string()]);
        let again = asm.assemble(&session, &DataContext::new("oil"), false, true).await;
        assert!(Arc::ptr_eq(&bundle, &again));
    }
}
