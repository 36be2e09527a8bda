//! End-to-end generation: config + intent -> orchestrated session -> artifact.
//!
//! Wires the collaborators named in [`AppConfig`] into an [`Orchestrator`]:
//! HTTP discovery or a local descriptor catalog, remote generation stages
//! when an endpoint is configured (legacy-only otherwise), a remote or
//! built-in knowledge store, the validator and the discovery-session log.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use genpipe_discovery::{
    DiscoveryClient, DiscoveryOptions, DomainRouter, HttpMetadataProvider, HttpVectorIndex,
    StaticCatalog,
};
use genpipe_shared::{
    AppConfig, GenPipeError, RawSourceDescriptor, Result, SourceRef, Timeouts, session_log_path,
    validate_config,
};
use genpipe_storage::Storage;

use crate::knowledge::{KnowledgeAssembler, KnowledgeStore, StaticKnowledgeStore};
use crate::orchestrator::{GenerationResult, Orchestrator, OrchestratorState};
use crate::remote::{HttpGenerationStage, HttpKnowledgeStore};
use crate::stages::Stage;
use crate::validator::{Validator, ValidatorOptions};

/// Progress callback for reporting session status.
pub trait ProgressReporter: Send + Sync {
    /// Called on every state transition.
    fn phase(&self, state: OrchestratorState);
    /// Called before each primary stage invocation.
    fn attempt(&self, stage: Stage, attempt: u32, budget: u32);
    /// Called when the session completes with an artifact.
    fn done(&self, result: &GenerationResult);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _state: OrchestratorState) {}
    fn attempt(&self, _stage: Stage, _attempt: u32, _budget: u32) {}
    fn done(&self, _result: &GenerationResult) {}
}

#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    pub intent: String,
    /// Local descriptors; when present they back discovery instead of the
    /// configured HTTP endpoints.
    pub descriptors: Option<BTreeMap<String, RawSourceDescriptor>>,
    /// Sources the router may choose from. Defaults to every catalogued source.
    pub sources: Option<Vec<SourceRef>>,
    pub enable_boost: bool,
}

/// Read a descriptor file: a JSON object keyed by source id.
pub fn load_descriptors(path: &Path) -> Result<BTreeMap<String, RawSourceDescriptor>> {
    let text = std::fs::read_to_string(path).map_err(|e| GenPipeError::io(path, e))?;
    serde_json::from_str(&text)
        .map_err(|e| GenPipeError::parse(format!("{}: invalid descriptor file: {e}", path.display())))
}

/// Discovery client plus the sources it knows up front.
pub fn build_discovery(
    config: &AppConfig,
    timeouts: &Timeouts,
    descriptors: Option<BTreeMap<String, RawSourceDescriptor>>,
) -> Result<(DiscoveryClient, Vec<SourceRef>)> {
    if let Some(descriptors) = descriptors {
        let catalog = Arc::new(StaticCatalog::new(descriptors));
        let sources = catalog.sources();
        info!(sources = sources.len(), "using local descriptor catalog");
        let client = DiscoveryClient::new(catalog.clone(), catalog).with_timeout(timeouts.discovery);
        return Ok((client, sources));
    }

    match (&config.discovery.index_url, &config.discovery.metadata_url) {
        (Some(index), Some(metadata)) => {
            let client = DiscoveryClient::new(
                Arc::new(HttpVectorIndex::new(index.clone(), timeouts.discovery)?),
                Arc::new(HttpMetadataProvider::new(metadata.clone(), timeouts.discovery)?),
            )
            .with_timeout(timeouts.discovery);
            Ok((client, Vec::new()))
        }
        _ => Err(GenPipeError::config(
            "no discovery backend: set discovery.index_url and discovery.metadata_url, or pass a descriptor file",
        )),
    }
}

/// Run one generation session from config.
#[instrument(skip_all, fields(intent = %request.intent))]
pub async fn generate(
    config: &AppConfig,
    request: GenerateRequest,
    progress: &dyn ProgressReporter,
    cancel: CancellationToken,
) -> Result<GenerationResult> {
    validate_config(config)?;
    let timeouts = Timeouts::from(&config.pipeline);

    let router = DomainRouter::new(&config.router)?;
    let (client, catalogued) = build_discovery(config, &timeouts, request.descriptors)?;
    let available = request.sources.unwrap_or(catalogued);

    let store: Arc<dyn KnowledgeStore> = match &config.knowledge.endpoint {
        Some(endpoint) => Arc::new(HttpKnowledgeStore::new(endpoint.clone(), timeouts.knowledge)?),
        None => Arc::new(StaticKnowledgeStore::builtin()),
    };
    let knowledge = KnowledgeAssembler::new(store, timeouts.knowledge);
    let validator = Validator::new(ValidatorOptions::from_config(
        &config.validator,
        timeouts.compiler,
    ));

    let mut orchestrator = Orchestrator::new(router, client)
        .with_available_sources(available)
        .with_discovery_options(DiscoveryOptions::from(&config.discovery))
        .with_knowledge(Arc::new(knowledge))
        .with_validator(validator)
        .with_timeouts(timeouts)
        .with_cancellation(cancel)
        .with_boost(request.enable_boost);

    match &config.generation.endpoint {
        Some(endpoint) => {
            let stage = Arc::new(HttpGenerationStage::new(
                endpoint.clone(),
                timeouts.design.max(timeouts.build),
            )?);
            orchestrator = orchestrator
                .with_design_stage(stage.clone())
                .with_build_stage(stage);
        }
        None => info!("no generation endpoint configured, using the legacy path"),
    }

    if let Some(root) = &config.pipeline.build_root {
        orchestrator = orchestrator.with_build_root(root.clone());
    }

    let log_path = session_log_path(config)?;
    match Storage::open(&log_path).await {
        Ok(storage) => orchestrator = orchestrator.with_sink(Arc::new(storage)),
        Err(e) => warn!(
            path = %log_path.display(),
            error = %e,
            "session log unavailable, discovery sessions will not be persisted"
        ),
    }

    orchestrator.run(&request.intent, progress).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use serde_json::json;
    use url::Url;
    use uuid::Uuid;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::stages::{IssueKind, Origin};

    fn fixture_path() -> PathBuf {
        PathBuf::from("../../../fixtures/sources/descriptors.fixture.json")
    }

    fn test_config() -> (AppConfig, PathBuf) {
        let log = std::env::temp_dir().join(format!("genpipe_test_{}.db", Uuid::now_v7()));
        let mut config = AppConfig::default();
        config.telemetry.session_log = Some(log.clone());
        config.validator.compiler_enabled = false;
        (config, log)
    }

    #[tokio::test]
    async fn offline_generation_uses_legacy_and_logs_session() {
        let (config, log) = test_config();
        let request = GenerateRequest {
            intent: "oil production in the Permian basin".into(),
            descriptors: Some(load_descriptors(&fixture_path()).unwrap()),
            ..Default::default()
        };

        let result = generate(&config, request, &SilentProgress, CancellationToken::new())
            .await
            .unwrap();

        assert!(result.routed());
        assert!(result.used_legacy_design && result.used_legacy_build);
        assert!(result.artifact.has_file_for("RrcTable"));

        let storage = Storage::open_readonly(&log).await.unwrap();
        assert_eq!(storage.session_count().await.unwrap(), 1);
        let _ = std::fs::remove_file(&log);
    }

    #[tokio::test]
    async fn remote_stages_are_used_when_configured() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/design"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "title": "Permian oil",
                "components": [{ "name": "RrcChart", "kind": "chart", "source_id": "rrc" }]
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/build"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "files": {
                    "App.tsx": "import { RrcChart } from \"./RrcChart\";\nexport default RrcChart;\n",
                    "RrcChart.tsx": "export function RrcChart() { return null; }\n"
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let (mut config, log) = test_config();
        config.generation.endpoint = Some(Url::parse(&server.uri()).unwrap());
        let request = GenerateRequest {
            intent: "oil production in the Permian basin".into(),
            descriptors: Some(load_descriptors(&fixture_path()).unwrap()),
            ..Default::default()
        };

        let result = generate(&config, request, &SilentProgress, CancellationToken::new())
            .await
            .unwrap();

        assert!(!result.used_legacy_design && !result.used_legacy_build);
        assert_eq!(result.artifact.origin, Origin::Primary);
        assert!(result.conflicts.is_empty());
        let _ = std::fs::remove_file(&log);
    }

    #[tokio::test]
    async fn configured_knowledge_service_is_consulted_once_per_category() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/fragments"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let (mut config, log) = test_config();
        config.knowledge.endpoint = Some(Url::parse(&server.uri()).unwrap());
        let request = GenerateRequest {
            intent: "oil production in the Permian basin".into(),
            descriptors: Some(load_descriptors(&fixture_path()).unwrap()),
            ..Default::default()
        };

        let result = generate(&config, request, &SilentProgress, CancellationToken::new())
            .await
            .unwrap();

        assert!(result.used_legacy_build);
        assert_eq!(
            result
                .issues_of(IssueKind::DiscoveryGap)
                .filter(|i| i.message.contains("knowledge"))
                .count(),
            3
        );
        let _ = std::fs::remove_file(&log);
    }

    #[tokio::test]
    async fn missing_discovery_backend_is_a_config_error() {
        let (config, _) = test_config();
        let err = generate(
            &config,
            GenerateRequest {
                intent: "anything".into(),
                ..Default::default()
            },
            &SilentProgress,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, GenPipeError::Config { .. }));
    }

    #[test]
    fn bad_descriptor_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("bad.json");
        std::fs::write(&file, "[1, 2]").unwrap();
        assert!(matches!(load_descriptors(&file), Err(GenPipeError::Parse { .. })));
    }
}
