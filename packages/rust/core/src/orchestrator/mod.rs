//! Execution orchestrator: one generation session from intent to artifact.
//!
//! The session walks an explicit state machine. Discovery and knowledge
//! assembly run once; design and build each run a bounded retry loop whose
//! every decision comes from a [`DecisionPolicy`]. Whatever happens inside
//! the loops, the legacy path guarantees an artifact, and the discovery
//! session is always sealed and persisted before `run` returns.

pub mod decision;
pub mod state;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Map, json};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use genpipe_discovery::{DiscoveryClient, DiscoveryOptions, DiscoveryTracker, DomainRouter};
use genpipe_shared::{DiscoverySession, GenPipeError, Result, SessionId, SourceRef, Timeouts};
use genpipe_storage::Storage;

use crate::adapter;
use crate::knowledge::{
    DataContext, KnowledgeAssembler, KnowledgeBundle, KnowledgeView, StaticKnowledgeStore, view_for,
};
use crate::legacy::{LegacyGenerator, LegacyPath};
use crate::pipeline::ProgressReporter;
use crate::stages::{
    ActionKind, Artifact, BuildStage, DesignSpec, DesignStage, EvaluationResult, Evaluator,
    IssueKind, PipelineIssue, Requirements, Stage, StructuralEvaluator,
};
use crate::validator::{RuntimeConflict, Validator, ValidatorOptions};

pub use decision::{DecisionPolicy, DefaultPolicy};
pub use state::{OrchestratorState, StateMachine, TransitionRecord};

/// Upper bound on design-stage invocations per session.
pub const MAX_DESIGN_ITERATIONS: u32 = 3;

/// Upper bound on build-stage invocations per session.
pub const MAX_BUILD_ATTEMPTS: u32 = 2;

// ---------------------------------------------------------------------------
// Session sink
// ---------------------------------------------------------------------------

/// Destination for sealed discovery sessions.
#[async_trait]
pub trait SessionSink: Send + Sync {
    async fn persist(&self, session: &DiscoverySession) -> Result<()>;
}

#[async_trait]
impl SessionSink for Storage {
    async fn persist(&self, session: &DiscoverySession) -> Result<()> {
        self.append_session(session).await
    }
}

// ---------------------------------------------------------------------------
// Result
// ---------------------------------------------------------------------------

/// Everything a finished session produced. `artifact` is always present.
#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub session_id: SessionId,
    pub requirements: Requirements,
    pub context: DataContext,
    pub design: DesignSpec,
    pub artifact: Artifact,
    /// Non-fatal deficiencies, in the order they occurred.
    pub issues: Vec<PipelineIssue>,
    /// Validator output for the final artifact.
    pub conflicts: Vec<RuntimeConflict>,
    pub transitions: Vec<TransitionRecord>,
    pub discovery_session: DiscoverySession,
    pub used_legacy_design: bool,
    pub used_legacy_build: bool,
    pub elapsed: Duration,
}

impl GenerationResult {
    pub fn routed(&self) -> bool {
        self.context.routed
    }

    pub fn issues_of(&self, kind: IssueKind) -> impl Iterator<Item = &PipelineIssue> {
        self.issues.iter().filter(move |i| i.kind == kind)
    }
}

struct Outcome {
    requirements: Requirements,
    context: DataContext,
    design: DesignSpec,
    artifact: Artifact,
    issues: Vec<PipelineIssue>,
    conflicts: Vec<RuntimeConflict>,
    used_legacy_design: bool,
    used_legacy_build: bool,
}

/// Where the validator materializes artifacts.
enum BuildDir {
    Fixed(PathBuf),
    Temp(TempDir),
}

impl BuildDir {
    fn create(root: Option<&Path>, session: &SessionId) -> Result<Self> {
        match root {
            Some(root) => {
                let dir = root.join(session.to_string());
                std::fs::create_dir_all(&dir).map_err(|e| GenPipeError::io(&dir, e))?;
                Ok(Self::Fixed(dir))
            }
            None => tempfile::Builder::new()
                .prefix("genpipe-build-")
                .tempdir()
                .map(Self::Temp)
                .map_err(|e| GenPipeError::io(std::env::temp_dir(), e)),
        }
    }

    fn path(&self) -> &Path {
        match self {
            Self::Fixed(path) => path,
            Self::Temp(dir) => dir.path(),
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Drives one generation session. Build with [`Orchestrator::new`] and the
/// `with_*` methods, then call [`Orchestrator::run`] once.
pub struct Orchestrator {
    router: DomainRouter,
    discovery: DiscoveryClient,
    tracker: DiscoveryTracker,
    knowledge: Arc<KnowledgeAssembler>,
    design_stage: Option<Arc<dyn DesignStage>>,
    build_stage: Option<Arc<dyn BuildStage>>,
    legacy: Arc<dyn LegacyPath>,
    evaluator: Arc<dyn Evaluator>,
    policy: Arc<dyn DecisionPolicy>,
    validator: Validator,
    timeouts: Timeouts,
    sink: Option<Arc<dyn SessionSink>>,
    cancel: CancellationToken,
    available: Vec<SourceRef>,
    discovery_options: DiscoveryOptions,
    enable_boost: bool,
    build_root: Option<PathBuf>,
}

impl Orchestrator {
    /// Without stages configured, every generation goes through the legacy path.
    pub fn new(router: DomainRouter, discovery: DiscoveryClient) -> Self {
        let tracker = DiscoveryTracker::new();
        let timeouts = Timeouts::default();
        Self {
            router,
            discovery: discovery.with_tracker(tracker.clone()),
            tracker,
            knowledge: Arc::new(KnowledgeAssembler::new(
                Arc::new(StaticKnowledgeStore::builtin()),
                timeouts.knowledge,
            )),
            design_stage: None,
            build_stage: None,
            legacy: Arc::new(LegacyGenerator),
            evaluator: Arc::new(StructuralEvaluator),
            policy: Arc::new(DefaultPolicy),
            validator: Validator::new(ValidatorOptions::without_compiler()),
            timeouts,
            sink: None,
            cancel: CancellationToken::new(),
            available: Vec::new(),
            discovery_options: DiscoveryOptions::default(),
            enable_boost: false,
            build_root: None,
        }
    }

    /// Sources the router may choose from.
    pub fn with_available_sources(mut self, sources: Vec<SourceRef>) -> Self {
        self.available = sources;
        self
    }

    pub fn with_discovery_options(mut self, options: DiscoveryOptions) -> Self {
        self.discovery_options = options;
        self
    }

    pub fn with_knowledge(mut self, knowledge: Arc<KnowledgeAssembler>) -> Self {
        self.knowledge = knowledge;
        self
    }

    pub fn with_design_stage(mut self, stage: Arc<dyn DesignStage>) -> Self {
        self.design_stage = Some(stage);
        self
    }

    pub fn with_build_stage(mut self, stage: Arc<dyn BuildStage>) -> Self {
        self.build_stage = Some(stage);
        self
    }

    pub fn with_legacy(mut self, legacy: Arc<dyn LegacyPath>) -> Self {
        self.legacy = legacy;
        self
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn with_policy(mut self, policy: Arc<dyn DecisionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn SessionSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_boost(mut self, enable: bool) -> Self {
        self.enable_boost = enable;
        self
    }

    /// Materialize artifacts under `root/<session>` instead of a temp dir.
    pub fn with_build_root(mut self, root: PathBuf) -> Self {
        self.build_root = Some(root);
        self
    }

    pub fn router(&self) -> &DomainRouter {
        &self.router
    }

    pub fn tracker(&self) -> &DiscoveryTracker {
        &self.tracker
    }

    pub fn knowledge(&self) -> &KnowledgeAssembler {
        &self.knowledge
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run one session.
    ///
    /// Stage failures, timeouts and poor evaluations never escape: they are
    /// decided on, retried or routed to the legacy path, and reported as
    /// issues. Only cancellation and a failing legacy path return `Err`.
    #[instrument(skip_all, fields(intent = %intent))]
    pub async fn run(&self, intent: &str, progress: &dyn ProgressReporter) -> Result<GenerationResult> {
        let started = Instant::now();
        let session = self.tracker.start_session(None);
        let mut machine = StateMachine::new();
        info!(%session, "generation session started");

        let outcome = self.drive(&session, intent, &mut machine, progress).await;

        let discovery_session = self.tracker.end_session();
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.persist(&discovery_session).await {
                warn!(%session, error = %e, "failed to persist discovery session");
            }
        }
        self.knowledge.clear_cache(&session);

        match outcome {
            Ok(out) => {
                let result = GenerationResult {
                    session_id: session,
                    requirements: out.requirements,
                    context: out.context,
                    design: out.design,
                    artifact: out.artifact,
                    issues: out.issues,
                    conflicts: out.conflicts,
                    transitions: machine.into_transitions(),
                    discovery_session,
                    used_legacy_design: out.used_legacy_design,
                    used_legacy_build: out.used_legacy_build,
                    elapsed: started.elapsed(),
                };
                info!(
                    session = %result.session_id,
                    files = result.artifact.files.len(),
                    issues = result.issues.len(),
                    conflicts = result.conflicts.len(),
                    legacy_design = result.used_legacy_design,
                    legacy_build = result.used_legacy_build,
                    elapsed_ms = result.elapsed.as_millis() as u64,
                    "generation session completed"
                );
                progress.done(&result);
                Ok(result)
            }
            Err(e) => {
                machine.fail(0);
                warn!(%session, error = %e, state = %machine.current(), "generation session ended without an artifact");
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        session: &SessionId,
        intent: &str,
        machine: &mut StateMachine,
        progress: &dyn ProgressReporter,
    ) -> Result<Outcome> {
        let mut issues = Vec::new();

        self.enter(machine, OrchestratorState::ParsingRequirements, 0, progress)?;
        let requirements = Requirements::parse(intent);
        debug!(
            keywords = ?requirements.keywords,
            wanted = ?requirements.wanted_components,
            "requirements parsed"
        );

        self.enter(machine, OrchestratorState::DiscoveringData, 0, progress)?;
        let context = self.discover(intent, &mut issues).await?;

        self.enter(machine, OrchestratorState::FetchingKnowledge, 0, progress)?;
        let bundle = self
            .cancellable(self.knowledge.assemble(session, &context, self.enable_boost, true))
            .await?;
        for gap in &bundle.gaps {
            issues.push(PipelineIssue::new(
                IssueKind::DiscoveryGap,
                None,
                format!("no {gap} knowledge available"),
            ));
        }

        self.enter(machine, OrchestratorState::AnalyzingContext, 0, progress)?;
        for source in context.sources.values() {
            if source.available_in.is_empty() {
                issues.push(PipelineIssue::new(
                    IssueKind::DiscoveryGap,
                    None,
                    format!("source '{}' has no populated location", source.id),
                ));
            }
        }

        let (design, used_legacy_design) = self
            .design_loop(&requirements, &context, &bundle, machine, &mut issues, progress)
            .await?;
        let design_eval = self.evaluator.evaluate_design(&design, &context);

        self.enter(machine, OrchestratorState::BuildingSession, 0, progress)?;
        let build_dir = match BuildDir::create(self.build_root.as_deref(), session) {
            Ok(dir) => Some(dir),
            Err(e) => {
                warn!(error = %e, "no build directory, type check will be skipped");
                issues.push(PipelineIssue::new(
                    IssueKind::ValidationConflict,
                    Some(Stage::Build),
                    format!("build directory unavailable: {e}"),
                ));
                None
            }
        };
        let mut extra = Map::new();
        extra.insert("sessionId".into(), json!(session.to_string()));
        extra.insert("title".into(), json!(design.title));
        let view = view_for(&bundle, Stage::Build, extra);

        let (artifact, conflicts, used_legacy_build) = self
            .build_loop(&design, &design_eval, &view, build_dir.as_ref(), machine, &mut issues, progress)
            .await?;
        for conflict in &conflicts {
            issues.push(PipelineIssue::new(
                IssueKind::ValidationConflict,
                Some(Stage::Build),
                conflict.to_string(),
            ));
        }

        self.enter(machine, OrchestratorState::Completed, 0, progress)?;
        Ok(Outcome {
            requirements,
            context,
            design,
            artifact,
            issues,
            conflicts,
            used_legacy_design,
            used_legacy_build,
        })
    }

    // -----------------------------------------------------------------------
    // Discovery
    // -----------------------------------------------------------------------

    async fn discover(&self, intent: &str, issues: &mut Vec<PipelineIssue>) -> Result<DataContext> {
        let mut context = DataContext::new(intent);

        let report = match self.router.route(intent, &self.available) {
            Some(routed) => {
                context.routed = true;
                self.cancellable(self.discovery.describe_routed(intent, &routed, &self.discovery_options))
                    .await?
            }
            None => {
                self.cancellable(self.discovery.discover(intent, &self.discovery_options))
                    .await?
            }
        };

        if report.is_empty() {
            issues.push(PipelineIssue::new(
                IssueKind::DiscoveryGap,
                None,
                format!("no sources found for '{intent}'"),
            ));
        }
        for source in &report.sources {
            if let Some(schema) = &source.schema {
                context.schemas.insert(source.candidate.id.clone(), schema.clone());
            }
            if source.descriptor.is_none() {
                issues.push(PipelineIssue::new(
                    IssueKind::DiscoveryGap,
                    None,
                    format!("no usable descriptor for source '{}'", source.candidate.id),
                ));
            }
        }

        context.sources = adapter::normalize(&report.descriptors());
        info!(
            routed = context.routed,
            sources = context.sources.len(),
            schemas = context.schemas.len(),
            "data context ready"
        );
        Ok(context)
    }

    // -----------------------------------------------------------------------
    // Design loop
    // -----------------------------------------------------------------------

    async fn design_loop(
        &self,
        requirements: &Requirements,
        context: &DataContext,
        bundle: &Arc<KnowledgeBundle>,
        machine: &mut StateMachine,
        issues: &mut Vec<PipelineIssue>,
        progress: &dyn ProgressReporter,
    ) -> Result<(DesignSpec, bool)> {
        let Some(stage) = &self.design_stage else {
            self.enter(machine, OrchestratorState::Designing, 1, progress)?;
            return Ok((self.legacy_design(requirements, context)?, true));
        };

        let view = view_for(bundle, Stage::Design, Map::new());
        let mut output: Option<DesignSpec> = None;
        let mut last_error: Option<String> = None;
        let mut attempt = 0;

        while attempt < MAX_DESIGN_ITERATIONS {
            attempt += 1;
            self.check_cancelled()?;
            self.enter(machine, OrchestratorState::Designing, attempt, progress)?;
            progress.attempt(Stage::Design, attempt, MAX_DESIGN_ITERATIONS);

            let design = match self
                .guarded("design", self.timeouts.design, stage.design(requirements, &view))
                .await
            {
                Ok(design) => design,
                Err(GenPipeError::Cancelled) => return Err(GenPipeError::Cancelled),
                Err(e) => {
                    warn!(attempt, error = %e, "design stage failed");
                    issues.push(PipelineIssue::from_error(Stage::Design, &e));
                    machine.fail(attempt);
                    let message = e.to_string();
                    let action = self
                        .policy
                        .decide(OrchestratorState::Error, None, None, Some(&message));
                    last_error = Some(message);
                    match action {
                        ActionKind::FallbackToLegacy => {
                            self.enter(machine, OrchestratorState::Designing, attempt, progress)?;
                            return Ok((self.legacy_design(requirements, context)?, true));
                        }
                        ActionKind::Abort => break,
                        _ => continue,
                    }
                }
            };

            let eval = self.evaluator.evaluate_design(&design, context);
            if eval.satisfactory {
                info!(attempt, components = design.components.len(), "design accepted");
                return Ok((design, false));
            }
            issues.push(evaluation_issue(Stage::Design, &eval));

            let action = self.policy.decide(
                OrchestratorState::Designing,
                Some(&eval),
                None,
                last_error.as_deref(),
            );
            info!(attempt, %action, issues = eval.issues.len(), "design unsatisfactory");
            match action {
                ActionKind::RetryStage if attempt < MAX_DESIGN_ITERATIONS => {
                    output = Some(design);
                }
                ActionKind::FallbackToLegacy => {
                    let legacy = self.legacy_design(requirements, context)?;
                    let recheck = self.evaluator.evaluate_design(&legacy, context);
                    if !recheck.satisfactory {
                        issues.push(evaluation_issue(Stage::Design, &recheck));
                    }
                    return Ok((legacy, true));
                }
                _ => return Ok((design, false)),
            }
        }

        match output {
            Some(design) => {
                info!(attempt, "design budget spent, keeping last output");
                Ok((design, false))
            }
            None => {
                info!(attempt, "design budget spent without output, using legacy design");
                if machine.current() == OrchestratorState::Error {
                    self.enter(machine, OrchestratorState::Designing, attempt, progress)?;
                }
                Ok((self.legacy_design(requirements, context)?, true))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Build loop
    // -----------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn build_loop(
        &self,
        design: &DesignSpec,
        design_eval: &EvaluationResult,
        view: &KnowledgeView,
        build_dir: Option<&BuildDir>,
        machine: &mut StateMachine,
        issues: &mut Vec<PipelineIssue>,
        progress: &dyn ProgressReporter,
    ) -> Result<(Artifact, Vec<RuntimeConflict>, bool)> {
        let Some(stage) = &self.build_stage else {
            self.enter(machine, OrchestratorState::GeneratingCode, 1, progress)?;
            let artifact = self.legacy_build(design)?;
            let conflicts = self.validate(&artifact, build_dir, "legacy").await?;
            return Ok((artifact, conflicts, true));
        };

        let mut output: Option<(Artifact, Vec<RuntimeConflict>)> = None;
        let mut last_error: Option<String> = None;
        let mut attempt = 0;

        while attempt < MAX_BUILD_ATTEMPTS {
            attempt += 1;
            self.check_cancelled()?;
            self.enter(machine, OrchestratorState::GeneratingCode, attempt, progress)?;
            progress.attempt(Stage::Build, attempt, MAX_BUILD_ATTEMPTS);

            let artifact = match self
                .guarded("build", self.timeouts.build, stage.build(design, view))
                .await
            {
                Ok(artifact) => artifact,
                Err(GenPipeError::Cancelled) => return Err(GenPipeError::Cancelled),
                Err(e) => {
                    warn!(attempt, error = %e, "build stage failed");
                    issues.push(PipelineIssue::from_error(Stage::Build, &e));
                    machine.fail(attempt);
                    let message = e.to_string();
                    let action = self.policy.decide(
                        OrchestratorState::Error,
                        Some(design_eval),
                        None,
                        Some(&message),
                    );
                    last_error = Some(message);
                    match action {
                        ActionKind::FallbackToLegacy => {
                            self.enter(machine, OrchestratorState::GeneratingCode, attempt, progress)?;
                            let artifact = self.legacy_build(design)?;
                            let conflicts = self.validate(&artifact, build_dir, "legacy").await?;
                            return Ok((artifact, conflicts, true));
                        }
                        ActionKind::Abort => break,
                        _ => continue,
                    }
                }
            };

            let conflicts = self
                .validate(&artifact, build_dir, &format!("attempt-{attempt}"))
                .await?;
            let eval = self.evaluator.evaluate_build(&artifact, design, &conflicts);
            if eval.satisfactory {
                info!(attempt, files = artifact.files.len(), "build accepted");
                return Ok((artifact, conflicts, false));
            }
            issues.push(evaluation_issue(Stage::Build, &eval));

            let action = self.policy.decide(
                OrchestratorState::GeneratingCode,
                Some(design_eval),
                Some(&eval),
                last_error.as_deref(),
            );
            info!(attempt, %action, issues = eval.issues.len(), "build unsatisfactory");
            match action {
                ActionKind::RetryStage if attempt < MAX_BUILD_ATTEMPTS => {
                    output = Some((artifact, conflicts));
                }
                ActionKind::FallbackToLegacy => {
                    let legacy = self.legacy_build(design)?;
                    let conflicts = self.validate(&legacy, build_dir, "legacy").await?;
                    let recheck = self.evaluator.evaluate_build(&legacy, design, &conflicts);
                    if !recheck.satisfactory {
                        issues.push(evaluation_issue(Stage::Build, &recheck));
                    }
                    return Ok((legacy, conflicts, true));
                }
                _ => return Ok((artifact, conflicts, false)),
            }
        }

        match output {
            Some((artifact, conflicts)) => {
                info!(attempt, "build budget spent, keeping last output");
                Ok((artifact, conflicts, false))
            }
            None => {
                info!(attempt, "build budget spent without output, using legacy build");
                if machine.current() == OrchestratorState::Error {
                    self.enter(machine, OrchestratorState::GeneratingCode, attempt, progress)?;
                }
                let artifact = self.legacy_build(design)?;
                let conflicts = self.validate(&artifact, build_dir, "legacy").await?;
                Ok((artifact, conflicts, true))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn enter(
        &self,
        machine: &mut StateMachine,
        to: OrchestratorState,
        attempt: u32,
        progress: &dyn ProgressReporter,
    ) -> Result<()> {
        machine.transition(to, attempt)?;
        progress.phase(to);
        Ok(())
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(GenPipeError::Cancelled);
        }
        Ok(())
    }

    /// Race `fut` against cancellation.
    async fn cancellable<T>(&self, fut: impl Future<Output = T>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(GenPipeError::Cancelled),
            out = fut => Ok(out),
        }
    }

    /// Race `fut` against cancellation and a time budget.
    async fn guarded<T>(
        &self,
        operation: &str,
        budget: Duration,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match self.cancellable(tokio::time::timeout(budget, fut)).await? {
            Ok(result) => result,
            Err(_) => Err(GenPipeError::timeout(operation, budget)),
        }
    }

    async fn validate(
        &self,
        artifact: &Artifact,
        build_dir: Option<&BuildDir>,
        label: &str,
    ) -> Result<Vec<RuntimeConflict>> {
        let dir = match build_dir {
            Some(dir) => dir.path().join(label),
            None => std::env::temp_dir().join(format!("genpipe-unavailable-{label}")),
        };
        self.cancellable(self.validator.validate(&artifact.files, &dir)).await
    }

    fn legacy_design(&self, requirements: &Requirements, context: &DataContext) -> Result<DesignSpec> {
        info!("falling back to legacy design");
        self.legacy.design(requirements, context).map_err(fatal("design"))
    }

    fn legacy_build(&self, design: &DesignSpec) -> Result<Artifact> {
        info!("falling back to legacy build");
        self.legacy.build(design).map_err(fatal("build"))
    }
}

fn fatal(stage: &'static str) -> impl Fn(GenPipeError) -> GenPipeError {
    move |e| match e {
        GenPipeError::Fatal(_) => e,
        other => GenPipeError::Fatal(format!("legacy {stage} failed: {other}")),
    }
}

fn evaluation_issue(stage: Stage, eval: &EvaluationResult) -> PipelineIssue {
    PipelineIssue::new(IssueKind::EvaluationFailure, Some(stage), eval.issues.join("; "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use genpipe_discovery::StaticCatalog;
    use genpipe_shared::{RawSourceDescriptor, RouterConfig};

    use crate::pipeline::SilentProgress;
    use crate::stages::{ComponentKind, ComponentSpec, Origin};

    const PERMIAN: &str = "oil production in the Permian basin";

    fn catalog() -> StaticCatalog {
        let text = std::fs::read_to_string("../../../fixtures/sources/descriptors.fixture.json")
            .expect("read descriptor fixture");
        let raw: BTreeMap<String, RawSourceDescriptor> =
            serde_json::from_str(&text).expect("parse fixture");
        StaticCatalog::new(raw)
    }

    fn orchestrator() -> Orchestrator {
        let catalog = catalog();
        let available = catalog.sources();
        let catalog = Arc::new(catalog);
        let router = DomainRouter::new(&RouterConfig::default()).unwrap();
        Orchestrator::new(router, DiscoveryClient::new(catalog.clone(), catalog))
            .with_available_sources(available)
    }

    fn rrc_design() -> DesignSpec {
        DesignSpec {
            title: "Permian".into(),
            components: vec![ComponentSpec {
                name: "RrcTable".into(),
                kind: ComponentKind::Table,
                source_id: Some("rrc".into()),
                fields: vec![],
            }],
            origin: Origin::Primary,
        }
    }

    fn empty_design() -> DesignSpec {
        DesignSpec {
            title: "empty".into(),
            components: vec![],
            origin: Origin::Primary,
        }
    }

    /// Replays a script, then keeps failing.
    #[derive(Default)]
    struct ScriptedDesign {
        script: Mutex<VecDeque<Result<DesignSpec>>>,
        calls: AtomicUsize,
    }

    impl ScriptedDesign {
        fn new(script: Vec<Result<DesignSpec>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl DesignStage for ScriptedDesign {
        async fn design(&self, _: &Requirements, _: &KnowledgeView) -> Result<DesignSpec> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(GenPipeError::protocol("design", "model unavailable")))
        }
    }

    /// Builds real files for the design through the legacy templates.
    #[derive(Default)]
    struct TemplateBuild {
        calls: AtomicUsize,
        fail_first: usize,
    }

    #[async_trait]
    impl BuildStage for TemplateBuild {
        async fn build(&self, design: &DesignSpec, _: &KnowledgeView) -> Result<Artifact> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(GenPipeError::protocol("build", "model returned 500"));
            }
            let mut artifact = LegacyGenerator.build(design)?;
            artifact.origin = Origin::Primary;
            Ok(artifact)
        }
    }

    struct SlowDesign;

    #[async_trait]
    impl DesignStage for SlowDesign {
        async fn design(&self, _: &Requirements, _: &KnowledgeView) -> Result<DesignSpec> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(rrc_design())
        }
    }

    /// Cancels the session from inside the stage, then hangs.
    struct CancellingDesign(CancellationToken);

    #[async_trait]
    impl DesignStage for CancellingDesign {
        async fn design(&self, _: &Requirements, _: &KnowledgeView) -> Result<DesignSpec> {
            self.0.cancel();
            std::future::pending().await
        }
    }

    /// Retries on errors, falls back on any unsatisfactory evaluation.
    struct FallbackOnEvaluation;

    impl DecisionPolicy for FallbackOnEvaluation {
        fn decide(
            &self,
            state: OrchestratorState,
            _: Option<&EvaluationResult>,
            _: Option<&EvaluationResult>,
            _: Option<&str>,
        ) -> ActionKind {
            match state {
                OrchestratorState::Error => ActionKind::RetryStage,
                _ => ActionKind::FallbackToLegacy,
            }
        }
    }

    #[derive(Default)]
    struct MemorySink {
        sessions: Mutex<Vec<DiscoverySession>>,
    }

    #[async_trait]
    impl SessionSink for MemorySink {
        async fn persist(&self, session: &DiscoverySession) -> Result<()> {
            self.sessions.lock().unwrap().push(session.clone());
            Ok(())
        }
    }

    fn count_state(result: &GenerationResult, state: OrchestratorState) -> usize {
        result.transitions.iter().filter(|t| t.to == state).count()
    }

    #[tokio::test]
    async fn primary_path_completes_without_legacy() {
        let design = Arc::new(ScriptedDesign::new(vec![Ok(rrc_design())]));
        let build = Arc::new(TemplateBuild::default());
        let orch = orchestrator()
            .with_design_stage(design.clone())
            .with_build_stage(build.clone());

        let result = orch.run(PERMIAN, &SilentProgress).await.unwrap();

        assert!(result.routed());
        assert_eq!(result.context.sources.keys().collect::<Vec<_>>(), vec!["rrc"]);
        assert_eq!(result.design, rrc_design());
        assert_eq!(result.artifact.origin, Origin::Primary);
        assert!(!result.used_legacy_design && !result.used_legacy_build);
        assert!(result.conflicts.is_empty());
        assert_eq!(
            result.transitions.last().map(|t| t.to),
            Some(OrchestratorState::Completed)
        );
        assert_eq!(design.calls.load(Ordering::SeqCst), 1);
        assert_eq!(build.calls.load(Ordering::SeqCst), 1);
        assert!(orch.knowledge().cache().is_empty());
        assert!(orch.tracker().active_session().is_none());
    }

    #[tokio::test]
    async fn always_failing_design_terminates_with_legacy_output() {
        let design = Arc::new(ScriptedDesign::default());
        let orch = orchestrator().with_design_stage(design.clone());

        let result = orch.run(PERMIAN, &SilentProgress).await.unwrap();

        assert_eq!(design.calls.load(Ordering::SeqCst), MAX_DESIGN_ITERATIONS as usize);
        assert!(result.used_legacy_design);
        assert_eq!(result.design.origin, Origin::Legacy);
        assert!(!result.design.components.is_empty());
        assert_eq!(result.issues_of(IssueKind::ProtocolError).count(), 3);
        assert_eq!(count_state(&result, OrchestratorState::Error), 3);
        assert!(!result.artifact.files.is_empty());
    }

    #[tokio::test]
    async fn throw_then_unsatisfactory_then_fallback_yields_legacy_design() {
        let design = Arc::new(ScriptedDesign::new(vec![
            Err(GenPipeError::protocol("design", "boom")),
            Ok(empty_design()),
        ]));
        let orch = orchestrator()
            .with_design_stage(design.clone())
            .with_policy(Arc::new(FallbackOnEvaluation));

        let result = orch.run(PERMIAN, &SilentProgress).await.unwrap();

        let expected = LegacyGenerator
            .design(&Requirements::parse(PERMIAN), &result.context)
            .unwrap();
        assert_eq!(result.design, expected);
        assert_eq!(design.calls.load(Ordering::SeqCst), 2);
        assert_eq!(result.issues_of(IssueKind::EvaluationFailure).count(), 1);
    }

    #[tokio::test]
    async fn unsatisfactory_design_is_retried_then_accepted() {
        let design = Arc::new(ScriptedDesign::new(vec![
            Ok(empty_design()),
            Ok(empty_design()),
            Ok(empty_design()),
        ]));
        let orch = orchestrator().with_design_stage(design.clone());

        let result = orch.run(PERMIAN, &SilentProgress).await.unwrap();

        assert_eq!(design.calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.design, empty_design());
        assert!(!result.used_legacy_design);
        assert_eq!(result.issues_of(IssueKind::EvaluationFailure).count(), 3);
    }

    #[tokio::test]
    async fn failing_build_is_bounded_and_falls_back() {
        let design = Arc::new(ScriptedDesign::new(vec![Ok(rrc_design())]));
        let build = Arc::new(TemplateBuild {
            fail_first: usize::MAX,
            ..Default::default()
        });
        let orch = orchestrator()
            .with_design_stage(design)
            .with_build_stage(build.clone());

        let result = orch.run(PERMIAN, &SilentProgress).await.unwrap();

        assert_eq!(build.calls.load(Ordering::SeqCst), MAX_BUILD_ATTEMPTS as usize);
        assert!(result.used_legacy_build);
        assert_eq!(result.artifact.origin, Origin::Legacy);
        assert!(result.artifact.has_file_for("RrcTable"));
        assert_eq!(
            result.transitions.last().map(|t| (t.from, t.to)),
            Some((OrchestratorState::GeneratingCode, OrchestratorState::Completed))
        );
    }

    #[tokio::test]
    async fn free_form_component_names_still_get_a_legacy_artifact() {
        let spaced = DesignSpec {
            title: "Permian".into(),
            components: vec![ComponentSpec {
                name: "Production Chart".into(),
                kind: ComponentKind::Chart,
                source_id: Some("rrc".into()),
                fields: vec![],
            }],
            origin: Origin::Primary,
        };
        let design = Arc::new(ScriptedDesign::new(vec![Ok(spaced.clone())]));
        let build = Arc::new(TemplateBuild {
            fail_first: usize::MAX,
            ..Default::default()
        });
        let orch = orchestrator()
            .with_design_stage(design)
            .with_build_stage(build.clone());

        let result = orch.run(PERMIAN, &SilentProgress).await.unwrap();

        assert_eq!(result.design, spaced);
        assert_eq!(build.calls.load(Ordering::SeqCst), MAX_BUILD_ATTEMPTS as usize);
        assert!(result.used_legacy_build);
        assert!(result.artifact.files.contains_key("components/ProductionChart.tsx"));
        assert!(result.artifact.has_file_for("Production Chart"));
        assert!(result.conflicts.is_empty());
        assert_eq!(result.issues_of(IssueKind::EvaluationFailure).count(), 0);
    }

    #[tokio::test]
    async fn build_recovers_on_second_attempt() {
        let design = Arc::new(ScriptedDesign::new(vec![Ok(rrc_design())]));
        let build = Arc::new(TemplateBuild {
            fail_first: 1,
            ..Default::default()
        });
        let orch = orchestrator()
            .with_design_stage(design)
            .with_build_stage(build.clone());

        let result = orch.run(PERMIAN, &SilentProgress).await.unwrap();

        assert_eq!(build.calls.load(Ordering::SeqCst), 2);
        assert!(!result.used_legacy_build);
        assert_eq!(result.issues_of(IssueKind::ProtocolError).count(), 1);
    }

    #[tokio::test]
    async fn stage_timeouts_are_stage_failures() {
        let orch = orchestrator()
            .with_design_stage(Arc::new(SlowDesign))
            .with_timeouts(Timeouts {
                design: Duration::from_millis(20),
                ..Timeouts::default()
            });

        let result = orch.run(PERMIAN, &SilentProgress).await.unwrap();

        assert_eq!(result.issues_of(IssueKind::Timeout).count(), 3);
        assert!(result.used_legacy_design);
    }

    #[tokio::test]
    async fn cancellation_still_seals_and_persists_the_session() {
        let token = CancellationToken::new();
        let sink = Arc::new(MemorySink::default());
        let orch = orchestrator()
            .with_design_stage(Arc::new(CancellingDesign(token.clone())))
            .with_cancellation(token)
            .with_sink(sink.clone());

        let err = orch.run(PERMIAN, &SilentProgress).await.unwrap_err();

        assert!(matches!(err, GenPipeError::Cancelled));
        let sessions = sink.sessions.lock().unwrap();
        assert_eq!(sessions.len(), 1);
        assert!(sessions[0].total_attempts() > 0);
        assert!(orch.knowledge().cache().is_empty());
        assert!(orch.tracker().active_session().is_none());
    }

    #[tokio::test]
    async fn cancelled_before_start_runs_nothing() {
        let token = CancellationToken::new();
        token.cancel();
        let design = Arc::new(ScriptedDesign::new(vec![Ok(rrc_design())]));
        let orch = orchestrator()
            .with_design_stage(design.clone())
            .with_cancellation(token);

        assert!(matches!(
            orch.run(PERMIAN, &SilentProgress).await,
            Err(GenPipeError::Cancelled)
        ));
        assert_eq!(design.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unrouted_intent_uses_semantic_discovery() {
        let orch = orchestrator();
        let result = orch
            .run("FracFocus chemical disclosures table", &SilentProgress)
            .await
            .unwrap();

        assert!(!result.routed());
        assert!(result.context.sources.contains_key("fracfocus"));
        assert!(result.used_legacy_design && result.used_legacy_build);
    }

    #[tokio::test]
    async fn empty_discovery_is_reported_as_gap() {
        let orch = orchestrator();
        let result = orch.run("zzz qqq", &SilentProgress).await.unwrap();

        assert!(result.context.sources.is_empty());
        assert!(result.issues_of(IssueKind::DiscoveryGap).count() >= 1);
        assert_eq!(result.design.components[0].name, "Summary");
    }

    #[tokio::test]
    async fn sessions_are_persisted_to_storage() {
        let path = std::env::temp_dir().join(format!("genpipe_test_{}.db", uuid::Uuid::now_v7()));
        let storage = Arc::new(Storage::open(&path).await.unwrap());
        let orch = orchestrator().with_sink(storage.clone());

        let result = orch.run(PERMIAN, &SilentProgress).await.unwrap();

        assert_eq!(storage.session_count().await.unwrap(), 1);
        let stored = storage
            .get_session(result.discovery_session.id())
            .await
            .unwrap()
            .expect("session stored");
        assert_eq!(stored.total_attempts(), result.discovery_session.total_attempts());
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn build_root_receives_materialized_files() {
        let root = tempfile::tempdir().unwrap();
        let orch = orchestrator()
            .with_build_root(root.path().to_path_buf())
            .with_validator(Validator::new(ValidatorOptions {
                compiler_command: vec!["genpipe-no-such-compiler-xyz".into()],
                compiler_enabled: true,
                compiler_timeout: Duration::from_secs(5),
            }));

        let result = orch.run(PERMIAN, &SilentProgress).await.unwrap();

        let app = root
            .path()
            .join(result.session_id.to_string())
            .join("legacy")
            .join("App.tsx");
        assert!(app.exists());
    }

    #[tokio::test]
    async fn every_recorded_transition_is_legal() {
        let design = Arc::new(ScriptedDesign::new(vec![
            Err(GenPipeError::protocol("design", "boom")),
            Ok(rrc_design()),
        ]));
        let orch = orchestrator()
            .with_design_stage(design)
            .with_build_stage(Arc::new(TemplateBuild {
                fail_first: 1,
                ..Default::default()
            }));

        let result = orch.run(PERMIAN, &SilentProgress).await.unwrap();

        assert_eq!(result.transitions[0].from, OrchestratorState::Idle);
        for t in &result.transitions {
            assert!(state::is_legal_transition(t.from, t.to), "{} -> {}", t.from, t.to);
        }
    }
}
