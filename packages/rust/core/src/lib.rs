//! Generation pipeline orchestration for genpipe.
//!
//! This crate turns an intent into a validated artifact: it normalizes the
//! discovered sources ([`adapter`]), assembles per-session knowledge
//! ([`knowledge`]), drives the design and build stages through a bounded,
//! state-machine-based retry loop ([`orchestrator`]) with a deterministic
//! fallback ([`legacy`]), and checks the result ([`validator`]).

pub mod adapter;
pub mod knowledge;
pub mod legacy;
pub mod orchestrator;
pub mod pipeline;
pub mod remote;
pub mod stages;
pub mod validator;

pub use adapter::{NormalizeOutcome, normalize, normalize_one, normalize_raw};
pub use knowledge::{
    DataContext, KnowledgeAssembler, KnowledgeBundle, KnowledgeCache, KnowledgeCategory,
    KnowledgeStore, KnowledgeView, StaticKnowledgeStore, view_for,
};
pub use legacy::{LegacyGenerator, LegacyPath};
pub use orchestrator::{
    DecisionPolicy, DefaultPolicy, GenerationResult, MAX_BUILD_ATTEMPTS, MAX_DESIGN_ITERATIONS,
    Orchestrator, OrchestratorState, SessionSink, StateMachine, TransitionRecord,
};
pub use pipeline::{GenerateRequest, ProgressReporter, SilentProgress, generate, load_descriptors};
pub use remote::{HttpGenerationStage, HttpKnowledgeStore};
pub use stages::{
    ActionKind, Artifact, BuildStage, ComponentKind, ComponentSpec, DesignSpec, DesignStage,
    EvaluationResult, Evaluator, IssueKind, Origin, PipelineIssue, Requirements, Stage,
    StructuralEvaluator,
};
pub use validator::{ConflictKind, RuntimeConflict, Severity, Validator, ValidatorOptions};
