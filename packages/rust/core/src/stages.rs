//! Generation stage contracts, their inputs and outputs, and evaluation.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use genpipe_shared::{GenPipeError, Result};

use crate::knowledge::{DataContext, KnowledgeView};
use crate::validator::{RuntimeConflict, Severity};

/// File stems accepted as an artifact's entry point.
pub const ENTRY_STEMS: [&str; 3] = ["App", "index", "main"];

/// One of the two generation phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Design,
    Build,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Design => f.write_str("design"),
            Self::Build => f.write_str("build"),
        }
    }
}

// ---------------------------------------------------------------------------
// Requirements
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    Filter,
    Metric,
    Chart,
    Map,
    Table,
}

impl ComponentKind {
    pub const ALL: [ComponentKind; 5] = [
        ComponentKind::Filter,
        ComponentKind::Metric,
        ComponentKind::Chart,
        ComponentKind::Map,
        ComponentKind::Table,
    ];

    pub fn suffix(&self) -> &'static str {
        match self {
            Self::Filter => "Filter",
            Self::Metric => "Metric",
            Self::Chart => "Chart",
            Self::Map => "Map",
            Self::Table => "Table",
        }
    }

    fn cue(&self) -> &'static Regex {
        match self {
            Self::Filter => &FILTER_CUE,
            Self::Metric => &METRIC_CUE,
            Self::Chart => &CHART_CUE,
            Self::Map => &MAP_CUE,
            Self::Table => &TABLE_CUE,
        }
    }
}

static FILTER_CUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:filters?|filtered|compare|select(?:or)?)\b").expect("valid regex"));
static METRIC_CUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:totals?|kpis?|metrics?|summary|count)\b").expect("valid regex"));
static CHART_CUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:charts?|graphs?|plots?|trends?|over\s+time|timeline)\b").expect("valid regex")
});
static MAP_CUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:maps?|geographic|spatial|county|counties)\b").expect("valid regex")
});
static TABLE_CUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:tables?|list|breakdown|rows)\b").expect("valid regex"));

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "from", "into", "show", "me", "of", "in", "by", "per", "on",
    "a", "an", "to", "all", "each", "what", "how",
];

/// Deterministic reading of an intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requirements {
    pub intent: String,
    /// Lowercase content words, first occurrence order.
    pub keywords: Vec<String>,
    /// Component kinds the intent asks for, in page order.
    pub wanted_components: Vec<ComponentKind>,
}

impl Requirements {
    pub fn parse(intent: &str) -> Self {
        let mut seen = BTreeSet::new();
        let keywords = intent
            .split(|c: char| !c.is_alphanumeric())
            .map(str::to_lowercase)
            .filter(|w| w.len() > 2 && !STOPWORDS.contains(&w.as_str()))
            .filter(|w| seen.insert(w.clone()))
            .collect();

        let wanted_components = ComponentKind::ALL
            .into_iter()
            .filter(|kind| kind.cue().is_match(intent))
            .collect();

        Self {
            intent: intent.trim().to_string(),
            keywords,
            wanted_components,
        }
    }
}

// ---------------------------------------------------------------------------
// Stage outputs
// ---------------------------------------------------------------------------

/// Which path produced an output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Primary,
    Legacy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentSpec {
    pub name: String,
    pub kind: ComponentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(default)]
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesignSpec {
    pub title: String,
    pub components: Vec<ComponentSpec>,
    #[serde(default = "primary")]
    pub origin: Origin,
}

fn primary() -> Origin {
    Origin::Primary
}

/// Generated files, keyed by relative path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub files: BTreeMap<String, String>,
    #[serde(default = "primary")]
    pub origin: Origin,
}

impl Artifact {
    /// First file whose stem is an entry-point name.
    pub fn entry_file(&self) -> Option<&str> {
        self.files
            .keys()
            .find(|path| ENTRY_STEMS.contains(&file_stem(path)))
            .map(String::as_str)
    }

    /// Whether some file is named after the component, either literally or
    /// by its [`component_ident`].
    pub fn has_file_for(&self, component: &str) -> bool {
        let ident = component_ident(component);
        self.files
            .keys()
            .map(|path| file_stem(path))
            .any(|stem| stem == component || stem == ident)
    }
}

/// Basename without its last extension.
pub fn file_stem(path: &str) -> &str {
    let base = path.rsplit(['/', '\\']).next().unwrap_or(path);
    match base.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => base,
    }
}

/// `eagle_ford-wells` -> `EagleFordWells`. Only ASCII letters and digits survive.
pub fn pascal_case(s: &str) -> String {
    s.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}

/// A TypeScript identifier for a component name: `Production Chart` ->
/// `ProductionChart`, `2023_wells` -> `Data2023Wells`, `..` -> `Component`.
pub fn component_ident(name: &str) -> String {
    let ident = pascal_case(name);
    match ident.chars().next() {
        None => "Component".to_string(),
        Some(c) if c.is_ascii_digit() => format!("Data{ident}"),
        Some(_) => ident,
    }
}

// ---------------------------------------------------------------------------
// Stage contracts
// ---------------------------------------------------------------------------

/// Primary design stage. Must be safe to call repeatedly.
#[async_trait]
pub trait DesignStage: Send + Sync {
    async fn design(&self, requirements: &Requirements, knowledge: &KnowledgeView) -> Result<DesignSpec>;
}

/// Primary build stage. Must be safe to call repeatedly.
#[async_trait]
pub trait BuildStage: Send + Sync {
    async fn build(&self, design: &DesignSpec, knowledge: &KnowledgeView) -> Result<Artifact>;
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    RetryStage,
    FallbackToLegacy,
    Abort,
    Proceed,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::RetryStage => "retry_stage",
            Self::FallbackToLegacy => "fallback_to_legacy",
            Self::Abort => "abort",
            Self::Proceed => "proceed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub satisfactory: bool,
    pub issues: Vec<String>,
    pub can_retry: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<ActionKind>,
}

impl EvaluationResult {
    pub fn pass() -> Self {
        Self {
            satisfactory: true,
            issues: Vec::new(),
            can_retry: true,
            suggested_action: None,
        }
    }

    /// Satisfactory exactly when `issues` is empty.
    pub fn from_issues(issues: Vec<String>, can_retry: bool) -> Self {
        Self {
            satisfactory: issues.is_empty(),
            issues,
            can_retry,
            suggested_action: None,
        }
    }

    pub fn suggest(mut self, action: ActionKind) -> Self {
        self.suggested_action = Some(action);
        self
    }
}

/// Quality gate run after each stage output.
pub trait Evaluator: Send + Sync {
    fn evaluate_design(&self, design: &DesignSpec, context: &DataContext) -> EvaluationResult;

    fn evaluate_build(
        &self,
        artifact: &Artifact,
        design: &DesignSpec,
        conflicts: &[RuntimeConflict],
    ) -> EvaluationResult;
}

/// Structure-only checks; no external calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct StructuralEvaluator;

impl Evaluator for StructuralEvaluator {
    fn evaluate_design(&self, design: &DesignSpec, context: &DataContext) -> EvaluationResult {
        let mut issues = Vec::new();
        if design.components.is_empty() {
            issues.push("design has no components".to_string());
        }

        let mut names = BTreeSet::new();
        for component in &design.components {
            if !names.insert(component.name.as_str()) {
                issues.push(format!("duplicate component name '{}'", component.name));
            }
            match &component.source_id {
                Some(id) if !context.sources.contains_key(id) => issues.push(format!(
                    "component '{}' is bound to unknown source '{id}'",
                    component.name
                )),
                _ => {}
            }
        }

        EvaluationResult::from_issues(issues, true)
    }

    fn evaluate_build(
        &self,
        artifact: &Artifact,
        design: &DesignSpec,
        conflicts: &[RuntimeConflict],
    ) -> EvaluationResult {
        let mut issues = Vec::new();
        if artifact.files.is_empty() {
            issues.push("build produced no files".to_string());
        } else if artifact.entry_file().is_none() {
            issues.push("build has no entry file".to_string());
        }

        for component in &design.components {
            if !artifact.has_file_for(&component.name) {
                issues.push(format!("no file for component '{}'", component.name));
            }
        }

        issues.extend(
            conflicts
                .iter()
                .filter(|c| c.severity == Severity::Error)
                .map(RuntimeConflict::to_string),
        );

        EvaluationResult::from_issues(issues, true)
    }
}

// ---------------------------------------------------------------------------
// Issues attached to the final result
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    ProtocolError,
    EvaluationFailure,
    ValidationConflict,
    DiscoveryGap,
    Timeout,
}

/// A non-fatal deficiency reported alongside the artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineIssue {
    pub kind: IssueKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    pub message: String,
}

impl PipelineIssue {
    pub fn new(kind: IssueKind, stage: Option<Stage>, message: impl Into<String>) -> Self {
        Self {
            kind,
            stage,
            message: message.into(),
        }
    }

    /// Classify a stage failure.
    pub fn from_error(stage: Stage, err: &GenPipeError) -> Self {
        let kind = match err {
            GenPipeError::Timeout { .. } => IssueKind::Timeout,
            _ => IssueKind::ProtocolError,
        };
        Self::new(kind, Some(stage), err.to_string())
    }
}

impl fmt::Display for PipelineIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.stage {
            Some(stage) => write!(f, "[{stage}] {:?}: {}", self.kind, self.message),
            None => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::ConflictKind;

    fn component(name: &str, kind: ComponentKind, source: Option<&str>) -> ComponentSpec {
        ComponentSpec {
            name: name.into(),
            kind,
            source_id: source.map(String::from),
            fields: vec![],
        }
    }

    #[test]
    fn requirements_pick_up_component_cues() {
        let req = Requirements::parse("Show me oil production trends by county with a summary table");
        assert_eq!(
            req.wanted_components,
            vec![
                ComponentKind::Metric,
                ComponentKind::Chart,
                ComponentKind::Map,
                ComponentKind::Table
            ]
        );
        assert_eq!(req.keywords[0], "oil");
        assert!(!req.keywords.contains(&"me".to_string()));
        assert_eq!(
            req.keywords.iter().filter(|k| *k == "production").count(),
            1
        );
    }

    #[test]
    fn requirements_are_deterministic() {
        let a = Requirements::parse("gas wells over time");
        let b = Requirements::parse("gas wells over time");
        assert_eq!(a, b);
        assert_eq!(a.wanted_components, vec![ComponentKind::Chart]);
    }

    #[test]
    fn stems_and_pascal_case() {
        assert_eq!(file_stem("components/RrcTable.tsx"), "RrcTable");
        assert_eq!(file_stem("App.test.tsx"), "App.test");
        assert_eq!(file_stem(".env"), ".env");
        assert_eq!(pascal_case("eagle_ford-wells"), "EagleFordWells");
        assert_eq!(pascal_case("rrc"), "Rrc");
        assert_eq!(pascal_case("café sales"), "CafSales");
    }

    #[test]
    fn component_idents_are_valid_identifiers() {
        assert_eq!(component_ident("Production Chart"), "ProductionChart");
        assert_eq!(component_ident("RrcTable"), "RrcTable");
        assert_eq!(component_ident("2023_wells"), "Data2023Wells");
        assert_eq!(component_ident("../"), "Component");

        let artifact = Artifact {
            files: BTreeMap::from([("components/ProductionChart.tsx".to_string(), String::new())]),
            origin: Origin::Legacy,
        };
        assert!(artifact.has_file_for("Production Chart"));
        assert!(!artifact.has_file_for("Production Table"));
    }

    #[test]
    fn design_evaluation_flags_unknown_sources() {
        let design = DesignSpec {
            title: "t".into(),
            components: vec![component("EiaTable", ComponentKind::Table, Some("eia"))],
            origin: Origin::Primary,
        };
        let eval = StructuralEvaluator.evaluate_design(&design, &DataContext::new("x"));
        assert!(!eval.satisfactory);
        assert!(eval.issues[0].contains("unknown source 'eia'"));

        let empty = DesignSpec {
            title: "t".into(),
            components: vec![],
            origin: Origin::Primary,
        };
        assert!(!StructuralEvaluator.evaluate_design(&empty, &DataContext::new("x")).satisfactory);
    }

    #[test]
    fn build_evaluation_requires_entry_and_component_files() {
        let design = DesignSpec {
            title: "t".into(),
            components: vec![component("Summary", ComponentKind::Metric, None)],
            origin: Origin::Primary,
        };
        let mut artifact = Artifact {
            files: BTreeMap::from([("components/Summary.tsx".to_string(), String::new())]),
            origin: Origin::Primary,
        };
        let eval = StructuralEvaluator.evaluate_build(&artifact, &design, &[]);
        assert_eq!(eval.issues, vec!["build has no entry file".to_string()]);

        artifact.files.insert("App.tsx".into(), String::new());
        assert!(StructuralEvaluator.evaluate_build(&artifact, &design, &[]).satisfactory);

        let warning = RuntimeConflict {
            kind: ConflictKind::TypeSafety,
            severity: Severity::Warning,
            message: "suspicious".into(),
            file: "App.tsx".into(),
            line: Some(1),
        };
        assert!(StructuralEvaluator.evaluate_build(&artifact, &design, &[warning.clone()]).satisfactory);

        let error = RuntimeConflict {
            kind: ConflictKind::ImportError,
            severity: Severity::Error,
            ..warning
        };
        assert!(!StructuralEvaluator.evaluate_build(&artifact, &design, &[error]).satisfactory);
    }

    #[test]
    fn issue_classification() {
        let timeout = GenPipeError::timeout("design", std::time::Duration::from_secs(3));
        assert_eq!(PipelineIssue::from_error(Stage::Design, &timeout).kind, IssueKind::Timeout);
        let proto = GenPipeError::protocol("build", "500");
        assert_eq!(
            PipelineIssue::from_error(Stage::Build, &proto).kind,
            IssueKind::ProtocolError
        );
    }
}
