//! Application configuration for genpipe.
//!
//! User config lives at `~/.genpipe/genpipe.toml`.
//! CLI flags override config file values, which override defaults.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{GenPipeError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "genpipe.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".genpipe";

/// Default discovery-session database file name.
const SESSION_LOG_NAME: &str = "discovery-sessions.db";

// ---------------------------------------------------------------------------
// Config structs (matching genpipe.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Per-call timeouts and build directory.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Semantic discovery settings.
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Deterministic intent routing rules.
    #[serde(default)]
    pub router: RouterConfig,

    /// Post-generation validator settings.
    #[serde(default)]
    pub validator: ValidatorConfig,

    /// Discovery telemetry persistence.
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Remote generation stages.
    #[serde(default)]
    pub generation: GenerationConfig,

    /// Domain knowledge store.
    #[serde(default)]
    pub knowledge: KnowledgeConfig,
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Budget for one design-stage call.
    #[serde(default = "default_stage_timeout")]
    pub design_timeout_secs: u64,

    /// Budget for one build-stage call.
    #[serde(default = "default_stage_timeout")]
    pub build_timeout_secs: u64,

    /// Budget for one knowledge-store fetch.
    #[serde(default = "default_short_timeout")]
    pub knowledge_timeout_secs: u64,

    /// Budget for one discovery RPC (search, schema, status).
    #[serde(default = "default_short_timeout")]
    pub discovery_timeout_secs: u64,

    /// Budget for the type-checker subprocess.
    #[serde(default = "default_compiler_timeout")]
    pub compiler_timeout_secs: u64,

    /// Directory where generated artifacts are materialized.
    /// A temporary directory is used when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_root: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            design_timeout_secs: default_stage_timeout(),
            build_timeout_secs: default_stage_timeout(),
            knowledge_timeout_secs: default_short_timeout(),
            discovery_timeout_secs: default_short_timeout(),
            compiler_timeout_secs: default_compiler_timeout(),
            build_root: None,
        }
    }
}

fn default_stage_timeout() -> u64 {
    120
}
fn default_short_timeout() -> u64 {
    15
}
fn default_compiler_timeout() -> u64 {
    60
}

/// `[discovery]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Maximum number of ranked candidates kept.
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Candidates scoring below this are discarded.
    #[serde(default = "default_min_relevance")]
    pub min_relevance: f32,

    /// How many top-ranked candidates get a schema lookup.
    #[serde(default = "default_schema_window")]
    pub schema_window: usize,

    /// Base URL of the vector index service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_url: Option<Url>,

    /// Base URL of the schema/status provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_url: Option<Url>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            min_relevance: default_min_relevance(),
            schema_window: default_schema_window(),
            index_url: None,
            metadata_url: None,
        }
    }
}

fn default_top_k() -> usize {
    10
}
fn default_min_relevance() -> f32 {
    0.3
}
fn default_schema_window() -> usize {
    5
}

/// One routable domain: its positive terms and the source ids it may bind to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainProfile {
    /// Profile name, used in logs.
    pub name: String,
    /// Domain-positive keywords.
    pub terms: Vec<String>,
    /// Source ids this domain is allowed to route to.
    pub allow_list: Vec<String>,
}

/// `[router]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Terms that force deferral to semantic discovery.
    #[serde(default = "default_exclusion_terms")]
    pub exclusion_terms: Vec<String>,

    /// Terms that are never enough on their own to route.
    #[serde(default = "default_ambiguous_terms")]
    pub ambiguous_terms: Vec<String>,

    /// Domain profiles, evaluated in order. Kept last so TOML emits
    /// plain values before the array of tables.
    #[serde(default = "default_domains")]
    pub domains: Vec<DomainProfile>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            exclusion_terms: default_exclusion_terms(),
            ambiguous_terms: default_ambiguous_terms(),
            domains: default_domains(),
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

fn default_domains() -> Vec<DomainProfile> {
    vec![DomainProfile {
        name: "oil_gas".into(),
        terms: strings(&[
            "oil",
            "gas",
            "natural gas",
            "crude",
            "condensate",
            "permian",
            "eagle ford",
            "barnett",
            "haynesville",
            "basin",
            "well",
            "wells",
            "drilling",
            "drilling permit",
            "lease",
            "leases",
            "barrels",
            "bbl",
            "mcf",
            "railroad commission",
            "rrc",
        ]),
        allow_list: strings(&["rrc"]),
    }]
}

fn default_exclusion_terms() -> Vec<String> {
    strings(&[
        "manufacturing",
        "factory",
        "film",
        "movie",
        "music",
        "video",
        "television",
        "theater",
        "theatre",
        "software",
        "game",
        "agriculture",
        "crop",
    ])
}

fn default_ambiguous_terms() -> Vec<String> {
    strings(&["production", "produced", "output", "data", "volume", "volumes"])
}

/// `[validator]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorConfig {
    /// Type-checker invocation, run inside the build directory.
    #[serde(default = "default_compiler_command")]
    pub compiler_command: Vec<String>,

    /// Whether the type-compilation check runs at all.
    #[serde(default = "default_true")]
    pub compiler_enabled: bool,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            compiler_command: default_compiler_command(),
            compiler_enabled: true,
        }
    }
}

fn default_compiler_command() -> Vec<String> {
    strings(&["tsc", "--noEmit", "--pretty", "false"])
}
fn default_true() -> bool {
    true
}

/// `[telemetry]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Discovery-session database path. Defaults to `~/.genpipe/discovery-sessions.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_log: Option<PathBuf>,
}

/// `[generation]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Base URL of the remote design/build service. Legacy-only when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<Url>,
}

/// `[knowledge]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KnowledgeConfig {
    /// Base URL of the knowledge service. Built-in guidance when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<Url>,
}

// ---------------------------------------------------------------------------
// Runtime timeouts (derived from config)
// ---------------------------------------------------------------------------

/// Per-call budgets as `Duration`s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub design: Duration,
    pub build: Duration,
    pub knowledge: Duration,
    pub discovery: Duration,
    pub compiler: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

impl From<&PipelineConfig> for Timeouts {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            design: Duration::from_secs(config.design_timeout_secs),
            build: Duration::from_secs(config.build_timeout_secs),
            knowledge: Duration::from_secs(config.knowledge_timeout_secs),
            discovery: Duration::from_secs(config.discovery_timeout_secs),
            compiler: Duration::from_secs(config.compiler_timeout_secs),
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.genpipe/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| GenPipeError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.genpipe/genpipe.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Resolve the discovery-session database path.
pub fn session_log_path(config: &AppConfig) -> Result<PathBuf> {
    match &config.telemetry.session_log {
        Some(path) => Ok(path.clone()),
        None => Ok(config_dir()?.join(SESSION_LOG_NAME)),
    }
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| GenPipeError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content)
        .map_err(|e| GenPipeError::config(format!("failed to parse {}: {e}", path.display())))?;
    validate_config(&config)?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| GenPipeError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| GenPipeError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| GenPipeError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Reject configurations the pipeline cannot run with.
pub fn validate_config(config: &AppConfig) -> Result<()> {
    let d = &config.discovery;
    if !(0.0..=1.0).contains(&d.min_relevance) {
        return Err(GenPipeError::config(format!(
            "discovery.min_relevance must be within [0, 1], got {}",
            d.min_relevance
        )));
    }
    if d.top_k == 0 {
        return Err(GenPipeError::config("discovery.top_k must be at least 1"));
    }

    let p = &config.pipeline;
    for (name, secs) in [
        ("design_timeout_secs", p.design_timeout_secs),
        ("build_timeout_secs", p.build_timeout_secs),
        ("knowledge_timeout_secs", p.knowledge_timeout_secs),
        ("discovery_timeout_secs", p.discovery_timeout_secs),
        ("compiler_timeout_secs", p.compiler_timeout_secs),
    ] {
        if secs == 0 {
            return Err(GenPipeError::config(format!("pipeline.{name} must be non-zero")));
        }
    }

    check_disjoint_terms(&config.router)
}

/// The three router keyword sets must not share a term.
pub fn check_disjoint_terms(router: &RouterConfig) -> Result<()> {
    let domain: BTreeSet<String> = router
        .domains
        .iter()
        .flat_map(|d| d.terms.iter().map(|t| t.to_lowercase()))
        .collect();
    let exclusion: BTreeSet<String> =
        router.exclusion_terms.iter().map(|t| t.to_lowercase()).collect();
    let ambiguous: BTreeSet<String> =
        router.ambiguous_terms.iter().map(|t| t.to_lowercase()).collect();

    for (a_name, a, b_name, b) in [
        ("domain", &domain, "exclusion", &exclusion),
        ("domain", &domain, "ambiguous", &ambiguous),
        ("exclusion", &exclusion, "ambiguous", &ambiguous),
    ] {
        if let Some(term) = a.intersection(b).next() {
            return Err(GenPipeError::config(format!(
                "router term '{term}' appears in both {a_name} and {b_name} sets"
            )));
        }
    }
    Ok(())
}
