//! CLI command definitions, routing, and tracing setup.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use genpipe_core::pipeline::{GenerateRequest, ProgressReporter, load_descriptors};
use genpipe_core::validator::{Severity, Validator, ValidatorOptions, materialize};
use genpipe_core::{GenerationResult, OrchestratorState, Stage, normalize_raw};
use genpipe_discovery::{DomainRouter, SessionAnalysis};
use genpipe_shared::{
    AppConfig, SessionId, SourceRef, Timeouts, init_config, load_config, load_config_from,
    session_log_path,
};
use genpipe_storage::Storage;
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::info;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// genpipe: turn an analytics intent into a validated dashboard artifact.
#[derive(Parser)]
#[command(
    name = "genpipe",
    version,
    about = "Route intents to data sources and generate validated dashboard code.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (defaults to ~/.genpipe/genpipe.toml).
    #[arg(long, global = true, env = "GENPIPE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Show how the deterministic router treats an intent.
    Route {
        /// Free-text intent.
        intent: String,

        /// Available source ids (comma-separated).
        #[arg(long, value_delimiter = ',')]
        sources: Vec<String>,

        /// Descriptor file whose ids are the available sources.
        #[arg(long)]
        descriptors: Option<PathBuf>,
    },

    /// Normalize a descriptor file into canonical sources.
    Normalize {
        /// JSON object of descriptors keyed by source id.
        file: PathBuf,
    },

    /// Run the post-generation validator over a directory of files.
    Validate {
        /// Artifact directory.
        dir: PathBuf,

        /// Skip the compiler check.
        #[arg(long)]
        no_compiler: bool,
    },

    /// Run a full generation session.
    Generate {
        /// Free-text intent.
        intent: String,

        /// Descriptor file to discover from instead of the HTTP endpoints.
        #[arg(long)]
        descriptors: Option<PathBuf>,

        /// Restrict routing to these source ids (comma-separated).
        #[arg(long, value_delimiter = ',')]
        sources: Vec<String>,

        /// Fetch boost signals with the knowledge bundle.
        #[arg(long)]
        boost: bool,

        /// Output directory (defaults to genpipe-out/<session>).
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Inspect the discovery-session log.
    Sessions {
        #[command(subcommand)]
        action: SessionsAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub(crate) enum SessionsAction {
    /// List recent sessions, newest first.
    List {
        #[arg(long, default_value = "20")]
        limit: u32,
    },
    /// Print one sealed session as JSON.
    Show { id: String },
    /// Aggregate every logged session.
    Report,
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "genpipe=info",
        1 => "genpipe=debug",
        _ => "genpipe=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.clone();
    let config = || -> Result<AppConfig> {
        Ok(match &config_path {
            Some(path) => load_config_from(path)?,
            None => load_config()?,
        })
    };

    match cli.command {
        Command::Route {
            intent,
            sources,
            descriptors,
        } => cmd_route(&config()?, &intent, sources, descriptors.as_deref()),
        Command::Normalize { file } => cmd_normalize(&file),
        Command::Validate { dir, no_compiler } => cmd_validate(&config()?, &dir, no_compiler).await,
        Command::Generate {
            intent,
            descriptors,
            sources,
            boost,
            out,
        } => cmd_generate(&config()?, intent, descriptors.as_deref(), sources, boost, out).await,
        Command::Sessions { action } => {
            let config = config()?;
            match action {
                SessionsAction::List { limit } => cmd_sessions_list(&config, limit).await,
                SessionsAction::Show { id } => cmd_sessions_show(&config, &id).await,
                SessionsAction::Report => cmd_sessions_report(&config).await,
            }
        }
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(&config()?),
        },
    }
}

// ---------------------------------------------------------------------------
// Routing and sources
// ---------------------------------------------------------------------------

fn cmd_route(
    config: &AppConfig,
    intent: &str,
    mut sources: Vec<String>,
    descriptors: Option<&Path>,
) -> Result<()> {
    if let Some(path) = descriptors {
        sources.extend(load_descriptors(path)?.into_keys());
    }
    let available: Vec<SourceRef> = sources.into_iter().map(SourceRef::new).collect();

    let router = DomainRouter::new(&config.router)?;
    let class = router.classify(intent);
    let routed = router.route(intent, &available);

    let report = serde_json::json!({
        "intent": intent,
        "classification": class,
        "routed": routed,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn cmd_normalize(file: &Path) -> Result<()> {
    let outcome = normalize_raw(load_descriptors(file)?);
    info!(
        sources = outcome.sources.len(),
        rejected = outcome.rejected.len(),
        "descriptors normalized"
    );
    let report = serde_json::json!({
        "sources": outcome.sources,
        "rejected": outcome.rejected,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

async fn cmd_validate(config: &AppConfig, dir: &Path, no_compiler: bool) -> Result<()> {
    if !dir.is_dir() {
        return Err(eyre!("'{}' is not a directory", dir.display()));
    }
    let files = read_tree(dir)?;
    info!(dir = %dir.display(), files = files.len(), "validating artifact");

    let timeouts = Timeouts::from(&config.pipeline);
    let mut options = ValidatorOptions::from_config(&config.validator, timeouts.compiler);
    if no_compiler {
        options.compiler_enabled = false;
    }

    // Compile a copy so the checked directory is left untouched.
    let scratch = std::env::temp_dir().join(format!("genpipe-validate-{}", SessionId::new()));
    let conflicts = Validator::new(options).validate(&files, &scratch).await;
    let _ = std::fs::remove_dir_all(&scratch);

    for conflict in &conflicts {
        println!("{conflict}");
    }
    let errors = conflicts
        .iter()
        .filter(|c| c.severity == Severity::Error)
        .count();
    println!(
        "\n  {} conflict(s), {errors} error(s)",
        conflicts.len()
    );
    if errors > 0 {
        return Err(eyre!("validation found {errors} error(s)"));
    }
    Ok(())
}

/// Every file under `root`, keyed by `/`-separated relative path.
fn read_tree(root: &Path) -> Result<BTreeMap<String, String>> {
    let mut files = BTreeMap::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
                continue;
            }
            let Ok(content) = std::fs::read_to_string(&path) else {
                // Binary files cannot hold imports.
                continue;
            };
            let rel = path
                .strip_prefix(root)?
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            files.insert(rel, content);
        }
    }
    Ok(files)
}

// ---------------------------------------------------------------------------
// Generation
// ---------------------------------------------------------------------------

async fn cmd_generate(
    config: &AppConfig,
    intent: String,
    descriptors: Option<&Path>,
    sources: Vec<String>,
    boost: bool,
    out: Option<PathBuf>,
) -> Result<()> {
    let request = GenerateRequest {
        intent,
        descriptors: descriptors.map(load_descriptors).transpose()?,
        sources: (!sources.is_empty()).then(|| sources.into_iter().map(SourceRef::new).collect()),
        enable_boost: boost,
    };
    info!(intent = %request.intent, boost, "starting generation");

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let reporter = CliProgress::new();
    let result = genpipe_core::generate(config, request, &reporter, cancel).await;
    reporter.spinner.finish_and_clear();
    let result = result?;

    let out = out.unwrap_or_else(|| {
        PathBuf::from("genpipe-out").join(result.session_id.to_string())
    });
    materialize(&result.artifact.files, &out)?;

    print_summary(&result, &out);
    Ok(())
}

fn print_summary(result: &GenerationResult, out: &Path) {
    let path = |legacy: bool| if legacy { "legacy" } else { "primary" };
    let agg = result.discovery_session.aggregates();

    println!();
    println!("  Generation complete");
    println!("  Session:   {}", result.session_id);
    println!("  Routed:    {}", result.routed());
    println!(
        "  Sources:   {}",
        result
            .context
            .sources
            .keys()
            .cloned()
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!("  Design:    {} ({} components)", path(result.used_legacy_design), result.design.components.len());
    println!("  Build:     {} ({} files)", path(result.used_legacy_build), result.artifact.files.len());
    println!(
        "  Discovery: {} attempts, {:.0}% success",
        agg.total_attempts,
        agg.success_rate * 100.0
    );
    println!("  Output:    {}", out.display());
    println!("  Time:      {:.1}s", result.elapsed.as_secs_f64());
    if !result.issues.is_empty() {
        println!();
        println!("  Issues:");
        for issue in &result.issues {
            println!("    - {issue}");
        }
    }
    println!();
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
            spinner.set_style(
                style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
            );
        }
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, state: OrchestratorState) {
        self.spinner.set_message(state.to_string().replace('_', " "));
    }

    fn attempt(&self, stage: Stage, attempt: u32, budget: u32) {
        self.spinner
            .set_message(format!("{stage} attempt {attempt}/{budget}"));
    }

    fn done(&self, _result: &GenerationResult) {
        self.spinner.finish_and_clear();
    }
}

// ---------------------------------------------------------------------------
// Session log
// ---------------------------------------------------------------------------

async fn open_log(config: &AppConfig) -> Result<Storage> {
    let path = session_log_path(config)?;
    Ok(Storage::open_readonly(&path).await?)
}

async fn cmd_sessions_list(config: &AppConfig, limit: u32) -> Result<()> {
    let storage = open_log(config).await?;
    let sessions = storage.list_sessions(Some(limit)).await?;
    if sessions.is_empty() {
        println!("No sessions logged yet.");
        return Ok(());
    }
    for s in &sessions {
        println!(
            "{}  {}  {:>4} attempts  {:>4} failed  {:>5.1}%",
            s.id,
            s.started_at.format("%Y-%m-%d %H:%M:%S"),
            s.total_attempts,
            s.failed_attempts,
            s.success_rate * 100.0
        );
    }
    Ok(())
}

async fn cmd_sessions_show(config: &AppConfig, id: &str) -> Result<()> {
    let id: SessionId = id.parse()?;
    let storage = open_log(config).await?;
    let session = storage
        .get_session(&id)
        .await?
        .ok_or_else(|| eyre!("no session with id {id}"))?;
    println!("{}", serde_json::to_string_pretty(&session)?);
    Ok(())
}

async fn cmd_sessions_report(config: &AppConfig) -> Result<()> {
    let storage = open_log(config).await?;
    let sessions = storage.load_sessions().await?;
    let analysis = SessionAnalysis::from_sessions(&sessions);
    println!("{}", serde_json::to_string_pretty(&analysis)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(config: &AppConfig) -> Result<()> {
    let toml_str = toml::to_string_pretty(config)?;
    println!("{toml_str}");
    Ok(())
}
