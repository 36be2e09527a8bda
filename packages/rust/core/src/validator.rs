//! Post-generation validation of artifact files.
//!
//! Three independent checks run on every call:
//!
//! 1. type compilation: materialize the files, add a `tsconfig.json` when the
//!    artifact has none, and run the configured compiler
//! 2. import resolution: every relative import names a file in the artifact
//! 3. type-safety heuristic: array-only methods on identifiers with no local
//!    array evidence
//!
//! A check that fails internally contributes a `build_error` conflict and the
//! remaining checks still run. Output is ordered check by check, each sorted
//! by file then line.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Component, Path};
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use genpipe_shared::{GenPipeError, Result, ValidatorConfig};

use crate::stages::file_stem;

/// Extensions dropped when comparing an import to artifact files.
const RESOLVABLE_EXTENSIONS: &[&str] = &["ts", "tsx", "js", "jsx", "mjs", "cjs", "json", "css"];

/// Array-only methods the heuristic looks for.
const ARRAY_METHODS: &str = "filter|map|reduce|forEach|find|findIndex|some|every|flatMap";

const TSCONFIG_FILE: &str = "tsconfig.json";

/// Written next to the artifact when it brings no config of its own.
const DEFAULT_TSCONFIG: &str = r#"{
  "compilerOptions": {
    "target": "ES2020",
    "module": "ESNext",
    "moduleResolution": "bundler",
    "jsx": "react-jsx",
    "strict": false,
    "noEmit": true,
    "skipLibCheck": true,
    "allowJs": true,
    "esModuleInterop": true,
    "allowImportingTsExtensions": true
  },
  "include": ["**/*.ts", "**/*.tsx", "**/*.js", "**/*.jsx"]
}
"#;

/// Diagnostics caused by the build directory having no installed packages
/// (missing declarations, no JSX runtime, nothing to compile).
const ENVIRONMENT_DIAGNOSTICS: [&str; 3] = ["TS7016", "TS2875", "TS18003"];

// ---------------------------------------------------------------------------
// Conflicts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    TypeError,
    ImportError,
    TypeSafety,
    BuildError,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TypeError => "type_error",
            Self::ImportError => "import_error",
            Self::TypeSafety => "type_safety",
            Self::BuildError => "build_error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConflict {
    pub kind: ConflictKind,
    pub severity: Severity,
    pub message: String,
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

impl RuntimeConflict {
    fn new(kind: ConflictKind, severity: Severity, file: impl Into<String>, line: Option<u32>, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            message: message.into(),
            file: file.into(),
            line,
        }
    }

    fn check_failed(check: &str, detail: impl fmt::Display) -> Self {
        Self::new(
            ConflictKind::BuildError,
            Severity::Warning,
            "",
            None,
            format!("{check} check failed: {detail}"),
        )
    }
}

impl fmt::Display for RuntimeConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.file.is_empty(), self.line) {
            (true, _) => write!(f, "{}: {}", self.kind, self.message),
            (false, Some(line)) => write!(f, "{}: {} ({}:{line})", self.kind, self.message, self.file),
            (false, None) => write!(f, "{}: {} ({})", self.kind, self.message, self.file),
        }
    }
}

fn sort_conflicts(conflicts: &mut [RuntimeConflict]) {
    conflicts.sort_by(|a, b| a.file.cmp(&b.file).then(a.line.cmp(&b.line)));
}

fn line_of(content: &str, offset: usize) -> u32 {
    content[..offset].matches('\n').count() as u32 + 1
}

// ---------------------------------------------------------------------------
// Validator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ValidatorOptions {
    /// Program and arguments, run inside the build directory.
    pub compiler_command: Vec<String>,
    pub compiler_enabled: bool,
    pub compiler_timeout: Duration,
}

impl ValidatorOptions {
    pub fn from_config(config: &ValidatorConfig, compiler_timeout: Duration) -> Self {
        Self {
            compiler_command: config.compiler_command.clone(),
            compiler_enabled: config.compiler_enabled,
            compiler_timeout,
        }
    }

    /// Only the in-memory checks.
    pub fn without_compiler() -> Self {
        Self {
            compiler_command: Vec::new(),
            compiler_enabled: false,
            compiler_timeout: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Validator {
    options: ValidatorOptions,
}

impl Validator {
    pub fn new(options: ValidatorOptions) -> Self {
        Self { options }
    }

    /// Run all checks. An empty result means the artifact passed.
    #[instrument(skip_all, fields(files = files.len(), build_dir = %build_dir.display()))]
    pub async fn validate(&self, files: &BTreeMap<String, String>, build_dir: &Path) -> Vec<RuntimeConflict> {
        let mut conflicts = match self.check_types(files, build_dir).await {
            Ok(mut found) => {
                sort_conflicts(&mut found);
                found
            }
            Err(e) => vec![RuntimeConflict::check_failed("type", e)],
        };

        conflicts.extend(run_pure_check("import", || check_imports(files)));
        conflicts.extend(run_pure_check("type-safety", || check_type_safety(files)));

        info!(conflicts = conflicts.len(), "validation finished");
        conflicts
    }

    async fn check_types(&self, files: &BTreeMap<String, String>, build_dir: &Path) -> Result<Vec<RuntimeConflict>> {
        if !self.options.compiler_enabled {
            return Ok(Vec::new());
        }
        let Some((program, args)) = self.options.compiler_command.split_first() else {
            return Ok(Vec::new());
        };

        std::fs::create_dir_all(build_dir).map_err(|e| GenPipeError::io(build_dir, e))?;
        materialize(files, build_dir)?;
        if !files.contains_key(TSCONFIG_FILE) {
            let path = build_dir.join(TSCONFIG_FILE);
            std::fs::write(&path, DEFAULT_TSCONFIG).map_err(|e| GenPipeError::io(&path, e))?;
        }

        let mut command = tokio::process::Command::new(program);
        command
            .args(args)
            .current_dir(build_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(%program, "compiler not installed, skipping type check");
                return Ok(Vec::new());
            }
            Err(e) => return Err(GenPipeError::io(program, e)),
        };

        let output = tokio::time::timeout(self.options.compiler_timeout, child.wait_with_output())
            .await
            .map_err(|_| GenPipeError::timeout("compiler", self.options.compiler_timeout))?
            .map_err(|e| GenPipeError::io(program, e))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let mut conflicts = parse_diagnostics(&stdout);
        conflicts.extend(parse_diagnostics(&stderr));

        if !output.status.success() && conflicts.is_empty() {
            let tail: String = stderr.lines().rev().take(3).collect::<Vec<_>>().join(" | ");
            conflicts.push(RuntimeConflict::new(
                ConflictKind::BuildError,
                Severity::Error,
                "",
                None,
                format!("compiler exited with {}: {tail}", output.status),
            ));
        }
        debug!(status = %output.status, diagnostics = conflicts.len(), "compiler finished");
        Ok(conflicts)
    }
}

/// Run an in-memory check, turning a panic into a `build_error`.
fn run_pure_check(name: &str, check: impl FnOnce() -> Vec<RuntimeConflict>) -> Vec<RuntimeConflict> {
    match catch_unwind(AssertUnwindSafe(check)) {
        Ok(mut found) => {
            sort_conflicts(&mut found);
            found
        }
        Err(_) => {
            warn!(check = name, "validator check panicked");
            vec![RuntimeConflict::check_failed(name, "internal panic")]
        }
    }
}

/// Write artifact files under `build_dir`. Absolute or escaping paths are refused.
pub fn materialize(files: &BTreeMap<String, String>, build_dir: &Path) -> Result<()> {
    for (name, content) in files {
        let rel = Path::new(name);
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(GenPipeError::validation(format!(
                "artifact path escapes the build directory: {name}"
            )));
        }
        let path = build_dir.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| GenPipeError::io(parent, e))?;
        }
        std::fs::write(&path, content).map_err(|e| GenPipeError::io(&path, e))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// (a) compiler diagnostics
// ---------------------------------------------------------------------------

static TSC_DIAGNOSTIC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<file>[^\s(][^(]*)\((?P<line>\d+),(?P<col>\d+)\):\s+error\s+(?P<code>TS\d+):\s+(?P<msg>.+)$")
        .expect("valid regex")
});

static TSC_GLOBAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^error\s+(?P<code>TS\d+):\s+(?P<msg>.+)$").expect("valid regex"));

static MISSING_MODULE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Cannot find module '(?P<spec>[^']+)'").expect("valid regex"));

/// Package-resolution diagnostics are warnings; everything else is an error.
fn diagnostic_severity(code: &str, message: &str) -> Severity {
    if ENVIRONMENT_DIAGNOSTICS.contains(&code) {
        return Severity::Warning;
    }
    let missing_package = code == "TS2307"
        && MISSING_MODULE
            .captures(message)
            .is_some_and(|caps| !caps["spec"].starts_with('.'));
    if missing_package {
        Severity::Warning
    } else {
        Severity::Error
    }
}

/// Parse `tsc --pretty false` output into `type_error` conflicts.
pub fn parse_diagnostics(output: &str) -> Vec<RuntimeConflict> {
    output
        .lines()
        .map(str::trim_end)
        .filter_map(|line| {
            if let Some(caps) = TSC_DIAGNOSTIC.captures(line) {
                let col = &caps["col"];
                Some(RuntimeConflict::new(
                    ConflictKind::TypeError,
                    diagnostic_severity(&caps["code"], &caps["msg"]),
                    caps["file"].trim(),
                    caps["line"].parse().ok(),
                    format!("{} at column {col}: {}", &caps["code"], &caps["msg"]),
                ))
            } else {
                TSC_GLOBAL.captures(line).map(|caps| {
                    RuntimeConflict::new(
                        ConflictKind::TypeError,
                        diagnostic_severity(&caps["code"], &caps["msg"]),
                        "",
                        None,
                        format!("{}: {}", &caps["code"], &caps["msg"]),
                    )
                })
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// (b) import resolution
// ---------------------------------------------------------------------------

static RELATIVE_IMPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:\bfrom\s*|\bimport\s*\(?\s*|\brequire\s*\(\s*)["'](?P<spec>\.{1,2}/[^"']+)["']"#).expect("valid regex")
});

fn strip_known_extension(name: &str) -> &str {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && RESOLVABLE_EXTENSIONS.contains(&ext) => stem,
        _ => name,
    }
}

/// Relative imports whose basename matches no artifact file.
pub fn check_imports(files: &BTreeMap<String, String>) -> Vec<RuntimeConflict> {
    let stems: BTreeSet<&str> = files.keys().map(|path| file_stem(path)).collect();
    // Directories importable through an index file.
    let index_dirs: BTreeSet<&str> = files
        .keys()
        .filter(|path| file_stem(path) == "index")
        .filter_map(|path| {
            let mut parts = path.rsplit(['/', '\\']);
            parts.next();
            parts.next()
        })
        .collect();

    let mut conflicts = Vec::new();
    for (file, content) in files {
        for caps in RELATIVE_IMPORT.captures_iter(content) {
            let Some(spec) = caps.name("spec") else { continue };
            let target = spec.as_str().trim_end_matches('/');
            let base = target.rsplit('/').next().unwrap_or(target);
            let wanted = strip_known_extension(base);

            if stems.contains(wanted) || index_dirs.contains(base) {
                continue;
            }
            conflicts.push(RuntimeConflict::new(
                ConflictKind::ImportError,
                Severity::Error,
                file.as_str(),
                Some(line_of(content, spec.start())),
                format!("unresolved import '{}'", spec.as_str()),
            ));
        }
    }
    conflicts
}

// ---------------------------------------------------------------------------
// (c) type-safety heuristic
// ---------------------------------------------------------------------------

static ARRAY_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?P<ident>[A-Za-z_$][\w$]*)\s*\??\.\s*(?P<method>{ARRAY_METHODS})\s*\(")).expect("valid regex")
});

/// Whether `content` shows `ident` is an array.
fn has_array_evidence(content: &str, ident: &str) -> bool {
    let id = regex::escape(ident);
    let patterns = [
        // annotation: `rows: Row[]`, `rows: Array<Row>`
        format!(r"\b{id}\s*\??\s*:\s*(?:readonly\s+)?[^=;,)]*?(?:\[\]|Array<)"),
        // literal or constructor: `rows = [`, `rows = Array.from(`
        format!(r"\b{id}\s*=\s*(?:\[|Array\.(?:from|of)\s*\(|new\s+Array\b)"),
        format!(r"Array\.isArray\(\s*{id}\s*\)"),
        // `const [rows, setRows] = useState<Row[]>(...)` or `useState([])`
        format!(r"\[\s*{id}\s*,[^\]]*\]\s*=\s*useState\s*(?:<[^>]*\[\]\s*>|\(\s*\[)"),
    ];
    patterns
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .any(|re| re.is_match(content))
}

/// Array-only method calls on identifiers not evidenced as arrays in the same file.
pub fn check_type_safety(files: &BTreeMap<String, String>) -> Vec<RuntimeConflict> {
    let mut conflicts = Vec::new();
    for (file, content) in files {
        let mut seen = BTreeSet::new();
        let mut evidence: BTreeMap<String, bool> = BTreeMap::new();

        for caps in ARRAY_CALL.captures_iter(content) {
            let (Some(ident), Some(method)) = (caps.name("ident"), caps.name("method")) else {
                continue;
            };
            let name = ident.as_str();
            // Global namespaces such as `Object` or `Array` are not values.
            if name.chars().next().is_some_and(char::is_uppercase) && name != name.to_uppercase() {
                continue;
            }
            let evidenced = *evidence
                .entry(name.to_string())
                .or_insert_with(|| has_array_evidence(content, name));
            if evidenced {
                continue;
            }

            let line = line_of(content, ident.start());
            if !seen.insert((line, name.to_string())) {
                continue;
            }
            conflicts.push(RuntimeConflict::new(
                ConflictKind::TypeSafety,
                Severity::Warning,
                file.as_str(),
                Some(line),
                format!(
                    "'{name}.{}' called on a value not known to be an array",
                    method.as_str()
                ),
            ));
        }
    }
    conflicts
}
