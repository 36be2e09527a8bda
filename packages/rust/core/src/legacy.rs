//! Deterministic legacy generation path.
//!
//! Used when the primary stages keep failing. It has no external
//! dependencies: the same requirements and data context always yield the
//! same design and the same files, and every relative import it emits
//! resolves within the artifact.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use tracing::{debug, instrument};

use genpipe_shared::Result;

use crate::knowledge::DataContext;
use crate::stages::{
    Artifact, ComponentKind, ComponentSpec, DesignSpec, Origin, Requirements, component_ident,
    pascal_case,
};

/// Component used when there is no source to bind to.
const SUMMARY_COMPONENT: &str = "Summary";

/// Upper bound on fields copied from a schema into a component.
const MAX_FIELDS: usize = 8;

/// Identifiers the templates already declare in `App.tsx`.
const RESERVED_IDENTS: [&str; 2] = ["App", "React"];

/// The trusted fallback path. Implementations must not make external calls.
pub trait LegacyPath: Send + Sync {
    fn design(&self, requirements: &Requirements, context: &DataContext) -> Result<DesignSpec>;

    fn build(&self, design: &DesignSpec) -> Result<Artifact>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LegacyGenerator;

impl LegacyPath for LegacyGenerator {
    #[instrument(skip_all, fields(sources = context.sources.len()))]
    fn design(&self, requirements: &Requirements, context: &DataContext) -> Result<DesignSpec> {
        let mut components = Vec::new();
        let mut used = reserved();

        for id in context.sources.keys() {
            let fields: Vec<String> = context
                .schemas
                .get(id)
                .map(|schema| schema.columns.iter().take(MAX_FIELDS).cloned().collect())
                .unwrap_or_default();
            let base = pascal_case(id);
            for kind in [ComponentKind::Table, ComponentKind::Metric] {
                components.push(ComponentSpec {
                    name: unique_ident(&format!("{base}{}", kind.suffix()), &mut used),
                    kind,
                    source_id: Some(id.clone()),
                    fields: fields.clone(),
                });
            }
        }

        match context.sources.keys().next() {
            Some(first) => {
                let base = pascal_case(first);
                for kind in &requirements.wanted_components {
                    if matches!(kind, ComponentKind::Table | ComponentKind::Metric) {
                        continue;
                    }
                    components.push(ComponentSpec {
                        name: unique_ident(&format!("{base}{}", kind.suffix()), &mut used),
                        kind: *kind,
                        source_id: Some(first.clone()),
                        fields: Vec::new(),
                    });
                }
            }
            None => components.push(ComponentSpec {
                name: SUMMARY_COMPONENT.into(),
                kind: ComponentKind::Metric,
                source_id: None,
                fields: Vec::new(),
            }),
        }

        let title = if requirements.intent.is_empty() {
            "Dashboard".to_string()
        } else {
            requirements.intent.clone()
        };
        debug!(components = components.len(), "legacy design produced");

        Ok(DesignSpec {
            title,
            components,
            origin: Origin::Legacy,
        })
    }

    #[instrument(skip_all, fields(components = design.components.len()))]
    fn build(&self, design: &DesignSpec) -> Result<Artifact> {
        // Primary designs may use any component name.
        let mut used = reserved();
        let named: Vec<(String, &ComponentSpec)> = design
            .components
            .iter()
            .map(|component| (unique_ident(&component.name, &mut used), component))
            .collect();

        let mut files = BTreeMap::new();
        for (ident, component) in &named {
            if ident != &component.name {
                debug!(name = %component.name, %ident, "component renamed for legacy build");
            }
            files.insert(
                format!("components/{ident}.tsx"),
                render_component(ident, component),
            );
        }

        files.insert("data/sources.ts".into(), render_sources(design));
        files.insert("App.tsx".into(), render_app(&design.title, &named));

        debug!(files = files.len(), "legacy build produced");
        Ok(Artifact {
            files,
            origin: Origin::Legacy,
        })
    }
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

fn reserved() -> BTreeSet<String> {
    RESERVED_IDENTS.iter().map(|s| s.to_string()).collect()
}

/// [`component_ident`] of `name`, suffixed with a counter when taken.
fn unique_ident(name: &str, used: &mut BTreeSet<String>) -> String {
    let base = component_ident(name);
    if used.insert(base.clone()) {
        return base;
    }
    let mut n = 2;
    loop {
        let candidate = format!("{base}{n}");
        if used.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

fn js_string(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}

fn render_app(title: &str, named: &[(String, &ComponentSpec)]) -> String {
    let mut out = String::from("import React from \"react\";\n");
    for (ident, _) in named {
        let _ = writeln!(out, "import {{ {ident} }} from \"./components/{ident}\";");
    }
    out.push_str("\nexport default function App() {\n  return (\n    <main>\n");
    let _ = writeln!(out, "      <h1>{{{}}}</h1>", js_string(title));
    for (ident, _) in named {
        let _ = writeln!(out, "      <{ident} />");
    }
    out.push_str("    </main>\n  );\n}\n");
    out
}

fn render_sources(design: &DesignSpec) -> String {
    let mut bound: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for component in &design.components {
        if let Some(id) = &component.source_id {
            let fields = bound.entry(id.as_str()).or_default();
            for field in &component.fields {
                if !fields.contains(&field.as_str()) {
                    fields.push(field.as_str());
                }
            }
        }
    }

    let mut out = String::from(
        "export interface SourceInfo {\n  id: string;\n  fields: string[];\n}\n\nexport const sources: SourceInfo[] = [\n",
    );
    for (id, fields) in &bound {
        let quoted: Vec<String> = fields.iter().map(|f| js_string(f)).collect();
        let _ = writeln!(
            out,
            "  {{ id: {}, fields: [{}] }},",
            js_string(id),
            quoted.join(", ")
        );
    }
    out.push_str("];\n");
    out
}

fn render_component(ident: &str, component: &ComponentSpec) -> String {
    let source = component
        .source_id
        .as_deref()
        .map(js_string)
        .unwrap_or_else(|| "null".into());
    let fields: Vec<String> = component.fields.iter().map(|f| js_string(f)).collect();

    let body = match component.kind {
        ComponentKind::Table => {
            "      <table>\n        <thead>\n          <tr>{fields.map((f) => <th key={f}>{f}</th>)}</tr>\n        </thead>\n      </table>\n"
        }
        ComponentKind::Metric => "      <strong>{fields.length}</strong>\n",
        ComponentKind::Chart => "      <figure data-kind=\"chart\">{fields.join(\", \")}</figure>\n",
        ComponentKind::Map => "      <figure data-kind=\"map\" />\n",
        ComponentKind::Filter => {
            "      <select>{fields.map((f) => <option key={f}>{f}</option>)}</select>\n"
        }
    };

    format!(
        "import React from \"react\";\nimport {{ sources }} from \"../data/sources\";\n\n\
         const sourceId: string | null = {source};\n\
         const fields: string[] = [{fields}];\n\n\
         export function {name}() {{\n  const known = sources.length;\n  return (\n    <section data-source={{sourceId ?? \"\"}} data-known={{known}}>\n{body}    </section>\n  );\n}}\n",
        fields = fields.join(", "),
        name = ident,
    )
}
