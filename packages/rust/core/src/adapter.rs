//! Context Adapter: flat and layered source descriptions into one canonical form.
//!
//! The adapter runs on every request and works purely from the counts the
//! metadata provider already computed. It never touches the filesystem,
//! never drops a populated location, and never derives one node's count from
//! another.

use std::collections::BTreeMap;

use chrono::Utc;
use tracing::{debug, warn};

use genpipe_shared::{
    CanonicalSource, DirectoryNode, FlatSource, LayeredSource, LocationKind, LocationStats,
    RawSourceDescriptor, ShapeKind, SourceDescriptor, SourceShape,
};

/// Location name used when a flat source gives counts but no location string.
const UNSPECIFIED_LOCATION: &str = "unspecified";

/// Histogram key for files without an extension.
const NO_EXTENSION: &str = "none";

/// Output of [`normalize_raw`]: canonical sources plus descriptors that had
/// no recognizable shape, keyed by id with the reason.
#[derive(Debug, Default)]
pub struct NormalizeOutcome {
    pub sources: BTreeMap<String, CanonicalSource>,
    pub rejected: BTreeMap<String, String>,
}

/// Normalize typed descriptors. Deterministic apart from `normalized_at`.
pub fn normalize(raw: &BTreeMap<String, SourceDescriptor>) -> BTreeMap<String, CanonicalSource> {
    raw.iter()
        .map(|(id, desc)| (id.clone(), normalize_one(desc)))
        .collect()
}

/// Classify and normalize untyped descriptors as delivered by the provider.
pub fn normalize_raw(raw: BTreeMap<String, RawSourceDescriptor>) -> NormalizeOutcome {
    let mut outcome = NormalizeOutcome::default();
    for (id, desc) in raw {
        match SourceDescriptor::from_raw(&id, desc) {
            Ok(typed) => {
                outcome.sources.insert(id, normalize_one(&typed));
            }
            Err(e) => {
                warn!(source_id = %id, error = %e, "descriptor rejected");
                outcome.rejected.insert(id, e.to_string());
            }
        }
    }
    outcome
}

pub fn normalize_one(desc: &SourceDescriptor) -> CanonicalSource {
    let (shape, locations, tree) = match &desc.shape {
        SourceShape::Flat(flat) => (ShapeKind::Flat, flat_locations(flat), None),
        SourceShape::Layered(layered) => (
            ShapeKind::Layered,
            layered_locations(layered),
            Some(layered.directory_structure.clone()),
        ),
    };

    // BTreeMap order is the default-selection preference order.
    let available_in: Vec<LocationKind> = locations.keys().cloned().collect();
    debug!(
        source_id = %desc.id,
        ?shape,
        locations = available_in.len(),
        "source normalized"
    );

    CanonicalSource {
        id: desc.id.clone(),
        label: desc.label.clone(),
        shape,
        locations,
        available_in,
        tree,
        normalized_at: Utc::now(),
    }
}

fn flat_locations(flat: &FlatSource) -> BTreeMap<LocationKind, LocationStats> {
    let mut locations = BTreeMap::new();

    if let Some(all) = &flat.all_locations {
        for (name, stats) in all.iter().filter(|(_, s)| s.file_count > 0) {
            insert_unique(&mut locations, name, stats.clone());
        }
    }

    // The top-level location stands in only when the per-location map is
    // absent or reports nothing.
    if locations.is_empty() && flat.file_count > 0 {
        let (kind, name) = if flat.location.is_empty() {
            (
                LocationKind::Other(UNSPECIFIED_LOCATION.into()),
                UNSPECIFIED_LOCATION,
            )
        } else {
            (LocationKind::infer(&flat.location), flat.location.as_str())
        };
        let stats = LocationStats {
            file_count: flat.file_count,
            row_count: flat.row_count,
            ..Default::default()
        };
        if locations.insert(kind, stats).is_some() {
            warn!(location = name, "duplicate top-level location");
        }
    }

    locations
}

fn layered_locations(layered: &LayeredSource) -> BTreeMap<LocationKind, LocationStats> {
    let mut locations = BTreeMap::new();
    for (name, node) in &layered.directory_structure {
        let stats = LocationStats {
            file_count: node.file_count,
            size_bytes: node.size_bytes,
            file_type_histogram: histogram(node),
            row_count: None,
        };
        insert_unique(&mut locations, name, stats);
    }
    locations
}

/// Insert under the parsed kind; a second key parsing to the same kind
/// (e.g. `Raw` next to `raw`) is kept under its literal name.
fn insert_unique(
    locations: &mut BTreeMap<LocationKind, LocationStats>,
    name: &str,
    stats: LocationStats,
) {
    let kind = LocationKind::from(name);
    let kind = if locations.contains_key(&kind) {
        LocationKind::Other(name.to_string())
    } else {
        kind
    };
    locations.insert(kind, stats);
}

/// Extension histogram of the node's own `files`; subdirectories are not visited.
fn histogram(node: &DirectoryNode) -> BTreeMap<String, u64> {
    let mut hist = BTreeMap::new();
    for file in &node.files {
        let ext = match file.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => ext.to_ascii_lowercase(),
            _ => NO_EXTENSION.to_string(),
        };
        *hist.entry(ext).or_insert(0) += 1;
    }
    hist
}
