//! Core domain types for genpipe: source descriptions and discovery telemetry.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{GenPipeError, Result};

/// Number of slowest attempts kept in a sealed session.
pub const SLOWEST_ATTEMPTS_KEPT: usize = 5;

/// More searched locations than this means the caller lacked a structure hint.
pub const STRUCTURE_HINT_THRESHOLD: usize = 5;

// ---------------------------------------------------------------------------
// SessionId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for generation session identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Generate a new time-sortable session identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// SourceRef
// ---------------------------------------------------------------------------

/// A reference to a data source known to the system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    /// Stable source identifier (e.g., `rrc`).
    pub id: String,
    /// Human label, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl SourceRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Locations
// ---------------------------------------------------------------------------

/// Where a copy of a source's files lives in the data lake.
///
/// The four well-known stages sort first, in default-selection preference
/// order; anything else is kept under [`LocationKind::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum LocationKind {
    Processed,
    Interim,
    Raw,
    External,
    Other(String),
}

impl LocationKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Processed => "processed",
            Self::Interim => "interim",
            Self::Raw => "raw",
            Self::External => "external",
            Self::Other(name) => name,
        }
    }

    /// Infer the kind from a location string such as `data/processed/rrc`.
    /// The first path component naming a known stage wins.
    pub fn infer(location: &str) -> Self {
        location
            .split(['/', '\\'])
            .map(Self::from)
            .find(|kind| !matches!(kind, Self::Other(_)))
            .unwrap_or_else(|| Self::Other(location.to_string()))
    }
}

impl From<&str> for LocationKind {
    fn from(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "processed" => Self::Processed,
            "interim" => Self::Interim,
            "raw" => Self::Raw,
            "external" => Self::External,
            _ => Self::Other(name.to_string()),
        }
    }
}

impl From<String> for LocationKind {
    fn from(name: String) -> Self {
        Self::from(name.as_str())
    }
}

impl From<LocationKind> for String {
    fn from(kind: LocationKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for LocationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pre-computed statistics for one location of a source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationStats {
    #[serde(default)]
    pub file_count: u64,
    #[serde(default, alias = "size")]
    pub size_bytes: u64,
    /// Extension (lowercase, no dot) to file count.
    #[serde(default, alias = "file_types")]
    pub file_type_histogram: BTreeMap<String, u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,
}

/// One node of a layered `directory_structure` tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryNode {
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub subdirs: BTreeMap<String, DirectoryNode>,
    /// Authoritative count reported by the node itself.
    #[serde(default)]
    pub file_count: u64,
    #[serde(default)]
    pub size_bytes: u64,
}

// ---------------------------------------------------------------------------
// SourceDescriptor
// ---------------------------------------------------------------------------

/// A source description exactly as delivered by the metadata provider.
/// Every field is optional; [`SourceDescriptor::try_from`] decides the shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawSourceDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub all_locations: Option<BTreeMap<String, LocationStats>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory_structure: Option<BTreeMap<String, DirectoryNode>>,
}

/// The flat shape: top-level counts plus an optional per-location map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlatSource {
    pub row_count: Option<u64>,
    pub file_count: u64,
    pub location: String,
    pub all_locations: Option<BTreeMap<String, LocationStats>>,
}

/// The layered shape: a directory tree keyed by top-level location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayeredSource {
    pub directory_structure: BTreeMap<String, DirectoryNode>,
}

/// Exactly one of the two raw shapes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum SourceShape {
    Flat(FlatSource),
    Layered(LayeredSource),
}

/// A typed, shape-classified source description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub id: String,
    pub label: String,
    pub shape: SourceShape,
}

impl SourceDescriptor {
    /// Classify a raw descriptor, using `fallback_id` when the payload has no id.
    ///
    /// `directory_structure` makes it layered even if `file_count` is also
    /// present; `file_count` alone makes it flat; neither is an error.
    pub fn from_raw(fallback_id: &str, raw: RawSourceDescriptor) -> Result<Self> {
        let id = raw.id.unwrap_or_else(|| fallback_id.to_string());
        let label = raw.label.unwrap_or_else(|| id.clone());

        let shape = match (raw.directory_structure, raw.file_count) {
            (Some(directory_structure), _) => SourceShape::Layered(LayeredSource {
                directory_structure,
            }),
            (None, Some(file_count)) => SourceShape::Flat(FlatSource {
                row_count: raw.row_count,
                file_count,
                location: raw.location.unwrap_or_default(),
                all_locations: raw.all_locations,
            }),
            (None, None) => {
                return Err(GenPipeError::validation(format!(
                    "source '{id}' has neither file_count nor directory_structure"
                )));
            }
        };

        Ok(Self { id, label, shape })
    }

    pub fn is_layered(&self) -> bool {
        matches!(self.shape, SourceShape::Layered(_))
    }
}

impl TryFrom<RawSourceDescriptor> for SourceDescriptor {
    type Error = GenPipeError;

    /// Like [`SourceDescriptor::from_raw`], but the payload must carry its own id.
    fn try_from(raw: RawSourceDescriptor) -> Result<Self> {
        let id = raw
            .id
            .clone()
            .ok_or_else(|| GenPipeError::validation("source descriptor has no id"))?;
        Self::from_raw(&id, raw)
    }
}

// ---------------------------------------------------------------------------
// CanonicalSource
// ---------------------------------------------------------------------------

/// Which raw shape a canonical source came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeKind {
    Flat,
    Layered,
}

/// Normalized multi-location description of one source.
///
/// Every location is kept; `available_in` only orders them for a caller's
/// default pick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalSource {
    pub id: String,
    pub label: String,
    pub shape: ShapeKind,
    pub locations: BTreeMap<LocationKind, LocationStats>,
    pub available_in: Vec<LocationKind>,
    /// The untouched layered tree, when the source was layered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tree: Option<BTreeMap<String, DirectoryNode>>,
    pub normalized_at: DateTime<Utc>,
}

impl CanonicalSource {
    /// The caller's default location: first entry of `available_in`.
    pub fn preferred_location(&self) -> Option<(&LocationKind, &LocationStats)> {
        self.available_in
            .first()
            .and_then(|kind| self.locations.get_key_value(kind))
    }
}

// ---------------------------------------------------------------------------
// Discovery telemetry
// ---------------------------------------------------------------------------

/// Why a tracked discovery operation failed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptErrorKind {
    NotFound,
    Timeout,
    PatternMismatch,
    Protocol,
    /// The guard was dropped without an outcome (early return or cancellation).
    Abandoned,
    Panic,
    Other(String),
}

/// Which hint the caller was missing, derived per attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HintType {
    None,
    Path,
    Structure,
    FilePattern,
}

impl HintType {
    /// Derive the missing hint from an attempt's outcome.
    pub fn derive(
        error_kind: Option<&AttemptErrorKind>,
        expected: Option<&str>,
        actual: Option<&str>,
        searched: usize,
    ) -> Self {
        let mismatch = matches!((expected, actual), (Some(e), Some(a)) if e != a);
        if matches!(error_kind, Some(AttemptErrorKind::NotFound)) || mismatch {
            Self::Path
        } else if searched > STRUCTURE_HINT_THRESHOLD {
            Self::Structure
        } else if matches!(error_kind, Some(AttemptErrorKind::PatternMismatch)) {
            Self::FilePattern
        } else {
            Self::None
        }
    }
}

impl fmt::Display for HintType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Path => "path",
            Self::Structure => "structure",
            Self::FilePattern => "file_pattern",
        };
        f.write_str(s)
    }
}

/// One measured discovery operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryAttempt {
    pub method: String,
    pub query: String,
    /// Hint the caller supplied, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    pub success: bool,
    pub duration_ms: u64,
    #[serde(default)]
    pub searched_locations: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<AttemptErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub result_count: usize,
    pub missing_hint_type: HintType,
    pub recorded_at: DateTime<Utc>,
}

impl DiscoveryAttempt {
    /// Whether the expected and actual locations were both known and differ.
    pub fn is_navigation_mismatch(&self) -> bool {
        matches!(
            (&self.expected_location, &self.actual_location),
            (Some(e), Some(a)) if e != a
        )
    }
}

/// Frozen aggregates computed when a session is sealed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionAggregates {
    pub total_attempts: usize,
    pub successful_attempts: usize,
    pub failed_attempts: usize,
    /// 0.0 to 1.0; 0.0 for an empty session.
    pub success_rate: f64,
    pub average_duration_ms: f64,
    pub total_duration_ms: u64,
    pub slowest: Vec<DiscoveryAttempt>,
    pub failures: Vec<DiscoveryAttempt>,
    pub navigation_mismatches: Vec<DiscoveryAttempt>,
    pub hint_deficiencies: BTreeMap<HintType, usize>,
}

impl SessionAggregates {
    fn compute(attempts: &[DiscoveryAttempt]) -> Self {
        let total = attempts.len();
        let successful = attempts.iter().filter(|a| a.success).count();
        let total_duration_ms: u64 = attempts.iter().map(|a| a.duration_ms).sum();

        let mut slowest: Vec<DiscoveryAttempt> = attempts.to_vec();
        // Stable sort keeps recording order among equal durations.
        slowest.sort_by(|a, b| b.duration_ms.cmp(&a.duration_ms));
        slowest.truncate(SLOWEST_ATTEMPTS_KEPT);

        let mut hint_deficiencies = BTreeMap::new();
        for attempt in attempts {
            *hint_deficiencies.entry(attempt.missing_hint_type).or_insert(0) += 1;
        }

        Self {
            total_attempts: total,
            successful_attempts: successful,
            failed_attempts: total - successful,
            success_rate: if total == 0 {
                0.0
            } else {
                successful as f64 / total as f64
            },
            average_duration_ms: if total == 0 {
                0.0
            } else {
                total_duration_ms as f64 / total as f64
            },
            total_duration_ms,
            slowest,
            failures: attempts.iter().filter(|a| !a.success).cloned().collect(),
            navigation_mismatches: attempts
                .iter()
                .filter(|a| a.is_navigation_mismatch())
                .cloned()
                .collect(),
            hint_deficiencies,
        }
    }
}

/// A sealed, immutable record of every tracked discovery operation in one session.
///
/// Fields are private; a session can only be built by [`DiscoverySession::seal`]
/// (or deserialized from the session log) and only read afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoverySession {
    id: SessionId,
    started_at: DateTime<Utc>,
    sealed_at: DateTime<Utc>,
    attempts: Vec<DiscoveryAttempt>,
    aggregates: SessionAggregates,
}

impl DiscoverySession {
    /// Freeze a list of attempts into a sealed session.
    pub fn seal(id: SessionId, started_at: DateTime<Utc>, attempts: Vec<DiscoveryAttempt>) -> Self {
        let aggregates = SessionAggregates::compute(&attempts);
        Self {
            id,
            started_at,
            sealed_at: Utc::now(),
            attempts,
            aggregates,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn sealed_at(&self) -> DateTime<Utc> {
        self.sealed_at
    }

    pub fn attempts(&self) -> &[DiscoveryAttempt] {
        &self.attempts
    }

    pub fn aggregates(&self) -> &SessionAggregates {
        &self.aggregates
    }

    pub fn total_attempts(&self) -> usize {
        self.aggregates.total_attempts
    }

    pub fn failed_attempts(&self) -> usize {
        self.aggregates.failed_attempts
    }

    pub fn success_rate(&self) -> f64 {
        self.aggregates.success_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(method: &str, success: bool, duration_ms: u64) -> DiscoveryAttempt {
        DiscoveryAttempt {
            method: method.into(),
            query: "q".into(),
            hint: None,
            success,
            duration_ms,
            searched_locations: vec![],
            expected_location: None,
            actual_location: None,
            error_kind: (!success).then_some(AttemptErrorKind::Protocol),
            error_message: None,
            result_count: 0,
            missing_hint_type: HintType::None,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn session_id_roundtrip() {
        let id = SessionId::new();
        let parsed: SessionId = id.to_string().parse().expect("parse SessionId");
        assert_eq!(id, parsed);
    }

    #[test]
    fn location_kind_parsing_and_order() {
        assert_eq!(LocationKind::from("RAW"), LocationKind::Raw);
        assert_eq!(
            LocationKind::from("models"),
            LocationKind::Other("models".into())
        );
        assert_eq!(LocationKind::infer("data/processed/rrc"), LocationKind::Processed);
        assert_eq!(
            LocationKind::infer("s3://bucket/x"),
            LocationKind::Other("s3://bucket/x".into())
        );

        let mut kinds = vec![
            LocationKind::Other("archive".into()),
            LocationKind::Raw,
            LocationKind::External,
            LocationKind::Processed,
            LocationKind::Interim,
        ];
        kinds.sort();
        assert_eq!(
            kinds,
            vec![
                LocationKind::Processed,
                LocationKind::Interim,
                LocationKind::Raw,
                LocationKind::External,
                LocationKind::Other("archive".into()),
            ]
        );
    }

    #[test]
    fn location_kind_serializes_as_plain_string() {
        let json = serde_json::to_string(&LocationKind::Interim).unwrap();
        assert_eq!(json, "\"interim\"");
        let parsed: LocationKind = serde_json::from_str("\"scratch\"").unwrap();
        assert_eq!(parsed, LocationKind::Other("scratch".into()));
    }

    #[test]
    fn descriptor_shape_classification() {
        let flat = RawSourceDescriptor {
            file_count: Some(3),
            location: Some("data/raw/rrc".into()),
            ..Default::default()
        };
        let desc = SourceDescriptor::from_raw("rrc", flat).unwrap();
        assert_eq!(desc.id, "rrc");
        assert_eq!(desc.label, "rrc");
        assert!(!desc.is_layered());

        let both = RawSourceDescriptor {
            file_count: Some(3),
            directory_structure: Some(BTreeMap::new()),
            ..Default::default()
        };
        assert!(SourceDescriptor::from_raw("x", both).unwrap().is_layered());

        let neither = RawSourceDescriptor::default();
        let err = SourceDescriptor::from_raw("ghost", neither).unwrap_err();
        assert!(err.to_string().contains("ghost"));

        let anonymous = RawSourceDescriptor {
            file_count: Some(1),
            ..Default::default()
        };
        assert!(SourceDescriptor::try_from(anonymous).is_err());
        let named = RawSourceDescriptor {
            id: Some("eia".into()),
            file_count: Some(1),
            ..Default::default()
        };
        assert_eq!(SourceDescriptor::try_from(named).unwrap().id, "eia");
    }

    #[test]
    fn descriptor_fixture_parses() {
        let fixture = std::fs::read_to_string("../../../fixtures/sources/descriptors.fixture.json")
            .expect("read fixture");
        let raw: BTreeMap<String, RawSourceDescriptor> =
            serde_json::from_str(&fixture).expect("deserialize fixture");
        assert_eq!(raw.len(), 3);

        let rrc = SourceDescriptor::from_raw("rrc", raw["rrc"].clone()).unwrap();
        assert!(!rrc.is_layered());
        let fracfocus = SourceDescriptor::from_raw("fracfocus", raw["fracfocus"].clone()).unwrap();
        assert!(fracfocus.is_layered());
    }

    #[test]
    fn hint_derivation_rules() {
        assert_eq!(
            HintType::derive(Some(&AttemptErrorKind::NotFound), None, None, 0),
            HintType::Path
        );
        assert_eq!(
            HintType::derive(None, Some("processed"), Some("raw"), 1),
            HintType::Path
        );
        assert_eq!(HintType::derive(None, Some("raw"), Some("raw"), 6), HintType::Structure);
        assert_eq!(HintType::derive(None, None, None, 5), HintType::None);
        assert_eq!(
            HintType::derive(Some(&AttemptErrorKind::PatternMismatch), None, None, 2),
            HintType::FilePattern
        );
    }

    #[test]
    fn sealed_session_aggregates() {
        let mut attempts: Vec<DiscoveryAttempt> = (0..7)
            .map(|i| attempt("find_sources", i % 3 != 0, (i as u64) * 10))
            .collect();
        attempts[1].expected_location = Some("processed".into());
        attempts[1].actual_location = Some("raw".into());
        attempts[1].missing_hint_type = HintType::Path;

        let session = DiscoverySession::seal(SessionId::new(), Utc::now(), attempts);
        let agg = session.aggregates();

        assert_eq!(session.total_attempts(), 7);
        assert_eq!(session.failed_attempts(), 3);
        assert_eq!(agg.successful_attempts, 4);
        assert!((session.success_rate() - 4.0 / 7.0).abs() < 1e-9);
        assert_eq!(agg.total_duration_ms, 210);
        assert!((agg.average_duration_ms - 30.0).abs() < 1e-9);
        assert_eq!(agg.slowest.len(), SLOWEST_ATTEMPTS_KEPT);
        assert_eq!(agg.slowest[0].duration_ms, 60);
        assert_eq!(agg.failures.len(), 3);
        assert_eq!(agg.navigation_mismatches.len(), 1);
        assert_eq!(agg.hint_deficiencies[&HintType::Path], 1);
        assert_eq!(agg.hint_deficiencies[&HintType::None], 6);
    }

    #[test]
    fn empty_session_has_zero_rates() {
        let session = DiscoverySession::seal(SessionId::new(), Utc::now(), vec![]);
        assert_eq!(session.total_attempts(), 0);
        assert_eq!(session.success_rate(), 0.0);
        assert!(session.aggregates().slowest.is_empty());
    }

    #[test]
    fn sealed_session_survives_serialization() {
        let session = DiscoverySession::seal(
            SessionId::new(),
            Utc::now(),
            vec![attempt("get_schema", true, 12)],
        );
        let json = serde_json::to_string(&session).expect("serialize");
        let parsed: DiscoverySession = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, session);
    }
}
