//! Shared types, error model, and configuration for genpipe.
//!
//! This crate is the foundation depended on by all other genpipe crates.
//! It provides:
//! - [`GenPipeError`]: the unified error type
//! - Domain types ([`SourceDescriptor`], [`CanonicalSource`], [`DiscoverySession`], [`SessionId`])
//! - Configuration ([`AppConfig`], [`Timeouts`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DiscoveryConfig, DomainProfile, GenerationConfig, KnowledgeConfig, PipelineConfig,
    RouterConfig, TelemetryConfig, Timeouts, ValidatorConfig, check_disjoint_terms, config_dir,
    config_file_path, init_config, load_config, load_config_from, session_log_path,
    validate_config,
};
pub use error::{GenPipeError, Result};
pub use types::{
    AttemptErrorKind, CanonicalSource, DirectoryNode, DiscoveryAttempt, DiscoverySession,
    FlatSource, HintType, LayeredSource, LocationKind, LocationStats, RawSourceDescriptor,
    SessionAggregates, SessionId, ShapeKind, SourceDescriptor, SourceRef, SourceShape,
};
