//! Data discovery for genpipe.
//!
//! Intents first go through the deterministic [`DomainRouter`]; anything it
//! declines falls through to semantic search via [`DiscoveryClient`]. Every
//! discovery call is measured by a [`DiscoveryTracker`] and sealed into a
//! session at the end of a generation.

pub mod analysis;
pub mod catalog;
pub mod client;
pub mod http;
pub mod instrumentation;
pub mod router;

pub use analysis::{MethodStats, SessionAnalysis};
pub use catalog::StaticCatalog;
pub use client::{
    DiscoveredSource, DiscoveryClient, DiscoveryOptions, DiscoveryReport, MetadataProvider,
    ProcessingStatus, Schema, SearchHit, SourceCandidate, VectorIndex, rank_candidates,
};
pub use http::{HttpMetadataProvider, HttpVectorIndex};
pub use instrumentation::{DiscoveryTracker, ScopedAttempt, error_kind_for};
pub use router::{DomainRouter, IntentClass, RouterStats};
