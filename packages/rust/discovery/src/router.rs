//! Deterministic keyword routing, run before any semantic lookup.
//!
//! A generic phrase like "production data" must never bind to a
//! domain-specific source through fuzzy similarity alone, so intents are
//! first checked against three disjoint keyword sets:
//!
//! 1. exclusion terms: any hit defers to semantic discovery
//! 2. domain terms: a hit routes to that domain's allow-listed sources
//! 3. ambiguous terms: never enough on their own

use std::sync::atomic::{AtomicU64, Ordering};

use regex::Regex;
use serde::Serialize;
use tracing::{debug, info};

use genpipe_shared::{GenPipeError, Result, RouterConfig, SourceRef, check_disjoint_terms};

/// How an intent was classified against the keyword sets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum IntentClass {
    /// An exclusion term matched; domain terms are ignored.
    Excluded { term: String },
    /// Domain terms matched for these profiles, in declaration order.
    Domain { profiles: Vec<String> },
    /// Only ambiguous terms matched.
    Ambiguous { term: String },
    /// Nothing matched.
    Unmatched,
}

/// Routing counters exposed by [`DomainRouter::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RouterStats {
    pub total_routes: u64,
    pub domain_routes: u64,
    /// `domain_routes / total_routes * 100`, or 0 before the first route.
    pub domain_percentage: f64,
}

struct CompiledDomain {
    name: String,
    matcher: Option<Regex>,
    allow_list: Vec<String>,
}

/// Keyword router owning its own counters. One instance per orchestrator.
pub struct DomainRouter {
    domains: Vec<CompiledDomain>,
    exclusion: Option<Regex>,
    ambiguous: Option<Regex>,
    total_routes: AtomicU64,
    domain_routes: AtomicU64,
}

impl DomainRouter {
    /// Compile the keyword sets. Fails if the sets overlap.
    pub fn new(config: &RouterConfig) -> Result<Self> {
        check_disjoint_terms(config)?;

        let domains = config
            .domains
            .iter()
            .map(|d| {
                Ok(CompiledDomain {
                    name: d.name.clone(),
                    matcher: compile_terms(&d.terms)?,
                    allow_list: d.allow_list.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            domains,
            exclusion: compile_terms(&config.exclusion_terms)?,
            ambiguous: compile_terms(&config.ambiguous_terms)?,
            total_routes: AtomicU64::new(0),
            domain_routes: AtomicU64::new(0),
        })
    }

    /// Classify an intent without touching the counters.
    pub fn classify(&self, intent: &str) -> IntentClass {
        if let Some(term) = first_match(self.exclusion.as_ref(), intent) {
            return IntentClass::Excluded { term };
        }

        let profiles: Vec<String> = self
            .domains
            .iter()
            .filter(|d| first_match(d.matcher.as_ref(), intent).is_some())
            .map(|d| d.name.clone())
            .collect();
        if !profiles.is_empty() {
            return IntentClass::Domain { profiles };
        }

        match first_match(self.ambiguous.as_ref(), intent) {
            Some(term) => IntentClass::Ambiguous { term },
            None => IntentClass::Unmatched,
        }
    }

    /// Route an intent to allow-listed sources, or `None` to defer to
    /// semantic discovery. Never returns sources absent from `available`.
    pub fn route(&self, intent: &str, available: &[SourceRef]) -> Option<Vec<SourceRef>> {
        self.total_routes.fetch_add(1, Ordering::Relaxed);

        let class = self.classify(intent);
        let IntentClass::Domain { profiles } = &class else {
            debug!(?class, "intent not routed, deferring to semantic discovery");
            return None;
        };

        for domain in self.domains.iter().filter(|d| profiles.contains(&d.name)) {
            let routed: Vec<SourceRef> = available
                .iter()
                .filter(|s| domain.allow_list.iter().any(|id| id == &s.id))
                .cloned()
                .collect();

            if !routed.is_empty() {
                self.domain_routes.fetch_add(1, Ordering::Relaxed);
                info!(
                    domain = %domain.name,
                    sources = ?routed.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
                    "intent routed deterministically"
                );
                return Some(routed);
            }
            debug!(domain = %domain.name, "no allow-listed source available");
        }

        None
    }

    pub fn stats(&self) -> RouterStats {
        let total = self.total_routes.load(Ordering::Relaxed);
        let domain = self.domain_routes.load(Ordering::Relaxed);
        RouterStats {
            total_routes: total,
            domain_routes: domain,
            domain_percentage: if total == 0 {
                0.0
            } else {
                domain as f64 / total as f64 * 100.0
            },
        }
    }

    pub fn reset_stats(&self) {
        self.total_routes.store(0, Ordering::Relaxed);
        self.domain_routes.store(0, Ordering::Relaxed);
    }
}

/// Build a case-insensitive, word-bounded alternation. Multi-word terms
/// tolerate any run of whitespace between words.
fn compile_terms(terms: &[String]) -> Result<Option<Regex>> {
    let mut parts: Vec<String> = terms
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .map(|t| {
            t.split_whitespace()
                .map(regex::escape)
                .collect::<Vec<_>>()
                .join(r"\s+")
        })
        .collect();
    if parts.is_empty() {
        return Ok(None);
    }
    // Longest first so the reported term is the most specific one.
    parts.sort_by_key(|p| std::cmp::Reverse(p.len()));

    let pattern = format!(r"(?i)\b(?:{})\b", parts.join("|"));
    Regex::new(&pattern)
        .map(Some)
        .map_err(|e| GenPipeError::config(format!("invalid router term pattern: {e}")))
}

fn first_match(matcher: Option<&Regex>, intent: &str) -> Option<String> {
    matcher
        .and_then(|re| re.find(intent))
        .map(|m| m.as_str().to_lowercase())
}
