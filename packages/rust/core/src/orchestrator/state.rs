//! Orchestrator states and the legal transition graph.
//!
//! ```text
//! Idle -> ParsingRequirements -> DiscoveringData -> FetchingKnowledge
//!      -> AnalyzingContext -> Designing
//! Designing       -> Designing | BuildingSession
//! BuildingSession -> GeneratingCode
//! GeneratingCode  -> GeneratingCode | Completed
//! Error           -> Designing | BuildingSession | GeneratingCode | Completed
//! any non-terminal state -> Error
//! ```
//!
//! Re-entering `Designing` or `GeneratingCode` is how a stage retry looks;
//! leaving `Error` is how a recovered stage failure looks.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use genpipe_shared::{GenPipeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    Idle,
    ParsingRequirements,
    DiscoveringData,
    FetchingKnowledge,
    AnalyzingContext,
    Designing,
    BuildingSession,
    GeneratingCode,
    Completed,
    Error,
}

impl OrchestratorState {
    pub fn is_terminal(self) -> bool {
        self == Self::Completed
    }
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::ParsingRequirements => "parsing_requirements",
            Self::DiscoveringData => "discovering_data",
            Self::FetchingKnowledge => "fetching_knowledge",
            Self::AnalyzingContext => "analyzing_context",
            Self::Designing => "designing",
            Self::BuildingSession => "building_session",
            Self::GeneratingCode => "generating_code",
            Self::Completed => "completed",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

pub fn is_legal_transition(from: OrchestratorState, to: OrchestratorState) -> bool {
    use OrchestratorState::*;

    if to == Error {
        return from != Error && !from.is_terminal();
    }

    matches!(
        (from, to),
        (Idle, ParsingRequirements)
            | (ParsingRequirements, DiscoveringData)
            | (DiscoveringData, FetchingKnowledge)
            | (FetchingKnowledge, AnalyzingContext)
            | (AnalyzingContext, Designing)
            | (Designing, Designing)
            | (Designing, BuildingSession)
            | (BuildingSession, GeneratingCode)
            | (GeneratingCode, GeneratingCode)
            | (GeneratingCode, Completed)
            | (Error, Designing)
            | (Error, BuildingSession)
            | (Error, GeneratingCode)
            | (Error, Completed)
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: OrchestratorState,
    pub to: OrchestratorState,
    /// Stage attempt number at the time, 0 outside the stage loops.
    pub attempt: u32,
    pub at: DateTime<Utc>,
}

/// Current state plus the log of every transition taken.
#[derive(Debug, Clone)]
pub struct StateMachine {
    current: OrchestratorState,
    transitions: Vec<TransitionRecord>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            current: OrchestratorState::Idle,
            transitions: Vec::new(),
        }
    }

    pub fn current(&self) -> OrchestratorState {
        self.current
    }

    pub fn transitions(&self) -> &[TransitionRecord] {
        &self.transitions
    }

    pub fn into_transitions(self) -> Vec<TransitionRecord> {
        self.transitions
    }

    /// Move to `to`, or fail without changing state.
    pub fn transition(&mut self, to: OrchestratorState, attempt: u32) -> Result<()> {
        if !is_legal_transition(self.current, to) {
            return Err(GenPipeError::validation(format!(
                "illegal state transition: {} -> {to}",
                self.current
            )));
        }
        debug!(from = %self.current, to = %to, attempt, "state transition");
        self.transitions.push(TransitionRecord {
            from: self.current,
            to,
            attempt,
            at: Utc::now(),
        });
        self.current = to;
        Ok(())
    }

    /// Enter `Error` unless already there.
    pub fn fail(&mut self, attempt: u32) {
        if self.current != OrchestratorState::Error && !self.current.is_terminal() {
            // Every non-terminal state may move to Error.
            let _ = self.transition(OrchestratorState::Error, attempt);
        }
    }
}
