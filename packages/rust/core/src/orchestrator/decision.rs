//! Retry and fallback decisions.
//!
//! A policy only looks at its arguments. The orchestrator owns all side
//! effects, so every decision can be tested without any collaborator.

use tracing::debug;

use crate::stages::{ActionKind, EvaluationResult};

use super::state::OrchestratorState;

pub trait DecisionPolicy: Send + Sync {
    fn decide(
        &self,
        state: OrchestratorState,
        design_eval: Option<&EvaluationResult>,
        build_eval: Option<&EvaluationResult>,
        last_error: Option<&str>,
    ) -> ActionKind;
}

/// Retry while evaluations allow it, fall back to legacy when they don't.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPolicy;

impl DecisionPolicy for DefaultPolicy {
    fn decide(
        &self,
        state: OrchestratorState,
        design_eval: Option<&EvaluationResult>,
        build_eval: Option<&EvaluationResult>,
        last_error: Option<&str>,
    ) -> ActionKind {
        let action = match state {
            // Protocol errors and timeouts are retried; the stage budget
            // bounds how often.
            OrchestratorState::Error => ActionKind::RetryStage,
            _ => {
                let eval = match state {
                    OrchestratorState::Designing => design_eval,
                    OrchestratorState::BuildingSession | OrchestratorState::GeneratingCode => {
                        build_eval
                    }
                    _ => build_eval.or(design_eval),
                };
                match eval {
                    None => ActionKind::Proceed,
                    Some(eval) if eval.satisfactory => ActionKind::Proceed,
                    Some(eval) => eval.suggested_action.unwrap_or(if eval.can_retry {
                        ActionKind::RetryStage
                    } else {
                        ActionKind::FallbackToLegacy
                    }),
                }
            }
        };
        debug!(%state, %action, last_error, "decision");
        action
    }
}
