//! Workflow state machine.
//!
//! `transition` is the single source of truth for which phase follows which.
//! The orchestrator never assigns `WorkflowRun::phase` directly.

use crate::types::{Phase, TerminalReason};
use thiserror::Error;

/// Something that happened to a run and may move it to another phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    PlanReady,
    CandidateProduced,
    VerdictPassed,
    VerdictContinue,
    VerdictExhausted,
    VerdictTimeout,
    RefinedCandidateReady,
    DocsProduced,
    /// The run deadline passed while waiting on a collaborator.
    DeadlineExceeded,
    FatalError,
    Cancelled,
}

impl PhaseEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PlanReady => "plan_ready",
            Self::CandidateProduced => "candidate_produced",
            Self::VerdictPassed => "verdict_passed",
            Self::VerdictContinue => "verdict_continue",
            Self::VerdictExhausted => "verdict_exhausted",
            Self::VerdictTimeout => "verdict_timeout",
            Self::RefinedCandidateReady => "refined_candidate_ready",
            Self::DocsProduced => "docs_produced",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::FatalError => "fatal_error",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal reason recorded when this event ends a run.
    pub fn terminal_reason(&self) -> Option<TerminalReason> {
        match self {
            Self::DocsProduced => Some(TerminalReason::Passed),
            Self::VerdictExhausted => Some(TerminalReason::MaxIterations),
            Self::VerdictTimeout | Self::DeadlineExceeded => Some(TerminalReason::Timeout),
            Self::FatalError => Some(TerminalReason::FatalToolError),
            Self::Cancelled => Some(TerminalReason::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("run is terminal ({0}); no further transitions accepted")]
    Terminal(&'static str),
    #[error("invalid transition: {from} --{event}-->")]
    Invalid {
        from: &'static str,
        event: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, TransitionError>;

/// Compute the next phase for `(from, event)`.
pub fn transition(from: Phase, event: PhaseEvent) -> Result<Phase> {
    use PhaseEvent as E;

    if from.is_terminal() {
        return Err(TransitionError::Terminal(from.as_str()));
    }

    let to = match (from, event) {
        (_, E::FatalError | E::Cancelled | E::DeadlineExceeded) => Phase::Failed,
        (Phase::Planning, E::PlanReady) => Phase::Generating,
        (Phase::Generating, E::CandidateProduced) => Phase::Validating,
        (Phase::Validating, E::VerdictPassed) => Phase::Documenting,
        (Phase::Validating, E::VerdictContinue) => Phase::Refining,
        (Phase::Validating, E::VerdictExhausted | E::VerdictTimeout) => Phase::Failed,
        (Phase::Refining, E::RefinedCandidateReady) => Phase::Generating,
        (Phase::Documenting, E::DocsProduced) => Phase::Done,
        _ => {
            return Err(TransitionError::Invalid {
                from: from.as_str(),
                event: event.as_str(),
            })
        }
    };
    Ok(to)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_reaches_done() {
        let mut phase = Phase::Planning;
        for event in [
            PhaseEvent::PlanReady,
            PhaseEvent::CandidateProduced,
            PhaseEvent::VerdictPassed,
            PhaseEvent::DocsProduced,
        ] {
            phase = transition(phase, event).unwrap();
        }
        assert_eq!(phase, Phase::Done);
    }

    #[test]
    fn refine_loop_returns_to_generating() {
        let phase = transition(Phase::Validating, PhaseEvent::VerdictContinue).unwrap();
        assert_eq!(phase, Phase::Refining);
        let phase = transition(phase, PhaseEvent::RefinedCandidateReady).unwrap();
        assert_eq!(phase, Phase::Generating);
        let phase = transition(phase, PhaseEvent::CandidateProduced).unwrap();
        assert_eq!(phase, Phase::Validating);
    }

    #[test]
    fn budget_stops_fail_from_validating() {
        assert_eq!(
            transition(Phase::Validating, PhaseEvent::VerdictExhausted),
            Ok(Phase::Failed)
        );
        assert_eq!(
            transition(Phase::Validating, PhaseEvent::VerdictTimeout),
            Ok(Phase::Failed)
        );
        assert!(transition(Phase::Generating, PhaseEvent::VerdictExhausted).is_err());
    }

    #[test]
    fn fatal_and_cancel_allowed_from_every_live_phase() {
        for phase in [
            Phase::Planning,
            Phase::Generating,
            Phase::Validating,
            Phase::Refining,
            Phase::Documenting,
        ] {
            assert_eq!(transition(phase, PhaseEvent::FatalError), Ok(Phase::Failed));
            assert_eq!(transition(phase, PhaseEvent::Cancelled), Ok(Phase::Failed));
            assert_eq!(transition(phase, PhaseEvent::DeadlineExceeded), Ok(Phase::Failed));
        }
    }

    #[test]
    fn terminal_phases_reject_everything() {
        for phase in [Phase::Done, Phase::Failed] {
            assert!(matches!(
                transition(phase, PhaseEvent::Cancelled),
                Err(TransitionError::Terminal(_))
            ));
            assert!(transition(phase, PhaseEvent::PlanReady).is_err());
        }
    }

    #[test]
    fn out_of_order_events_are_rejected() {
        assert_eq!(
            transition(Phase::Planning, PhaseEvent::CandidateProduced),
            Err(TransitionError::Invalid {
                from: "PLANNING",
                event: "candidate_produced",
            })
        );
        assert!(transition(Phase::Refining, PhaseEvent::VerdictPassed).is_err());
        assert!(transition(Phase::Documenting, PhaseEvent::PlanReady).is_err());
    }

    #[test]
    fn terminal_reasons_follow_events() {
        assert_eq!(
            PhaseEvent::DocsProduced.terminal_reason(),
            Some(TerminalReason::Passed)
        );
        assert_eq!(
            PhaseEvent::VerdictExhausted.terminal_reason(),
            Some(TerminalReason::MaxIterations)
        );
        assert_eq!(
            PhaseEvent::DeadlineExceeded.terminal_reason(),
            Some(TerminalReason::Timeout)
        );
        assert_eq!(PhaseEvent::VerdictContinue.terminal_reason(), None);
    }
}
