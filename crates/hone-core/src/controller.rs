//! Refinement controller.
//!
//! Decides whether a run keeps iterating after a validation pass. The checks
//! run in a fixed order: passed, then iteration budget, then deadline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::machine::PhaseEvent;
use crate::types::{Finding, Severity, WorkflowRun};
use crate::verdict::Verdict;

/// Default iteration budget when a request does not set one.
pub const DEFAULT_MAX_ITERATIONS: u32 = 5;

/// Outcome of [`decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Continue,
    StopPassed,
    StopExhausted,
    StopTimeout,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Continue => "CONTINUE",
            Self::StopPassed => "STOP_PASSED",
            Self::StopExhausted => "STOP_EXHAUSTED",
            Self::StopTimeout => "STOP_TIMEOUT",
        }
    }

    /// The state machine event this decision raises in `Validating`.
    pub fn phase_event(&self) -> PhaseEvent {
        match self {
            Self::Continue => PhaseEvent::VerdictContinue,
            Self::StopPassed => PhaseEvent::VerdictPassed,
            Self::StopExhausted => PhaseEvent::VerdictExhausted,
            Self::StopTimeout => PhaseEvent::VerdictTimeout,
        }
    }
}

/// Decide what follows a validation pass.
///
/// Pure: `now` is passed in rather than read from the clock.
///
/// # Example
/// ```
/// use chrono::Utc;
/// use hone_core::controller::{decide, Decision};
/// use hone_core::{RunRequest, Severity, Verdict, WorkflowRun};
///
/// let request = RunRequest {
///     requirements: "bucket".into(),
///     max_iterations: 5,
///     total_timeout_sec: 60,
///     blocking_severity: Severity::High,
///     initial_candidate: None,
/// };
/// let run = WorkflowRun::new(&request, Utc::now());
/// let verdict = Verdict::from_invocations(Vec::new(), Severity::High);
/// assert_eq!(decide(&run, &verdict, Utc::now()), Decision::StopPassed);
/// ```
pub fn decide(run: &WorkflowRun, latest_verdict: &Verdict, now: DateTime<Utc>) -> Decision {
    if latest_verdict.passed {
        Decision::StopPassed
    } else if run.iteration >= run.max_iterations {
        Decision::StopExhausted
    } else if now >= run.deadline {
        Decision::StopTimeout
    } else {
        Decision::Continue
    }
}

/// Blocking findings reported by one tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolFindings {
    pub tool: String,
    pub findings: Vec<Finding>,
}

/// Remediation input handed to the code generator on `Continue`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinementRequest {
    pub previous_candidate: String,
    /// Blocking findings grouped by source tool, in first-seen order.
    pub blocking: Vec<ToolFindings>,
    /// Iteration the refined candidate will be validated in.
    pub iteration: u32,
    pub threshold: Severity,
}

impl RefinementRequest {
    pub fn new(previous_candidate: impl Into<String>, verdict: &Verdict, iteration: u32) -> Self {
        let mut blocking: Vec<ToolFindings> = Vec::new();
        for finding in verdict.blocking_findings() {
            match blocking.iter_mut().find(|g| g.tool == finding.source_tool) {
                Some(group) => group.findings.push(finding.clone()),
                None => blocking.push(ToolFindings {
                    tool: finding.source_tool.clone(),
                    findings: vec![finding.clone()],
                }),
            }
        }
        Self {
            previous_candidate: previous_candidate.into(),
            blocking,
            iteration,
            threshold: verdict.threshold,
        }
    }

    pub fn finding_count(&self) -> usize {
        self.blocking.iter().map(|g| g.findings.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InvocationStatus, RunRequest, ToolInvocation};
    use chrono::Duration;

    fn run_with(iteration: u32, max_iterations: u32) -> WorkflowRun {
        let request = RunRequest {
            requirements: "vpc".to_string(),
            max_iterations,
            total_timeout_sec: 300,
            blocking_severity: Severity::High,
            initial_candidate: None,
        };
        let mut run = WorkflowRun::new(&request, Utc::now());
        run.iteration = iteration;
        run
    }

    fn verdict(findings: Vec<Finding>) -> Verdict {
        let mut inv = ToolInvocation::running("tflint", true);
        inv.findings = findings;
        Verdict::from_invocations(vec![inv.finish(InvocationStatus::Succeeded)], Severity::High)
    }

    fn critical(tool: &str, message: &str) -> Finding {
        Finding::new(Severity::Critical, tool, "main.tf", message)
    }

    #[test]
    fn passed_wins_over_everything() {
        let run = run_with(9, 2);
        let late = run.deadline + Duration::hours(1);
        assert_eq!(decide(&run, &verdict(Vec::new()), late), Decision::StopPassed);
    }

    #[test]
    fn exhausted_checked_before_timeout() {
        let run = run_with(2, 2);
        let late = run.deadline + Duration::seconds(1);
        let failing = verdict(vec![critical("tflint", "x")]);
        assert_eq!(decide(&run, &failing, late), Decision::StopExhausted);
    }

    #[test]
    fn timeout_when_deadline_reached() {
        let run = run_with(1, 5);
        let failing = verdict(vec![critical("tflint", "x")]);
        assert_eq!(decide(&run, &failing, run.deadline), Decision::StopTimeout);
    }

    #[test]
    fn continue_within_budget() {
        let run = run_with(0, 5);
        let failing = verdict(vec![critical("tflint", "x")]);
        assert_eq!(decide(&run, &failing, Utc::now()), Decision::Continue);
    }

    #[test]
    fn zero_budget_stops_after_first_failure() {
        let run = run_with(0, 0);
        let failing = verdict(vec![critical("tflint", "x")]);
        assert_eq!(decide(&run, &failing, Utc::now()), Decision::StopExhausted);
    }

    #[test]
    fn decisions_map_to_phase_events() {
        assert_eq!(Decision::Continue.phase_event(), PhaseEvent::VerdictContinue);
        assert_eq!(Decision::StopPassed.phase_event(), PhaseEvent::VerdictPassed);
        assert_eq!(Decision::StopExhausted.phase_event(), PhaseEvent::VerdictExhausted);
        assert_eq!(Decision::StopTimeout.phase_event(), PhaseEvent::VerdictTimeout);
    }

    #[test]
    fn refinement_request_groups_by_tool() {
        let tflint = {
            let mut inv = ToolInvocation::running("tflint", true);
            inv.findings = vec![critical("tflint", "a"), critical("tflint", "b")];
            inv.finish(InvocationStatus::Succeeded)
        };
        let trivy = {
            let mut inv = ToolInvocation::running("trivy", true);
            inv.findings = vec![
                critical("trivy", "c"),
                Finding::new(Severity::Low, "trivy", "main.tf", "minor"),
            ];
            inv.finish(InvocationStatus::Succeeded)
        };
        let verdict = Verdict::from_invocations(vec![tflint, trivy], Severity::High);

        let request = RefinementRequest::new("old code", &verdict, 1);
        assert_eq!(request.previous_candidate, "old code");
        assert_eq!(request.iteration, 1);
        assert_eq!(request.blocking.len(), 2);
        assert_eq!(request.blocking[0].tool, "tflint");
        assert_eq!(request.blocking[0].findings.len(), 2);
        assert_eq!(request.blocking[1].findings.len(), 1);
        assert_eq!(request.finding_count(), 3);
    }
}
