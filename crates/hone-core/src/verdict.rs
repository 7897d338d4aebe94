//! Verdict computation for one validation pass.
//!
//! A finding blocks when its severity is at or above the threshold, unless it
//! comes from a `Failed` invocation of a non-required adapter. A verdict passes
//! when nothing blocks and every required adapter ended `Succeeded` or
//! `TimedOut`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::types::{Finding, InvocationStatus, Severity, ToolInvocation};

/// Aggregated outcome of one validation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub passed: bool,
    /// Blocking threshold the verdict was computed with.
    pub threshold: Severity,
    pub invocations: Vec<ToolInvocation>,
    pub produced_at: DateTime<Utc>,
}

impl Verdict {
    pub fn from_invocations(invocations: Vec<ToolInvocation>, threshold: Severity) -> Self {
        let nothing_blocks = invocations
            .iter()
            .all(|inv| blocking_in(inv, threshold).next().is_none());
        let required_ok = invocations
            .iter()
            .filter(|inv| inv.required)
            .all(|inv| {
                matches!(
                    inv.status,
                    InvocationStatus::Succeeded | InvocationStatus::TimedOut
                )
            });

        Self {
            passed: nothing_blocks && required_ok,
            threshold,
            invocations,
            produced_at: Utc::now(),
        }
    }

    /// Findings at or above the threshold, in invocation order.
    pub fn blocking_findings(&self) -> Vec<&Finding> {
        self.invocations
            .iter()
            .flat_map(|inv| blocking_in(inv, self.threshold))
            .collect()
    }

    pub fn invocation(&self, tool_name: &str) -> Option<&ToolInvocation> {
        self.invocations.iter().find(|inv| inv.tool_name == tool_name)
    }

    pub fn summary(&self) -> VerdictSummary {
        let mut severities = SeverityCounts::default();
        let mut tools = Vec::with_capacity(self.invocations.len());
        let mut clean = 0usize;

        for inv in &self.invocations {
            for finding in &inv.findings {
                severities.add(finding.severity);
            }
            let blocking = blocking_in(inv, self.threshold).count();
            if inv.status == InvocationStatus::Succeeded && blocking == 0 {
                clean += 1;
            }
            tools.push(ToolSummary {
                tool: inv.tool_name.clone(),
                status: inv.status,
                required: inv.required,
                findings: inv.findings.len(),
                blocking,
            });
        }

        let score = if self.invocations.is_empty() {
            100
        } else {
            (clean * 100 / self.invocations.len()) as u8
        };

        VerdictSummary {
            passed: self.passed,
            threshold: self.threshold,
            blocking_count: tools.iter().map(|t| t.blocking).sum(),
            severities,
            tools,
            score,
        }
    }
}

/// Whether findings of this invocation take part in the verdict.
fn counts_toward_verdict(inv: &ToolInvocation) -> bool {
    inv.status != InvocationStatus::Failed || inv.required
}

fn blocking_in(inv: &ToolInvocation, threshold: Severity) -> impl Iterator<Item = &Finding> {
    let counted = counts_toward_verdict(inv);
    inv.findings
        .iter()
        .filter(move |f| counted && f.severity.blocks_at(threshold))
}

/// Drop repeated findings from a single tool.
///
/// Two findings are the same when `(rule_id, resource_ref, message)` match
/// exactly. First occurrence wins and order is preserved. Never call this on
/// findings from different tools.
pub fn dedup_within_tool(findings: Vec<Finding>) -> Vec<Finding> {
    let mut seen: HashSet<(Option<String>, String, String)> = HashSet::new();
    findings
        .into_iter()
        .filter(|f| seen.insert((f.rule_id.clone(), f.resource_ref.clone(), f.message.clone())))
        .collect()
}

/// Compact projection of a verdict for status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerdictSummary {
    pub passed: bool,
    pub threshold: Severity,
    pub blocking_count: usize,
    pub severities: SeverityCounts,
    pub tools: Vec<ToolSummary>,
    /// Percentage of invocations that succeeded with no blocking findings.
    pub score: u8,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityCounts {
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub info: usize,
}

impl SeverityCounts {
    fn add(&mut self, severity: Severity) {
        match severity {
            Severity::Critical => self.critical += 1,
            Severity::High => self.high += 1,
            Severity::Medium => self.medium += 1,
            Severity::Low => self.low += 1,
            Severity::Info => self.info += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSummary {
    pub tool: String,
    pub status: InvocationStatus,
    pub required: bool,
    pub findings: usize,
    pub blocking: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InvocationFailure, PARSE_ERROR_RULE};

    fn finding(tool: &str, severity: Severity) -> Finding {
        Finding::new(severity, tool, "aws_s3_bucket.logs", format!("{} issue", severity.as_str()))
    }

    fn succeeded(tool: &str, required: bool, findings: Vec<Finding>) -> ToolInvocation {
        let mut inv = ToolInvocation::running(tool, required);
        inv.findings = findings;
        inv.finish(InvocationStatus::Succeeded)
    }

    #[test]
    fn high_and_low_at_high_threshold_fails() {
        let inv = succeeded(
            "tflint",
            true,
            vec![finding("tflint", Severity::High), finding("tflint", Severity::Low)],
        );
        let verdict = Verdict::from_invocations(vec![inv], Severity::High);
        assert!(!verdict.passed);
        assert_eq!(verdict.blocking_findings().len(), 1);
        assert_eq!(verdict.blocking_findings()[0].severity, Severity::High);
    }

    #[test]
    fn low_and_info_at_high_threshold_passes() {
        let inv = succeeded(
            "tflint",
            true,
            vec![finding("tflint", Severity::Low), finding("tflint", Severity::Info)],
        );
        let verdict = Verdict::from_invocations(vec![inv], Severity::High);
        assert!(verdict.passed);
        assert!(verdict.blocking_findings().is_empty());
    }

    #[test]
    fn blocking_finding_from_optional_adapter_still_fails() {
        let required = succeeded("terraform", true, Vec::new());
        let optional = succeeded("trivy", false, vec![finding("trivy", Severity::Critical)]);
        let verdict = Verdict::from_invocations(vec![required, optional], Severity::High);
        assert!(!verdict.passed);
    }

    #[test]
    fn optional_timeout_does_not_block() {
        let terraform = succeeded("terraform", true, Vec::new());
        let trivy = ToolInvocation::running("trivy", false).finish(InvocationStatus::TimedOut);
        let verdict = Verdict::from_invocations(vec![terraform, trivy], Severity::High);
        assert!(verdict.passed);
    }

    #[test]
    fn required_timeout_with_partial_blocking_finding_fails() {
        let mut inv = ToolInvocation::running("trivy", true);
        inv.findings.push(finding("trivy", Severity::High));
        let inv = inv.finish(InvocationStatus::TimedOut);
        let verdict = Verdict::from_invocations(vec![inv], Severity::High);
        assert!(!verdict.passed);
    }

    #[test]
    fn required_timeout_without_findings_passes() {
        let inv = ToolInvocation::running("trivy", true).finish(InvocationStatus::TimedOut);
        let verdict = Verdict::from_invocations(vec![inv], Severity::High);
        assert!(verdict.passed);
    }

    #[test]
    fn required_failure_blocks_but_optional_failure_does_not() {
        let broken = || {
            ToolInvocation::running("tflint", true).fail(
                InvocationFailure::ParseError,
                PARSE_ERROR_RULE,
                "garbage on stdout",
            )
        };

        let verdict = Verdict::from_invocations(vec![broken()], Severity::High);
        assert!(!verdict.passed);

        let mut optional = broken();
        optional.required = false;
        let verdict = Verdict::from_invocations(vec![optional], Severity::High);
        assert!(verdict.passed);
        assert!(verdict.blocking_findings().is_empty());
    }

    #[test]
    fn empty_pass_is_vacuously_passed() {
        let verdict = Verdict::from_invocations(Vec::new(), Severity::High);
        assert!(verdict.passed);
        assert_eq!(verdict.summary().score, 100);
    }

    #[test]
    fn dedup_removes_exact_repeats_only() {
        let base = finding("tflint", Severity::Medium).with_rule("terraform_naming_convention");
        let mut other_message = base.clone();
        other_message.message = "different".to_string();
        let mut other_resource = base.clone();
        other_resource.resource_ref = "aws_s3_bucket.data".to_string();

        let deduped = dedup_within_tool(vec![
            base.clone(),
            other_message.clone(),
            base.clone(),
            other_resource.clone(),
        ]);
        assert_eq!(deduped, vec![base, other_message, other_resource]);
    }

    #[test]
    fn findings_from_different_tools_are_retained() {
        let tflint = succeeded("tflint", true, vec![finding("tflint", Severity::Medium)]);
        let trivy = succeeded("trivy", true, vec![finding("trivy", Severity::High)]);
        let verdict = Verdict::from_invocations(vec![tflint, trivy], Severity::Medium);
        let blocking = verdict.blocking_findings();
        assert_eq!(blocking.len(), 2);
        assert_eq!(blocking[0].source_tool, "tflint");
        assert_eq!(blocking[1].source_tool, "trivy");
    }

    #[test]
    fn summary_counts_severities_and_score() {
        let clean = succeeded("terraform", true, vec![finding("terraform", Severity::Info)]);
        let dirty = succeeded("tflint", true, vec![finding("tflint", Severity::Critical)]);
        let slow = ToolInvocation::running("trivy", false).finish(InvocationStatus::TimedOut);
        let verdict = Verdict::from_invocations(vec![clean, dirty, slow], Severity::High);

        let summary = verdict.summary();
        assert!(!summary.passed);
        assert_eq!(summary.blocking_count, 1);
        assert_eq!(summary.severities.critical, 1);
        assert_eq!(summary.severities.info, 1);
        assert_eq!(summary.score, 33);
        assert_eq!(summary.tools[2].status, InvocationStatus::TimedOut);
    }
}
