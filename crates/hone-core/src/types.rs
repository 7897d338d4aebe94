//! Core types for the orchestration engine.
//!
//! A `WorkflowRun` is one generation/validation lifecycle. Each validation pass
//! produces one `ToolInvocation` per adapter, which carry normalized `Finding`s
//! and are folded into a `Verdict` (see `verdict.rs`).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::verdict::{Verdict, VerdictSummary};

/// Rule id attached to the synthetic finding emitted for unparseable tool output.
pub const PARSE_ERROR_RULE: &str = "adapter_parse_error";
/// Rule id attached to the synthetic finding emitted when a tool cannot be started.
pub const SPAWN_ERROR_RULE: &str = "adapter_spawn_error";
/// Rule id attached to the synthetic finding emitted when an adapter task panics.
pub const CRASH_RULE: &str = "adapter_crashed";

/// Unique identifier for runs and events.
/// Uses `UUIDv7` for time-ordered lexicographic sorting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// --- Enumerations ---

/// Workflow phase. `Done` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Planning,
    Generating,
    Validating,
    Refining,
    Documenting,
    Done,
    Failed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "PLANNING",
            Self::Generating => "GENERATING",
            Self::Validating => "VALIDATING",
            Self::Refining => "REFINING",
            Self::Documenting => "DOCUMENTING",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PLANNING" => Some(Self::Planning),
            "GENERATING" => Some(Self::Generating),
            "VALIDATING" => Some(Self::Validating),
            "REFINING" => Some(Self::Refining),
            "DOCUMENTING" => Some(Self::Documenting),
            "DONE" => Some(Self::Done),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// Why a run reached `Done` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TerminalReason {
    Passed,
    MaxIterations,
    Timeout,
    FatalToolError,
    Cancelled,
}

impl TerminalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passed => "PASSED",
            Self::MaxIterations => "MAX_ITERATIONS",
            Self::Timeout => "TIMEOUT",
            Self::FatalToolError => "FATAL_TOOL_ERROR",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PASSED" => Some(Self::Passed),
            "MAX_ITERATIONS" => Some(Self::MaxIterations),
            "TIMEOUT" => Some(Self::Timeout),
            "FATAL_TOOL_ERROR" => Some(Self::FatalToolError),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// Finding severity.
///
/// Variants are declared from least to most severe so the derived `Ord`
/// gives `Critical > High > Medium > Low > Info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "CRITICAL",
            Self::High => "HIGH",
            Self::Medium => "MEDIUM",
            Self::Low => "LOW",
            Self::Info => "INFO",
        }
    }

    /// Parse a severity name, case-insensitively. Accepts the tool-style
    /// aliases `error`, `warning` and `notice`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "critical" => Some(Self::Critical),
            "high" | "error" => Some(Self::High),
            "medium" | "warning" => Some(Self::Medium),
            "low" | "notice" => Some(Self::Low),
            "info" => Some(Self::Info),
            _ => None,
        }
    }

    /// Whether a finding of this severity blocks at the given threshold.
    pub fn blocks_at(&self, threshold: Self) -> bool {
        *self >= threshold
    }
}

/// Status of a single adapter invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvocationStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl InvocationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::TimedOut => "TIMED_OUT",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::TimedOut)
    }
}

/// Classification of a `Failed` invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvocationFailure {
    /// The tool process could not be started.
    SpawnFailed,
    /// The tool ran but its output could not be normalized.
    ParseError,
    /// The adapter task panicked.
    Crashed,
    /// The invocation was abandoned because the run was cancelled.
    Cancelled,
}

impl InvocationFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SpawnFailed => "SPAWN_FAILED",
            Self::ParseError => "PARSE_ERROR",
            Self::Crashed => "CRASHED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

// --- Core Types ---

/// One normalized issue reported by a tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    pub source_tool: String,
    /// Opaque reference to the offending resource (file, address, block).
    pub resource_ref: String,
    pub message: String,
    #[serde(default)]
    pub rule_id: Option<String>,
}

impl Finding {
    pub fn new(
        severity: Severity,
        source_tool: impl Into<String>,
        resource_ref: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            source_tool: source_tool.into(),
            resource_ref: resource_ref.into(),
            message: message.into(),
            rule_id: None,
        }
    }

    pub fn with_rule(mut self, rule_id: impl Into<String>) -> Self {
        self.rule_id = Some(rule_id.into());
        self
    }

    /// A CRITICAL finding describing a failure of the adapter itself.
    pub fn synthetic(tool: &str, rule_id: &str, message: impl Into<String>) -> Self {
        Self::new(Severity::Critical, tool, format!("adapter:{tool}"), message).with_rule(rule_id)
    }

    /// Whether this finding was produced by the engine rather than the tool.
    pub fn is_synthetic(&self) -> bool {
        matches!(
            self.rule_id.as_deref(),
            Some(PARSE_ERROR_RULE | SPAWN_ERROR_RULE | CRASH_RULE)
        )
    }
}

/// One adapter call within one validation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub tool_name: String,
    /// Copied from the adapter configuration.
    pub required: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: InvocationStatus,
    pub findings: Vec<Finding>,
    /// Process exit code, when a process ran to completion.
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub failure: Option<InvocationFailure>,
}

impl ToolInvocation {
    /// A fresh invocation in `Running` state, stamped with the current time.
    pub fn running(tool_name: impl Into<String>, required: bool) -> Self {
        Self {
            tool_name: tool_name.into(),
            required,
            started_at: Utc::now(),
            finished_at: None,
            status: InvocationStatus::Running,
            findings: Vec::new(),
            exit_code: None,
            failure: None,
        }
    }

    /// Move to a terminal status and stamp `finished_at`.
    pub fn finish(mut self, status: InvocationStatus) -> Self {
        self.status = status;
        self.finished_at = Some(Utc::now());
        self
    }

    /// Mark as `Failed` with a classification and one synthetic finding.
    pub fn fail(mut self, failure: InvocationFailure, rule_id: &str, message: impl Into<String>) -> Self {
        let finding = Finding::synthetic(&self.tool_name, rule_id, message);
        self.findings.push(finding);
        self.failure = Some(failure);
        self.finish(InvocationStatus::Failed)
    }

    pub fn duration_ms(&self) -> Option<u64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds().max(0) as u64)
    }
}

/// Parameters of a run-start request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    /// Opaque requirements handed to the planner and generator.
    pub requirements: String,
    pub max_iterations: u32,
    pub total_timeout_sec: u64,
    pub blocking_severity: Severity,
    /// Existing code to validate first instead of generating from scratch.
    #[serde(default)]
    pub initial_candidate: Option<String>,
}

/// One generation/validation lifecycle.
///
/// Written only by the orchestrator. `verdict_history` holds the verdicts
/// consumed by refine cycles, so its length equals `iteration`; the verdict
/// that ended the run (if any) is kept in `latest_verdict`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub run_id: Id,
    pub phase: Phase,
    pub iteration: u32,
    pub max_iterations: u32,
    pub blocking_severity: Severity,
    pub requirements: String,
    pub plan: Option<String>,
    pub code_candidate: Option<String>,
    pub verdict_history: Vec<Verdict>,
    pub latest_verdict: Option<Verdict>,
    pub documentation: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Absolute wall-clock deadline derived from the total timeout.
    pub deadline: DateTime<Utc>,
    pub terminal_reason: Option<TerminalReason>,
    /// Human-readable cause for fatal failures.
    pub failure_detail: Option<String>,
}

impl WorkflowRun {
    /// Create a run in `Planning` from a start request.
    pub fn new(request: &RunRequest, now: DateTime<Utc>) -> Self {
        let deadline = i64::try_from(request.total_timeout_sec)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|budget| now.checked_add_signed(budget))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            run_id: Id::new(),
            phase: Phase::Planning,
            iteration: 0,
            max_iterations: request.max_iterations,
            blocking_severity: request.blocking_severity,
            requirements: request.requirements.clone(),
            plan: None,
            code_candidate: request.initial_candidate.clone(),
            verdict_history: Vec::new(),
            latest_verdict: None,
            documentation: None,
            created_at: now,
            updated_at: now,
            deadline,
            terminal_reason: None,
            failure_detail: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    pub fn status(&self) -> RunStatusView {
        RunStatusView {
            run_id: self.run_id.clone(),
            phase: self.phase,
            iteration: self.iteration,
            terminal_reason: self.terminal_reason,
            latest_verdict: self.latest_verdict.as_ref().map(Verdict::summary),
            updated_at: self.updated_at,
        }
    }
}

/// Pollable status of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatusView {
    pub run_id: Id,
    pub phase: Phase,
    pub iteration: u32,
    pub terminal_reason: Option<TerminalReason>,
    pub latest_verdict: Option<VerdictSummary>,
    pub updated_at: DateTime<Utc>,
}

/// An entry in the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Id,
    pub run_id: Id,
    /// Event type name (e.g., `RUN_CREATED`, `PHASE_CHANGED`).
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub payload_json: String,
}
