//! Event types for the audit log.

use crate::types::{Id, Phase, Severity, TerminalReason};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    RunCreated,
    PhaseChanged,
    ValidationFinished,
    RunFinished,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunCreated => "RUN_CREATED",
            Self::PhaseChanged => "PHASE_CHANGED",
            Self::ValidationFinished => "VALIDATION_FINISHED",
            Self::RunFinished => "RUN_FINISHED",
        }
    }
}

/// Payload for RUN_CREATED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCreatedPayload {
    pub run_id: Id,
    pub max_iterations: u32,
    pub blocking_severity: Severity,
    pub deadline: DateTime<Utc>,
}

/// Payload for PHASE_CHANGED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseChangedPayload {
    pub run_id: Id,
    pub from: Phase,
    pub to: Phase,
    pub iteration: u32,
}

/// One tool's outcome within VALIDATION_FINISHED.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub tool: String,
    pub status: String,
    pub findings: usize,
    pub duration_ms: Option<u64>,
}

/// Payload for VALIDATION_FINISHED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationFinishedPayload {
    pub run_id: Id,
    pub iteration: u32,
    pub passed: bool,
    pub blocking_count: usize,
    pub score: u8,
    pub tools: Vec<ToolOutcome>,
}

/// Payload for RUN_FINISHED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunFinishedPayload {
    pub run_id: Id,
    pub phase: Phase,
    pub terminal_reason: Option<TerminalReason>,
    pub iteration: u32,
    pub detail: Option<String>,
}

/// Union type for all event payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    RunCreated(RunCreatedPayload),
    PhaseChanged(PhaseChangedPayload),
    ValidationFinished(ValidationFinishedPayload),
    RunFinished(RunFinishedPayload),
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::RunCreated(_) => EventType::RunCreated,
            Self::PhaseChanged(_) => EventType::PhaseChanged,
            Self::ValidationFinished(_) => EventType::ValidationFinished,
            Self::RunFinished(_) => EventType::RunFinished,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_serializes_correctly() {
        assert_eq!(
            serde_json::to_string(&EventType::PhaseChanged).unwrap(),
            "\"PHASE_CHANGED\""
        );
        assert_eq!(EventType::ValidationFinished.as_str(), "VALIDATION_FINISHED");
    }

    #[test]
    fn phase_changed_payload_serializes() {
        let payload = EventPayload::PhaseChanged(PhaseChangedPayload {
            run_id: Id::from_string("run-1"),
            from: Phase::Validating,
            to: Phase::Refining,
            iteration: 1,
        });
        assert_eq!(payload.event_type(), EventType::PhaseChanged);
        let json = payload.to_json().unwrap();
        assert!(json.contains("\"from\":\"VALIDATING\""));
        assert!(json.contains("\"to\":\"REFINING\""));
    }

    #[test]
    fn run_finished_payload_carries_reason() {
        let payload = RunFinishedPayload {
            run_id: Id::from_string("run-2"),
            phase: Phase::Failed,
            terminal_reason: Some(TerminalReason::MaxIterations),
            iteration: 2,
            detail: None,
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("MAX_ITERATIONS"));
    }
}
