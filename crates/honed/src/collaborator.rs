//! Planner, code generator and documenter seams.
//!
//! The engine treats all three as opaque text producers. The bundled
//! [`CommandCollaborator`] shells out to one configured command for every
//! role, passing a JSON request on stdin and reading the answer from stdout.

use async_trait::async_trait;
use hone_core::RefinementRequest;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::process::{self, ProcessOutcome};

const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
    #[error("collaborator exited with code {code}: {detail}")]
    Failed { code: i32, detail: String },
    #[error("collaborator timed out after {0:?}")]
    Timeout(Duration),
    #[error("collaborator was cancelled")]
    Cancelled,
    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CollaboratorError>;

/// Turns requirements into a plan.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, requirements: &str) -> Result<String>;
}

/// What the generator is asked to produce.
#[derive(Debug, Clone, Copy)]
pub enum GenerationRequest<'a> {
    Initial {
        requirements: &'a str,
        plan: Option<&'a str>,
    },
    Refine {
        requirements: &'a str,
        refinement: &'a RefinementRequest,
    },
}

/// Produces code candidates.
#[async_trait]
pub trait CodeGenerator: Send + Sync {
    async fn generate(&self, request: GenerationRequest<'_>) -> Result<String>;
}

/// Produces documentation for an accepted candidate.
#[async_trait]
pub trait Documenter: Send + Sync {
    async fn document(&self, requirements: &str, candidate: &str) -> Result<String>;
}

/// Uses the requirements verbatim as the plan.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughPlanner;

#[async_trait]
impl Planner for PassthroughPlanner {
    async fn plan(&self, requirements: &str) -> Result<String> {
        Ok(requirements.to_string())
    }
}

/// Produces no documentation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SkipDocumenter;

#[async_trait]
impl Documenter for SkipDocumenter {
    async fn document(&self, _requirements: &str, _candidate: &str) -> Result<String> {
        Ok(String::new())
    }
}

/// Stand-in generator for engines started without `generator_cmd`.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredGenerator;

#[async_trait]
impl CodeGenerator for UnconfiguredGenerator {
    async fn generate(&self, _request: GenerationRequest<'_>) -> Result<String> {
        Err(CollaboratorError::Unavailable(
            "no generator_cmd configured".to_string(),
        ))
    }
}

/// JSON written to the collaborator's stdin.
#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum WireRequest<'a> {
    Plan {
        requirements: &'a str,
    },
    Generate {
        requirements: &'a str,
        plan: Option<&'a str>,
    },
    Refine {
        requirements: &'a str,
        refinement: &'a RefinementRequest,
    },
    Document {
        requirements: &'a str,
        candidate: &'a str,
    },
}

impl WireRequest<'_> {
    fn kind(&self) -> &'static str {
        match self {
            Self::Plan { .. } => "plan",
            Self::Generate { .. } => "generate",
            Self::Refine { .. } => "refine",
            Self::Document { .. } => "document",
        }
    }
}

/// One shell command serving every collaborator role.
#[derive(Debug, Clone)]
pub struct CommandCollaborator {
    cmd: String,
    workdir: PathBuf,
    timeout: Duration,
}

impl CommandCollaborator {
    pub fn new(cmd: impl Into<String>, workdir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            cmd: cmd.into(),
            workdir: workdir.into(),
            timeout,
        }
    }

    async fn call(&self, request: &WireRequest<'_>) -> Result<String> {
        let body = serde_json::to_vec(request)?;
        debug!(kind = request.kind(), bytes = body.len(), "calling collaborator");

        let output = process::run_shell(
            &self.cmd,
            &self.workdir,
            Some(body),
            self.timeout,
            &CancellationToken::new(),
        )
        .await
        .map_err(|err| CollaboratorError::Unavailable(err.to_string()))?;

        match output.outcome {
            ProcessOutcome::Completed(0) => Ok(output.stdout_lossy()),
            ProcessOutcome::Completed(code) => {
                let detail = output.tail(STDERR_TAIL_LINES);
                warn!(kind = request.kind(), code, "collaborator failed");
                if output.command_missing() {
                    Err(CollaboratorError::Unavailable(detail))
                } else {
                    Err(CollaboratorError::Failed { code, detail })
                }
            }
            ProcessOutcome::TimedOut => Err(CollaboratorError::Timeout(self.timeout)),
            ProcessOutcome::Cancelled => Err(CollaboratorError::Cancelled),
        }
    }
}

#[async_trait]
impl Planner for CommandCollaborator {
    async fn plan(&self, requirements: &str) -> Result<String> {
        self.call(&WireRequest::Plan { requirements }).await
    }
}

#[async_trait]
impl CodeGenerator for CommandCollaborator {
    async fn generate(&self, request: GenerationRequest<'_>) -> Result<String> {
        let wire = match request {
            GenerationRequest::Initial { requirements, plan } => {
                WireRequest::Generate { requirements, plan }
            }
            GenerationRequest::Refine {
                requirements,
                refinement,
            } => WireRequest::Refine {
                requirements,
                refinement,
            },
        };
        self.call(&wire).await
    }
}

#[async_trait]
impl Documenter for CommandCollaborator {
    async fn document(&self, requirements: &str, candidate: &str) -> Result<String> {
        self.call(&WireRequest::Document {
            requirements,
            candidate,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hone_core::{Finding, InvocationStatus, Severity, ToolInvocation, Verdict};
    use tempfile::TempDir;

    fn collaborator(dir: &TempDir, cmd: &str) -> CommandCollaborator {
        CommandCollaborator::new(cmd, dir.path(), Duration::from_secs(10))
    }

    #[tokio::test]
    async fn request_is_sent_as_json_on_stdin() {
        let dir = TempDir::new().unwrap();
        let echo = collaborator(&dir, "cat");
        let out = echo
            .generate(GenerationRequest::Initial {
                requirements: "two subnets",
                plan: Some("vpc then subnets"),
            })
            .await
            .unwrap();

        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["kind"], "generate");
        assert_eq!(value["requirements"], "two subnets");
        assert_eq!(value["plan"], "vpc then subnets");
    }

    #[tokio::test]
    async fn refine_request_carries_blocking_findings() {
        let dir = TempDir::new().unwrap();
        let echo = collaborator(&dir, "cat");
        let mut inv = ToolInvocation::running("tflint", true);
        inv.findings = vec![Finding::new(Severity::High, "tflint", "main.tf", "bad")];
        let verdict =
            Verdict::from_invocations(vec![inv.finish(InvocationStatus::Succeeded)], Severity::High);
        let refinement = RefinementRequest::new("old", &verdict, 1);

        let out = echo
            .generate(GenerationRequest::Refine {
                requirements: "r",
                refinement: &refinement,
            })
            .await
            .unwrap();

        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["kind"], "refine");
        assert_eq!(value["refinement"]["previous_candidate"], "old");
        assert_eq!(value["refinement"]["blocking"][0]["tool"], "tflint");
    }

    #[tokio::test]
    async fn non_zero_exit_is_failure() {
        let dir = TempDir::new().unwrap();
        let broken = collaborator(&dir, "echo 'quota exceeded' >&2; exit 2");
        let err = broken.plan("x").await.unwrap_err();
        assert!(matches!(
            err,
            CollaboratorError::Failed { code: 2, ref detail } if detail == "quota exceeded"
        ));
    }

    #[tokio::test]
    async fn missing_command_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let missing = collaborator(&dir, "hone-test-no-such-generator");
        assert!(matches!(
            missing.document("r", "c").await.unwrap_err(),
            CollaboratorError::Unavailable(_)
        ));
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let dir = TempDir::new().unwrap();
        let slow = CommandCollaborator::new("sleep 30", dir.path(), Duration::from_millis(200));
        assert!(matches!(
            slow.plan("x").await.unwrap_err(),
            CollaboratorError::Timeout(_)
        ));
    }

    #[tokio::test]
    async fn defaults_behave() {
        assert_eq!(PassthroughPlanner.plan("reqs").await.unwrap(), "reqs");
        assert_eq!(SkipDocumenter.document("r", "c").await.unwrap(), "");
        assert!(UnconfiguredGenerator
            .generate(GenerationRequest::Initial {
                requirements: "r",
                plan: None
            })
            .await
            .is_err());
    }
}
