//! Validation tool adapters.
//!
//! An adapter runs one external (or in-process) check against a code
//! candidate and returns a terminal [`ToolInvocation`] with normalized
//! findings. Adapters never return errors: a tool that cannot start, crashes
//! or prints garbage is reported as a `Failed` invocation carrying one
//! synthetic CRITICAL finding.

use async_trait::async_trait;
use hone_core::config::STRUCTURE_ADAPTER;
use hone_core::{
    AdapterConfig, Config, Finding, InvocationFailure, InvocationStatus, OutputFormat, Severity,
    ToolInvocation, PARSE_ERROR_RULE, SPAWN_ERROR_RULE,
};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::process::{self, ProcessOutcome, ProcessOutput};

/// File name the candidate is written to inside the scratch directory.
pub const CANDIDATE_FILE: &str = "main.tf";

/// Lines of tool output kept in an `exit_code` finding.
const OUTPUT_TAIL_LINES: usize = 20;

/// One validation tool.
///
/// Implementations keep no state between calls; everything an invocation
/// needs comes from its arguments.
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    async fn invoke(
        &self,
        candidate: &str,
        config: &AdapterConfig,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> ToolInvocation;
}

/// An adapter together with the configuration it runs under.
#[derive(Clone)]
pub struct AdapterBinding {
    pub config: AdapterConfig,
    pub adapter: Arc<dyn ToolAdapter>,
}

impl AdapterBinding {
    pub fn new(config: AdapterConfig, adapter: Arc<dyn ToolAdapter>) -> Self {
        Self { config, adapter }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_sec)
    }
}

impl std::fmt::Debug for AdapterBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterBinding")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Build the adapter set named in `config.adapters`, in order.
pub fn build_adapters(config: &Config) -> Vec<AdapterBinding> {
    config
        .adapter_configs()
        .into_iter()
        .map(|adapter_config| {
            let adapter: Arc<dyn ToolAdapter> = if adapter_config.name == STRUCTURE_ADAPTER {
                Arc::new(StructureAdapter)
            } else {
                Arc::new(CommandAdapter)
            };
            AdapterBinding::new(adapter_config, adapter)
        })
        .collect()
}

fn keep_filtered(findings: Vec<Finding>, config: &AdapterConfig) -> Vec<Finding> {
    if config.severity_filter.is_empty() {
        return findings;
    }
    findings
        .into_iter()
        .filter(|f| config.severity_filter.contains(&f.severity))
        .collect()
}

// --- Command adapter ---

/// Runs `config.cmd` through the shell against a scratch copy of the
/// candidate.
///
/// The candidate is written to `{dir}/main.tf`. The command may reference
/// `{dir}`, `{file}` and `{rule_set}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandAdapter;

/// Normalized finding shape accepted from `findings_json` tools.
#[derive(Debug, Deserialize)]
struct ReportedFinding {
    severity: String,
    #[serde(default)]
    resource_ref: Option<String>,
    message: String,
    #[serde(default)]
    rule_id: Option<String>,
}

fn expand_command(cmd: &str, dir: &Path, rule_set: Option<&str>) -> String {
    let file = dir.join(CANDIDATE_FILE);
    cmd.replace("{dir}", &dir.display().to_string())
        .replace("{file}", &file.display().to_string())
        .replace("{rule_set}", rule_set.unwrap_or(""))
}

/// Parse a `findings_json` report. `source_tool` is always the adapter name.
fn parse_findings_json(tool: &str, stdout: &str) -> Result<Vec<Finding>, String> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let reported: Vec<ReportedFinding> = serde_json::from_str(trimmed)
        .map_err(|err| format!("expected a JSON array of findings: {err}"))?;

    reported
        .into_iter()
        .map(|r| {
            let severity = Severity::parse(&r.severity)
                .ok_or_else(|| format!("unknown severity '{}'", r.severity))?;
            let finding = Finding {
                severity,
                source_tool: tool.to_string(),
                resource_ref: r
                    .resource_ref
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| CANDIDATE_FILE.to_string()),
                message: r.message,
                rule_id: r.rule_id,
            };
            Ok(finding)
        })
        .collect()
}

fn findings_from_output(
    config: &AdapterConfig,
    code: i32,
    output: &ProcessOutput,
) -> Result<Vec<Finding>, String> {
    match config.format {
        OutputFormat::ExitCode => {
            if code == 0 {
                return Ok(Vec::new());
            }
            let tail = output.tail(OUTPUT_TAIL_LINES);
            let message = if tail.trim().is_empty() {
                format!("{} exited with code {code}", config.name)
            } else {
                tail
            };
            Ok(vec![Finding::new(
                config.failure_severity,
                &config.name,
                CANDIDATE_FILE,
                message,
            )
            .with_rule(format!("exit_{code}"))])
        }
        OutputFormat::FindingsJson => {
            let stdout = output.stdout_lossy();
            if stdout.trim().is_empty() && code != 0 {
                return Err(format!(
                    "exited with code {code} without a report: {}",
                    output.tail(OUTPUT_TAIL_LINES)
                ));
            }
            parse_findings_json(&config.name, &stdout)
        }
    }
}

#[async_trait]
impl ToolAdapter for CommandAdapter {
    async fn invoke(
        &self,
        candidate: &str,
        config: &AdapterConfig,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> ToolInvocation {
        let mut invocation = ToolInvocation::running(&config.name, config.required);

        let Some(cmd) = config.cmd.as_deref() else {
            return invocation.fail(
                InvocationFailure::SpawnFailed,
                SPAWN_ERROR_RULE,
                "no command configured",
            );
        };

        let scratch = match tempfile::Builder::new().prefix("hone-").tempdir() {
            Ok(dir) => dir,
            Err(err) => {
                return invocation.fail(
                    InvocationFailure::SpawnFailed,
                    SPAWN_ERROR_RULE,
                    format!("failed to create scratch directory: {err}"),
                )
            }
        };
        if let Err(err) = tokio::fs::write(scratch.path().join(CANDIDATE_FILE), candidate).await {
            return invocation.fail(
                InvocationFailure::SpawnFailed,
                SPAWN_ERROR_RULE,
                format!("failed to write candidate: {err}"),
            );
        }

        let command = expand_command(cmd, scratch.path(), config.rule_set.as_deref());
        let output = match process::run_shell(&command, scratch.path(), None, timeout, &cancel).await
        {
            Ok(output) => output,
            Err(err) => {
                return invocation.fail(
                    InvocationFailure::SpawnFailed,
                    SPAWN_ERROR_RULE,
                    err.to_string(),
                )
            }
        };

        debug!(
            tool = %config.name,
            outcome = ?output.outcome,
            duration_ms = output.duration_ms,
            "adapter process finished"
        );

        match output.outcome {
            ProcessOutcome::Completed(code) if output.command_missing() => {
                invocation.exit_code = Some(code);
                invocation.fail(
                    InvocationFailure::SpawnFailed,
                    SPAWN_ERROR_RULE,
                    format!(
                        "command could not be run (exit {code}): {}",
                        output.tail(OUTPUT_TAIL_LINES)
                    ),
                )
            }
            ProcessOutcome::Completed(code) => {
                invocation.exit_code = Some(code);
                match findings_from_output(config, code, &output) {
                    Ok(findings) => {
                        invocation.findings = keep_filtered(findings, config);
                        invocation.finish(InvocationStatus::Succeeded)
                    }
                    Err(message) => {
                        warn!(tool = %config.name, error = %message, "adapter output unparseable");
                        invocation.fail(InvocationFailure::ParseError, PARSE_ERROR_RULE, message)
                    }
                }
            }
            ProcessOutcome::TimedOut => {
                // A partial report is kept if it happens to parse.
                if config.format == OutputFormat::FindingsJson {
                    if let Ok(findings) = parse_findings_json(&config.name, &output.stdout_lossy())
                    {
                        invocation.findings = keep_filtered(findings, config);
                    }
                }
                invocation.finish(InvocationStatus::TimedOut)
            }
            ProcessOutcome::Cancelled => {
                invocation.failure = Some(InvocationFailure::Cancelled);
                invocation.finish(InvocationStatus::Failed)
            }
        }
    }
}

// --- Structure adapter ---

/// In-process structural check: non-empty, balanced braces, and at least one
/// recognizable top-level block.
#[derive(Debug, Clone, Copy, Default)]
pub struct StructureAdapter;

const BLOCK_KEYWORDS: [&str; 8] = [
    "resource",
    "data",
    "module",
    "variable",
    "output",
    "provider",
    "terraform",
    "locals",
];

/// Depth check over braces outside strings and comments.
fn brace_problem(source: &str) -> Option<String> {
    let mut depth: i64 = 0;
    for (number, line) in source.lines().enumerate() {
        let mut in_string = false;
        let mut escaped = false;
        let mut chars = line.chars().peekable();
        while let Some(c) = chars.next() {
            if in_string {
                match c {
                    _ if escaped => escaped = false,
                    '\\' => escaped = true,
                    '"' => in_string = false,
                    _ => {}
                }
                continue;
            }
            match c {
                '"' => in_string = true,
                '#' => break,
                '/' if chars.peek() == Some(&'/') => break,
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth < 0 {
                        return Some(format!("unexpected closing brace on line {}", number + 1));
                    }
                }
                _ => {}
            }
        }
    }
    (depth > 0).then(|| format!("{depth} unclosed brace(s)"))
}

fn has_block(source: &str) -> bool {
    source.lines().any(|line| {
        let first = line.split_whitespace().next().unwrap_or("");
        BLOCK_KEYWORDS.contains(&first)
    })
}

fn structure_findings(tool: &str, candidate: &str) -> Vec<Finding> {
    if candidate.trim().is_empty() {
        return vec![
            Finding::new(Severity::Critical, tool, CANDIDATE_FILE, "candidate is empty")
                .with_rule("empty_candidate"),
        ];
    }

    let mut findings = Vec::new();
    if let Some(problem) = brace_problem(candidate) {
        findings.push(
            Finding::new(Severity::Critical, tool, CANDIDATE_FILE, problem)
                .with_rule("unbalanced_braces"),
        );
    }
    if !has_block(candidate) {
        findings.push(
            Finding::new(
                Severity::Medium,
                tool,
                CANDIDATE_FILE,
                "no resource, data, module, variable or output block found",
            )
            .with_rule("no_blocks"),
        );
    }
    findings
}

#[async_trait]
impl ToolAdapter for StructureAdapter {
    async fn invoke(
        &self,
        candidate: &str,
        config: &AdapterConfig,
        _timeout: Duration,
        cancel: CancellationToken,
    ) -> ToolInvocation {
        let mut invocation = ToolInvocation::running(&config.name, config.required);
        if cancel.is_cancelled() {
            invocation.failure = Some(InvocationFailure::Cancelled);
            return invocation.finish(InvocationStatus::Failed);
        }
        invocation.findings = keep_filtered(structure_findings(&config.name, candidate), config);
        invocation.finish(InvocationStatus::Succeeded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command_config(name: &str, cmd: &str) -> AdapterConfig {
        let mut config = AdapterConfig::named(name);
        config.cmd = Some(cmd.to_string());
        config
    }

    async fn run(config: &AdapterConfig, candidate: &str) -> ToolInvocation {
        CommandAdapter
            .invoke(
                candidate,
                config,
                Duration::from_secs(config.timeout_sec),
                CancellationToken::new(),
            )
            .await
    }

    #[tokio::test]
    async fn exit_zero_is_clean() {
        let config = command_config("validate", "test -f {file}");
        let inv = run(&config, "resource \"a\" \"b\" {}").await;
        assert_eq!(inv.status, InvocationStatus::Succeeded);
        assert_eq!(inv.exit_code, Some(0));
        assert!(inv.findings.is_empty());
    }

    #[tokio::test]
    async fn non_zero_exit_becomes_one_finding() {
        let mut config = command_config("validate", "echo 'Error: missing argument' >&2; exit 1");
        config.failure_severity = Severity::Critical;
        let inv = run(&config, "x").await;
        assert_eq!(inv.status, InvocationStatus::Succeeded);
        assert_eq!(inv.findings.len(), 1);
        assert_eq!(inv.findings[0].severity, Severity::Critical);
        assert_eq!(inv.findings[0].message, "Error: missing argument");
        assert_eq!(inv.findings[0].rule_id.as_deref(), Some("exit_1"));
        assert_eq!(inv.findings[0].source_tool, "validate");
    }

    #[tokio::test]
    async fn candidate_is_visible_to_command() {
        let mut config = command_config("grep", "grep -q encrypted {file}");
        config.format = OutputFormat::ExitCode;
        assert!(run(&config, "encrypted = true").await.findings.is_empty());
        assert_eq!(run(&config, "plain").await.findings.len(), 1);
    }

    #[tokio::test]
    async fn findings_json_is_normalized() {
        let report = r#"[{"severity":"error","resource_ref":"aws_s3_bucket.logs","message":"public ACL","rule_id":"S3_001"},{"severity":"LOW","message":"missing tag"}]"#;
        let mut config = command_config("trivy", &format!("echo '{report}'; exit 1"));
        config.format = OutputFormat::FindingsJson;
        let inv = run(&config, "x").await;

        assert_eq!(inv.status, InvocationStatus::Succeeded);
        assert_eq!(inv.findings.len(), 2);
        assert_eq!(inv.findings[0].severity, Severity::High);
        assert_eq!(inv.findings[0].resource_ref, "aws_s3_bucket.logs");
        assert_eq!(inv.findings[0].rule_id.as_deref(), Some("S3_001"));
        assert_eq!(inv.findings[1].resource_ref, CANDIDATE_FILE);
        assert!(inv.findings.iter().all(|f| f.source_tool == "trivy"));
    }

    #[tokio::test]
    async fn severity_filter_drops_other_levels() {
        let report = r#"[{"severity":"critical","message":"a"},{"severity":"info","message":"b"}]"#;
        let mut config = command_config("trivy", &format!("echo '{report}'"));
        config.format = OutputFormat::FindingsJson;
        config.severity_filter = vec![Severity::Critical, Severity::High];
        let inv = run(&config, "x").await;
        assert_eq!(inv.findings.len(), 1);
        assert_eq!(inv.findings[0].message, "a");
    }

    #[tokio::test]
    async fn garbage_output_is_parse_error() {
        let mut config = command_config("checkov", "echo 'not json at all'");
        config.format = OutputFormat::FindingsJson;
        let inv = run(&config, "x").await;
        assert_eq!(inv.status, InvocationStatus::Failed);
        assert_eq!(inv.failure, Some(InvocationFailure::ParseError));
        assert_eq!(inv.findings.len(), 1);
        assert_eq!(inv.findings[0].severity, Severity::Critical);
        assert_eq!(inv.findings[0].rule_id.as_deref(), Some(PARSE_ERROR_RULE));
    }

    #[tokio::test]
    async fn missing_binary_is_spawn_failure() {
        let config = command_config("tflint", "hone-test-no-such-tool --format json");
        let inv = run(&config, "x").await;
        assert_eq!(inv.status, InvocationStatus::Failed);
        assert_eq!(inv.failure, Some(InvocationFailure::SpawnFailed));
        assert_eq!(inv.findings[0].rule_id.as_deref(), Some(SPAWN_ERROR_RULE));
    }

    #[tokio::test]
    async fn missing_command_config_is_spawn_failure() {
        let inv = run(&AdapterConfig::named("empty"), "x").await;
        assert_eq!(inv.failure, Some(InvocationFailure::SpawnFailed));
    }

    #[tokio::test]
    async fn slow_tool_times_out() {
        let mut config = command_config("slow", "sleep 30");
        config.timeout_sec = 1;
        let inv = run(&config, "x").await;
        assert_eq!(inv.status, InvocationStatus::TimedOut);
        assert!(inv.findings.is_empty());
        assert!(inv.duration_ms().unwrap() < 10_000);
    }

    #[tokio::test]
    async fn cancelled_invocation_is_failed() {
        let config = command_config("slow", "sleep 30");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let inv = CommandAdapter
            .invoke("x", &config, Duration::from_secs(60), cancel)
            .await;
        assert_eq!(inv.status, InvocationStatus::Failed);
        assert_eq!(inv.failure, Some(InvocationFailure::Cancelled));
    }

    #[test]
    fn expand_command_substitutes_placeholders() {
        let cmd = expand_command(
            "tflint --chdir {dir} --config {rule_set} {file}",
            Path::new("/tmp/x"),
            Some("strict.hcl"),
        );
        assert_eq!(cmd, "tflint --chdir /tmp/x --config strict.hcl /tmp/x/main.tf");
    }

    #[test]
    fn unknown_severity_in_report_is_rejected() {
        let err = parse_findings_json("t", r#"[{"severity":"urgent","message":"m"}]"#).unwrap_err();
        assert!(err.contains("urgent"));
    }

    #[test]
    fn structure_accepts_well_formed_candidate() {
        let candidate = r#"
resource "aws_s3_bucket" "logs" {
  bucket = "logs-${var.env}"
  # a comment with a stray {
  tags = { team = "infra" }
}
"#;
        assert!(structure_findings("structure", candidate).is_empty());
    }

    #[test]
    fn structure_flags_empty_candidate() {
        let findings = structure_findings("structure", "  \n");
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::Critical);
        assert_eq!(findings[0].rule_id.as_deref(), Some("empty_candidate"));
    }

    #[test]
    fn structure_flags_unbalanced_braces() {
        let findings = structure_findings("structure", "resource \"a\" \"b\" {\n  x = 1\n");
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].rule_id.as_deref(), Some("unbalanced_braces"));

        let findings = structure_findings("structure", "}\nresource \"a\" \"b\" {}");
        assert!(findings[0].message.contains("line 1"));
    }

    #[test]
    fn structure_flags_missing_blocks() {
        let findings = structure_findings("structure", "just some prose");
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::Medium);
    }

    #[test]
    fn build_adapters_keeps_registration_order() {
        let mut config = Config::default();
        config.adapters = vec!["structure".to_string(), "tflint".to_string()];
        let adapters = build_adapters(&config);
        assert_eq!(adapters.len(), 2);
        assert_eq!(adapters[0].config.name, "structure");
        assert_eq!(adapters[1].config.name, "tflint");
        assert_eq!(adapters[1].timeout(), Duration::from_secs(120));
    }
}
