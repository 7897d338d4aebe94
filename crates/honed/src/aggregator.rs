//! Parallel validation pass.
//!
//! Fans a candidate out to every adapter concurrently and folds the results
//! into a [`Verdict`]. The pass is bounded by the slowest adapter's timeout
//! plus a join grace, so a misbehaving adapter cannot stall it.

use hone_core::verdict::dedup_within_tool;
use hone_core::{InvocationFailure, InvocationStatus, Severity, ToolInvocation, Verdict, CRASH_RULE};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapter::AdapterBinding;

/// How long aborted adapter tasks get to unwind before the pass returns.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct Aggregator {
    join_grace: Duration,
}

impl Aggregator {
    pub fn new(join_grace: Duration) -> Self {
        Self { join_grace }
    }

    /// Run every adapter against `candidate` and compute the verdict.
    ///
    /// Invocations appear in adapter registration order. When `cancel` fires
    /// the pass stops early; unfinished invocations are marked `Failed` with
    /// a `Cancelled` classification and the caller should discard the result.
    pub async fn aggregate(
        &self,
        candidate: &str,
        adapters: &[AdapterBinding],
        threshold: Severity,
        cancel: &CancellationToken,
    ) -> Verdict {
        let candidate: Arc<str> = Arc::from(candidate);
        let pass_token = cancel.child_token();

        let mut slots: Vec<Option<ToolInvocation>> = vec![None; adapters.len()];
        let mut index_of = HashMap::with_capacity(adapters.len());
        let mut tasks = JoinSet::new();

        for (idx, binding) in adapters.iter().enumerate() {
            let binding = binding.clone();
            let candidate = Arc::clone(&candidate);
            let token = pass_token.clone();
            let handle = tasks.spawn(async move {
                let timeout = binding.timeout();
                binding
                    .adapter
                    .invoke(&candidate, &binding.config, timeout, token)
                    .await
            });
            index_of.insert(handle.id(), idx);
        }

        let longest = adapters
            .iter()
            .map(AdapterBinding::timeout)
            .max()
            .unwrap_or(Duration::ZERO);
        let deadline = tokio::time::Instant::now() + longest + self.join_grace;

        let unfinished = loop {
            tokio::select! {
                joined = tasks.join_next_with_id() => match joined {
                    None => break None,
                    Some(Ok((id, invocation))) => {
                        if let Some(&idx) = index_of.get(&id) {
                            slots[idx] = Some(settle(invocation));
                        }
                    }
                    Some(Err(err)) => {
                        if let Some(&idx) = index_of.get(&err.id()) {
                            let binding = &adapters[idx];
                            warn!(tool = %binding.config.name, error = %err, "adapter task crashed");
                            slots[idx] = Some(
                                ToolInvocation::running(&binding.config.name, binding.config.required)
                                    .fail(
                                        InvocationFailure::Crashed,
                                        CRASH_RULE,
                                        format!("adapter task failed: {err}"),
                                    ),
                            );
                        }
                    }
                },
                () = tokio::time::sleep_until(deadline) => {
                    warn!(grace_ms = self.join_grace.as_millis() as u64, "validation pass exceeded its bound");
                    break Some(Unfinished::Expired);
                }
                () = cancel.cancelled() => {
                    info!("validation pass cancelled");
                    break Some(Unfinished::Cancelled);
                }
            }
        };

        if unfinished.is_some() {
            pass_token.cancel();
            tasks.abort_all();
            let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
                while tasks.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!("adapter tasks still unwinding after abort");
            }
        }

        let invocations: Vec<ToolInvocation> = slots
            .into_iter()
            .zip(adapters)
            .map(|(slot, binding)| {
                slot.unwrap_or_else(|| {
                    let pending =
                        ToolInvocation::running(&binding.config.name, binding.config.required);
                    match unfinished {
                        Some(Unfinished::Cancelled) => {
                            let mut inv = pending;
                            inv.failure = Some(InvocationFailure::Cancelled);
                            inv.finish(InvocationStatus::Failed)
                        }
                        _ => pending.finish(InvocationStatus::TimedOut),
                    }
                })
            })
            .collect();

        for inv in &invocations {
            info!(
                tool = %inv.tool_name,
                status = inv.status.as_str(),
                findings = inv.findings.len(),
                duration_ms = inv.duration_ms().unwrap_or(0),
                "adapter finished"
            );
        }

        let verdict = Verdict::from_invocations(invocations, threshold);
        debug!(
            passed = verdict.passed,
            blocking = verdict.blocking_findings().len(),
            "verdict computed"
        );
        verdict
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unfinished {
    Expired,
    Cancelled,
}

/// Deduplicate findings and make sure the invocation is terminal.
fn settle(mut invocation: ToolInvocation) -> ToolInvocation {
    invocation.findings = dedup_within_tool(std::mem::take(&mut invocation.findings));
    if invocation.status.is_terminal() {
        if invocation.finished_at.is_none() {
            invocation.finished_at = Some(chrono::Utc::now());
        }
        invocation
    } else {
        warn!(tool = %invocation.tool_name, "adapter returned a non-terminal invocation");
        invocation.fail(
            InvocationFailure::Crashed,
            CRASH_RULE,
            "adapter returned without finishing the invocation",
        )
    }
}
