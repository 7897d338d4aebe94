//! Run orchestration.
//!
//! Each admitted run is driven on its own task through
//! PLANNING → GENERATING → VALIDATING ⇄ REFINING → DOCUMENTING → DONE,
//! with FAILED reachable from any non-terminal phase. Every transition goes
//! through [`hone_core::transition`] and is checkpointed before the next phase
//! starts, so a crashed engine can resume from the last completed transition.
//!
//! Every await inside a run is bounded: collaborator calls by the generator
//! timeout and the run deadline, validation passes by the aggregator bound,
//! checkpoint writes by the checkpoint timeout.

use chrono::Utc;
use hone_core::events::{
    EventPayload, PhaseChangedPayload, RunCreatedPayload, RunFinishedPayload, ToolOutcome,
    ValidationFinishedPayload,
};
use hone_core::{
    decide, transition, AdmissionPolicy, Config, Decision, Id, InvocationFailure, Phase,
    PhaseEvent, RefinementRequest, RunRequest, RunStatusView, TerminalReason, TransitionError,
    Verdict, WorkflowRun,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex, OwnedSemaphorePermit};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adapter::AdapterBinding;
use crate::admission::{AdmissionError, AdmissionGate};
use crate::aggregator::Aggregator;
use crate::checkpoint::{self, CheckpointError, CheckpointStore};
use crate::collaborator::{
    CodeGenerator, CollaboratorError, Documenter, GenerationRequest, PassthroughPlanner, Planner,
    SkipDocumenter,
};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("invalid run request: {0}")]
    InvalidRequest(String),
    #[error("run {run_id} rejected: admission pool exhausted")]
    AdmissionRejected { run_id: Id },
    #[error("run not found: {0}")]
    RunNotFound(String),
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("checkpoint write timed out after {0:?}")]
    CheckpointTimeout(Duration),
    #[error("state machine error: {0}")]
    Transition(#[from] TransitionError),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Engine-wide knobs, usually derived from [`Config`].
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_concurrent_workflows: usize,
    pub admission_policy: AdmissionPolicy,
    pub join_grace: Duration,
    pub generator_timeout: Duration,
    pub checkpoint_timeout: Duration,
    pub checkpoint_ttl: chrono::Duration,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_concurrent_workflows: config.max_concurrent_workflows,
            admission_policy: config.admission_policy,
            join_grace: Duration::from_millis(config.join_grace_ms),
            generator_timeout: Duration::from_secs(config.generator_timeout_sec),
            checkpoint_timeout: Duration::from_secs(config.checkpoint_timeout_sec),
            checkpoint_ttl: i64::try_from(config.checkpoint_ttl_sec)
                .ok()
                .and_then(chrono::Duration::try_seconds)
                .unwrap_or(chrono::Duration::MAX),
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Handle to a run being driven by this process.
struct ActiveRun {
    cancel: CancellationToken,
    state: watch::Receiver<Arc<WorkflowRun>>,
}

struct Inner {
    store: Arc<dyn CheckpointStore>,
    planner: Arc<dyn Planner>,
    generator: Arc<dyn CodeGenerator>,
    documenter: Arc<dyn Documenter>,
    adapters: Vec<AdapterBinding>,
    aggregator: Aggregator,
    gate: AdmissionGate,
    settings: OrchestratorSettings,
    active: Mutex<HashMap<Id, ActiveRun>>,
}

/// Builder for [`Orchestrator`]. Planner and documenter default to
/// [`PassthroughPlanner`] and [`SkipDocumenter`].
pub struct OrchestratorBuilder {
    store: Arc<dyn CheckpointStore>,
    generator: Arc<dyn CodeGenerator>,
    adapters: Vec<AdapterBinding>,
    planner: Arc<dyn Planner>,
    documenter: Arc<dyn Documenter>,
    settings: OrchestratorSettings,
}

impl OrchestratorBuilder {
    pub fn planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.planner = planner;
        self
    }

    pub fn documenter(mut self, documenter: Arc<dyn Documenter>) -> Self {
        self.documenter = documenter;
        self
    }

    pub fn settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> Orchestrator {
        let gate = AdmissionGate::new(
            self.settings.max_concurrent_workflows,
            self.settings.admission_policy,
        );
        Orchestrator {
            inner: Arc::new(Inner {
                store: self.store,
                planner: self.planner,
                generator: self.generator,
                documenter: self.documenter,
                adapters: self.adapters,
                aggregator: Aggregator::new(self.settings.join_grace),
                gate,
                settings: self.settings,
                active: Mutex::new(HashMap::new()),
            }),
        }
    }
}

impl std::fmt::Debug for OrchestratorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorBuilder")
            .field("adapters", &self.adapters)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Drives runs and answers status queries. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("adapters", &self.inner.adapters)
            .field("settings", &self.inner.settings)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn builder(
        store: Arc<dyn CheckpointStore>,
        generator: Arc<dyn CodeGenerator>,
        adapters: Vec<AdapterBinding>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            store,
            generator,
            adapters,
            planner: Arc::new(PassthroughPlanner),
            documenter: Arc::new(SkipDocumenter),
            settings: OrchestratorSettings::default(),
        }
    }

    /// Admit a new run and start driving it in the background.
    ///
    /// Under the `reject` policy a full pool fails the run immediately: it is
    /// still recorded (FAILED, `FATAL_TOOL_ERROR`) and its id is returned
    /// inside the error.
    pub async fn start(&self, request: RunRequest) -> Result<Id> {
        if request.total_timeout_sec == 0 {
            return Err(OrchestratorError::InvalidRequest(
                "total_timeout_sec must be greater than zero".to_string(),
            ));
        }

        let mut run = WorkflowRun::new(&request, Utc::now());
        let run_id = run.run_id.clone();

        let permit = match self.inner.gate.policy() {
            AdmissionPolicy::Reject => match self.inner.gate.try_admit() {
                Ok(permit) => Some(permit),
                Err(err) => {
                    warn!(run_id = %run_id, error = %err, "run rejected at admission");
                    self.inner.record_created(&run).await;
                    run.phase = transition(run.phase, PhaseEvent::FatalError)?;
                    run.terminal_reason = Some(TerminalReason::FatalToolError);
                    run.failure_detail = Some("admission pool exhausted".to_string());
                    run.updated_at = Utc::now();
                    self.inner.persist(&run).await?;
                    self.inner.record_finished(&run).await;
                    return Err(OrchestratorError::AdmissionRejected { run_id });
                }
            },
            AdmissionPolicy::Queue => None,
        };

        self.inner.persist(&run).await?;
        self.inner.record_created(&run).await;
        info!(
            run_id = %run_id,
            max_iterations = run.max_iterations,
            blocking_severity = run.blocking_severity.as_str(),
            "run created"
        );

        self.spawn_driver(run, permit).await;
        Ok(run_id)
    }

    /// Start a run and wait for it to reach a terminal phase.
    pub async fn run(&self, request: RunRequest) -> Result<WorkflowRun> {
        let run_id = self.start(request).await?;
        self.wait(&run_id).await
    }

    /// Wait for a run to finish. Runs not driven by this process are read
    /// from the checkpoint store as they are.
    pub async fn wait(&self, run_id: &Id) -> Result<WorkflowRun> {
        let state = {
            let active = self.inner.active.lock().await;
            active.get(run_id).map(|a| a.state.clone())
        };

        if let Some(mut state) = state {
            let finished = state
                .wait_for(|run| run.is_terminal())
                .await
                .map(|run| Arc::clone(&*run));
            if let Ok(run) = finished {
                return Ok(WorkflowRun::clone(&run));
            }
        }
        self.inner.load(run_id).await
    }

    /// Current phase, iteration and latest verdict summary of a run.
    pub async fn get_status(&self, run_id: &Id) -> Result<RunStatusView> {
        {
            let active = self.inner.active.lock().await;
            if let Some(run) = active.get(run_id) {
                let status = run.state.borrow().status();
                return Ok(status);
            }
        }
        Ok(self.inner.load(run_id).await?.status())
    }

    /// Request cancellation. Terminal runs are left untouched.
    pub async fn cancel(&self, run_id: &Id) -> Result<()> {
        {
            let active = self.inner.active.lock().await;
            if let Some(run) = active.get(run_id) {
                info!(run_id = %run_id, "cancellation requested");
                run.cancel.cancel();
                return Ok(());
            }
        }

        let mut run = self.inner.load(run_id).await?;
        if run.is_terminal() {
            debug!(run_id = %run_id, phase = run.phase.as_str(), "cancel ignored for terminal run");
            return Ok(());
        }
        let from = run.phase;
        run.phase = transition(from, PhaseEvent::Cancelled)?;
        run.terminal_reason = Some(TerminalReason::Cancelled);
        run.updated_at = Utc::now();
        match self.inner.persist(&run).await {
            Ok(()) => {}
            Err(OrchestratorError::Checkpoint(CheckpointError::Terminal(_))) => {
                debug!(run_id = %run_id, "run finished before cancel was recorded");
                return Ok(());
            }
            Err(err) => return Err(err),
        }
        self.inner.record_phase(&run, from).await;
        self.inner.record_finished(&run).await;
        info!(run_id = %run_id, "idle run cancelled");
        Ok(())
    }

    /// Continue a run from its latest checkpoint. Terminal runs and runs
    /// already driven by this process are returned unchanged.
    pub async fn resume(&self, run_id: &Id) -> Result<Id> {
        if self.inner.active.lock().await.contains_key(run_id) {
            return Ok(run_id.clone());
        }

        let run = self.inner.load(run_id).await?;
        if run.is_terminal() {
            debug!(run_id = %run_id, phase = run.phase.as_str(), "resume is a no-op for terminal run");
            return Ok(run.run_id);
        }

        info!(
            run_id = %run_id,
            phase = run.phase.as_str(),
            iteration = run.iteration,
            "resuming run"
        );
        // Resumed runs were admitted once already, so they queue regardless of policy.
        self.spawn_driver(run, None).await;
        Ok(run_id.clone())
    }

    /// Resume every non-terminal run in the store. Runs whose checkpoint
    /// cannot be loaded are logged and skipped.
    pub async fn resume_interrupted(&self) -> Result<Vec<Id>> {
        let ids = self.inner.store.list_run_ids(true).await?;
        let mut resumed = Vec::with_capacity(ids.len());
        for run_id in ids {
            match self.resume(&run_id).await {
                Ok(id) => resumed.push(id),
                Err(err) => warn!(run_id = %run_id, error = %err, "failed to resume run"),
            }
        }
        Ok(resumed)
    }

    /// Cancel every run driven by this process and stop admitting new ones.
    pub async fn shutdown(&self) -> Vec<Id> {
        self.inner.gate.close();
        let active = self.inner.active.lock().await;
        for run in active.values() {
            run.cancel.cancel();
        }
        active.keys().cloned().collect()
    }

    pub async fn active_runs(&self) -> Vec<Id> {
        self.inner.active.lock().await.keys().cloned().collect()
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.inner.store
    }

    async fn spawn_driver(&self, run: WorkflowRun, permit: Option<OwnedSemaphorePermit>) {
        let run_id = run.run_id.clone();
        let cancel = CancellationToken::new();
        let (tx, rx) = watch::channel(Arc::new(run.clone()));

        self.inner.active.lock().await.insert(
            run_id.clone(),
            ActiveRun {
                cancel: cancel.clone(),
                state: rx,
            },
        );

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut driver = RunDriver {
                inner: &inner,
                run,
                cancel,
                state: tx,
            };
            let permit = match permit {
                Some(permit) => Some(permit),
                None => driver.admit().await,
            };

            if let Err(err) = driver.drive().await {
                error!(run_id = %run_id, error = %err, "run aborted");
            }
            drop(permit);
            inner.active.lock().await.remove(&run_id);
        });
    }
}

impl Inner {
    async fn load(&self, run_id: &Id) -> Result<WorkflowRun> {
        let load = checkpoint::load_run(self.store.as_ref(), run_id);
        match tokio::time::timeout(self.settings.checkpoint_timeout, load).await {
            Ok(Ok(run)) => Ok(run),
            Ok(Err(CheckpointError::NotFound(id))) => Err(OrchestratorError::RunNotFound(id)),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(OrchestratorError::CheckpointTimeout(
                self.settings.checkpoint_timeout,
            )),
        }
    }

    async fn persist(&self, run: &WorkflowRun) -> Result<()> {
        let save = checkpoint::save_run(self.store.as_ref(), run, self.settings.checkpoint_ttl);
        match tokio::time::timeout(self.settings.checkpoint_timeout, save).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(OrchestratorError::CheckpointTimeout(
                self.settings.checkpoint_timeout,
            )),
        }
    }

    /// Audit events are best-effort; a failed append never fails the run.
    async fn record(&self, run_id: &Id, payload: EventPayload) {
        let append = self.store.append_event(run_id, &payload);
        match tokio::time::timeout(self.settings.checkpoint_timeout, append).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(run_id = %run_id, event = payload.event_type().as_str(), error = %err, "failed to record event");
            }
            Err(_) => {
                warn!(run_id = %run_id, event = payload.event_type().as_str(), "recording event timed out");
            }
        }
    }

    async fn record_created(&self, run: &WorkflowRun) {
        let payload = EventPayload::RunCreated(RunCreatedPayload {
            run_id: run.run_id.clone(),
            max_iterations: run.max_iterations,
            blocking_severity: run.blocking_severity,
            deadline: run.deadline,
        });
        self.record(&run.run_id, payload).await;
    }

    async fn record_phase(&self, run: &WorkflowRun, from: Phase) {
        let payload = EventPayload::PhaseChanged(PhaseChangedPayload {
            run_id: run.run_id.clone(),
            from,
            to: run.phase,
            iteration: run.iteration,
        });
        self.record(&run.run_id, payload).await;
    }

    async fn record_finished(&self, run: &WorkflowRun) {
        let payload = EventPayload::RunFinished(RunFinishedPayload {
            run_id: run.run_id.clone(),
            phase: run.phase,
            terminal_reason: run.terminal_reason,
            iteration: run.iteration,
            detail: run.failure_detail.clone(),
        });
        self.record(&run.run_id, payload).await;
    }

    async fn record_validation(&self, run: &WorkflowRun, verdict: &Verdict) {
        let summary = verdict.summary();
        let payload = EventPayload::ValidationFinished(ValidationFinishedPayload {
            run_id: run.run_id.clone(),
            iteration: run.iteration,
            passed: verdict.passed,
            blocking_count: summary.blocking_count,
            score: summary.score,
            tools: verdict
                .invocations
                .iter()
                .map(|inv| ToolOutcome {
                    tool: inv.tool_name.clone(),
                    status: inv.status.as_str().to_string(),
                    findings: inv.findings.len(),
                    duration_ms: inv.duration_ms(),
                })
                .collect(),
        });
        self.record(&run.run_id, payload).await;
    }
}

/// Why a phase could not complete normally.
#[derive(Debug)]
enum Interrupt {
    Cancelled,
    Deadline,
    Fatal(String),
}

impl Interrupt {
    fn into_step(self) -> Step {
        match self {
            Self::Cancelled => Step::Stop(PhaseEvent::Cancelled, None),
            Self::Deadline => Step::Stop(
                PhaseEvent::DeadlineExceeded,
                Some("run deadline passed".to_string()),
            ),
            Self::Fatal(detail) => Step::Stop(PhaseEvent::FatalError, Some(detail)),
        }
    }
}

/// Result of executing the current phase.
#[derive(Debug)]
enum Step {
    Advance(PhaseEvent),
    Stop(PhaseEvent, Option<String>),
}

struct RunDriver<'a> {
    inner: &'a Inner,
    run: WorkflowRun,
    cancel: CancellationToken,
    state: watch::Sender<Arc<WorkflowRun>>,
}

impl RunDriver<'_> {
    /// Wait for an admission permit. A failed wait is left for `drive` to
    /// notice through the cancellation token or the closed gate.
    async fn admit(&mut self) -> Option<OwnedSemaphorePermit> {
        match self.inner.gate.admit(&self.cancel).await {
            Ok(permit) => Some(permit),
            Err(AdmissionError::Cancelled) => None,
            Err(err) => {
                warn!(run_id = %self.run.run_id, error = %err, "admission failed");
                self.cancel.cancel();
                self.run.failure_detail = Some(err.to_string());
                None
            }
        }
    }

    async fn drive(&mut self) -> Result<()> {
        while !self.run.is_terminal() {
            if self.cancel.is_cancelled() {
                let detail = self.run.failure_detail.take();
                self.apply(PhaseEvent::Cancelled, detail).await?;
                break;
            }

            let step = match self.run.phase {
                Phase::Planning => self.plan().await,
                Phase::Generating => self.generate().await,
                Phase::Validating => self.validate().await,
                Phase::Refining => self.refine().await,
                Phase::Documenting => self.document().await,
                Phase::Done | Phase::Failed => break,
            };

            match step {
                Step::Advance(event) => self.apply(event, None).await?,
                Step::Stop(event, detail) => self.apply(event, detail).await?,
            }
        }

        info!(
            run_id = %self.run.run_id,
            phase = self.run.phase.as_str(),
            reason = self.run.terminal_reason.map_or("", |r| r.as_str()),
            iteration = self.run.iteration,
            "run finished"
        );
        Ok(())
    }

    /// Transition, checkpoint, then publish. A run whose checkpoint cannot be
    /// written is failed and the error returned. A run another process already
    /// finished takes on the stored terminal state.
    async fn apply(&mut self, event: PhaseEvent, detail: Option<String>) -> Result<()> {
        let from = self.run.phase;
        let to = transition(from, event)?;
        self.run.phase = to;
        self.run.updated_at = Utc::now();
        if to.is_terminal() {
            self.run.terminal_reason = event.terminal_reason();
            self.run.failure_detail = detail;
        }

        info!(
            run_id = %self.run.run_id,
            from = from.as_str(),
            to = to.as_str(),
            event = event.as_str(),
            iteration = self.run.iteration,
            "phase transition"
        );

        if let Err(err) = self.inner.persist(&self.run).await {
            if matches!(err, OrchestratorError::Checkpoint(CheckpointError::Terminal(_))) {
                return self.adopt_stored().await;
            }
            error!(run_id = %self.run.run_id, error = %err, "checkpoint write failed");
            if !to.is_terminal() {
                self.run.phase = transition(to, PhaseEvent::FatalError)?;
                self.run.terminal_reason = Some(TerminalReason::FatalToolError);
                self.run.failure_detail = Some(format!("checkpoint write failed: {err}"));
                self.run.updated_at = Utc::now();
                if let Err(retry) = self.inner.persist(&self.run).await {
                    warn!(run_id = %self.run.run_id, error = %retry, "failed to record checkpoint failure");
                }
            }
            self.publish();
            self.inner.record_finished(&self.run).await;
            return Err(err);
        }

        self.publish();
        self.inner.record_phase(&self.run, from).await;
        if to.is_terminal() {
            self.inner.record_finished(&self.run).await;
        }
        Ok(())
    }

    async fn adopt_stored(&mut self) -> Result<()> {
        let stored = self.inner.load(&self.run.run_id).await?;
        info!(
            run_id = %stored.run_id,
            phase = stored.phase.as_str(),
            reason = stored.terminal_reason.map_or("", |r| r.as_str()),
            "run already finished elsewhere; keeping stored state"
        );
        self.run = stored;
        self.publish();
        Ok(())
    }

    fn publish(&self) {
        self.state.send_replace(Arc::new(self.run.clone()));
    }

    /// Await a collaborator, bounded by the generator timeout, the run
    /// deadline and cancellation.
    async fn call<T>(
        &self,
        what: &'static str,
        fut: impl Future<Output = std::result::Result<T, CollaboratorError>>,
    ) -> std::result::Result<T, Interrupt> {
        let remaining = (self.run.deadline - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        if remaining.is_zero() {
            return Err(Interrupt::Deadline);
        }
        let limit = self.inner.settings.generator_timeout;
        let bound = limit.min(remaining);

        tokio::select! {
            () = self.cancel.cancelled() => Err(Interrupt::Cancelled),
            result = tokio::time::timeout(bound, fut) => match result {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(CollaboratorError::Cancelled)) => Err(Interrupt::Cancelled),
                Ok(Err(err)) => Err(Interrupt::Fatal(format!("{what} failed: {err}"))),
                Err(_) if bound < limit => Err(Interrupt::Deadline),
                Err(_) => Err(Interrupt::Fatal(format!("{what} timed out after {limit:?}"))),
            },
        }
    }

    async fn plan(&mut self) -> Step {
        let result = self
            .call("planner", self.inner.planner.plan(&self.run.requirements))
            .await;
        match result {
            Ok(plan) => {
                self.run.plan = Some(plan);
                Step::Advance(PhaseEvent::PlanReady)
            }
            Err(interrupt) => interrupt.into_step(),
        }
    }

    async fn generate(&mut self) -> Step {
        if self
            .run
            .code_candidate
            .as_deref()
            .is_some_and(|c| !c.trim().is_empty())
        {
            debug!(run_id = %self.run.run_id, "validating supplied candidate");
            return Step::Advance(PhaseEvent::CandidateProduced);
        }

        let request = GenerationRequest::Initial {
            requirements: &self.run.requirements,
            plan: self.run.plan.as_deref(),
        };
        let result = self
            .call("generator", self.inner.generator.generate(request))
            .await;
        match result {
            Ok(code) if code.trim().is_empty() => Step::Stop(
                PhaseEvent::FatalError,
                Some("generator returned an empty candidate".to_string()),
            ),
            Ok(code) => {
                self.run.code_candidate = Some(code);
                Step::Advance(PhaseEvent::CandidateProduced)
            }
            Err(interrupt) => interrupt.into_step(),
        }
    }

    async fn validate(&mut self) -> Step {
        let Some(candidate) = self.run.code_candidate.clone() else {
            return Step::Stop(
                PhaseEvent::FatalError,
                Some("no candidate to validate".to_string()),
            );
        };

        let verdict = self
            .inner
            .aggregator
            .aggregate(
                &candidate,
                &self.inner.adapters,
                self.run.blocking_severity,
                &self.cancel,
            )
            .await;
        if self.cancel.is_cancelled() {
            return Step::Stop(PhaseEvent::Cancelled, None);
        }

        self.inner.record_validation(&self.run, &verdict).await;

        let unstartable = verdict
            .invocations
            .iter()
            .find(|inv| inv.required && inv.failure == Some(InvocationFailure::SpawnFailed))
            .map(|inv| inv.tool_name.clone());
        if let Some(tool) = unstartable {
            self.run.latest_verdict = Some(verdict);
            return Step::Stop(
                PhaseEvent::FatalError,
                Some(format!("required adapter {tool} could not be started")),
            );
        }

        let decision = decide(&self.run, &verdict, Utc::now());
        info!(
            run_id = %self.run.run_id,
            iteration = self.run.iteration,
            passed = verdict.passed,
            blocking = verdict.blocking_findings().len(),
            decision = decision.as_str(),
            "validation finished"
        );

        if decision == Decision::Continue {
            self.run.verdict_history.push(verdict.clone());
            self.run.iteration += 1;
        }
        self.run.latest_verdict = Some(verdict);
        Step::Advance(decision.phase_event())
    }

    async fn refine(&mut self) -> Step {
        let (Some(previous), Some(verdict)) = (&self.run.code_candidate, &self.run.latest_verdict)
        else {
            return Step::Stop(
                PhaseEvent::FatalError,
                Some("nothing to refine".to_string()),
            );
        };
        let refinement = RefinementRequest::new(previous.as_str(), verdict, self.run.iteration);
        debug!(
            run_id = %self.run.run_id,
            blocking = refinement.finding_count(),
            "requesting refinement"
        );

        let request = GenerationRequest::Refine {
            requirements: &self.run.requirements,
            refinement: &refinement,
        };
        let result = self
            .call("generator", self.inner.generator.generate(request))
            .await;
        match result {
            Ok(code) if code.trim().is_empty() => Step::Stop(
                PhaseEvent::FatalError,
                Some("generator returned an empty refinement".to_string()),
            ),
            Ok(code) => {
                self.run.code_candidate = Some(code);
                Step::Advance(PhaseEvent::RefinedCandidateReady)
            }
            Err(interrupt) => interrupt.into_step(),
        }
    }

    async fn document(&mut self) -> Step {
        let candidate = self.run.code_candidate.as_deref().unwrap_or_default();
        let result = self
            .call(
                "documenter",
                self.inner.documenter.document(&self.run.requirements, candidate),
            )
            .await;
        match result {
            Ok(docs) => {
                self.run.documentation = (!docs.trim().is_empty()).then_some(docs);
                Step::Advance(PhaseEvent::DocsProduced)
            }
            Err(interrupt) => interrupt.into_step(),
        }
    }
}
