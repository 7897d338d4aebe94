//! Checkpoint store interface and run persistence.
//!
//! A run is persisted as a small [`Snapshot`] row whose large fields
//! (requirements, candidate, verdicts, docs) are content-addressed blobs.
//! Blobs are always written before the snapshot that references them, so a
//! crash between the two leaves the previous snapshot intact.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use hone_core::events::EventPayload;
use hone_core::{BlobRef, Event, Id, Snapshot, Verdict, WorkflowRun, SCHEMA_VERSION};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint not found: {0}")]
    NotFound(String),
    #[error("checkpoint for run {0} is terminal")]
    Terminal(String),
    #[error("checkpoint schema mismatch: expected {expected}, found {found}")]
    SchemaMismatch {
        expected: &'static str,
        found: String,
    },
    #[error("blob not found: {0}")]
    BlobMissing(String),
    #[error("corrupt checkpoint field {field}: {value}")]
    Corrupt { field: &'static str, value: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Durable storage for run snapshots and their blobs.
///
/// `save` must be atomic per run: a reader sees either the previous snapshot
/// or the new one, never a mix.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Store immutable bytes and return their digest. Idempotent.
    async fn put_blob(&self, bytes: &[u8]) -> Result<BlobRef>;

    async fn get_blob(&self, blob: &BlobRef) -> Result<Vec<u8>>;

    /// Replace the snapshot for `run_id`. A stored DONE or FAILED snapshot is
    /// never replaced; saving over one fails with `Terminal`.
    async fn save(&self, run_id: &Id, snapshot: &Snapshot) -> Result<()>;

    /// Latest snapshot for `run_id`. Fails with `SchemaMismatch` for snapshots
    /// written under another schema tag.
    async fn load(&self, run_id: &Id) -> Result<Snapshot>;

    async fn delete(&self, run_id: &Id) -> Result<()>;

    /// Run ids with a snapshot, oldest first.
    async fn list_run_ids(&self, non_terminal_only: bool) -> Result<Vec<Id>>;

    /// Run ids whose retention window ended at or before `now`. Nothing is
    /// deleted; removal is left to an external sweep.
    async fn expired(&self, now: DateTime<Utc>) -> Result<Vec<Id>>;

    /// Append to the audit log. Stores without one ignore events.
    async fn append_event(&self, _run_id: &Id, _payload: &EventPayload) -> Result<()> {
        Ok(())
    }

    async fn list_events(&self, _run_id: &Id) -> Result<Vec<Event>> {
        Ok(Vec::new())
    }
}

async fn put_text(store: &dyn CheckpointStore, text: &str) -> Result<BlobRef> {
    store.put_blob(text.as_bytes()).await
}

async fn put_optional(store: &dyn CheckpointStore, text: Option<&str>) -> Result<Option<BlobRef>> {
    match text {
        Some(text) => Ok(Some(put_text(store, text).await?)),
        None => Ok(None),
    }
}

async fn get_text(store: &dyn CheckpointStore, blob: &BlobRef) -> Result<String> {
    let bytes = store.get_blob(blob).await?;
    String::from_utf8(bytes).map_err(|_| CheckpointError::Corrupt {
        field: "blob",
        value: blob.to_string(),
    })
}

async fn get_optional(store: &dyn CheckpointStore, blob: Option<&BlobRef>) -> Result<Option<String>> {
    match blob {
        Some(blob) => Ok(Some(get_text(store, blob).await?)),
        None => Ok(None),
    }
}

/// Persist `run` as its latest snapshot. `ttl` sets the retention hint.
pub async fn save_run(store: &dyn CheckpointStore, run: &WorkflowRun, ttl: Duration) -> Result<()> {
    let requirements_ref = put_text(store, &run.requirements).await?;
    let plan_ref = put_optional(store, run.plan.as_deref()).await?;
    let code_candidate_ref = put_optional(store, run.code_candidate.as_deref()).await?;
    let history_json = serde_json::to_string(&run.verdict_history)?;
    let verdict_history_ref = put_text(store, &history_json).await?;
    let latest_verdict_ref = match &run.latest_verdict {
        Some(verdict) => Some(put_text(store, &serde_json::to_string(verdict)?).await?),
        None => None,
    };
    let documentation_ref = put_optional(store, run.documentation.as_deref()).await?;

    let snapshot = Snapshot {
        schema_version: SCHEMA_VERSION.to_string(),
        run_id: run.run_id.clone(),
        phase: run.phase,
        iteration: run.iteration,
        max_iterations: run.max_iterations,
        blocking_severity: run.blocking_severity,
        requirements_ref,
        plan_ref,
        code_candidate_ref,
        verdict_history_ref,
        latest_verdict_ref,
        documentation_ref,
        created_at: run.created_at,
        updated_at: run.updated_at,
        deadline: run.deadline,
        terminal_reason: run.terminal_reason,
        failure_detail: run.failure_detail.clone(),
        expires_at: run
            .updated_at
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC),
    };

    store.save(&run.run_id, &snapshot).await
}

/// Rebuild a run from its latest snapshot.
pub async fn load_run(store: &dyn CheckpointStore, run_id: &Id) -> Result<WorkflowRun> {
    let snapshot = store.load(run_id).await?;

    let requirements = get_text(store, &snapshot.requirements_ref).await?;
    let plan = get_optional(store, snapshot.plan_ref.as_ref()).await?;
    let code_candidate = get_optional(store, snapshot.code_candidate_ref.as_ref()).await?;
    let history_json = get_text(store, &snapshot.verdict_history_ref).await?;
    let verdict_history: Vec<Verdict> = serde_json::from_str(&history_json)?;
    let latest_verdict = match get_optional(store, snapshot.latest_verdict_ref.as_ref()).await? {
        Some(json) => Some(serde_json::from_str::<Verdict>(&json)?),
        None => None,
    };
    let documentation = get_optional(store, snapshot.documentation_ref.as_ref()).await?;

    Ok(WorkflowRun {
        run_id: snapshot.run_id,
        phase: snapshot.phase,
        iteration: snapshot.iteration,
        max_iterations: snapshot.max_iterations,
        blocking_severity: snapshot.blocking_severity,
        requirements,
        plan,
        code_candidate,
        verdict_history,
        latest_verdict,
        documentation,
        created_at: snapshot.created_at,
        updated_at: snapshot.updated_at,
        deadline: snapshot.deadline,
        terminal_reason: snapshot.terminal_reason,
        failure_detail: snapshot.failure_detail,
    })
}
