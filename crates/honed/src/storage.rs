//! SQLite checkpoint store.
//!
//! Holds three tables: content-addressed `blobs`, one `checkpoints` row per
//! run, and the append-only `events` audit log.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hone_core::events::EventPayload;
use hone_core::{
    BlobRef, Event, Id, Phase, Severity, Snapshot, TerminalReason, SCHEMA_VERSION,
};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::path::Path;

use crate::checkpoint::{CheckpointError, CheckpointStore, Result};

const CHECKPOINT_COLUMNS: &str = "run_id, schema_version, phase, iteration, max_iterations, \
    blocking_severity, requirements_ref, plan_ref, code_candidate_ref, verdict_history_ref, \
    latest_verdict_ref, documentation_ref, created_at, updated_at, deadline, terminal_reason, \
    failure_detail, expires_at";

#[derive(Debug)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `db_path`.
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// Apply the schema compiled into the binary. Safe to run repeatedly.
    pub async fn migrate_embedded(&self) -> Result<()> {
        let migrations = [include_str!("../../../migrations/0001_init.sql")];

        for migration_sql in migrations {
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");

            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if let Err(e) = sqlx::query(trimmed).execute(&self.pool).await {
                    let msg = e.to_string();
                    if !msg.contains("duplicate column") && !msg.contains("already exists") {
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for SqliteStore {
    async fn put_blob(&self, bytes: &[u8]) -> Result<BlobRef> {
        let digest = BlobRef::for_bytes(bytes);
        sqlx::query(
            "INSERT OR IGNORE INTO blobs (digest, content, size, created_at) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(digest.as_ref())
        .bind(bytes)
        .bind(bytes.len() as i64)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(digest)
    }

    async fn get_blob(&self, blob: &BlobRef) -> Result<Vec<u8>> {
        let content: Vec<u8> = sqlx::query_scalar("SELECT content FROM blobs WHERE digest = ?1")
            .bind(blob.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CheckpointError::BlobMissing(blob.to_string()))?;

        if BlobRef::for_bytes(&content) != *blob {
            return Err(CheckpointError::Corrupt {
                field: "blob",
                value: blob.to_string(),
            });
        }
        Ok(content)
    }

    async fn save(&self, run_id: &Id, snapshot: &Snapshot) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r"
            INSERT INTO checkpoints (run_id, schema_version, phase, iteration, max_iterations,
                                     blocking_severity, requirements_ref, plan_ref,
                                     code_candidate_ref, verdict_history_ref, latest_verdict_ref,
                                     documentation_ref, created_at, updated_at, deadline,
                                     terminal_reason, failure_detail, expires_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
            ON CONFLICT(run_id) DO UPDATE SET
                schema_version = excluded.schema_version,
                phase = excluded.phase,
                iteration = excluded.iteration,
                max_iterations = excluded.max_iterations,
                blocking_severity = excluded.blocking_severity,
                requirements_ref = excluded.requirements_ref,
                plan_ref = excluded.plan_ref,
                code_candidate_ref = excluded.code_candidate_ref,
                verdict_history_ref = excluded.verdict_history_ref,
                latest_verdict_ref = excluded.latest_verdict_ref,
                documentation_ref = excluded.documentation_ref,
                updated_at = excluded.updated_at,
                deadline = excluded.deadline,
                terminal_reason = excluded.terminal_reason,
                failure_detail = excluded.failure_detail,
                expires_at = excluded.expires_at
            WHERE checkpoints.phase NOT IN ('DONE', 'FAILED')
            ",
        )
        .bind(run_id.as_ref())
        .bind(&snapshot.schema_version)
        .bind(snapshot.phase.as_str())
        .bind(i64::from(snapshot.iteration))
        .bind(i64::from(snapshot.max_iterations))
        .bind(snapshot.blocking_severity.as_str())
        .bind(snapshot.requirements_ref.as_ref())
        .bind(snapshot.plan_ref.as_ref().map(AsRef::<str>::as_ref))
        .bind(snapshot.code_candidate_ref.as_ref().map(AsRef::<str>::as_ref))
        .bind(snapshot.verdict_history_ref.as_ref())
        .bind(snapshot.latest_verdict_ref.as_ref().map(AsRef::<str>::as_ref))
        .bind(snapshot.documentation_ref.as_ref().map(AsRef::<str>::as_ref))
        .bind(snapshot.created_at.timestamp_millis())
        .bind(snapshot.updated_at.timestamp_millis())
        .bind(snapshot.deadline.timestamp_millis())
        .bind(snapshot.terminal_reason.map(|r| r.as_str()))
        .bind(&snapshot.failure_detail)
        .bind(snapshot.expires_at.timestamp_millis())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CheckpointError::Terminal(run_id.to_string()));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn load(&self, run_id: &Id) -> Result<Snapshot> {
        let query = format!("SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE run_id = ?1");
        let row = sqlx::query_as::<_, CheckpointRow>(&query)
            .bind(run_id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CheckpointError::NotFound(run_id.to_string()))?;

        row.into_snapshot()
    }

    async fn delete(&self, run_id: &Id) -> Result<()> {
        let result = sqlx::query("DELETE FROM checkpoints WHERE run_id = ?1")
            .bind(run_id.as_ref())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CheckpointError::NotFound(run_id.to_string()));
        }
        Ok(())
    }

    async fn list_run_ids(&self, non_terminal_only: bool) -> Result<Vec<Id>> {
        let query = if non_terminal_only {
            "SELECT run_id FROM checkpoints WHERE phase NOT IN ('DONE', 'FAILED') \
             ORDER BY created_at ASC"
        } else {
            "SELECT run_id FROM checkpoints ORDER BY created_at ASC"
        };
        let ids: Vec<String> = sqlx::query_scalar(query).fetch_all(&self.pool).await?;
        Ok(ids.into_iter().map(Id::from_string).collect())
    }

    async fn expired(&self, now: DateTime<Utc>) -> Result<Vec<Id>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT run_id FROM checkpoints WHERE expires_at <= ?1 ORDER BY expires_at ASC",
        )
        .bind(now.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(Id::from_string).collect())
    }

    async fn append_event(&self, run_id: &Id, payload: &EventPayload) -> Result<()> {
        let id = Id::new();
        let payload_json = payload.to_json()?;

        sqlx::query(
            "INSERT INTO events (id, run_id, type, ts, payload_json) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(id.as_ref())
        .bind(run_id.as_ref())
        .bind(payload.event_type().as_str())
        .bind(Utc::now().timestamp_millis())
        .bind(&payload_json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_events(&self, run_id: &Id) -> Result<Vec<Event>> {
        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT id, run_id, type, ts, payload_json FROM events WHERE run_id = ?1 \
             ORDER BY ts ASC, id ASC",
        )
        .bind(run_id.as_ref())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(EventRow::into_event).collect())
    }
}

// --- Row types for SQLx ---

#[derive(sqlx::FromRow)]
struct CheckpointRow {
    run_id: String,
    schema_version: String,
    phase: String,
    iteration: i64,
    max_iterations: i64,
    blocking_severity: String,
    requirements_ref: String,
    plan_ref: Option<String>,
    code_candidate_ref: Option<String>,
    verdict_history_ref: String,
    latest_verdict_ref: Option<String>,
    documentation_ref: Option<String>,
    created_at: i64,
    updated_at: i64,
    deadline: i64,
    terminal_reason: Option<String>,
    failure_detail: Option<String>,
    expires_at: i64,
}

fn corrupt(field: &'static str, value: impl ToString) -> CheckpointError {
    CheckpointError::Corrupt {
        field,
        value: value.to_string(),
    }
}

fn millis(field: &'static str, ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| corrupt(field, ms))
}

fn count(field: &'static str, value: i64) -> Result<u32> {
    u32::try_from(value).map_err(|_| corrupt(field, value))
}

impl CheckpointRow {
    fn into_snapshot(self) -> Result<Snapshot> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(CheckpointError::SchemaMismatch {
                expected: SCHEMA_VERSION,
                found: self.schema_version,
            });
        }

        let phase = Phase::parse(&self.phase).ok_or_else(|| corrupt("phase", &self.phase))?;
        let blocking_severity = Severity::parse(&self.blocking_severity)
            .ok_or_else(|| corrupt("blocking_severity", &self.blocking_severity))?;
        let terminal_reason = match self.terminal_reason.as_deref() {
            Some(value) => {
                Some(TerminalReason::parse(value).ok_or_else(|| corrupt("terminal_reason", value))?)
            }
            None => None,
        };

        Ok(Snapshot {
            schema_version: self.schema_version,
            run_id: Id::from_string(self.run_id),
            phase,
            iteration: count("iteration", self.iteration)?,
            max_iterations: count("max_iterations", self.max_iterations)?,
            blocking_severity,
            requirements_ref: BlobRef(self.requirements_ref),
            plan_ref: self.plan_ref.map(BlobRef),
            code_candidate_ref: self.code_candidate_ref.map(BlobRef),
            verdict_history_ref: BlobRef(self.verdict_history_ref),
            latest_verdict_ref: self.latest_verdict_ref.map(BlobRef),
            documentation_ref: self.documentation_ref.map(BlobRef),
            created_at: millis("created_at", self.created_at)?,
            updated_at: millis("updated_at", self.updated_at)?,
            deadline: millis("deadline", self.deadline)?,
            terminal_reason,
            failure_detail: self.failure_detail,
            expires_at: millis("expires_at", self.expires_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: String,
    run_id: String,
    #[sqlx(rename = "type")]
    event_type: String,
    ts: i64,
    payload_json: String,
}

impl EventRow {
    fn into_event(self) -> Event {
        Event {
            id: Id::from_string(self.id),
            run_id: Id::from_string(self.run_id),
            event_type: self.event_type,
            timestamp: DateTime::from_timestamp_millis(self.ts).unwrap_or_default(),
            payload_json: self.payload_json,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use hone_core::events::RunCreatedPayload;
    use tempfile::TempDir;

    struct TestStore {
        store: SqliteStore,
        _dir: TempDir, // Keep alive to prevent cleanup
    }

    async fn create_test_store() -> TestStore {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("test.db");
        let store = SqliteStore::new(&db_path).await.unwrap();
        store.migrate_embedded().await.unwrap();
        TestStore { store, _dir: dir }
    }

    fn snapshot(run_id: &Id, phase: Phase, blob: &BlobRef, expires_at: DateTime<Utc>) -> Snapshot {
        let now = Utc::now();
        Snapshot {
            schema_version: SCHEMA_VERSION.to_string(),
            run_id: run_id.clone(),
            phase,
            iteration: 0,
            max_iterations: 5,
            blocking_severity: Severity::High,
            requirements_ref: blob.clone(),
            plan_ref: None,
            code_candidate_ref: None,
            verdict_history_ref: blob.clone(),
            latest_verdict_ref: None,
            documentation_ref: None,
            created_at: now,
            updated_at: now,
            deadline: now + Duration::hours(1),
            terminal_reason: phase.is_terminal().then_some(TerminalReason::Passed),
            failure_detail: None,
            expires_at,
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let ts = create_test_store().await;
        ts.store.migrate_embedded().await.unwrap();
    }

    #[tokio::test]
    async fn blobs_are_content_addressed() {
        let ts = create_test_store().await;
        let a = ts.store.put_blob(b"resource {}").await.unwrap();
        let b = ts.store.put_blob(b"resource {}").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(ts.store.get_blob(&a).await.unwrap(), b"resource {}");
    }

    #[tokio::test]
    async fn missing_blob_errors() {
        let ts = create_test_store().await;
        let err = ts
            .store
            .get_blob(&BlobRef::for_bytes(b"never stored"))
            .await
            .unwrap_err();
        assert!(matches!(err, CheckpointError::BlobMissing(_)));
    }

    #[tokio::test]
    async fn save_and_load_snapshot() {
        let ts = create_test_store().await;
        let blob = ts.store.put_blob(b"[]").await.unwrap();
        let run_id = Id::new();
        let snap = snapshot(&run_id, Phase::Validating, &blob, Utc::now() + Duration::days(1));

        ts.store.save(&run_id, &snap).await.unwrap();
        let loaded = ts.store.load(&run_id).await.unwrap();

        assert_eq!(loaded.run_id, run_id);
        assert_eq!(loaded.phase, Phase::Validating);
        assert_eq!(loaded.requirements_ref, blob);
        assert_eq!(loaded.expires_at.timestamp_millis(), snap.expires_at.timestamp_millis());
    }

    #[tokio::test]
    async fn unknown_schema_version_is_rejected() {
        let ts = create_test_store().await;
        let blob = ts.store.put_blob(b"[]").await.unwrap();
        let run_id = Id::new();
        let mut snap = snapshot(&run_id, Phase::Planning, &blob, Utc::now());
        snap.schema_version = "hone.checkpoint/v0".to_string();
        ts.store.save(&run_id, &snap).await.unwrap();

        let err = ts.store.load(&run_id).await.unwrap_err();
        assert!(matches!(
            err,
            CheckpointError::SchemaMismatch { found, .. } if found == "hone.checkpoint/v0"
        ));
    }

    #[tokio::test]
    async fn list_filters_terminal_runs() {
        let ts = create_test_store().await;
        let blob = ts.store.put_blob(b"[]").await.unwrap();
        let active = Id::new();
        let finished = Id::new();
        let far = Utc::now() + Duration::days(1);
        ts.store
            .save(&active, &snapshot(&active, Phase::Refining, &blob, far))
            .await
            .unwrap();
        ts.store
            .save(&finished, &snapshot(&finished, Phase::Done, &blob, far))
            .await
            .unwrap();

        assert_eq!(ts.store.list_run_ids(true).await.unwrap(), vec![active.clone()]);
        assert_eq!(ts.store.list_run_ids(false).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn expired_lists_without_deleting() {
        let ts = create_test_store().await;
        let blob = ts.store.put_blob(b"[]").await.unwrap();
        let stale = Id::new();
        let fresh = Id::new();
        let now = Utc::now();
        ts.store
            .save(&stale, &snapshot(&stale, Phase::Done, &blob, now - Duration::hours(1)))
            .await
            .unwrap();
        ts.store
            .save(&fresh, &snapshot(&fresh, Phase::Done, &blob, now + Duration::hours(1)))
            .await
            .unwrap();

        assert_eq!(ts.store.expired(now).await.unwrap(), vec![stale.clone()]);
        ts.store.load(&stale).await.unwrap();
    }

    #[tokio::test]
    async fn delete_removes_snapshot() {
        let ts = create_test_store().await;
        let blob = ts.store.put_blob(b"[]").await.unwrap();
        let run_id = Id::new();
        ts.store
            .save(&run_id, &snapshot(&run_id, Phase::Done, &blob, Utc::now()))
            .await
            .unwrap();

        ts.store.delete(&run_id).await.unwrap();
        assert!(matches!(
            ts.store.load(&run_id).await,
            Err(CheckpointError::NotFound(_))
        ));
        assert!(matches!(
            ts.store.delete(&run_id).await,
            Err(CheckpointError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn append_and_list_events() {
        let ts = create_test_store().await;
        let run_id = Id::new();
        let payload = EventPayload::RunCreated(RunCreatedPayload {
            run_id: run_id.clone(),
            max_iterations: 5,
            blocking_severity: Severity::High,
            deadline: Utc::now(),
        });

        ts.store.append_event(&run_id, &payload).await.unwrap();

        let events = ts.store.list_events(&run_id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "RUN_CREATED");
        assert!(ts.store.list_events(&Id::new()).await.unwrap().is_empty());
    }
}
