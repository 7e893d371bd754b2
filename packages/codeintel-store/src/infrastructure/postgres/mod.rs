//! PostgreSQL upload store
//!
//! Production backend. Batch claims lock candidate rows in ascending id
//! order with `FOR UPDATE SKIP LOCKED`, so concurrent janitors and API
//! callers never deadlock and a row held elsewhere is left for the next
//! cycle. Single-row transitions lock the row, apply the domain state
//! machine, and write the result back inside one transaction.
//!
//! The schema lives in `migrations/`; apply it with `sqlx migrate run`.

mod conditions;
mod scanner;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info};

use self::conditions::{
    push_allowed, push_bulk_conditions, push_list_conditions, Builder, MonikerColumns,
    AUDIT_REASON_SETTING, DELETE_TARGET_STATE, MARK_DIRTY, RANKED_PROVIDERS, UPLOAD_COLUMNS,
    UPLOAD_FROM,
};
use self::scanner::ReferenceQuery;
pub use self::scanner::PgReferenceScanner;

use crate::config::{DatabaseConfig, StoreConfig};
use crate::domain::filters::{BulkUploadOptions, ListUploadsOptions};
use crate::domain::models::{
    ArtifactState, AuditReason, CommitRefresh, DirtyRepository, Index, IndexId, Moniker, NewIndex,
    NewUpload, Repository, RepositoryId, RequeueReport, SourcedCommits, Upload, UploadAuditLog,
    UploadId, UploadPage,
};
use crate::domain::ports::{
    authorize_repositories, ReferenceScan, RepositoryAuthorizer, UploadStore,
};
use crate::domain::state::UploadStateMachine;
use crate::error::{ErrorKind, Result, StorageError};
use crate::scanner::SliceScanner;

/// Default page size of reference scanners
pub const DEFAULT_SCAN_BATCH_SIZE: usize = 100;

/// PostgreSQL `UploadStore`
#[derive(Clone)]
pub struct PostgresUploadStore {
    pool: PgPool,
    scan_batch_size: usize,
}

impl PostgresUploadStore {
    /// Open a connection pool with the configured sizing and timeouts
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .max_lifetime(Duration::from_secs(config.max_lifetime_secs))
            .connect(&config.url)
            .await
            .map_err(|e| {
                StorageError::database(format!("Failed to connect to PostgreSQL: {}", e))
                    .with_source(e)
            })?;
        info!(max_connections = config.max_connections, "connected upload store");
        Ok(Self::new(pool))
    }

    pub async fn from_config(config: &StoreConfig) -> Result<Self> {
        Ok(Self::connect(&config.database)
            .await?
            .with_scan_batch_size(config.monikers.reference_scan_batch))
    }

    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            scan_batch_size: DEFAULT_SCAN_BATCH_SIZE,
        }
    }

    pub fn with_scan_batch_size(mut self, batch_size: usize) -> Self {
        self.scan_batch_size = batch_size.max(1);
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    async fn begin(&self) -> Result<sqlx::Transaction<'static, sqlx::Postgres>> {
        self.pool.begin().await.map_err(|e| {
            StorageError::transaction(format!("Failed to begin transaction: {}", e)).with_source(e)
        })
    }

    /// Distinct repositories of the rows a filtered upload query would touch
    async fn candidate_repositories(&self, mut qb: Builder) -> Result<Vec<RepositoryId>> {
        Ok(qb.build_query_scalar::<i64>().fetch_all(&self.pool).await?)
    }
}

async fn commit(tx: sqlx::Transaction<'static, sqlx::Postgres>) -> Result<()> {
    tx.commit().await.map_err(|e| {
        StorageError::transaction(format!("Failed to commit transaction: {}", e)).with_source(e)
    })
}

// ═══════════════════════════════════════════════════════════════════════════
// Row mapping
// ═══════════════════════════════════════════════════════════════════════════

fn out_of_range(column: &str, value: impl std::fmt::Display) -> StorageError {
    StorageError::serialization(format!("{} out of range: {}", column, value))
}

/// Counters are `INTEGER` columns but never negative
fn column_u32(row: &PgRow, column: &str) -> Result<u32> {
    let value: i32 = row.try_get(column)?;
    u32::try_from(value).map_err(|_| out_of_range(column, value))
}

fn to_i32(column: &str, value: u32) -> Result<i32> {
    i32::try_from(value).map_err(|_| out_of_range(column, value))
}

fn count_to_usize(column: &str, value: i64) -> Result<usize> {
    usize::try_from(value).map_err(|_| out_of_range(column, value))
}

/// `LIMIT`/`OFFSET` binds; anything past `i64::MAX` is unbounded anyway
pub(super) fn bind_count(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn parse_state(row: &PgRow) -> Result<ArtifactState> {
    let state: String = row.try_get("state")?;
    state.parse().map_err(StorageError::serialization)
}

fn row_to_upload(row: &PgRow) -> Result<Upload> {
    let uploaded_parts = row
        .try_get::<Vec<i32>, _>("uploaded_parts")?
        .into_iter()
        .map(|p| u32::try_from(p).map_err(|_| out_of_range("uploaded_parts", p)))
        .collect::<Result<Vec<_>>>()?;
    Ok(Upload {
        id: row.try_get("id")?,
        repository_id: row.try_get("repository_id")?,
        repository_name: row.try_get("repository_name")?,
        commit: row.try_get("commit")?,
        root: row.try_get("root")?,
        state: parse_state(row)?,
        indexer: row.try_get("indexer")?,
        indexer_version: row.try_get("indexer_version")?,
        failure_message: row.try_get("failure_message")?,
        uploaded_at: row.try_get("uploaded_at")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        num_parts: column_u32(row, "num_parts")?,
        uploaded_parts,
        upload_size: row.try_get("upload_size")?,
        num_failures: column_u32(row, "num_failures")?,
        associated_index_id: row.try_get("associated_index_id")?,
        should_reindex: row.try_get("should_reindex")?,
        commit_last_checked_at: row.try_get("commit_last_checked_at")?,
        expired: row.try_get("expired")?,
        last_retention_scan_at: row.try_get("last_retention_scan_at")?,
        visible_at_tip: row.try_get("visible_at_tip")?,
        rank: row
            .try_get::<Option<i64>, _>("queue_rank")?
            .map(|r| u32::try_from(r).map_err(|_| out_of_range("queue_rank", r)))
            .transpose()?,
    })
}

fn row_to_audit_log(row: &PgRow) -> Result<UploadAuditLog> {
    let transitions: String = row.try_get("transition_columns")?;
    let operation: String = row.try_get("operation")?;
    Ok(UploadAuditLog {
        log_timestamp: row.try_get("log_timestamp")?,
        record_deleted_at: row.try_get("record_deleted_at")?,
        upload_id: row.try_get("upload_id")?,
        commit: row.try_get("commit")?,
        root: row.try_get("root")?,
        repository_id: row.try_get("repository_id")?,
        uploaded_at: row.try_get("uploaded_at")?,
        indexer: row.try_get("indexer")?,
        indexer_version: row.try_get("indexer_version")?,
        upload_size: row.try_get("upload_size")?,
        associated_index_id: row.try_get("associated_index_id")?,
        transition_columns: serde_json::from_str(&transitions)?,
        reason: row.try_get("reason")?,
        operation: operation.parse().map_err(StorageError::serialization)?,
    })
}

fn row_to_index(row: &PgRow) -> Result<Index> {
    Ok(Index {
        id: row.try_get("id")?,
        repository_id: row.try_get("repository_id")?,
        repository_name: row.try_get("repository_name")?,
        commit: row.try_get("commit")?,
        root: row.try_get("root")?,
        state: parse_state(row)?,
        indexer: row.try_get("indexer")?,
        failure_message: row.try_get("failure_message")?,
        queued_at: row.try_get("queued_at")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        num_failures: column_u32(row, "num_failures")?,
        should_reindex: row.try_get("should_reindex")?,
        commit_last_checked_at: row.try_get("commit_last_checked_at")?,
    })
}

// ═══════════════════════════════════════════════════════════════════════════
// Single-row transitions
// ═══════════════════════════════════════════════════════════════════════════

async fn lock_upload(conn: &mut PgConnection, id: UploadId) -> Result<Upload> {
    let mut qb = Builder::new("SELECT ");
    qb.push(UPLOAD_COLUMNS)
        .push(UPLOAD_FROM)
        .push(" AND u.id = ")
        .push_bind(id)
        .push(" AND u.state != 'deleted' FOR UPDATE OF u");
    let row = qb
        .build()
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| StorageError::upload_not_found(id))?;
    row_to_upload(&row)
}

/// Write back the columns the state machine may change
async fn save_upload(conn: &mut PgConnection, upload: &Upload) -> Result<()> {
    let parts = upload
        .uploaded_parts
        .iter()
        .map(|p| to_i32("uploaded_parts", *p))
        .collect::<Result<Vec<_>>>()?;
    sqlx::query(
        r#"
        UPDATE lsif_uploads
        SET state = $2, started_at = $3, finished_at = $4, failure_message = $5,
            num_failures = $6, uploaded_parts = $7
        WHERE id = $1
        "#,
    )
    .bind(upload.id)
    .bind(upload.state.as_str())
    .bind(upload.started_at)
    .bind(upload.finished_at)
    .bind(upload.failure_message.as_deref())
    .bind(to_i32("num_failures", upload.num_failures)?)
    .bind(parts)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Tag every audit entry written by the rest of the transaction
async fn set_audit_reason(conn: &mut PgConnection, reason: AuditReason) -> Result<()> {
    sqlx::query("SELECT set_config($1, $2, true)")
        .bind(AUDIT_REASON_SETTING)
        .bind(reason.as_str())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn mark_dirty(conn: &mut PgConnection, repositories: &[RepositoryId]) -> Result<()> {
    if repositories.is_empty() {
        return Ok(());
    }
    sqlx::query(MARK_DIRTY)
        .bind(repositories.to_vec())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn ensure_repository(conn: &mut PgConnection, id: RepositoryId) -> Result<()> {
    let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM repositories WHERE id = $1")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    exists
        .map(|_| ())
        .ok_or_else(|| StorageError::repository_not_found(id))
}

async fn replace_monikers(
    conn: &mut PgConnection,
    table: &str,
    upload_id: UploadId,
    monikers: &[Moniker],
) -> Result<()> {
    let exists: Option<i64> = sqlx::query_scalar(
        "SELECT id FROM lsif_uploads WHERE id = $1 AND state != 'deleted'",
    )
    .bind(upload_id)
    .fetch_optional(&mut *conn)
    .await?;
    if exists.is_none() {
        return Err(StorageError::upload_not_found(upload_id));
    }

    sqlx::query(&format!("DELETE FROM {} WHERE dump_id = $1", table))
        .bind(upload_id)
        .execute(&mut *conn)
        .await?;

    let m = monikers;
    sqlx::query(&format!(
        "INSERT INTO {} (dump_id, scheme, manager, name, version) \
         SELECT $1, * FROM unnest($2::text[], $3::text[], $4::text[], $5::text[])",
        table
    ))
    .bind(upload_id)
    .bind(m.iter().map(|m| m.scheme.clone()).collect::<Vec<_>>())
    .bind(m.iter().map(|m| m.manager.clone()).collect::<Vec<_>>())
    .bind(m.iter().map(|m| m.name.clone()).collect::<Vec<_>>())
    .bind(m.iter().map(|m| m.version.clone()).collect::<Vec<_>>())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn replace_upload_set(
    conn: &mut PgConnection,
    table: &str,
    repository_id: RepositoryId,
    commit: Option<&str>,
    upload_ids: &[UploadId],
) -> Result<()> {
    match commit {
        Some(commit) => {
            sqlx::query(&format!(
                "DELETE FROM {} WHERE repository_id = $1 AND commit = $2",
                table
            ))
            .bind(repository_id)
            .bind(commit)
            .execute(&mut *conn)
            .await?;
            sqlx::query(&format!(
                "INSERT INTO {} (repository_id, commit, upload_id) \
                 SELECT $1, $2, id FROM unnest($3::bigint[]) AS id ON CONFLICT DO NOTHING",
                table
            ))
            .bind(repository_id)
            .bind(commit)
            .bind(upload_ids.to_vec())
            .execute(&mut *conn)
            .await?;
        }
        None => {
            sqlx::query(&format!("DELETE FROM {} WHERE repository_id = $1", table))
                .bind(repository_id)
                .execute(&mut *conn)
                .await?;
            sqlx::query(&format!(
                "INSERT INTO {} (repository_id, upload_id) \
                 SELECT $1, id FROM unnest($2::bigint[]) AS id ON CONFLICT DO NOTHING",
                table
            ))
            .bind(repository_id)
            .bind(upload_ids.to_vec())
            .execute(&mut *conn)
            .await?;
        }
    }
    Ok(())
}

#[async_trait]
impl UploadStore for PostgresUploadStore {
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Repositories
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    async fn upsert_repository(&self, repository: &Repository) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO repositories (id, name, deleted_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                deleted_at = EXCLUDED.deleted_at
            "#,
        )
        .bind(repository.id)
        .bind(&repository.name)
        .bind(repository.deleted_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Ingestion and processing
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    async fn insert_upload(&self, upload: NewUpload, now: DateTime<Utc>) -> Result<UploadId> {
        let mut tx = self.begin().await?;
        ensure_repository(&mut tx, upload.repository_id).await?;

        let state = upload.initial_state();
        let parts: Vec<i32> = if state == ArtifactState::Queued {
            vec![0]
        } else {
            Vec::new()
        };
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO lsif_uploads (
                repository_id, commit, root, state, indexer, indexer_version,
                uploaded_at, num_parts, uploaded_parts, upload_size, associated_index_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING id
            "#,
        )
        .bind(upload.repository_id)
        .bind(&upload.commit)
        .bind(&upload.root)
        .bind(state.as_str())
        .bind(&upload.indexer)
        .bind(&upload.indexer_version)
        .bind(now)
        .bind(to_i32("num_parts", upload.num_parts.max(1))?)
        .bind(parts)
        .bind(upload.upload_size)
        .bind(upload.associated_index_id)
        .fetch_one(&mut *tx)
        .await?;

        commit(tx).await?;
        debug!(upload_id = id, state = %state, "upload inserted");
        Ok(id)
    }

    async fn add_upload_part(&self, id: UploadId, part: u32) -> Result<ArtifactState> {
        let mut tx = self.begin().await?;
        let mut upload = lock_upload(&mut tx, id).await?;
        UploadStateMachine::new(&mut upload).add_part(part)?;
        save_upload(&mut tx, &upload).await?;
        commit(tx).await?;
        Ok(upload.state)
    }

    async fn dequeue_upload(&self, now: DateTime<Utc>) -> Result<Option<Upload>> {
        let mut tx = self.begin().await?;
        let mut qb = Builder::new("SELECT ");
        qb.push(UPLOAD_COLUMNS).push(UPLOAD_FROM).push(
            " AND u.state = 'queued' ORDER BY u.uploaded_at, u.id LIMIT 1 \
             FOR UPDATE OF u SKIP LOCKED",
        );
        let Some(row) = qb.build().fetch_optional(&mut *tx).await? else {
            return Ok(None);
        };
        let mut upload = row_to_upload(&row)?;
        UploadStateMachine::new(&mut upload).start(now)?;
        upload.rank = None;
        save_upload(&mut tx, &upload).await?;
        commit(tx).await?;
        debug!(upload_id = upload.id, "upload dequeued");
        Ok(Some(upload))
    }

    async fn mark_complete(&self, id: UploadId, now: DateTime<Utc>) -> Result<()> {
        let mut tx = self.begin().await?;
        let mut upload = lock_upload(&mut tx, id).await?;
        UploadStateMachine::new(&mut upload).complete(now)?;
        save_upload(&mut tx, &upload).await?;
        mark_dirty(&mut tx, &[upload.repository_id]).await?;
        commit(tx).await
    }

    async fn mark_errored(
        &self,
        id: UploadId,
        failure_message: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.begin().await?;
        let mut upload = lock_upload(&mut tx, id).await?;
        UploadStateMachine::new(&mut upload).error(failure_message, now)?;
        save_upload(&mut tx, &upload).await?;
        commit(tx).await
    }

    async fn requeue_errored(&self, max_failures: u32, _now: DateTime<Utc>) -> Result<RequeueReport> {
        let states: Vec<String> = sqlx::query_scalar(
            r#"
            WITH candidates AS (
                SELECT id FROM lsif_uploads
                WHERE state = 'errored'
                ORDER BY id
                FOR UPDATE SKIP LOCKED
            )
            UPDATE lsif_uploads u
            SET state = CASE WHEN u.num_failures >= $1 THEN 'failed' ELSE 'queued' END,
                started_at = CASE WHEN u.num_failures >= $1 THEN u.started_at END,
                finished_at = CASE WHEN u.num_failures >= $1 THEN u.finished_at END
            FROM candidates c
            WHERE u.id = c.id
            RETURNING u.state
            "#,
        )
        .bind(to_i32("max_failures", max_failures)?)
        .fetch_all(&self.pool)
        .await?;

        let failed = states.iter().filter(|s| s.as_str() == "failed").count();
        Ok(RequeueReport {
            requeued: states.len() - failed,
            failed,
        })
    }

    async fn reap_deleting(&self) -> Result<Vec<UploadId>> {
        let mut tx = self.begin().await?;
        let mut reaped: Vec<i64> = sqlx::query_scalar(
            r#"
            WITH candidates AS (
                SELECT id FROM lsif_uploads
                WHERE state = 'deleting'
                ORDER BY id
                FOR UPDATE SKIP LOCKED
            )
            UPDATE lsif_uploads u SET state = 'deleted'
            FROM candidates c
            WHERE u.id = c.id
            RETURNING u.id
            "#,
        )
        .fetch_all(&mut *tx)
        .await?;

        for table in ["lsif_packages", "lsif_references"] {
            sqlx::query(&format!("DELETE FROM {} WHERE dump_id = ANY($1)", table))
                .bind(reaped.clone())
                .execute(&mut *tx)
                .await?;
        }
        commit(tx).await?;

        reaped.sort_unstable();
        if !reaped.is_empty() {
            info!(count = reaped.len(), "reaped deleting uploads");
        }
        Ok(reaped)
    }

    async fn insert_index(&self, index: NewIndex, now: DateTime<Utc>) -> Result<IndexId> {
        let mut tx = self.begin().await?;
        ensure_repository(&mut tx, index.repository_id).await?;
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO lsif_indexes (repository_id, commit, root, state, indexer, queued_at)
            VALUES ($1, $2, $3, 'queued', $4, $5)
            RETURNING id
            "#,
        )
        .bind(index.repository_id)
        .bind(&index.commit)
        .bind(&index.root)
        .bind(&index.indexer)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        commit(tx).await?;
        Ok(id)
    }

    async fn get_index_by_id(&self, id: IndexId) -> Result<Option<Index>> {
        let row = sqlx::query(
            r#"
            SELECT i.*, COALESCE(r.name, '') AS repository_name
            FROM lsif_indexes i
            LEFT JOIN repositories r ON r.id = i.repository_id
            WHERE i.id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_index).transpose()
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Derived data
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    async fn update_packages(&self, upload_id: UploadId, packages: &[Moniker]) -> Result<()> {
        let mut tx = self.begin().await?;
        replace_monikers(&mut tx, "lsif_packages", upload_id, packages).await?;
        commit(tx).await
    }

    async fn update_package_references(
        &self,
        upload_id: UploadId,
        references: &[Moniker],
    ) -> Result<()> {
        let mut tx = self.begin().await?;
        replace_monikers(&mut tx, "lsif_references", upload_id, references).await?;
        commit(tx).await
    }

    async fn update_commit_dates(
        &self,
        repository_id: RepositoryId,
        dates: &[(String, DateTime<Utc>)],
    ) -> Result<()> {
        let commits: Vec<String> = dates.iter().map(|(c, _)| c.clone()).collect();
        let times: Vec<DateTime<Utc>> = dates.iter().map(|(_, t)| *t).collect();
        sqlx::query(
            r#"
            INSERT INTO commit_dates (repository_id, commit, committed_at)
            SELECT $1, * FROM unnest($2::text[], $3::timestamptz[])
            ON CONFLICT (repository_id, commit) DO UPDATE
            SET committed_at = EXCLUDED.committed_at
            "#,
        )
        .bind(repository_id)
        .bind(commits)
        .bind(times)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_visible_at_tip(
        &self,
        repository_id: RepositoryId,
        upload_ids: &[UploadId],
    ) -> Result<()> {
        let mut tx = self.begin().await?;
        replace_upload_set(&mut tx, "uploads_visible_at_tip", repository_id, None, upload_ids)
            .await?;
        commit(tx).await
    }

    async fn set_nearest_uploads(
        &self,
        repository_id: RepositoryId,
        commit_sha: &str,
        upload_ids: &[UploadId],
    ) -> Result<()> {
        let mut tx = self.begin().await?;
        replace_upload_set(
            &mut tx,
            "nearest_uploads",
            repository_id,
            Some(commit_sha),
            upload_ids,
        )
        .await?;
        commit(tx).await
    }

    async fn dirty_repositories(&self) -> Result<Vec<DirtyRepository>> {
        let rows = sqlx::query(
            r#"
            SELECT d.repository_id, r.name, d.dirty_token
            FROM dirty_repositories d
            JOIN repositories r ON r.id = d.repository_id
            WHERE d.dirty_token > d.update_token AND r.deleted_at IS NULL
            ORDER BY d.repository_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<DirtyRepository> {
                Ok(DirtyRepository {
                    repository_id: row.try_get("repository_id")?,
                    repository_name: row.try_get("name")?,
                    dirty_token: row.try_get("dirty_token")?,
                })
            })
            .collect()
    }

    async fn mark_repository_clean(
        &self,
        repository_id: RepositoryId,
        dirty_token: i64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dirty_repositories (repository_id, update_token, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (repository_id) DO UPDATE SET
                update_token = GREATEST(dirty_repositories.update_token, EXCLUDED.update_token),
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(repository_id)
        .bind(dirty_token)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Lookup
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    async fn get_upload_by_id(
        &self,
        id: UploadId,
        authz: &dyn RepositoryAuthorizer,
    ) -> Result<Option<Upload>> {
        let uploads = self.get_uploads_by_ids(&[id], authz).await?;
        Ok(uploads.into_iter().next())
    }

    async fn get_uploads_by_ids(
        &self,
        ids: &[UploadId],
        authz: &dyn RepositoryAuthorizer,
    ) -> Result<Vec<Upload>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb = Builder::new("SELECT ");
        qb.push(UPLOAD_COLUMNS)
            .push(UPLOAD_FROM)
            .push(" AND u.id = ANY(")
            .push_bind(ids.to_vec())
            .push(") AND u.state != 'deleted' AND r.deleted_at IS NULL ORDER BY u.id");
        let rows = qb.build().fetch_all(&self.pool).await?;
        let uploads = rows.iter().map(row_to_upload).collect::<Result<Vec<_>>>()?;

        let allowed = authorize_repositories(authz, uploads.iter().map(|u| u.repository_id)).await?;
        Ok(uploads
            .into_iter()
            .filter(|u| allowed.contains(&u.repository_id))
            .collect())
    }

    async fn list_uploads(
        &self,
        opts: &ListUploadsOptions,
        authz: &dyn RepositoryAuthorizer,
    ) -> Result<UploadPage> {
        let mut qb = Builder::new("SELECT DISTINCT u.repository_id");
        qb.push(UPLOAD_FROM);
        push_list_conditions(&mut qb, opts);
        let candidates = self.candidate_repositories(qb).await?;
        let allowed: Vec<RepositoryId> = authorize_repositories(authz, candidates)
            .await?
            .into_iter()
            .collect();
        if allowed.is_empty() {
            return Ok(UploadPage::default());
        }

        let mut count = Builder::new("SELECT COUNT(*)");
        count.push(UPLOAD_FROM);
        push_list_conditions(&mut count, opts);
        push_allowed(&mut count, &allowed);
        let total_count: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut qb = Builder::new("SELECT ");
        qb.push(UPLOAD_COLUMNS).push(UPLOAD_FROM);
        push_list_conditions(&mut qb, opts);
        push_allowed(&mut qb, &allowed);
        if opts.oldest_first {
            qb.push(" ORDER BY u.uploaded_at, u.id DESC");
        } else {
            qb.push(" ORDER BY u.uploaded_at DESC, u.id");
        }
        if let Some(limit) = opts.limit {
            qb.push(" LIMIT ").push_bind(bind_count(limit));
        }
        qb.push(" OFFSET ").push_bind(bind_count(opts.offset));

        let rows = qb.build().fetch_all(&self.pool).await?;
        Ok(UploadPage {
            uploads: rows.iter().map(row_to_upload).collect::<Result<Vec<_>>>()?,
            total_count: count_to_usize("total_count", total_count)?,
        })
    }

    async fn audit_logs_for_upload(
        &self,
        id: UploadId,
        authz: &dyn RepositoryAuthorizer,
    ) -> Result<Vec<UploadAuditLog>> {
        let rows = sqlx::query(
            r#"
            SELECT l.log_timestamp, l.record_deleted_at, l.upload_id, l.commit, l.root,
                   l.repository_id, l.uploaded_at, l.indexer, l.indexer_version, l.upload_size,
                   l.associated_index_id, l.transition_columns::text AS transition_columns,
                   l.reason, l.operation
            FROM lsif_uploads_audit_logs l
            JOIN repositories r ON r.id = l.repository_id
            WHERE l.upload_id = $1
            ORDER BY l.sequence
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        let logs = rows.iter().map(row_to_audit_log).collect::<Result<Vec<_>>>()?;

        let allowed = authorize_repositories(authz, logs.iter().map(|l| l.repository_id)).await?;
        Ok(logs
            .into_iter()
            .filter(|l| allowed.contains(&l.repository_id))
            .collect())
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Deletion and reindexing
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    async fn delete_uploads(
        &self,
        opts: &BulkUploadOptions,
        authz: &dyn RepositoryAuthorizer,
    ) -> Result<Vec<RepositoryId>> {
        let mut qb = Builder::new("SELECT DISTINCT u.repository_id");
        qb.push(UPLOAD_FROM);
        push_bulk_conditions(&mut qb, opts);
        let candidates = self.candidate_repositories(qb).await?;
        let allowed: Vec<RepositoryId> = authorize_repositories(authz, candidates)
            .await?
            .into_iter()
            .collect();
        if allowed.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.begin().await?;
        set_audit_reason(&mut tx, AuditReason::DeleteByFilter).await?;
        let mut qb = Builder::new("WITH candidates AS (SELECT u.id");
        qb.push(UPLOAD_FROM);
        push_bulk_conditions(&mut qb, opts);
        push_allowed(&mut qb, &allowed);
        qb.push(" ORDER BY u.id FOR UPDATE OF u SKIP LOCKED) UPDATE lsif_uploads u SET state = ")
            .push(DELETE_TARGET_STATE)
            .push(" FROM candidates c WHERE u.id = c.id RETURNING u.repository_id");
        let mut repositories: Vec<i64> = qb.build_query_scalar().fetch_all(&mut *tx).await?;
        repositories.sort_unstable();
        repositories.dedup();

        mark_dirty(&mut tx, &repositories).await?;
        commit(tx).await?;
        info!(repositories = repositories.len(), "deleted uploads by filter");
        Ok(repositories)
    }

    async fn delete_upload_by_id(&self, id: UploadId) -> Result<bool> {
        let mut tx = self.begin().await?;
        set_audit_reason(&mut tx, AuditReason::DeleteById).await?;
        let mut qb = Builder::new("UPDATE lsif_uploads u SET state = ");
        qb.push(DELETE_TARGET_STATE)
            .push(" WHERE u.id = ")
            .push_bind(id)
            .push(" AND u.state NOT IN ('deleting', 'deleted') RETURNING u.repository_id");
        let repository: Option<i64> = qb.build_query_scalar().fetch_optional(&mut *tx).await?;

        let Some(repository_id) = repository else {
            return Ok(false);
        };
        mark_dirty(&mut tx, &[repository_id]).await?;
        commit(tx).await?;
        Ok(true)
    }

    async fn reindex_uploads(
        &self,
        opts: &BulkUploadOptions,
        authz: &dyn RepositoryAuthorizer,
    ) -> Result<usize> {
        let mut qb = Builder::new("SELECT DISTINCT u.repository_id");
        qb.push(UPLOAD_FROM);
        push_bulk_conditions(&mut qb, opts);
        let candidates = self.candidate_repositories(qb).await?;
        let allowed: Vec<RepositoryId> = authorize_repositories(authz, candidates)
            .await?
            .into_iter()
            .collect();
        if allowed.is_empty() {
            return Ok(0);
        }

        let mut tx = self.begin().await?;
        set_audit_reason(&mut tx, AuditReason::ReindexByFilter).await?;
        let mut qb = Builder::new("WITH candidates AS (SELECT u.id, u.associated_index_id");
        qb.push(UPLOAD_FROM);
        push_bulk_conditions(&mut qb, opts);
        push_allowed(&mut qb, &allowed);
        qb.push(
            " ORDER BY u.id FOR UPDATE OF u SKIP LOCKED), \
             flagged_indexes AS (\
                 UPDATE lsif_indexes i SET should_reindex = TRUE \
                 FROM candidates c WHERE i.id = c.associated_index_id RETURNING i.id) \
             UPDATE lsif_uploads u SET should_reindex = TRUE \
             FROM candidates c WHERE u.id = c.id",
        );
        let result = qb.build().execute(&mut *tx).await?;
        commit(tx).await?;
        let flagged = result.rows_affected();
        usize::try_from(flagged).map_err(|_| out_of_range("rows_affected", flagged))
    }

    async fn reindex_upload_by_id(&self, id: UploadId) -> Result<()> {
        let mut tx = self.begin().await?;
        let associated: Option<Option<i64>> = sqlx::query_scalar(
            r#"
            SELECT associated_index_id FROM lsif_uploads
            WHERE id = $1 AND state NOT IN ('deleting', 'deleted')
            FOR UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        let index_id = associated.ok_or_else(|| StorageError::upload_not_found(id))?;

        if let Some(index_id) = index_id {
            let flagged = sqlx::query("UPDATE lsif_indexes SET should_reindex = TRUE WHERE id = $1")
                .bind(index_id)
                .execute(&mut *tx)
                .await?;
            if flagged.rows_affected() == 0 {
                return Err(StorageError::new(
                    ErrorKind::IllegalStateTransition,
                    format!(
                        "Cannot reindex upload {}: associated index {} does not exist",
                        id, index_id
                    ),
                ));
            }
        }

        sqlx::query("UPDATE lsif_uploads SET should_reindex = TRUE WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        commit(tx).await
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Staleness
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    async fn stale_sourced_commits(
        &self,
        min_time_since_last_check: chrono::Duration,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<SourcedCommits>> {
        let rows = sqlx::query(
            r#"
            WITH candidates AS (
                SELECT repository_id, commit, commit_last_checked_at AS last_checked
                FROM lsif_uploads
                WHERE state NOT IN ('deleting', 'deleted')
                  AND ($1 - commit_last_checked_at > $2 * INTERVAL '1 second') IS DISTINCT FROM FALSE
                UNION ALL
                SELECT repository_id, commit, commit_last_checked_at AS last_checked
                FROM lsif_indexes
                WHERE state NOT IN ('deleting', 'deleted')
                  AND ($1 - commit_last_checked_at > $2 * INTERVAL '1 second') IS DISTINCT FROM FALSE
            ),
            grouped AS (
                SELECT repository_id, commit, MAX(last_checked) AS max_last_checked
                FROM candidates
                GROUP BY repository_id, commit
            )
            SELECT g.repository_id, r.name AS repository_name, g.commit
            FROM grouped g
            JOIN repositories r ON r.id = g.repository_id
            ORDER BY MIN(g.max_last_checked) OVER (PARTITION BY g.repository_id) ASC NULLS LAST,
                     g.repository_id, g.commit
            LIMIT $3
            "#,
        )
        .bind(now)
        .bind(min_time_since_last_check.num_seconds() as f64)
        .bind(bind_count(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut out: Vec<SourcedCommits> = Vec::new();
        for row in &rows {
            let repository_id: i64 = row.try_get("repository_id")?;
            let commit_sha: String = row.try_get("commit")?;
            match out.last_mut() {
                Some(last) if last.repository_id == repository_id => last.commits.push(commit_sha),
                _ => out.push(SourcedCommits {
                    repository_id,
                    repository_name: row.try_get("repository_name")?,
                    commits: vec![commit_sha],
                }),
            }
        }
        for sourced in &mut out {
            sourced.commits.sort();
        }
        Ok(out)
    }

    async fn refresh_commit_resolvability(
        &self,
        repository_id: RepositoryId,
        commit_sha: &str,
        delete: bool,
        now: DateTime<Utc>,
    ) -> Result<CommitRefresh> {
        let mut tx = self.begin().await?;

        let upload_state = if delete { DELETE_TARGET_STATE } else { "u.state" };
        let uploads = sqlx::query(&format!(
            r#"
            WITH candidates AS (
                SELECT id FROM lsif_uploads
                WHERE repository_id = $1 AND commit = $2
                  AND state NOT IN ('deleting', 'deleted')
                ORDER BY id
                FOR UPDATE SKIP LOCKED
            )
            UPDATE lsif_uploads u
            SET state = {},
                commit_last_checked_at = GREATEST(COALESCE(u.commit_last_checked_at, $3), $3)
            FROM candidates c
            WHERE u.id = c.id
            "#,
            upload_state
        ))
        .bind(repository_id)
        .bind(commit_sha)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected() as usize;

        let indexes = if delete {
            sqlx::query(
                r#"
                DELETE FROM lsif_indexes
                WHERE id IN (
                    SELECT id FROM lsif_indexes
                    WHERE repository_id = $1 AND commit = $2
                      AND state NOT IN ('deleting', 'deleted')
                    ORDER BY id
                    FOR UPDATE SKIP LOCKED
                )
                "#,
            )
            .bind(repository_id)
            .bind(commit_sha)
            .execute(&mut *tx)
            .await?
        } else {
            sqlx::query(
                r#"
                WITH candidates AS (
                    SELECT id FROM lsif_indexes
                    WHERE repository_id = $1 AND commit = $2
                      AND state NOT IN ('deleting', 'deleted')
                    ORDER BY id
                    FOR UPDATE SKIP LOCKED
                )
                UPDATE lsif_indexes i
                SET commit_last_checked_at = GREATEST(COALESCE(i.commit_last_checked_at, $3), $3)
                FROM candidates c
                WHERE i.id = c.id
                "#,
            )
            .bind(repository_id)
            .bind(commit_sha)
            .bind(now)
            .execute(&mut *tx)
            .await?
        }
        .rows_affected() as usize;

        if delete && uploads > 0 {
            mark_dirty(&mut tx, &[repository_id]).await?;
        }
        commit(tx).await?;
        Ok(CommitRefresh { uploads, indexes })
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Package identity
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    async fn dumps_with_definitions(
        &self,
        monikers: &[Moniker],
        limit: usize,
        authz: &dyn RepositoryAuthorizer,
    ) -> Result<Vec<Upload>> {
        if monikers.is_empty() {
            return Ok(Vec::new());
        }
        let columns = MonikerColumns::new(monikers);

        let mut qb = Builder::new(
            "SELECT DISTINCT pu.repository_id FROM lsif_packages p \
             JOIN lsif_uploads pu ON pu.id = p.dump_id \
             JOIN repositories pr ON pr.id = pu.repository_id \
             WHERE pu.state = 'completed' AND pr.deleted_at IS NULL",
        );
        columns.push_match(&mut qb, "p");
        let candidates = self.candidate_repositories(qb).await?;
        let allowed: Vec<RepositoryId> = authorize_repositories(authz, candidates)
            .await?
            .into_iter()
            .collect();
        if allowed.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb = Builder::new("WITH ranked AS (");
        qb.push(RANKED_PROVIDERS)
            .push(" WHERE pr.deleted_at IS NULL");
        columns.push_match(&mut qb, "p");
        qb.push(" AND pu.repository_id = ANY(")
            .push_bind(allowed)
            .push(")) SELECT ")
            .push(UPLOAD_COLUMNS)
            .push(UPLOAD_FROM)
            .push(" AND u.id IN (SELECT dump_id FROM ranked WHERE rank = 1) ORDER BY u.id LIMIT ")
            .push_bind(bind_count(limit));

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_upload).collect()
    }

    async fn visible_references(
        &self,
        repository_id: RepositoryId,
        commit_sha: &str,
        monikers: &[Moniker],
        limit: Option<usize>,
        offset: usize,
        authz: &dyn RepositoryAuthorizer,
    ) -> Result<ReferenceScan> {
        let empty = || ReferenceScan {
            scanner: Box::new(SliceScanner::empty()),
            total_count: 0,
        };
        if monikers.is_empty() {
            return Ok(empty());
        }

        let mut query = ReferenceQuery {
            repository_id,
            commit: commit_sha.to_string(),
            monikers: MonikerColumns::new(monikers),
            allowed: None,
        };
        let candidates = self
            .candidate_repositories(query.build("DISTINCT u.repository_id"))
            .await?;
        let allowed: Vec<RepositoryId> = authorize_repositories(authz, candidates)
            .await?
            .into_iter()
            .collect();
        if allowed.is_empty() {
            return Ok(empty());
        }
        query.allowed = Some(allowed);

        let total_count: i64 = query
            .build("COUNT(DISTINCT ref.dump_id)")
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await?;

        let scanner =
            PgReferenceScanner::open(&self.pool, query, limit, offset, self.scan_batch_size)
                .await?;
        Ok(ReferenceScan {
            scanner: Box::new(scanner),
            total_count: count_to_usize("total_count", total_count)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_range_counters_are_rejected() {
        let err = to_i32("num_failures", u32::MAX).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Serialization);
        assert!(err.message.contains("num_failures"));
        assert_eq!(to_i32("num_parts", 7).unwrap(), 7);

        let err = count_to_usize("total_count", -1).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Serialization);
        assert_eq!(count_to_usize("total_count", 42).unwrap(), 42);
    }

    #[test]
    fn test_bind_count_saturates() {
        assert_eq!(bind_count(10), 10);
        assert_eq!(bind_count(usize::MAX), i64::MAX);
    }
}
