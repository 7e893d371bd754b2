//! Port traits (hexagonal boundaries)
//!
//! `UploadStore` is implemented by the PostgreSQL adapter and by the
//! in-memory store. `RepositoryAuthorizer`, `CommitResolver` (janitor) and
//! the reference scanners are the seams to external collaborators.

use std::collections::{BTreeSet, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::filters::{BulkUploadOptions, ListUploadsOptions};
use crate::domain::models::{
    ArtifactState, CommitRefresh, DirtyRepository, Index, IndexId, Moniker, NewIndex, NewUpload,
    PackageReference, Repository, RepositoryId, RequeueReport, SourcedCommits, Upload,
    UploadAuditLog, UploadId, UploadPage,
};
use crate::error::Result;

// ═══════════════════════════════════════════════════════════════════════════
// Repository visibility
// ═══════════════════════════════════════════════════════════════════════════

/// Opaque per-caller repository visibility predicate
///
/// Stores hand over the repositories a query could touch and keep only the
/// rows of the repositories returned.
#[async_trait]
pub trait RepositoryAuthorizer: Send + Sync {
    async fn authorized(&self, candidates: &[RepositoryId]) -> Result<HashSet<RepositoryId>>;
}

/// Authorizer for internal callers that may see every repository
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl RepositoryAuthorizer for AllowAll {
    async fn authorized(&self, candidates: &[RepositoryId]) -> Result<HashSet<RepositoryId>> {
        Ok(candidates.iter().copied().collect())
    }
}

/// Authorizer restricted to a fixed repository set
#[derive(Debug, Clone, Default)]
pub struct AllowList(pub HashSet<RepositoryId>);

#[async_trait]
impl RepositoryAuthorizer for AllowList {
    async fn authorized(&self, candidates: &[RepositoryId]) -> Result<HashSet<RepositoryId>> {
        Ok(candidates
            .iter()
            .copied()
            .filter(|id| self.0.contains(id))
            .collect())
    }
}

/// Ask `authz` about the distinct repositories in `candidates`. An empty
/// candidate set short-circuits without consulting the authorizer.
pub async fn authorize_repositories(
    authz: &dyn RepositoryAuthorizer,
    candidates: impl IntoIterator<Item = RepositoryId>,
) -> Result<HashSet<RepositoryId>> {
    let candidates: Vec<RepositoryId> = candidates
        .into_iter()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    if candidates.is_empty() {
        return Ok(HashSet::new());
    }
    authz.authorized(&candidates).await
}

// ═══════════════════════════════════════════════════════════════════════════
// Reference scanning
// ═══════════════════════════════════════════════════════════════════════════

/// Lazy, finite, single-pass stream of package references
///
/// `close` releases the underlying cursor and is idempotent; `next` after
/// `close` yields `None`. Dropping an unclosed scanner must also release
/// its resources.
#[async_trait]
pub trait PackageReferenceScanner: Send {
    async fn next(&mut self) -> Result<Option<PackageReference>>;

    async fn close(&mut self) -> Result<()>;
}

/// Scanner plus the total number of matching uploads for pagination
pub struct ReferenceScan {
    pub scanner: Box<dyn PackageReferenceScanner>,
    pub total_count: usize,
}

// ═══════════════════════════════════════════════════════════════════════════
// Upload store
// ═══════════════════════════════════════════════════════════════════════════

/// Upload/index lifecycle storage
///
/// Every mutating call runs in one transaction: it applies fully or not at
/// all. Batch claims skip rows locked by concurrent callers instead of
/// waiting on them.
#[async_trait]
pub trait UploadStore: Send + Sync {
    // ── repositories ──────────────────────────────────────────────────────

    async fn upsert_repository(&self, repository: &Repository) -> Result<()>;

    // ── ingestion and processing ──────────────────────────────────────────

    async fn insert_upload(&self, upload: NewUpload, now: DateTime<Utc>) -> Result<UploadId>;

    /// Record an uploaded part. Returns the upload's resulting state.
    async fn add_upload_part(&self, id: UploadId, part: u32) -> Result<ArtifactState>;

    /// Claim the oldest queued upload and move it to `processing`.
    async fn dequeue_upload(&self, now: DateTime<Utc>) -> Result<Option<Upload>>;

    /// `processing → completed`; marks the repository dirty.
    async fn mark_complete(&self, id: UploadId, now: DateTime<Utc>) -> Result<()>;

    /// `processing → errored`; increments the failure count.
    async fn mark_errored(&self, id: UploadId, failure_message: &str, now: DateTime<Utc>)
        -> Result<()>;

    /// Retry errored uploads; uploads at `max_failures` become `failed`.
    async fn requeue_errored(&self, max_failures: u32, now: DateTime<Utc>) -> Result<RequeueReport>;

    /// `deleting → deleted`, dropping package and reference rows. Returns the
    /// reaped ids.
    async fn reap_deleting(&self) -> Result<Vec<UploadId>>;

    async fn insert_index(&self, index: NewIndex, now: DateTime<Utc>) -> Result<IndexId>;

    async fn get_index_by_id(&self, id: IndexId) -> Result<Option<Index>>;

    // ── derived data written by processing / graph collaborators ─────────

    async fn update_packages(&self, upload_id: UploadId, packages: &[Moniker]) -> Result<()>;

    async fn update_package_references(&self, upload_id: UploadId, references: &[Moniker])
        -> Result<()>;

    async fn update_commit_dates(
        &self,
        repository_id: RepositoryId,
        dates: &[(String, DateTime<Utc>)],
    ) -> Result<()>;

    /// Replace the set of uploads visible from the default branch tip
    async fn set_visible_at_tip(&self, repository_id: RepositoryId, upload_ids: &[UploadId])
        -> Result<()>;

    /// Replace the set of uploads visible from `commit`
    async fn set_nearest_uploads(
        &self,
        repository_id: RepositoryId,
        commit: &str,
        upload_ids: &[UploadId],
    ) -> Result<()>;

    async fn dirty_repositories(&self) -> Result<Vec<DirtyRepository>>;

    /// Record that visibility was recomputed up to `dirty_token`, stamping
    /// the repository's commit-graph refresh time.
    async fn mark_repository_clean(
        &self,
        repository_id: RepositoryId,
        dirty_token: i64,
        now: DateTime<Utc>,
    ) -> Result<()>;

    // ── lookup ────────────────────────────────────────────────────────────

    /// Excludes `deleted` uploads and uploads of deleted repositories.
    async fn get_upload_by_id(
        &self,
        id: UploadId,
        authz: &dyn RepositoryAuthorizer,
    ) -> Result<Option<Upload>>;

    async fn get_uploads_by_ids(
        &self,
        ids: &[UploadId],
        authz: &dyn RepositoryAuthorizer,
    ) -> Result<Vec<Upload>>;

    async fn list_uploads(
        &self,
        opts: &ListUploadsOptions,
        authz: &dyn RepositoryAuthorizer,
    ) -> Result<UploadPage>;

    /// Audit trail of one upload, oldest entry first. Entries outlive the
    /// upload itself; an unauthorized repository yields an empty trail.
    async fn audit_logs_for_upload(
        &self,
        id: UploadId,
        authz: &dyn RepositoryAuthorizer,
    ) -> Result<Vec<UploadAuditLog>>;

    // ── deletion and reindexing ───────────────────────────────────────────

    /// Soft-delete matching uploads; returns the affected repositories, each
    /// of which has been marked dirty.
    async fn delete_uploads(
        &self,
        opts: &BulkUploadOptions,
        authz: &dyn RepositoryAuthorizer,
    ) -> Result<Vec<RepositoryId>>;

    /// Returns false if no live upload has this id.
    async fn delete_upload_by_id(&self, id: UploadId) -> Result<bool>;

    /// Flag matching uploads and their associated index jobs for reindexing.
    /// Returns the number of uploads flagged.
    async fn reindex_uploads(
        &self,
        opts: &BulkUploadOptions,
        authz: &dyn RepositoryAuthorizer,
    ) -> Result<usize>;

    /// Fails with `NotFound` for a missing upload and with
    /// `IllegalStateTransition` when the associated index no longer exists.
    async fn reindex_upload_by_id(&self, id: UploadId) -> Result<()>;

    // ── staleness ─────────────────────────────────────────────────────────

    async fn stale_sourced_commits(
        &self,
        min_time_since_last_check: chrono::Duration,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<SourcedCommits>>;

    async fn refresh_commit_resolvability(
        &self,
        repository_id: RepositoryId,
        commit: &str,
        delete: bool,
        now: DateTime<Utc>,
    ) -> Result<CommitRefresh>;

    // ── package identity ──────────────────────────────────────────────────

    /// Canonical completed uploads providing any of `monikers`, ascending by
    /// id and capped at `limit`.
    async fn dumps_with_definitions(
        &self,
        monikers: &[Moniker],
        limit: usize,
        authz: &dyn RepositoryAuthorizer,
    ) -> Result<Vec<Upload>>;

    /// References to `monikers` from uploads visible at `(repository_id,
    /// commit)`, ordered by upload id. `limit = None` streams every row.
    async fn visible_references(
        &self,
        repository_id: RepositoryId,
        commit: &str,
        monikers: &[Moniker],
        limit: Option<usize>,
        offset: usize,
        authz: &dyn RepositoryAuthorizer,
    ) -> Result<ReferenceScan>;
}
