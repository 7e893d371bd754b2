//! Domain models for uploads, indexes and packages

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type UploadId = i64;
pub type IndexId = i64;
pub type RepositoryId = i64;

// ═══════════════════════════════════════════════════════════════════════════
// Artifact State
// ═══════════════════════════════════════════════════════════════════════════

/// Lifecycle state shared by uploads and index jobs
///
/// Persisted as lowercase text (`'completed'`, `'deleting'`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactState {
    /// Multipart upload still receiving parts
    Uploading,
    Queued,
    Processing,
    Completed,
    /// Processing failed; may be retried
    Errored,
    /// Retry budget exhausted
    Failed,
    /// Soft-deleted; derived data not yet reaped
    Deleting,
    Deleted,
}

impl ArtifactState {
    pub const ALL: [ArtifactState; 8] = [
        ArtifactState::Uploading,
        ArtifactState::Queued,
        ArtifactState::Processing,
        ArtifactState::Completed,
        ArtifactState::Errored,
        ArtifactState::Failed,
        ArtifactState::Deleting,
        ArtifactState::Deleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactState::Uploading => "uploading",
            ArtifactState::Queued => "queued",
            ArtifactState::Processing => "processing",
            ArtifactState::Completed => "completed",
            ArtifactState::Errored => "errored",
            ArtifactState::Failed => "failed",
            ArtifactState::Deleting => "deleting",
            ArtifactState::Deleted => "deleted",
        }
    }

    /// `deleting` and `deleted` rows are invisible to lookups and staleness scans
    pub fn is_deleted(&self) -> bool {
        matches!(self, ArtifactState::Deleting | ArtifactState::Deleted)
    }
}

impl fmt::Display for ArtifactState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ArtifactState::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown artifact state: {}", s))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Repositories
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub id: RepositoryId,
    pub name: String,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Repository {
    pub fn new(id: RepositoryId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            deleted_at: None,
        }
    }
}

/// Marker that a repository's commit-graph-derived visibility needs
/// recomputation. `dirty_token` only ever grows; the graph collaborator
/// records the token it processed via `mark_repository_clean`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirtyRepository {
    pub repository_id: RepositoryId,
    pub repository_name: String,
    pub dirty_token: i64,
}

/// Staleness janitor working set for one repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcedCommits {
    pub repository_id: RepositoryId,
    pub repository_name: String,
    /// Sorted ascending
    pub commits: Vec<String>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Uploads
// ═══════════════════════════════════════════════════════════════════════════

/// A stored precise code-intelligence artifact for one `(repository, commit, root)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Upload {
    pub id: UploadId,
    pub repository_id: RepositoryId,
    pub repository_name: String,
    pub commit: String,
    pub root: String,
    pub state: ArtifactState,
    pub indexer: String,
    pub indexer_version: String,
    pub failure_message: Option<String>,
    pub uploaded_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub num_parts: u32,
    pub uploaded_parts: Vec<u32>,
    pub upload_size: Option<i64>,
    pub num_failures: u32,
    pub associated_index_id: Option<IndexId>,
    pub should_reindex: bool,
    pub commit_last_checked_at: Option<DateTime<Utc>>,
    pub expired: bool,
    pub last_retention_scan_at: Option<DateTime<Utc>>,
    /// Computed against the current commit graph when the row is read
    pub visible_at_tip: bool,
    /// 1-based position in the processing queue; `None` unless `queued`
    pub rank: Option<u32>,
}

/// Insert payload for a new upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUpload {
    pub repository_id: RepositoryId,
    pub commit: String,
    pub root: String,
    pub indexer: String,
    pub indexer_version: String,
    /// Multipart uploads start in `uploading`, single-part ones in `queued`
    pub num_parts: u32,
    pub upload_size: Option<i64>,
    pub associated_index_id: Option<IndexId>,
}

impl NewUpload {
    pub fn new(repository_id: RepositoryId, commit: impl Into<String>, indexer: impl Into<String>) -> Self {
        Self {
            repository_id,
            commit: commit.into(),
            root: String::new(),
            indexer: indexer.into(),
            indexer_version: String::new(),
            num_parts: 1,
            upload_size: None,
            associated_index_id: None,
        }
    }

    pub fn with_root(mut self, root: impl Into<String>) -> Self {
        self.root = root.into();
        self
    }

    pub fn with_parts(mut self, num_parts: u32) -> Self {
        self.num_parts = num_parts;
        self
    }

    pub fn with_associated_index(mut self, index_id: IndexId) -> Self {
        self.associated_index_id = Some(index_id);
        self
    }

    pub fn initial_state(&self) -> ArtifactState {
        if self.num_parts > 1 {
            ArtifactState::Uploading
        } else {
            ArtifactState::Queued
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Index jobs
// ═══════════════════════════════════════════════════════════════════════════

/// An auto-indexing job that produces uploads. Indexes are hard-deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    pub id: IndexId,
    pub repository_id: RepositoryId,
    pub repository_name: String,
    pub commit: String,
    pub root: String,
    pub state: ArtifactState,
    pub indexer: String,
    pub failure_message: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub num_failures: u32,
    pub should_reindex: bool,
    pub commit_last_checked_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewIndex {
    pub repository_id: RepositoryId,
    pub commit: String,
    pub root: String,
    pub indexer: String,
}

impl NewIndex {
    pub fn new(repository_id: RepositoryId, commit: impl Into<String>, indexer: impl Into<String>) -> Self {
        Self {
            repository_id,
            commit: commit.into(),
            root: String::new(),
            indexer: indexer.into(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Packages and monikers
// ═══════════════════════════════════════════════════════════════════════════

/// A `(scheme, manager, name, version)` package identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Moniker {
    pub scheme: String,
    pub manager: String,
    pub name: String,
    pub version: String,
}

impl Moniker {
    pub fn new(
        scheme: impl Into<String>,
        manager: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            scheme: scheme.into(),
            manager: manager.into(),
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for Moniker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}@{}", self.scheme, self.manager, self.name, self.version)
    }
}

/// A package declared (provided) by an upload
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Package {
    pub dump_id: UploadId,
    pub moniker: Moniker,
}

/// A package consumed by an upload
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackageReference {
    pub dump_id: UploadId,
    pub moniker: Moniker,
}

// ═══════════════════════════════════════════════════════════════════════════
// Audit trail
// ═══════════════════════════════════════════════════════════════════════════

/// Why a bulk or by-ID operation touched an upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuditReason {
    DeleteByFilter,
    DeleteById,
    ReindexByFilter,
}

impl AuditReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditReason::DeleteByFilter => "direct delete by filter criteria request",
            AuditReason::DeleteById => "direct delete by ID request",
            AuditReason::ReindexByFilter => "direct reindex by filter criteria request",
        }
    }
}

impl fmt::Display for AuditReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOperation {
    /// The upload row was inserted
    Create,
    /// One or more tracked columns changed
    Modify,
}

impl AuditOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOperation::Create => "create",
            AuditOperation::Modify => "modify",
        }
    }
}

impl FromStr for AuditOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(AuditOperation::Create),
            "modify" => Ok(AuditOperation::Modify),
            other => Err(format!("unknown audit operation: {}", other)),
        }
    }
}

/// One tracked column's value before and after a logged change.
/// Values are rendered as text; `old` is `None` on create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionColumn {
    pub column: String,
    pub old: Option<String>,
    pub new: Option<String>,
}

impl TransitionColumn {
    /// Columns whose changes are written to the audit trail, in log order
    pub const TRACKED: [&'static str; 4] = ["state", "expired", "num_failures", "should_reindex"];

    /// Tracked columns that differ between `before` and `after`
    pub fn diff(before: Option<&Upload>, after: &Upload) -> Vec<TransitionColumn> {
        let old = before.map(tracked_values);
        let new = tracked_values(after);
        Self::TRACKED
            .iter()
            .enumerate()
            .filter_map(|(i, column)| {
                let old = old.as_ref().map(|values| values[i].clone());
                let new = new[i].clone();
                (old.as_ref() != Some(&new)).then(|| TransitionColumn {
                    column: column.to_string(),
                    old,
                    new: Some(new),
                })
            })
            .collect()
    }
}

fn tracked_values(upload: &Upload) -> [String; 4] {
    [
        upload.state.as_str().to_string(),
        upload.expired.to_string(),
        upload.num_failures.to_string(),
        upload.should_reindex.to_string(),
    ]
}

/// One entry of an upload's audit trail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadAuditLog {
    pub log_timestamp: DateTime<Utc>,
    /// Set on every entry of the upload once it reaches `deleted`
    pub record_deleted_at: Option<DateTime<Utc>>,
    pub upload_id: UploadId,
    pub commit: String,
    pub root: String,
    pub repository_id: RepositoryId,
    pub uploaded_at: DateTime<Utc>,
    pub indexer: String,
    pub indexer_version: String,
    pub upload_size: Option<i64>,
    pub associated_index_id: Option<IndexId>,
    pub transition_columns: Vec<TransitionColumn>,
    pub reason: Option<String>,
    pub operation: AuditOperation,
}

// ═══════════════════════════════════════════════════════════════════════════
// Operation results
// ═══════════════════════════════════════════════════════════════════════════

/// Rows touched by one `refresh_commit_resolvability` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitRefresh {
    pub uploads: usize,
    pub indexes: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequeueReport {
    pub requeued: usize,
    pub failed: usize,
}

/// One page of uploads plus the total number of matches
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadPage {
    pub uploads: Vec<Upload>,
    pub total_count: usize,
}
