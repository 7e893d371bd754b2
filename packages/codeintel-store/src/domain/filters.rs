//! Upload filter options
//!
//! The option structs are backend-neutral. The in-memory store evaluates
//! them with the matching helpers below; the PostgreSQL store renders the
//! same semantics into SQL conditions.

use chrono::{DateTime, Utc};

use crate::domain::models::{ArtifactState, RepositoryId, Upload, UploadId};

/// Filter for `list_uploads`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListUploadsOptions {
    pub repository_id: Option<RepositoryId>,
    /// Matched case-insensitively against commit, root, state, failure
    /// message, repository name, indexer and indexer version
    pub term: Option<String>,
    pub states: Vec<ArtifactState>,
    /// Keep `errored` and `failed` apart instead of treating them as one bucket
    pub exact_states: bool,
    pub visible_at_tip: bool,
    /// Uploads canonically providing packages referenced by this upload
    pub dependency_of: Option<UploadId>,
    /// Uploads referencing packages this upload canonically provides
    pub dependent_of: Option<UploadId>,
    /// Substring matches, OR'd together
    pub indexer_names: Vec<String>,
    pub uploaded_before: Option<DateTime<Utc>>,
    pub uploaded_after: Option<DateTime<Utc>>,
    /// Only uploads never scanned or scanned before this instant
    pub last_retention_scan_before: Option<DateTime<Utc>>,
    /// Only uploads that finished before their repository's commit graph was last refreshed
    pub in_commit_graph: bool,
    pub allow_expired: bool,
    pub allow_deleted_repo: bool,
    pub allow_deleted_upload: bool,
    pub oldest_first: bool,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl ListUploadsOptions {
    pub fn for_repository(repository_id: RepositoryId) -> Self {
        Self {
            repository_id: Some(repository_id),
            ..Default::default()
        }
    }
}

/// Filter shared by `delete_uploads` and `reindex_uploads`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkUploadOptions {
    pub repository_id: Option<RepositoryId>,
    pub states: Vec<ArtifactState>,
    pub exact_states: bool,
    pub term: Option<String>,
    pub visible_at_tip: bool,
    pub indexer_names: Vec<String>,
}

/// Expand a state filter, folding `errored`/`failed` together unless `exact`.
/// The result is sorted and deduplicated.
pub fn effective_states(states: &[ArtifactState], exact: bool) -> Vec<ArtifactState> {
    let mut out: Vec<ArtifactState> = Vec::with_capacity(states.len() + 1);
    for state in states {
        match state {
            ArtifactState::Errored | ArtifactState::Failed if !exact => {
                out.push(ArtifactState::Errored);
                out.push(ArtifactState::Failed);
            }
            other => out.push(*other),
        }
    }
    out.sort();
    out.dedup();
    out
}

pub fn term_matches(term: &str, upload: &Upload) -> bool {
    let needle = term.to_lowercase();
    let fields = [
        upload.commit.as_str(),
        upload.root.as_str(),
        upload.state.as_str(),
        upload.failure_message.as_deref().unwrap_or(""),
        upload.repository_name.as_str(),
        upload.indexer.as_str(),
        upload.indexer_version.as_str(),
    ];
    fields.iter().any(|f| f.to_lowercase().contains(&needle))
}

pub fn indexer_matches(names: &[String], indexer: &str) -> bool {
    if names.is_empty() {
        return true;
    }
    let indexer = indexer.to_lowercase();
    names.iter().any(|n| indexer.contains(&n.to_lowercase()))
}

/// Translate a user term into an `ILIKE` pattern, escaping wildcards.
pub fn like_pattern(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len() + 2);
    escaped.push('%');
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}
