//! In-memory upload store
//!
//! A single `RwLock` guards all tables, so every operation is trivially
//! atomic and there is never lock contention to skip. Used by tests and by
//! embedders that do not need durability.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::debug;

use crate::domain::filters::{
    effective_states, indexer_matches, term_matches, BulkUploadOptions, ListUploadsOptions,
};
use crate::domain::models::{
    ArtifactState, AuditOperation, AuditReason, CommitRefresh, DirtyRepository, Index, IndexId,
    Moniker, NewIndex, NewUpload, Package, PackageReference, Repository, RepositoryId,
    RequeueReport, SourcedCommits, TransitionColumn, Upload, UploadAuditLog, UploadId, UploadPage,
};
use crate::domain::ports::{
    authorize_repositories as authorize, ReferenceScan, RepositoryAuthorizer, UploadStore,
};
use crate::domain::ranking::{canonical_providers, ProviderCandidate};
use crate::domain::state::UploadStateMachine;
use crate::error::{ErrorKind, Result, StorageError};
use crate::scanner::SliceScanner;

#[derive(Debug, Clone, Default)]
struct DirtyMarker {
    dirty_token: i64,
    update_token: i64,
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    repositories: BTreeMap<RepositoryId, Repository>,
    uploads: BTreeMap<UploadId, Upload>,
    indexes: BTreeMap<IndexId, Index>,
    packages: Vec<Package>,
    references: Vec<PackageReference>,
    commit_dates: HashMap<(RepositoryId, String), DateTime<Utc>>,
    visible_at_tip: HashMap<RepositoryId, BTreeSet<UploadId>>,
    nearest_uploads: HashMap<(RepositoryId, String), BTreeSet<UploadId>>,
    dirty: BTreeMap<RepositoryId, DirtyMarker>,
    /// Append-only; never pruned with the upload
    audit_logs: Vec<UploadAuditLog>,
    next_upload_id: UploadId,
    next_index_id: IndexId,
}

impl MemoryState {
    fn live_repository(&self, id: RepositoryId) -> Option<&Repository> {
        self.repositories.get(&id).filter(|r| r.deleted_at.is_none())
    }

    fn is_visible_at_tip(&self, upload: &Upload) -> bool {
        self.visible_at_tip
            .get(&upload.repository_id)
            .is_some_and(|ids| ids.contains(&upload.id))
    }

    /// Fill in the fields that are joined or derived at read time
    fn hydrate(&self, upload: &Upload) -> Upload {
        let mut out = upload.clone();
        out.repository_name = self
            .repositories
            .get(&upload.repository_id)
            .map(|r| r.name.clone())
            .unwrap_or_default();
        out.visible_at_tip = self.is_visible_at_tip(upload);
        out.rank = self.queue_rank(upload);
        out
    }

    fn queue_rank(&self, upload: &Upload) -> Option<u32> {
        if upload.state != ArtifactState::Queued {
            return None;
        }
        let key = (upload.uploaded_at, upload.id);
        let ahead = self
            .uploads
            .values()
            .filter(|u| u.state == ArtifactState::Queued && (u.uploaded_at, u.id) < key)
            .count();
        u32::try_from(ahead + 1).ok()
    }

    fn record_audit(
        &mut self,
        before: Option<&Upload>,
        after: &Upload,
        reason: Option<AuditReason>,
    ) {
        let transition_columns = TransitionColumn::diff(before, after);
        if before.is_some() && transition_columns.is_empty() {
            return;
        }
        let now = Utc::now();
        let deleted = after.state == ArtifactState::Deleted;
        if deleted {
            for log in self.audit_logs.iter_mut().filter(|l| l.upload_id == after.id) {
                log.record_deleted_at.get_or_insert(now);
            }
        }
        self.audit_logs.push(UploadAuditLog {
            log_timestamp: now,
            record_deleted_at: deleted.then_some(now),
            upload_id: after.id,
            commit: after.commit.clone(),
            root: after.root.clone(),
            repository_id: after.repository_id,
            uploaded_at: after.uploaded_at,
            indexer: after.indexer.clone(),
            indexer_version: after.indexer_version.clone(),
            upload_size: after.upload_size,
            associated_index_id: after.associated_index_id,
            transition_columns,
            reason: reason.map(|r| r.as_str().to_string()),
            operation: if before.is_some() {
                AuditOperation::Modify
            } else {
                AuditOperation::Create
            },
        });
    }

    /// Apply `f` to a live upload and log the tracked columns it changed
    fn audited<T>(
        &mut self,
        id: UploadId,
        reason: Option<AuditReason>,
        f: impl FnOnce(&mut Upload) -> Result<T>,
    ) -> Result<T> {
        let upload = self.upload_mut(id)?;
        let before = upload.clone();
        let out = f(upload)?;
        let after = upload.clone();
        self.record_audit(Some(&before), &after, reason);
        Ok(out)
    }

    fn mark_dirty(&mut self, repository_id: RepositoryId) {
        self.dirty.entry(repository_id).or_default().dirty_token += 1;
    }

    fn upload_mut(&mut self, id: UploadId) -> Result<&mut Upload> {
        self.uploads
            .get_mut(&id)
            .filter(|u| u.state != ArtifactState::Deleted)
            .ok_or_else(|| StorageError::upload_not_found(id))
    }

    fn committed_at(&self, upload: &Upload) -> Option<DateTime<Utc>> {
        self.commit_dates
            .get(&(upload.repository_id, upload.commit.clone()))
            .copied()
    }

    fn provider_candidates(&self, monikers: &HashSet<&Moniker>) -> Vec<ProviderCandidate> {
        self.packages
            .iter()
            .filter(|p| monikers.contains(&p.moniker))
            .filter_map(|p| {
                let upload = self.uploads.get(&p.dump_id)?;
                if upload.state != ArtifactState::Completed {
                    return None;
                }
                Some(ProviderCandidate {
                    upload_id: upload.id,
                    root: upload.root.clone(),
                    moniker: p.moniker.clone(),
                    committed_at: self.committed_at(upload),
                })
            })
            .collect()
    }

    /// Uploads canonically providing packages referenced by `upload_id`
    fn dependencies_of(&self, upload_id: UploadId) -> HashSet<UploadId> {
        let referenced: HashSet<&Moniker> = self
            .references
            .iter()
            .filter(|r| r.dump_id == upload_id)
            .map(|r| &r.moniker)
            .collect();
        canonical_providers(&self.provider_candidates(&referenced))
            .into_iter()
            .collect()
    }

    /// Uploads referencing packages `upload_id` canonically provides
    fn dependents_of(&self, upload_id: UploadId) -> HashSet<UploadId> {
        let Some(target) = self.uploads.get(&upload_id) else {
            return HashSet::new();
        };
        let mut out = HashSet::new();
        for package in self.packages.iter().filter(|p| p.dump_id == upload_id) {
            let wanted: HashSet<&Moniker> = [&package.moniker].into_iter().collect();
            let partition: Vec<ProviderCandidate> = self
                .provider_candidates(&wanted)
                .into_iter()
                .filter(|c| c.root == target.root)
                .collect();
            if canonical_providers(&partition) != vec![upload_id] {
                continue;
            }
            out.extend(
                self.references
                    .iter()
                    .filter(|r| r.moniker == package.moniker && r.dump_id != upload_id)
                    .map(|r| r.dump_id),
            );
        }
        out
    }

    fn matches_bulk(&self, upload: &Upload, opts: &BulkUploadOptions) -> bool {
        if opts.repository_id.is_some_and(|id| id != upload.repository_id) {
            return false;
        }
        if self.live_repository(upload.repository_id).is_none() {
            return false;
        }
        if upload.state.is_deleted() {
            return false;
        }
        if !opts.states.is_empty()
            && !effective_states(&opts.states, opts.exact_states).contains(&upload.state)
        {
            return false;
        }
        if let Some(term) = opts.term.as_deref() {
            let hydrated = self.hydrate(upload);
            if !term_matches(term, &hydrated) {
                return false;
            }
        }
        if opts.visible_at_tip && !self.is_visible_at_tip(upload) {
            return false;
        }
        indexer_matches(&opts.indexer_names, &upload.indexer)
    }

    fn matches_list(
        &self,
        upload: &Upload,
        opts: &ListUploadsOptions,
        dependencies: Option<&HashSet<UploadId>>,
        dependents: Option<&HashSet<UploadId>>,
    ) -> bool {
        let Some(repository) = self.repositories.get(&upload.repository_id) else {
            return false;
        };
        if !opts.allow_deleted_repo && repository.deleted_at.is_some() {
            return false;
        }
        if opts.repository_id.is_some_and(|id| id != upload.repository_id) {
            return false;
        }
        if !opts.states.is_empty() {
            if !effective_states(&opts.states, opts.exact_states).contains(&upload.state) {
                return false;
            }
        } else if !opts.allow_deleted_upload && upload.state == ArtifactState::Deleted {
            return false;
        }
        if let Some(term) = opts.term.as_deref() {
            if !term_matches(term, &self.hydrate(upload)) {
                return false;
            }
        }
        if opts.visible_at_tip && !self.is_visible_at_tip(upload) {
            return false;
        }
        if dependencies.is_some_and(|ids| !ids.contains(&upload.id)) {
            return false;
        }
        if dependents.is_some_and(|ids| !ids.contains(&upload.id)) {
            return false;
        }
        if !indexer_matches(&opts.indexer_names, &upload.indexer) {
            return false;
        }
        if opts.uploaded_before.is_some_and(|t| upload.uploaded_at >= t) {
            return false;
        }
        if opts.uploaded_after.is_some_and(|t| upload.uploaded_at <= t) {
            return false;
        }
        if opts.in_commit_graph {
            let graph_updated = self
                .dirty
                .get(&upload.repository_id)
                .and_then(|d| d.updated_at);
            match (upload.finished_at, graph_updated) {
                (Some(finished), Some(updated)) if finished < updated => {}
                _ => return false,
            }
        }
        if let Some(before) = opts.last_retention_scan_before {
            if upload.last_retention_scan_at.is_some_and(|t| t >= before) {
                return false;
            }
        }
        if !opts.allow_expired && upload.expired {
            return false;
        }
        true
    }
}

/// In-memory `UploadStore`
#[derive(Clone, Default)]
pub struct InMemoryUploadStore {
    state: Arc<RwLock<MemoryState>>,
}

impl InMemoryUploadStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UploadStore for InMemoryUploadStore {
    async fn upsert_repository(&self, repository: &Repository) -> Result<()> {
        self.state
            .write()
            .repositories
            .insert(repository.id, repository.clone());
        Ok(())
    }

    async fn insert_upload(&self, upload: NewUpload, now: DateTime<Utc>) -> Result<UploadId> {
        let mut state = self.state.write();
        if !state.repositories.contains_key(&upload.repository_id) {
            return Err(StorageError::repository_not_found(upload.repository_id));
        }
        state.next_upload_id += 1;
        let id = state.next_upload_id;
        let initial_state = upload.initial_state();
        let upload = Upload {
            id,
            repository_id: upload.repository_id,
            repository_name: String::new(),
            commit: upload.commit,
            root: upload.root,
            state: initial_state,
            indexer: upload.indexer,
            indexer_version: upload.indexer_version,
            failure_message: None,
            uploaded_at: now,
            started_at: None,
            finished_at: None,
            num_parts: upload.num_parts.max(1),
            uploaded_parts: if initial_state == ArtifactState::Queued {
                vec![0]
            } else {
                Vec::new()
            },
            upload_size: upload.upload_size,
            num_failures: 0,
            associated_index_id: upload.associated_index_id,
            should_reindex: false,
            commit_last_checked_at: None,
            expired: false,
            last_retention_scan_at: None,
            visible_at_tip: false,
            rank: None,
        };
        state.record_audit(None, &upload, None);
        state.uploads.insert(id, upload);
        debug!(upload_id = id, state = %initial_state, "upload inserted");
        Ok(id)
    }

    async fn add_upload_part(&self, id: UploadId, part: u32) -> Result<ArtifactState> {
        let mut state = self.state.write();
        state.audited(id, None, |upload| {
            UploadStateMachine::new(upload).add_part(part)?;
            Ok(upload.state)
        })
    }

    async fn dequeue_upload(&self, now: DateTime<Utc>) -> Result<Option<Upload>> {
        let mut state = self.state.write();
        let next = state
            .uploads
            .values()
            .filter(|u| u.state == ArtifactState::Queued)
            .min_by_key(|u| (u.uploaded_at, u.id))
            .map(|u| u.id);
        let Some(id) = next else {
            return Ok(None);
        };
        let snapshot = state.audited(id, None, |upload| {
            UploadStateMachine::new(upload).start(now)?;
            Ok(upload.clone())
        })?;
        Ok(Some(state.hydrate(&snapshot)))
    }

    async fn mark_complete(&self, id: UploadId, now: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.write();
        let repository_id = state.audited(id, None, |upload| {
            UploadStateMachine::new(upload).complete(now)?;
            Ok(upload.repository_id)
        })?;
        state.mark_dirty(repository_id);
        Ok(())
    }

    async fn mark_errored(
        &self,
        id: UploadId,
        failure_message: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.write();
        state.audited(id, None, |upload| {
            UploadStateMachine::new(upload).error(failure_message, now)
        })
    }

    async fn requeue_errored(&self, max_failures: u32, _now: DateTime<Utc>) -> Result<RequeueReport> {
        let mut state = self.state.write();
        let mut report = RequeueReport::default();
        let errored: Vec<UploadId> = state
            .uploads
            .values()
            .filter(|u| u.state == ArtifactState::Errored)
            .map(|u| u.id)
            .collect();
        for id in errored {
            match state.audited(id, None, |upload| {
                UploadStateMachine::new(upload).requeue(max_failures)
            })? {
                ArtifactState::Failed => report.failed += 1,
                _ => report.requeued += 1,
            }
        }
        Ok(report)
    }

    async fn reap_deleting(&self) -> Result<Vec<UploadId>> {
        let mut state = self.state.write();
        let reaped: Vec<UploadId> = state
            .uploads
            .values()
            .filter(|u| u.state == ArtifactState::Deleting)
            .map(|u| u.id)
            .collect();
        for id in &reaped {
            state.audited(*id, None, |upload| UploadStateMachine::new(upload).reap())?;
        }
        let gone: HashSet<UploadId> = reaped.iter().copied().collect();
        state.packages.retain(|p| !gone.contains(&p.dump_id));
        state.references.retain(|r| !gone.contains(&r.dump_id));
        Ok(reaped)
    }

    async fn insert_index(&self, index: NewIndex, now: DateTime<Utc>) -> Result<IndexId> {
        let mut state = self.state.write();
        if !state.repositories.contains_key(&index.repository_id) {
            return Err(StorageError::repository_not_found(index.repository_id));
        }
        state.next_index_id += 1;
        let id = state.next_index_id;
        state.indexes.insert(
            id,
            Index {
                id,
                repository_id: index.repository_id,
                repository_name: String::new(),
                commit: index.commit,
                root: index.root,
                state: ArtifactState::Queued,
                indexer: index.indexer,
                failure_message: None,
                queued_at: now,
                started_at: None,
                finished_at: None,
                num_failures: 0,
                should_reindex: false,
                commit_last_checked_at: None,
            },
        );
        Ok(id)
    }

    async fn get_index_by_id(&self, id: IndexId) -> Result<Option<Index>> {
        let state = self.state.read();
        Ok(state.indexes.get(&id).map(|index| {
            let mut out = index.clone();
            out.repository_name = state
                .repositories
                .get(&index.repository_id)
                .map(|r| r.name.clone())
                .unwrap_or_default();
            out
        }))
    }

    async fn update_packages(&self, upload_id: UploadId, packages: &[Moniker]) -> Result<()> {
        let mut state = self.state.write();
        state.upload_mut(upload_id)?;
        state.packages.retain(|p| p.dump_id != upload_id);
        state.packages.extend(packages.iter().map(|m| Package {
            dump_id: upload_id,
            moniker: m.clone(),
        }));
        Ok(())
    }

    async fn update_package_references(
        &self,
        upload_id: UploadId,
        references: &[Moniker],
    ) -> Result<()> {
        let mut state = self.state.write();
        state.upload_mut(upload_id)?;
        state.references.retain(|r| r.dump_id != upload_id);
        state.references.extend(references.iter().map(|m| PackageReference {
            dump_id: upload_id,
            moniker: m.clone(),
        }));
        Ok(())
    }

    async fn update_commit_dates(
        &self,
        repository_id: RepositoryId,
        dates: &[(String, DateTime<Utc>)],
    ) -> Result<()> {
        let mut state = self.state.write();
        for (commit, date) in dates {
            state
                .commit_dates
                .insert((repository_id, commit.clone()), *date);
        }
        Ok(())
    }

    async fn set_visible_at_tip(
        &self,
        repository_id: RepositoryId,
        upload_ids: &[UploadId],
    ) -> Result<()> {
        self.state
            .write()
            .visible_at_tip
            .insert(repository_id, upload_ids.iter().copied().collect());
        Ok(())
    }

    async fn set_nearest_uploads(
        &self,
        repository_id: RepositoryId,
        commit: &str,
        upload_ids: &[UploadId],
    ) -> Result<()> {
        self.state.write().nearest_uploads.insert(
            (repository_id, commit.to_string()),
            upload_ids.iter().copied().collect(),
        );
        Ok(())
    }

    async fn dirty_repositories(&self) -> Result<Vec<DirtyRepository>> {
        let state = self.state.read();
        Ok(state
            .dirty
            .iter()
            .filter(|(_, marker)| marker.dirty_token > marker.update_token)
            .filter_map(|(id, marker)| {
                let repository = state.live_repository(*id)?;
                Some(DirtyRepository {
                    repository_id: *id,
                    repository_name: repository.name.clone(),
                    dirty_token: marker.dirty_token,
                })
            })
            .collect())
    }

    async fn mark_repository_clean(
        &self,
        repository_id: RepositoryId,
        dirty_token: i64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.write();
        let marker = state.dirty.entry(repository_id).or_default();
        marker.update_token = marker.update_token.max(dirty_token);
        marker.updated_at = Some(now);
        Ok(())
    }

    async fn get_upload_by_id(
        &self,
        id: UploadId,
        authz: &dyn RepositoryAuthorizer,
    ) -> Result<Option<Upload>> {
        let found = {
            let state = self.state.read();
            state
                .uploads
                .get(&id)
                .filter(|u| u.state != ArtifactState::Deleted)
                .filter(|u| state.live_repository(u.repository_id).is_some())
                .map(|u| state.hydrate(u))
        };
        let Some(upload) = found else {
            return Ok(None);
        };
        let allowed = authorize(authz, [upload.repository_id]).await?;
        Ok(allowed.contains(&upload.repository_id).then_some(upload))
    }

    async fn get_uploads_by_ids(
        &self,
        ids: &[UploadId],
        authz: &dyn RepositoryAuthorizer,
    ) -> Result<Vec<Upload>> {
        let found: Vec<Upload> = {
            let state = self.state.read();
            ids.iter()
                .collect::<BTreeSet<_>>()
                .into_iter()
                .filter_map(|id| state.uploads.get(id))
                .filter(|u| u.state != ArtifactState::Deleted)
                .filter(|u| state.live_repository(u.repository_id).is_some())
                .map(|u| state.hydrate(u))
                .collect()
        };
        let allowed = authorize(authz, found.iter().map(|u| u.repository_id)).await?;
        Ok(found
            .into_iter()
            .filter(|u| allowed.contains(&u.repository_id))
            .collect())
    }

    async fn list_uploads(
        &self,
        opts: &ListUploadsOptions,
        authz: &dyn RepositoryAuthorizer,
    ) -> Result<UploadPage> {
        let matching: Vec<Upload> = {
            let state = self.state.read();
            let dependencies = opts.dependency_of.map(|id| state.dependencies_of(id));
            let dependents = opts.dependent_of.map(|id| state.dependents_of(id));
            state
                .uploads
                .values()
                .filter(|u| state.matches_list(u, opts, dependencies.as_ref(), dependents.as_ref()))
                .map(|u| state.hydrate(u))
                .collect()
        };

        let allowed = authorize(authz, matching.iter().map(|u| u.repository_id)).await?;
        let mut uploads: Vec<Upload> = matching
            .into_iter()
            .filter(|u| allowed.contains(&u.repository_id))
            .collect();

        if opts.oldest_first {
            uploads.sort_by_key(|u| (u.uploaded_at, Reverse(u.id)));
        } else {
            uploads.sort_by_key(|u| (Reverse(u.uploaded_at), u.id));
        }

        let total_count = uploads.len();
        let page = uploads
            .into_iter()
            .skip(opts.offset)
            .take(opts.limit.unwrap_or(usize::MAX))
            .collect();
        Ok(UploadPage {
            uploads: page,
            total_count,
        })
    }

    async fn audit_logs_for_upload(
        &self,
        id: UploadId,
        authz: &dyn RepositoryAuthorizer,
    ) -> Result<Vec<UploadAuditLog>> {
        let logs: Vec<UploadAuditLog> = {
            let state = self.state.read();
            state
                .audit_logs
                .iter()
                .filter(|l| l.upload_id == id)
                .cloned()
                .collect()
        };
        let allowed = authorize(authz, logs.iter().map(|l| l.repository_id)).await?;
        Ok(logs
            .into_iter()
            .filter(|l| allowed.contains(&l.repository_id))
            .collect())
    }

    async fn delete_uploads(
        &self,
        opts: &BulkUploadOptions,
        authz: &dyn RepositoryAuthorizer,
    ) -> Result<Vec<RepositoryId>> {
        let candidates: BTreeSet<RepositoryId> = {
            let state = self.state.read();
            state
                .uploads
                .values()
                .filter(|u| state.matches_bulk(u, opts))
                .map(|u| u.repository_id)
                .collect()
        };
        let allowed = authorize(authz, candidates).await?;

        let mut state = self.state.write();
        let ids: Vec<UploadId> = state
            .uploads
            .values()
            .filter(|u| allowed.contains(&u.repository_id) && state.matches_bulk(u, opts))
            .map(|u| u.id)
            .collect();

        let mut repositories = BTreeSet::new();
        for id in ids {
            let deleted = state.audited(id, Some(AuditReason::DeleteByFilter), |upload| {
                let deleted = UploadStateMachine::new(upload).delete()?;
                Ok(deleted.then_some(upload.repository_id))
            })?;
            repositories.extend(deleted);
        }
        for repository_id in &repositories {
            state.mark_dirty(*repository_id);
        }
        Ok(repositories.into_iter().collect())
    }

    async fn delete_upload_by_id(&self, id: UploadId) -> Result<bool> {
        let mut state = self.state.write();
        if !state
            .uploads
            .get(&id)
            .is_some_and(|u| u.state != ArtifactState::Deleted)
        {
            return Ok(false);
        }
        let deleted = state.audited(id, Some(AuditReason::DeleteById), |upload| {
            let deleted = UploadStateMachine::new(upload).delete()?;
            Ok(deleted.then_some(upload.repository_id))
        })?;
        let Some(repository_id) = deleted else {
            return Ok(false);
        };
        state.mark_dirty(repository_id);
        Ok(true)
    }

    async fn reindex_uploads(
        &self,
        opts: &BulkUploadOptions,
        authz: &dyn RepositoryAuthorizer,
    ) -> Result<usize> {
        let candidates: BTreeSet<RepositoryId> = {
            let state = self.state.read();
            state
                .uploads
                .values()
                .filter(|u| state.matches_bulk(u, opts))
                .map(|u| u.repository_id)
                .collect()
        };
        let allowed = authorize(authz, candidates).await?;

        let mut state = self.state.write();
        let targets: Vec<(UploadId, Option<IndexId>)> = state
            .uploads
            .values()
            .filter(|u| allowed.contains(&u.repository_id) && state.matches_bulk(u, opts))
            .map(|u| (u.id, u.associated_index_id))
            .collect();

        for (upload_id, index_id) in &targets {
            state.audited(*upload_id, Some(AuditReason::ReindexByFilter), |upload| {
                upload.should_reindex = true;
                Ok(())
            })?;
            let Some(index_id) = index_id else {
                continue;
            };
            if let Some(index) = state.indexes.get_mut(index_id) {
                index.should_reindex = true;
            }
        }
        Ok(targets.len())
    }

    async fn reindex_upload_by_id(&self, id: UploadId) -> Result<()> {
        let mut state = self.state.write();
        let upload = state
            .uploads
            .get(&id)
            .filter(|u| !u.state.is_deleted())
            .ok_or_else(|| StorageError::upload_not_found(id))?;
        let index_id = upload.associated_index_id;

        if let Some(index_id) = index_id {
            let index = state.indexes.get_mut(&index_id).ok_or_else(|| {
                StorageError::new(
                    ErrorKind::IllegalStateTransition,
                    format!(
                        "Cannot reindex upload {}: associated index {} does not exist",
                        id, index_id
                    ),
                )
            })?;
            index.should_reindex = true;
        }
        state.audited(id, None, |upload| {
            upload.should_reindex = true;
            Ok(())
        })
    }

    async fn stale_sourced_commits(
        &self,
        min_time_since_last_check: chrono::Duration,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<SourcedCommits>> {
        let state = self.state.read();
        let is_stale = |checked: Option<DateTime<Utc>>| match checked {
            None => true,
            Some(t) => now - t > min_time_since_last_check,
        };

        // (repository, commit) -> most recent check; None when never checked
        let mut candidates: BTreeMap<(RepositoryId, String), Option<DateTime<Utc>>> =
            BTreeMap::new();
        let rows = state
            .uploads
            .values()
            .map(|u| (u.repository_id, &u.commit, u.state, u.commit_last_checked_at))
            .chain(
                state
                    .indexes
                    .values()
                    .map(|i| (i.repository_id, &i.commit, i.state, i.commit_last_checked_at)),
            );
        for (repository_id, commit, artifact_state, checked) in rows {
            if artifact_state.is_deleted() || !is_stale(checked) {
                continue;
            }
            if !state.repositories.contains_key(&repository_id) {
                continue;
            }
            let entry = candidates
                .entry((repository_id, commit.clone()))
                .or_insert(checked);
            if checked > *entry {
                *entry = checked;
            }
        }

        // Oldest per-repository check first; never-checked sorts last
        let mut repo_oldest: HashMap<RepositoryId, (bool, Option<DateTime<Utc>>)> = HashMap::new();
        for ((repository_id, _), checked) in &candidates {
            let key = (checked.is_none(), *checked);
            repo_oldest
                .entry(*repository_id)
                .and_modify(|current| {
                    if key < *current {
                        *current = key;
                    }
                })
                .or_insert(key);
        }

        let mut ordered: Vec<(RepositoryId, String)> = candidates.into_keys().collect();
        ordered.sort_by(|(ra, ca), (rb, cb)| {
            (repo_oldest.get(ra), ra, ca).cmp(&(repo_oldest.get(rb), rb, cb))
        });
        ordered.truncate(limit);

        let mut out: Vec<SourcedCommits> = Vec::new();
        for (repository_id, commit) in ordered {
            match out.last_mut() {
                Some(last) if last.repository_id == repository_id => last.commits.push(commit),
                _ => out.push(SourcedCommits {
                    repository_id,
                    repository_name: state
                        .repositories
                        .get(&repository_id)
                        .map(|r| r.name.clone())
                        .unwrap_or_default(),
                    commits: vec![commit],
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
        commit: &str,
        delete: bool,
        now: DateTime<Utc>,
    ) -> Result<CommitRefresh> {
        let mut state = self.state.write();
        let mut refresh = CommitRefresh::default();

        let upload_ids: Vec<UploadId> = state
            .uploads
            .values()
            .filter(|u| u.repository_id == repository_id && u.commit == commit)
            .filter(|u| !u.state.is_deleted())
            .map(|u| u.id)
            .collect();
        for id in upload_ids {
            state.audited(id, None, |upload| {
                // Never moves backwards, even for a caller with a lagging clock
                upload.commit_last_checked_at = upload.commit_last_checked_at.max(Some(now));
                if delete {
                    UploadStateMachine::new(upload).delete()?;
                }
                Ok(())
            })?;
            refresh.uploads += 1;
        }

        let index_ids: Vec<IndexId> = state
            .indexes
            .values()
            .filter(|i| i.repository_id == repository_id && i.commit == commit)
            .filter(|i| !i.state.is_deleted())
            .map(|i| i.id)
            .collect();
        for id in index_ids {
            if delete {
                state.indexes.remove(&id);
            } else if let Some(index) = state.indexes.get_mut(&id) {
                index.commit_last_checked_at = index.commit_last_checked_at.max(Some(now));
            }
            refresh.indexes += 1;
        }

        if delete && refresh.uploads > 0 {
            state.mark_dirty(repository_id);
        }
        Ok(refresh)
    }

    async fn dumps_with_definitions(
        &self,
        monikers: &[Moniker],
        limit: usize,
        authz: &dyn RepositoryAuthorizer,
    ) -> Result<Vec<Upload>> {
        if monikers.is_empty() {
            return Ok(Vec::new());
        }
        let wanted: HashSet<&Moniker> = monikers.iter().collect();

        let candidates: Vec<(RepositoryId, ProviderCandidate)> = {
            let state = self.state.read();
            state
                .provider_candidates(&wanted)
                .into_iter()
                .filter_map(|c| {
                    let upload = state.uploads.get(&c.upload_id)?;
                    state.live_repository(upload.repository_id)?;
                    Some((upload.repository_id, c))
                })
                .collect()
        };

        let allowed = authorize(authz, candidates.iter().map(|(r, _)| *r)).await?;
        let visible: Vec<ProviderCandidate> = candidates
            .into_iter()
            .filter(|(r, _)| allowed.contains(r))
            .map(|(_, c)| c)
            .collect();

        let state = self.state.read();
        Ok(canonical_providers(&visible)
            .into_iter()
            .take(limit)
            .filter_map(|id| state.uploads.get(&id).map(|u| state.hydrate(u)))
            .collect())
    }

    async fn visible_references(
        &self,
        repository_id: RepositoryId,
        commit: &str,
        monikers: &[Moniker],
        limit: Option<usize>,
        offset: usize,
        authz: &dyn RepositoryAuthorizer,
    ) -> Result<ReferenceScan> {
        if monikers.is_empty() {
            return Ok(ReferenceScan {
                scanner: Box::new(SliceScanner::empty()),
                total_count: 0,
            });
        }
        let wanted: HashSet<&Moniker> = monikers.iter().collect();

        let rows: Vec<(RepositoryId, PackageReference)> = {
            let state = self.state.read();
            let mut visible: HashSet<UploadId> = state
                .nearest_uploads
                .get(&(repository_id, commit.to_string()))
                .map(|ids| ids.iter().copied().collect())
                .unwrap_or_default();
            for (other, ids) in &state.visible_at_tip {
                if *other != repository_id {
                    visible.extend(ids.iter().copied());
                }
            }

            let mut rows: Vec<(RepositoryId, PackageReference)> = state
                .references
                .iter()
                .filter(|r| wanted.contains(&r.moniker) && visible.contains(&r.dump_id))
                .filter_map(|r| {
                    let upload = state.uploads.get(&r.dump_id)?;
                    if upload.state != ArtifactState::Completed {
                        return None;
                    }
                    state.live_repository(upload.repository_id)?;
                    Some((upload.repository_id, r.clone()))
                })
                .collect();
            rows.sort_by(|(_, a), (_, b)| (a.dump_id, &a.moniker).cmp(&(b.dump_id, &b.moniker)));
            rows
        };

        let allowed = authorize(authz, rows.iter().map(|(r, _)| *r)).await?;
        let rows: Vec<PackageReference> = rows
            .into_iter()
            .filter(|(r, _)| allowed.contains(r))
            .map(|(_, reference)| reference)
            .collect();

        let total_count = rows
            .iter()
            .map(|r| r.dump_id)
            .collect::<HashSet<_>>()
            .len();
        let page = rows
            .into_iter()
            .skip(offset)
            .take(limit.unwrap_or(usize::MAX))
            .collect();

        Ok(ReferenceScan {
            scanner: Box::new(SliceScanner::new(page)),
            total_count,
        })
    }
}
