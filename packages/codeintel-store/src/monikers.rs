//! Moniker resolution
//!
//! Cross-repository navigation by package identity: which uploads define a
//! package, and which uploads visible from a commit reference it.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use tracing::{debug, instrument};

use crate::config::MonikerConfig;
use crate::domain::models::{Moniker, RepositoryId, Upload, UploadId};
use crate::domain::ports::{ReferenceScan, RepositoryAuthorizer, UploadStore};
use crate::error::Result;

/// One page of uploads referencing a moniker set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferencePage {
    /// Distinct upload ids, ascending
    pub upload_ids: Vec<UploadId>,
    /// Reference rows consumed; the offset for the next page
    pub records_scanned: usize,
    /// Distinct uploads matching across all pages
    pub total_count: usize,
}

pub struct MonikerResolver {
    store: Arc<dyn UploadStore>,
    config: MonikerConfig,
}

impl MonikerResolver {
    pub fn new(store: Arc<dyn UploadStore>, config: MonikerConfig) -> Self {
        Self { store, config }
    }

    /// Canonical uploads defining any of `monikers`, capped at the configured
    /// definition limit.
    #[instrument(skip_all, fields(monikers = monikers.len()))]
    pub async fn get_dumps_with_definitions(
        &self,
        monikers: &[Moniker],
        authz: &dyn RepositoryAuthorizer,
    ) -> Result<Vec<Upload>> {
        if monikers.is_empty() {
            return Ok(Vec::new());
        }
        self.store
            .dumps_with_definitions(monikers, self.config.definition_dumps_limit, authz)
            .await
    }

    /// Stream references to `monikers` from uploads visible at
    /// `(repository_id, commit)`. The caller owns the returned scanner and
    /// must close it.
    pub async fn get_visible_uploads_matching_monikers(
        &self,
        repository_id: RepositoryId,
        commit: &str,
        monikers: &[Moniker],
        limit: Option<usize>,
        offset: usize,
        authz: &dyn RepositoryAuthorizer,
    ) -> Result<ReferenceScan> {
        self.store
            .visible_references(repository_id, commit, monikers, limit, offset, authz)
            .await
    }

    /// Collect up to `limit` distinct uploads referencing `monikers`,
    /// skipping `ignore_ids`. Scanning starts at reference row `offset`.
    #[instrument(skip(self, monikers, ignore_ids, authz), fields(monikers = monikers.len()))]
    #[allow(clippy::too_many_arguments)]
    pub async fn get_upload_ids_with_references(
        &self,
        monikers: &[Moniker],
        ignore_ids: &[UploadId],
        repository_id: RepositoryId,
        commit: &str,
        limit: usize,
        offset: usize,
        authz: &dyn RepositoryAuthorizer,
    ) -> Result<ReferencePage> {
        let scan = self
            .get_visible_uploads_matching_monikers(
                repository_id,
                commit,
                monikers,
                None,
                offset,
                authz,
            )
            .await?;
        collect_reference_page(scan, ignore_ids, limit).await
    }
}

/// Drain `scan` until `limit` distinct uploads outside `ignore_ids` are
/// selected. The scanner is closed whether or not the scan fails.
async fn collect_reference_page(
    scan: ReferenceScan,
    ignore_ids: &[UploadId],
    limit: usize,
) -> Result<ReferencePage> {
    let ReferenceScan {
        mut scanner,
        total_count,
    } = scan;

    let ignored: HashSet<UploadId> = ignore_ids.iter().copied().collect();
    let mut selected: BTreeSet<UploadId> = BTreeSet::new();
    let mut records_scanned = 0;

    let scanned: Result<()> = async {
        while selected.len() < limit {
            let Some(reference) = scanner.next().await? else {
                break;
            };
            records_scanned += 1;
            if ignored.contains(&reference.dump_id) {
                continue;
            }
            selected.insert(reference.dump_id);
        }
        Ok(())
    }
    .await;

    let closed = scanner.close().await;
    scanned?;
    closed?;

    debug!(
        selected = selected.len(),
        records_scanned, total_count, "collected referencing uploads"
    );
    Ok(ReferencePage {
        upload_ids: selected.into_iter().collect(),
        records_scanned,
        total_count,
    })
}
