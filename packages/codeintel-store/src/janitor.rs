//! Staleness janitor
//!
//! Periodically re-resolves the commits that uploads and index jobs point
//! at. Commits that no longer exist in their repository (force-pushed away,
//! repository gone) have their uploads soft-deleted and index jobs removed;
//! commits that still resolve only get their last-checked time bumped so
//! the next cycle moves on to other work.
//!
//! Several janitors may run against one store. Batch claims skip rows held
//! by another instance, and `stale_sourced_commits` ordering makes every
//! instance work oldest-first.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::{JanitorConfig, LifecycleConfig};
use crate::domain::ports::UploadStore;
use crate::error::Result;

/// Version-control lookup used to decide whether a commit still exists
#[async_trait]
pub trait CommitResolver: Send + Sync {
    /// `Ok(false)` when the commit or its repository is gone. Errors are
    /// reserved for lookups that could not be answered.
    async fn commit_exists(&self, repository_name: &str, commit: &str) -> Result<bool>;
}

/// Counts from one janitor cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JanitorReport {
    pub commits_checked: usize,
    pub commits_unresolvable: usize,
    pub uploads_refreshed: usize,
    pub uploads_deleted: usize,
    pub indexes_refreshed: usize,
    pub indexes_deleted: usize,
    pub uploads_requeued: usize,
    pub uploads_failed: usize,
    pub uploads_reaped: usize,
}

pub struct StaleCommitJanitor {
    store: Arc<dyn UploadStore>,
    resolver: Arc<dyn CommitResolver>,
    config: JanitorConfig,
    lifecycle: Option<LifecycleConfig>,
}

impl StaleCommitJanitor {
    pub fn new(
        store: Arc<dyn UploadStore>,
        resolver: Arc<dyn CommitResolver>,
        config: JanitorConfig,
    ) -> Self {
        Self {
            store,
            resolver,
            config,
            lifecycle: None,
        }
    }

    /// Also retry errored uploads and reap soft-deleted ones each cycle
    pub fn with_lifecycle(mut self, lifecycle: LifecycleConfig) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    /// Run a single cycle at `now`
    #[instrument(skip(self))]
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<JanitorReport> {
        let mut report = JanitorReport::default();

        let batches = self
            .store
            .stale_sourced_commits(
                self.config.min_time_since_last_check(),
                self.config.commit_batch_size,
                now,
            )
            .await?;

        for batch in batches {
            for commit in &batch.commits {
                let exists = self
                    .resolver
                    .commit_exists(&batch.repository_name, commit)
                    .await?;
                let refresh = self
                    .store
                    .refresh_commit_resolvability(batch.repository_id, commit, !exists, now)
                    .await?;

                report.commits_checked += 1;
                if exists {
                    report.uploads_refreshed += refresh.uploads;
                    report.indexes_refreshed += refresh.indexes;
                } else {
                    debug!(
                        repository = %batch.repository_name,
                        commit = %commit,
                        uploads = refresh.uploads,
                        indexes = refresh.indexes,
                        "commit no longer resolvable"
                    );
                    report.commits_unresolvable += 1;
                    report.uploads_deleted += refresh.uploads;
                    report.indexes_deleted += refresh.indexes;
                }
            }
        }

        if let Some(lifecycle) = &self.lifecycle {
            let requeue = self.store.requeue_errored(lifecycle.max_failures, now).await?;
            report.uploads_requeued = requeue.requeued;
            report.uploads_failed = requeue.failed;
            report.uploads_reaped = self.store.reap_deleting().await?.len();
        }

        info!(
            commits_checked = report.commits_checked,
            commits_unresolvable = report.commits_unresolvable,
            uploads_deleted = report.uploads_deleted,
            indexes_deleted = report.indexes_deleted,
            "janitor cycle complete"
        );
        Ok(report)
    }

    /// Run cycles on the configured interval until `cancel` fires. A failed
    /// cycle is logged and retried on the next tick.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.run_once(Utc::now()) => {
                    if let Err(e) = result {
                        warn!(error = %e, "janitor cycle failed");
                    }
                }
            }
        }
        info!("janitor stopped");
    }
}
