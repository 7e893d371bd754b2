//! Transaction-scoped reference scanner
//!
//! Rows are pulled in pages of `batch_size` inside a read-only
//! `REPEATABLE READ` transaction, so every page sees the same snapshot.
//! Closing (or dropping) the scanner ends the transaction.

use std::collections::VecDeque;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::debug;

use super::bind_count;
use super::conditions::{push_allowed, Builder, MonikerColumns};
use crate::domain::models::{Moniker, PackageReference, RepositoryId};
use crate::domain::ports::PackageReferenceScanner;
use crate::error::Result;

/// References to a moniker set from uploads visible at `(repository, commit)`
///
/// Uploads of the requesting repository are visible when they are nearest
/// to the commit; uploads of other repositories when visible from their
/// default branch tip.
#[derive(Debug, Clone)]
pub(super) struct ReferenceQuery {
    pub repository_id: RepositoryId,
    pub commit: String,
    pub monikers: MonikerColumns,
    pub allowed: Option<Vec<RepositoryId>>,
}

impl ReferenceQuery {
    pub(super) fn build(&self, select: &str) -> Builder {
        let mut qb = Builder::new(
            "WITH visible_uploads AS (\
             SELECT upload_id FROM nearest_uploads WHERE repository_id = ",
        );
        qb.push_bind(self.repository_id)
            .push(" AND commit = ")
            .push_bind(self.commit.clone())
            .push(
                " UNION SELECT upload_id FROM uploads_visible_at_tip \
                 WHERE repository_id != ",
            )
            .push_bind(self.repository_id)
            .push(") SELECT ")
            .push(select)
            .push(
                " FROM lsif_references ref \
                 JOIN visible_uploads v ON v.upload_id = ref.dump_id \
                 JOIN lsif_uploads u ON u.id = ref.dump_id \
                 JOIN repositories r ON r.id = u.repository_id \
                 WHERE u.state = 'completed' AND r.deleted_at IS NULL",
            );
        self.monikers.push_match(&mut qb, "ref");
        if let Some(allowed) = &self.allowed {
            push_allowed(&mut qb, allowed);
        }
        qb
    }
}

fn row_to_reference(row: &PgRow) -> Result<PackageReference> {
    Ok(PackageReference {
        dump_id: row.try_get("dump_id")?,
        moniker: Moniker {
            scheme: row.try_get("scheme")?,
            manager: row.try_get("manager")?,
            name: row.try_get("name")?,
            version: row.try_get("version")?,
        },
    })
}

pub struct PgReferenceScanner {
    tx: Option<Transaction<'static, Postgres>>,
    query: ReferenceQuery,
    buffer: VecDeque<PackageReference>,
    next_offset: usize,
    remaining: Option<usize>,
    batch_size: usize,
    exhausted: bool,
}

impl PgReferenceScanner {
    pub(super) async fn open(
        pool: &PgPool,
        query: ReferenceQuery,
        limit: Option<usize>,
        offset: usize,
        batch_size: usize,
    ) -> Result<Self> {
        let mut tx = pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await?;
        Ok(Self {
            tx: Some(tx),
            query,
            buffer: VecDeque::new(),
            next_offset: offset,
            remaining: limit,
            batch_size: batch_size.max(1),
            exhausted: false,
        })
    }

    async fn fetch_page(&mut self) -> Result<()> {
        let take = self
            .remaining
            .map_or(self.batch_size, |r| r.min(self.batch_size));
        let Some(tx) = self.tx.as_mut() else {
            self.exhausted = true;
            return Ok(());
        };
        if take == 0 {
            self.exhausted = true;
            return Ok(());
        }

        let mut qb = self
            .query
            .build("ref.dump_id, ref.scheme, ref.manager, ref.name, ref.version");
        qb.push(" ORDER BY ref.dump_id, ref.scheme, ref.manager, ref.name, ref.version LIMIT ")
            .push_bind(bind_count(take))
            .push(" OFFSET ")
            .push_bind(bind_count(self.next_offset));
        let rows = qb.build().fetch_all(&mut **tx).await?;

        debug!(offset = self.next_offset, rows = rows.len(), "fetched reference page");
        if rows.len() < take {
            self.exhausted = true;
        }
        self.next_offset += rows.len();
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= rows.len();
        }
        for row in &rows {
            self.buffer.push_back(row_to_reference(row)?);
        }
        Ok(())
    }
}

#[async_trait]
impl PackageReferenceScanner for PgReferenceScanner {
    async fn next(&mut self) -> Result<Option<PackageReference>> {
        if self.buffer.is_empty() && !self.exhausted {
            self.fetch_page().await?;
        }
        Ok(self.buffer.pop_front())
    }

    async fn close(&mut self) -> Result<()> {
        self.exhausted = true;
        self.buffer.clear();
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
        }
        Ok(())
    }
}
