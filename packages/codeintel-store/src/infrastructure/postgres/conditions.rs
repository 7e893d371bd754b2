//! SQL renderings of the upload filters
//!
//! Every builder starts from `WHERE TRUE` so conditions can be appended as
//! `AND ...` without tracking position. All user input goes through binds.

use sqlx::{Postgres, QueryBuilder};

use crate::domain::filters::{effective_states, like_pattern, BulkUploadOptions, ListUploadsOptions};
use crate::domain::models::{ArtifactState, Moniker, RepositoryId};

pub(super) type Builder = QueryBuilder<'static, Postgres>;

/// Upload columns, plus the joined repository name, derived tip visibility
/// and queue position (dequeue order, so `uploaded_at` then `id`)
pub(super) const UPLOAD_COLUMNS: &str = r#"
    u.id, u.repository_id, r.name AS repository_name, u.commit, u.root, u.state,
    u.indexer, u.indexer_version, u.failure_message, u.uploaded_at, u.started_at,
    u.finished_at, u.num_parts, u.uploaded_parts, u.upload_size, u.num_failures,
    u.associated_index_id, u.should_reindex, u.commit_last_checked_at, u.expired,
    u.last_retention_scan_at,
    EXISTS (
        SELECT 1 FROM uploads_visible_at_tip t
        WHERE t.repository_id = u.repository_id AND t.upload_id = u.id
    ) AS visible_at_tip,
    CASE WHEN u.state = 'queued' THEN (
        SELECT COUNT(*) FROM lsif_uploads q
        WHERE q.state = 'queued' AND (q.uploaded_at, q.id) <= (u.uploaded_at, u.id)
    ) END AS queue_rank
"#;

/// Transaction-local setting the audit trigger copies into `reason`
pub(super) const AUDIT_REASON_SETTING: &str = "codeintel.lsif_uploads_audit.reason";

pub(super) const UPLOAD_FROM: &str =
    " FROM lsif_uploads u JOIN repositories r ON r.id = u.repository_id WHERE TRUE";

/// `completed` uploads keep derived data until reaped; everything else is
/// deleted outright.
pub(super) const DELETE_TARGET_STATE: &str =
    "CASE WHEN u.state = 'completed' THEN 'deleting' ELSE 'deleted' END";

/// Bump the dirty token of every repository in `$1`
pub(super) const MARK_DIRTY: &str = r#"
    INSERT INTO dirty_repositories (repository_id, dirty_token)
    SELECT id, 1 FROM unnest($1::bigint[]) AS id
    ON CONFLICT (repository_id) DO UPDATE
    SET dirty_token = dirty_repositories.dirty_token + 1
"#;

/// Package providers ranked within their `(scheme, manager, name, version,
/// root)` partition. Callers append a `WHERE` clause restricting the
/// candidate rows before ranking.
pub(super) const RANKED_PROVIDERS: &str = r#"
    SELECT p.dump_id, p.scheme, p.manager, p.name, p.version,
           RANK() OVER (
               PARTITION BY p.scheme, p.manager, p.name, p.version, pu.root
               ORDER BY cd.committed_at ASC NULLS LAST, p.dump_id
           ) AS rank
    FROM lsif_packages p
    JOIN lsif_uploads pu ON pu.id = p.dump_id AND pu.state = 'completed'
    JOIN repositories pr ON pr.id = pu.repository_id
    LEFT JOIN commit_dates cd ON cd.repository_id = pu.repository_id AND cd.commit = pu.commit
"#;

/// Moniker list flattened into parallel arrays for `unnest`
#[derive(Debug, Clone, Default)]
pub(super) struct MonikerColumns {
    schemes: Vec<String>,
    managers: Vec<String>,
    names: Vec<String>,
    versions: Vec<String>,
}

impl MonikerColumns {
    pub(super) fn new(monikers: &[Moniker]) -> Self {
        let mut columns = Self::default();
        for m in monikers {
            columns.schemes.push(m.scheme.clone());
            columns.managers.push(m.manager.clone());
            columns.names.push(m.name.clone());
            columns.versions.push(m.version.clone());
        }
        columns
    }

    /// `AND (alias.scheme, alias.manager, alias.name, alias.version) IN (...)`
    pub(super) fn push_match(&self, qb: &mut Builder, alias: &str) {
        qb.push(format!(
            " AND ({a}.scheme, {a}.manager, {a}.name, {a}.version) IN (SELECT * FROM unnest(",
            a = alias
        ));
        qb.push_bind(self.schemes.clone()).push("::text[], ");
        qb.push_bind(self.managers.clone()).push("::text[], ");
        qb.push_bind(self.names.clone()).push("::text[], ");
        qb.push_bind(self.versions.clone()).push("::text[]))");
    }
}

fn state_names(states: &[ArtifactState], exact: bool) -> Vec<String> {
    effective_states(states, exact)
        .into_iter()
        .map(|s| s.as_str().to_string())
        .collect()
}

fn push_term(qb: &mut Builder, term: &str) {
    let pattern = like_pattern(term);
    let columns = [
        "u.commit",
        "u.root",
        "u.state",
        "u.failure_message",
        "r.name",
        "u.indexer",
        "u.indexer_version",
    ];
    qb.push(" AND (");
    for (i, column) in columns.iter().enumerate() {
        if i > 0 {
            qb.push(" OR ");
        }
        qb.push(*column).push(" ILIKE ").push_bind(pattern.clone());
    }
    qb.push(")");
}

fn push_indexers(qb: &mut Builder, names: &[String]) {
    if names.is_empty() {
        return;
    }
    qb.push(" AND (");
    for (i, name) in names.iter().enumerate() {
        if i > 0 {
            qb.push(" OR ");
        }
        qb.push("u.indexer ILIKE ").push_bind(like_pattern(name));
    }
    qb.push(")");
}

fn push_visible_at_tip(qb: &mut Builder) {
    qb.push(
        " AND EXISTS (SELECT 1 FROM uploads_visible_at_tip t \
         WHERE t.repository_id = u.repository_id AND t.upload_id = u.id)",
    );
}

pub(super) fn push_allowed(qb: &mut Builder, allowed: &[RepositoryId]) {
    qb.push(" AND u.repository_id = ANY(")
        .push_bind(allowed.to_vec())
        .push(")");
}

/// Conditions for `list_uploads`
pub(super) fn push_list_conditions(qb: &mut Builder, opts: &ListUploadsOptions) {
    if !opts.allow_deleted_repo {
        qb.push(" AND r.deleted_at IS NULL");
    }
    if let Some(repository_id) = opts.repository_id {
        qb.push(" AND u.repository_id = ").push_bind(repository_id);
    }
    if let Some(term) = opts.term.as_deref() {
        push_term(qb, term);
    }
    if !opts.states.is_empty() {
        qb.push(" AND u.state = ANY(")
            .push_bind(state_names(&opts.states, opts.exact_states))
            .push(")");
    } else if !opts.allow_deleted_upload {
        qb.push(" AND u.state != 'deleted'");
    }
    if opts.visible_at_tip {
        push_visible_at_tip(qb);
    }
    if let Some(upload_id) = opts.dependency_of {
        qb.push(" AND u.id IN (SELECT ranked.dump_id FROM (")
            .push(RANKED_PROVIDERS)
            .push(
                " WHERE EXISTS (SELECT 1 FROM lsif_references ref WHERE ref.dump_id = ",
            )
            .push_bind(upload_id)
            .push(
                " AND (ref.scheme, ref.manager, ref.name, ref.version) \
                 = (p.scheme, p.manager, p.name, p.version))) ranked WHERE ranked.rank = 1)",
            );
    }
    if let Some(upload_id) = opts.dependent_of {
        qb.push(
            " AND u.id IN (SELECT ref.dump_id FROM lsif_references ref \
             WHERE ref.dump_id != ",
        )
        .push_bind(upload_id)
        .push(
            " AND (ref.scheme, ref.manager, ref.name, ref.version) IN (\
             SELECT ranked.scheme, ranked.manager, ranked.name, ranked.version FROM (",
        )
        .push(RANKED_PROVIDERS)
        .push(" WHERE pu.root = (SELECT root FROM lsif_uploads WHERE id = ")
        .push_bind(upload_id)
        .push(
            ") AND EXISTS (SELECT 1 FROM lsif_packages own WHERE own.dump_id = ",
        )
        .push_bind(upload_id)
        .push(
            " AND (own.scheme, own.manager, own.name, own.version) \
             = (p.scheme, p.manager, p.name, p.version))) ranked \
             WHERE ranked.rank = 1 AND ranked.dump_id = ",
        )
        .push_bind(upload_id)
        .push("))");
    }
    push_indexers(qb, &opts.indexer_names);
    if let Some(before) = opts.uploaded_before {
        qb.push(" AND u.uploaded_at < ").push_bind(before);
    }
    if let Some(after) = opts.uploaded_after {
        qb.push(" AND u.uploaded_at > ").push_bind(after);
    }
    if opts.in_commit_graph {
        qb.push(
            " AND u.finished_at < (SELECT dr.updated_at FROM dirty_repositories dr \
             WHERE dr.repository_id = u.repository_id)",
        );
    }
    if let Some(before) = opts.last_retention_scan_before {
        qb.push(" AND (u.last_retention_scan_at IS NULL OR u.last_retention_scan_at < ")
            .push_bind(before)
            .push(")");
    }
    if !opts.allow_expired {
        qb.push(" AND NOT u.expired");
    }
}

/// Conditions for `delete_uploads` and `reindex_uploads`. Soft-deleted rows
/// and rows of deleted repositories never match.
pub(super) fn push_bulk_conditions(qb: &mut Builder, opts: &BulkUploadOptions) {
    qb.push(" AND r.deleted_at IS NULL AND u.state NOT IN ('deleting', 'deleted')");
    if let Some(repository_id) = opts.repository_id {
        qb.push(" AND u.repository_id = ").push_bind(repository_id);
    }
    if !opts.states.is_empty() {
        qb.push(" AND u.state = ANY(")
            .push_bind(state_names(&opts.states, opts.exact_states))
            .push(")");
    }
    if let Some(term) = opts.term.as_deref() {
        push_term(qb, term);
    }
    if opts.visible_at_tip {
        push_visible_at_tip(qb);
    }
    push_indexers(qb, &opts.indexer_names);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(f: impl FnOnce(&mut Builder)) -> String {
        let mut qb = Builder::new("SELECT u.id");
        qb.push(UPLOAD_FROM);
        f(&mut qb);
        qb.sql().to_string()
    }

    #[test]
    fn test_default_list_conditions() {
        let sql = render(|qb| push_list_conditions(qb, &ListUploadsOptions::default()));
        assert!(sql.contains("r.deleted_at IS NULL"));
        assert!(sql.contains("u.state != 'deleted'"));
        assert!(sql.contains("NOT u.expired"));
        assert!(!sql.contains("ILIKE"));
    }

    #[test]
    fn test_explicit_states_replace_deleted_exclusion() {
        let opts = ListUploadsOptions {
            states: vec![ArtifactState::Deleted],
            allow_expired: true,
            ..Default::default()
        };
        let sql = render(|qb| push_list_conditions(qb, &opts));
        assert!(sql.contains("u.state = ANY($1)"));
        assert!(!sql.contains("u.state != 'deleted'"));
        assert!(!sql.contains("expired"));
    }

    #[test]
    fn test_term_binds_each_column() {
        let opts = ListUploadsOptions {
            term: Some("go".to_string()),
            ..Default::default()
        };
        let sql = render(|qb| push_list_conditions(qb, &opts));
        assert_eq!(sql.matches(" ILIKE ").count(), 7);
        assert!(sql.contains("r.name ILIKE $5"));
    }

    #[test]
    fn test_indexers_are_ored() {
        let opts = BulkUploadOptions {
            indexer_names: vec!["go".to_string(), "java".to_string()],
            ..Default::default()
        };
        let sql = render(|qb| push_bulk_conditions(qb, &opts));
        assert!(sql.contains("(u.indexer ILIKE $1 OR u.indexer ILIKE $2)"));
        assert!(sql.contains("u.state NOT IN ('deleting', 'deleted')"));
    }

    #[test]
    fn test_moniker_match_uses_parallel_arrays() {
        let columns = MonikerColumns::new(&[Moniker::new("npm", "", "left-pad", "1.0.0")]);
        let sql = render(|qb| columns.push_match(qb, "p"));
        assert!(sql.contains(
            "(p.scheme, p.manager, p.name, p.version) IN (SELECT * FROM unnest($1::text[], $2::text[], $3::text[], $4::text[]))"
        ));
    }
}
