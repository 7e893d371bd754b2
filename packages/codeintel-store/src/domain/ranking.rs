//! Canonical provider selection
//!
//! Several uploads may declare the same package. Providers are partitioned
//! by `(scheme, manager, name, version, root)` and ranked by the commit date
//! of the upload's commit, oldest first, with unknown dates last and the
//! upload id breaking ties. Only rank 1 of each partition is canonical.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};

use crate::domain::models::{Moniker, UploadId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCandidate {
    pub upload_id: UploadId,
    pub root: String,
    pub moniker: Moniker,
    pub committed_at: Option<DateTime<Utc>>,
}

fn rank_key(c: &ProviderCandidate) -> (bool, Option<DateTime<Utc>>, UploadId) {
    (c.committed_at.is_none(), c.committed_at, c.upload_id)
}

/// Rank-1 upload ids across all partitions, ascending.
pub fn canonical_providers(candidates: &[ProviderCandidate]) -> Vec<UploadId> {
    let mut best: HashMap<(&Moniker, &str), &ProviderCandidate> = HashMap::new();
    for candidate in candidates {
        best.entry((&candidate.moniker, candidate.root.as_str()))
            .and_modify(|current| {
                if rank_key(candidate) < rank_key(current) {
                    *current = candidate;
                }
            })
            .or_insert(candidate);
    }

    best.values()
        .map(|c| c.upload_id)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn left_pad() -> Moniker {
        Moniker::new("npm", "", "left-pad", "1.0.0")
    }

    fn candidate(id: UploadId, root: &str, day: Option<u32>) -> ProviderCandidate {
        ProviderCandidate {
            upload_id: id,
            root: root.to_string(),
            moniker: left_pad(),
            committed_at: day.map(|d| Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap()),
        }
    }

    #[test]
    fn test_oldest_commit_wins() {
        let candidates = vec![candidate(2, "", Some(5)), candidate(1, "", Some(9))];
        assert_eq!(canonical_providers(&candidates), vec![2]);
    }

    #[test]
    fn test_unknown_commit_date_ranks_last() {
        let candidates = vec![candidate(1, "", None), candidate(3, "", Some(20))];
        assert_eq!(canonical_providers(&candidates), vec![3]);
    }

    #[test]
    fn test_id_breaks_ties() {
        let candidates = vec![candidate(8, "", Some(2)), candidate(4, "", Some(2))];
        assert_eq!(canonical_providers(&candidates), vec![4]);
    }

    #[test]
    fn test_roots_are_separate_partitions() {
        let candidates = vec![
            candidate(1, "a/", Some(3)),
            candidate(2, "a/", Some(1)),
            candidate(3, "b/", Some(7)),
        ];
        assert_eq!(canonical_providers(&candidates), vec![2, 3]);
    }

    #[test]
    fn test_same_upload_in_several_partitions_is_listed_once() {
        let mut other = candidate(5, "", Some(1));
        other.moniker = Moniker::new("npm", "", "right-pad", "2.0.0");
        let candidates = vec![candidate(5, "", Some(1)), other];
        assert_eq!(canonical_providers(&candidates), vec![5]);
    }

    #[test]
    fn test_empty() {
        assert!(canonical_providers(&[]).is_empty());
    }
}
