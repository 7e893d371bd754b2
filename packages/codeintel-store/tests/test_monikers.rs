//! Moniker resolution integration tests (in-memory store)
//!
//! Fixture layout:
//!   repo 1 (lib)   provides left-pad at c1 (old), c2 (newer), c2:sub/
//!   repo 3 (tool)  provides left-pad at f1 (oldest); t1 references it
//!   repo 2 (app)   a1 references left-pad; a0 is the tip upload

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use pretty_assertions::assert_eq;

use codeintel_store::{
    AllowAll, AllowList, InMemoryUploadStore, ListUploadsOptions, Moniker, MonikerConfig,
    MonikerResolver, NewUpload, Repository, UploadId, UploadStore,
};

fn at(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 2, day, 0, 0, 0).unwrap()
}

fn left_pad() -> Moniker {
    Moniker::new("npm", "", "left-pad", "1.0.0")
}

async fn completed(
    store: &InMemoryUploadStore,
    repo: i64,
    commit: &str,
    root: &str,
    when: DateTime<Utc>,
) -> UploadId {
    let id = store
        .insert_upload(NewUpload::new(repo, commit, "scip-typescript").with_root(root), when)
        .await
        .unwrap();
    store.dequeue_upload(when).await.unwrap().unwrap();
    store.mark_complete(id, when).await.unwrap();
    id
}

struct Fixture {
    store: Arc<InMemoryUploadStore>,
    old: UploadId,
    sub: UploadId,
    fork: UploadId,
    app: UploadId,
    tool: UploadId,
}

async fn fixture() -> Fixture {
    let store = Arc::new(InMemoryUploadStore::new());
    for (id, name) in [(1, "lib"), (2, "app"), (3, "tool")] {
        store
            .upsert_repository(&Repository::new(id, format!("github.com/example/{name}")))
            .await
            .unwrap();
    }

    let old = completed(&store, 1, "c1", "", at(1)).await;
    let new = completed(&store, 1, "c2", "", at(2)).await;
    let sub = completed(&store, 1, "c2", "sub/", at(3)).await;
    let fork = completed(&store, 3, "f1", "", at(4)).await;
    let app = completed(&store, 2, "a1", "", at(5)).await;
    let tool = completed(&store, 3, "t1", "", at(6)).await;
    let app_tip = completed(&store, 2, "a0", "", at(7)).await;

    for provider in [old, new, sub, fork] {
        store.update_packages(provider, &[left_pad()]).await.unwrap();
    }
    for consumer in [app, tool, app_tip] {
        store
            .update_package_references(consumer, &[left_pad()])
            .await
            .unwrap();
    }

    store
        .update_commit_dates(1, &[("c1".to_string(), at(10)), ("c2".to_string(), at(15))])
        .await
        .unwrap();
    store
        .update_commit_dates(3, &[("f1".to_string(), at(5))])
        .await
        .unwrap();

    store.set_nearest_uploads(2, "a1", &[app]).await.unwrap();
    store.set_visible_at_tip(2, &[app_tip]).await.unwrap();
    store.set_visible_at_tip(3, &[tool, fork]).await.unwrap();

    Fixture {
        store,
        old,
        sub,
        fork,
        app,
        tool,
    }
}

fn resolver(fx: &Fixture, config: MonikerConfig) -> MonikerResolver {
    MonikerResolver::new(fx.store.clone(), config)
}

fn ids(uploads: &[codeintel_store::Upload]) -> Vec<UploadId> {
    uploads.iter().map(|u| u.id).collect()
}

// ═══════════════════════════════════════════════════════════════════════════
// Definitions
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_oldest_commit_is_canonical_per_root() {
    let fx = fixture().await;
    let dumps = resolver(&fx, MonikerConfig::default())
        .get_dumps_with_definitions(&[left_pad()], &AllowAll)
        .await
        .unwrap();
    assert_eq!(ids(&dumps), vec![fx.sub, fx.fork]);
    assert_eq!(dumps[1].repository_name, "github.com/example/tool");
}

#[tokio::test]
async fn test_authorization_applies_before_ranking() {
    let fx = fixture().await;
    let without_tool = AllowList([1, 2].into_iter().collect());
    let dumps = resolver(&fx, MonikerConfig::default())
        .get_dumps_with_definitions(&[left_pad()], &without_tool)
        .await
        .unwrap();
    // The fork is hidden, so the oldest visible lib upload takes over
    assert_eq!(ids(&dumps), vec![fx.old, fx.sub]);
}

#[tokio::test]
async fn test_definition_limit() {
    let fx = fixture().await;
    let config = MonikerConfig {
        definition_dumps_limit: 1,
        ..Default::default()
    };
    let dumps = resolver(&fx, config)
        .get_dumps_with_definitions(&[left_pad()], &AllowAll)
        .await
        .unwrap();
    assert_eq!(ids(&dumps), vec![fx.sub]);
}

#[tokio::test]
async fn test_unknown_moniker_has_no_definitions() {
    let fx = fixture().await;
    let dumps = resolver(&fx, MonikerConfig::default())
        .get_dumps_with_definitions(&[Moniker::new("npm", "", "right-pad", "1.0.0")], &AllowAll)
        .await
        .unwrap();
    assert!(dumps.is_empty());
}

// ═══════════════════════════════════════════════════════════════════════════
// References
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_references_visible_from_commit() {
    let fx = fixture().await;
    let page = resolver(&fx, MonikerConfig::default())
        .get_upload_ids_with_references(&[left_pad()], &[], 2, "a1", 10, 0, &AllowAll)
        .await
        .unwrap();

    // Same repository through the commit's nearest uploads, others through
    // their tip; repo 2's own tip upload is not visible from a1
    assert_eq!(page.upload_ids, vec![fx.app, fx.tool]);
    assert_eq!(page.records_scanned, 2);
    assert_eq!(page.total_count, 2);
}

#[tokio::test]
async fn test_references_respect_authorization() {
    let fx = fixture().await;
    let app_only = AllowList([2].into_iter().collect());
    let page = resolver(&fx, MonikerConfig::default())
        .get_upload_ids_with_references(&[left_pad()], &[], 2, "a1", 10, 0, &app_only)
        .await
        .unwrap();
    assert_eq!(page.upload_ids, vec![fx.app]);
    assert_eq!(page.total_count, 1);
}

#[tokio::test]
async fn test_reference_paging_skips_ignored_uploads() {
    let store = Arc::new(InMemoryUploadStore::new());
    for (id, name) in [(1, "consumers"), (2, "lib")] {
        store
            .upsert_repository(&Repository::new(id, format!("github.com/example/{name}")))
            .await
            .unwrap();
    }
    let mut consumers = Vec::new();
    for day in 1..=5 {
        let id = completed(&store, 1, &format!("c{day}"), "", at(day)).await;
        store
            .update_package_references(id, &[left_pad()])
            .await
            .unwrap();
        consumers.push(id);
    }
    store.set_visible_at_tip(1, &consumers).await.unwrap();

    let resolver = MonikerResolver::new(store.clone(), MonikerConfig::default());
    let first = resolver
        .get_upload_ids_with_references(&[left_pad()], &consumers[..2], 2, "main", 2, 0, &AllowAll)
        .await
        .unwrap();
    assert_eq!(first.upload_ids, consumers[2..4].to_vec());
    assert_eq!(first.records_scanned, 4);
    assert_eq!(first.total_count, 5);

    let second = resolver
        .get_upload_ids_with_references(
            &[left_pad()],
            &consumers[..2],
            2,
            "main",
            2,
            first.records_scanned,
            &AllowAll,
        )
        .await
        .unwrap();
    assert_eq!(second.upload_ids, vec![consumers[4]]);
    assert_eq!(second.records_scanned, 1);
}

// ═══════════════════════════════════════════════════════════════════════════
// Dependency listing
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_list_dependencies_and_dependents() {
    let fx = fixture().await;

    let dependencies = fx
        .store
        .list_uploads(
            &ListUploadsOptions {
                dependency_of: Some(fx.app),
                ..Default::default()
            },
            &AllowAll,
        )
        .await
        .unwrap();
    assert_eq!(ids(&dependencies.uploads), vec![fx.fork, fx.sub]);

    let dependents = fx
        .store
        .list_uploads(
            &ListUploadsOptions {
                dependent_of: Some(fx.fork),
                oldest_first: true,
                ..Default::default()
            },
            &AllowAll,
        )
        .await
        .unwrap();
    assert!(ids(&dependents.uploads).starts_with(&[fx.app, fx.tool]));
    assert_eq!(dependents.total_count, 3);

    // Not canonical for its partition, so nothing depends on it
    let shadowed = fx
        .store
        .list_uploads(
            &ListUploadsOptions {
                dependent_of: Some(fx.old),
                ..Default::default()
            },
            &AllowAll,
        )
        .await
        .unwrap();
    assert!(shadowed.uploads.is_empty());
}
