use serde_json::json;
use tempfile::tempdir;

use fieldsync::{EntityRecord, ReplicaPolicy, ReplicaStore, SyncError};

fn record(entity_id: &str, status: &str, project: &str) -> EntityRecord {
    let mut record = EntityRecord::new(
        "rfi",
        entity_id,
        status,
        json!({"project": project, "title": entity_id}),
    );
    record.version = 1;
    record
}

#[tokio::test]
async fn point_lookup_and_ordered_listing() {
    let dir = tempdir().unwrap();
    let store = ReplicaStore::open(dir.path(), ReplicaPolicy::default())
        .await
        .unwrap();

    store
        .apply_entities(vec![
            record("b", "draft", "p1"),
            record("a", "draft", "p1"),
            record("c", "draft", "p2"),
        ])
        .await
        .unwrap();

    let got = store.get("rfi", "b").await.unwrap();
    assert_eq!(got.entity.fields["title"], "b");
    assert!(store.get("rfi", "missing").await.is_none());

    let ids: Vec<String> = store
        .list("rfi")
        .await
        .into_iter()
        .map(|r| r.entity.entity_id)
        .collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn later_versions_replace_earlier_ones() {
    let dir = tempdir().unwrap();
    let store = ReplicaStore::open(dir.path(), ReplicaPolicy::default())
        .await
        .unwrap();

    store
        .apply_entities(vec![record("a", "draft", "p1")])
        .await
        .unwrap();
    let mut updated = record("a", "submitted", "p1");
    updated.version = 2;
    store.apply_entities(vec![updated]).await.unwrap();

    let got = store.get("rfi", "a").await.unwrap();
    assert_eq!(got.entity.status, "submitted");
    assert_eq!(got.entity.version, 2);
    assert_eq!(store.list("rfi").await.len(), 1);
}

#[tokio::test]
async fn indexed_lookup_by_foreign_key_and_status() {
    let dir = tempdir().unwrap();
    let store = ReplicaStore::open(dir.path(), ReplicaPolicy::default())
        .await
        .unwrap();

    // Index registered after some records already exist: backfill applies.
    store
        .apply_entities(vec![record("a", "draft", "p1"), record("b", "submitted", "p1")])
        .await
        .unwrap();
    store.register_index("rfi", "project").await.unwrap();
    store
        .apply_entities(vec![record("c", "draft", "p2")])
        .await
        .unwrap();

    let p1: Vec<String> = store
        .list_by_index("rfi", "project", "p1")
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.entity.entity_id)
        .collect();
    assert_eq!(p1, vec!["a", "b"]);

    let p1_draft = store
        .list_by_index_status("rfi", "project", "p1", "draft")
        .await
        .unwrap();
    assert_eq!(p1_draft.len(), 1);
    assert_eq!(p1_draft[0].entity.entity_id, "a");

    let err = store
        .list_by_index("rfi", "unindexed", "x")
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Execution(_)));
}

#[tokio::test]
async fn index_rows_follow_field_changes() {
    let dir = tempdir().unwrap();
    let store = ReplicaStore::open(dir.path(), ReplicaPolicy::default())
        .await
        .unwrap();
    store.register_index("rfi", "project").await.unwrap();

    store
        .apply_entities(vec![record("a", "draft", "p1")])
        .await
        .unwrap();
    let mut moved = record("a", "draft", "p2");
    moved.version = 2;
    store.apply_entities(vec![moved]).await.unwrap();

    assert!(
        store
            .list_by_index("rfi", "project", "p1")
            .await
            .unwrap()
            .is_empty()
    );
    let p2 = store.list_by_index("rfi", "project", "p2").await.unwrap();
    assert_eq!(p2.len(), 1);
}

#[tokio::test]
async fn subscribers_see_each_applied_entity() {
    let dir = tempdir().unwrap();
    let store = ReplicaStore::open(dir.path(), ReplicaPolicy::default())
        .await
        .unwrap();
    let mut events = store.subscribe();

    store
        .apply_entities(vec![record("a", "draft", "p1"), record("b", "draft", "p1")])
        .await
        .unwrap();

    let first = events.recv().await.unwrap();
    assert_eq!(first.collection, "rfi");
    assert_eq!(first.entity_id, "a");
    let second = events.recv().await.unwrap();
    assert_eq!(second.entity_id, "b");
}

#[tokio::test]
async fn replica_survives_reopen_with_indexes() {
    let dir = tempdir().unwrap();

    {
        let store = ReplicaStore::open(dir.path(), ReplicaPolicy::default())
            .await
            .unwrap();
        store.register_index("rfi", "project").await.unwrap();
        store
            .apply_entities(vec![record("a", "draft", "p1"), record("b", "draft", "p2")])
            .await
            .unwrap();
        store.close().await.unwrap();
    }

    let store = ReplicaStore::open(dir.path(), ReplicaPolicy::default())
        .await
        .unwrap();
    assert_eq!(store.list("rfi").await.len(), 2);
    let p2 = store.list_by_index("rfi", "project", "p2").await.unwrap();
    assert_eq!(p2.len(), 1);
    assert_eq!(p2[0].entity.entity_id, "b");
}
