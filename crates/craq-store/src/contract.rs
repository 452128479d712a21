//! Shared contract checks, run against every backend.
//!
//! Each check uses its own keys, so the whole suite can run on one store
//! instance.

use std::collections::HashMap;

use bytes::Bytes;
use craq_common::ChainError;

use crate::Storer;

/// Runs the full contract against an empty store.
pub async fn run_all(store: &dyn Storer) {
    read_unknown_key(store).await;
    write_commit_read(store).await;
    commit_purges_older_versions(store).await;
    commit_idempotence(store).await;
    dirty_sweeps(store).await;
    newer_than_filters(store).await;
}

async fn read_unknown_key(store: &dyn Storer) {
    let err = store.read("contract/missing").await.unwrap_err();
    assert_eq!(
        err,
        ChainError::key_not_found("contract/missing"),
        "unknown key must be KeyNotFound"
    );
    let err = store.read_version("contract/missing", 0).await.unwrap_err();
    assert!(err.is_not_found());
}

async fn write_commit_read(store: &dyn Storer) {
    let key = "contract/basic";
    store.write(key, Bytes::from_static(b"v0"), 0).await.unwrap();

    // Uncommitted writes are invisible to read, and the error names the
    // newest dirty version.
    let err = store.read(key).await.unwrap_err();
    assert_eq!(err, ChainError::dirty(key, 0));

    store.commit(key, 0).await.unwrap();
    let item = store.read(key).await.unwrap();
    assert_eq!(item.version, 0);
    assert_eq!(item.value, Bytes::from_static(b"v0"));
    assert!(item.committed);

    // A newer dirty version makes the key dirty again, but the exact old
    // version stays readable.
    store.write(key, Bytes::from_static(b"v1"), 1).await.unwrap();
    let err = store.read(key).await.unwrap_err();
    assert_eq!(err, ChainError::dirty(key, 1));
    let item = store.read_version(key, 0).await.unwrap();
    assert_eq!(item.value, Bytes::from_static(b"v0"));
}

async fn commit_purges_older_versions(store: &dyn Storer) {
    let key = "contract/purge";
    for version in 0..3u64 {
        let value = Bytes::from(format!("v{version}"));
        store.write(key, value, version).await.unwrap();
    }
    store.commit(key, 2).await.unwrap();

    let item = store.read(key).await.unwrap();
    assert_eq!(item.version, 2);
    assert!(store.read_version(key, 0).await.unwrap_err().is_not_found());
    assert!(store.read_version(key, 1).await.unwrap_err().is_not_found());
}

async fn commit_idempotence(store: &dyn Storer) {
    let key = "contract/idem";
    store.write(key, Bytes::from_static(b"a"), 0).await.unwrap();
    store.commit(key, 0).await.unwrap();
    // Second commit of a still-present version is a no-op success.
    store.commit(key, 0).await.unwrap();

    store.write(key, Bytes::from_static(b"b"), 1).await.unwrap();
    store.commit(key, 1).await.unwrap();
    // The purged version is gone for good.
    let err = store.commit(key, 0).await.unwrap_err();
    assert!(err.is_not_found());

    // Unknown keys can't be committed.
    let err = store.commit("contract/idem-missing", 0).await.unwrap_err();
    assert!(err.is_not_found());
}

async fn dirty_sweeps(store: &dyn Storer) {
    store
        .write("contract/sweep-a", Bytes::from_static(b"a"), 0)
        .await
        .unwrap();
    store
        .write("contract/sweep-b", Bytes::from_static(b"b"), 0)
        .await
        .unwrap();
    store.commit("contract/sweep-b", 0).await.unwrap();

    let dirty = store.all_dirty().await.unwrap();
    assert!(dirty.iter().any(|i| i.key == "contract/sweep-a"));
    assert!(dirty.iter().all(|i| !i.committed));
    assert!(dirty.iter().all(|i| i.key != "contract/sweep-b"));

    let committed = store.all_committed().await.unwrap();
    assert!(committed.iter().any(|i| i.key == "contract/sweep-b"));
    assert!(committed.iter().all(|i| i.committed));
}

async fn newer_than_filters(store: &dyn Storer) {
    // newer/k1: committed version 1. newer/k2: dirty version 5.
    store.write("contract/newer-k1", Bytes::from_static(b"x"), 1).await.unwrap();
    store.commit("contract/newer-k1", 1).await.unwrap();
    store.write("contract/newer-k2", Bytes::from_static(b"y"), 5).await.unwrap();

    // Committed: absent key is returned, matching version is filtered out.
    let newer = store.all_newer_committed(&HashMap::new()).await.unwrap();
    assert!(newer.iter().any(|i| i.key == "contract/newer-k1" && i.version == 1));

    let versions = HashMap::from([("contract/newer-k1".to_owned(), 1u64)]);
    let newer = store.all_newer_committed(&versions).await.unwrap();
    assert!(newer.iter().all(|i| i.key != "contract/newer-k1"));

    // Dirty: version strictly greater than the map entry is returned.
    let versions = HashMap::from([("contract/newer-k2".to_owned(), 4u64)]);
    let newer = store.all_newer_dirty(&versions).await.unwrap();
    assert!(newer.iter().any(|i| i.key == "contract/newer-k2" && i.version == 5));

    let versions = HashMap::from([("contract/newer-k2".to_owned(), 5u64)]);
    let newer = store.all_newer_dirty(&versions).await.unwrap();
    assert!(newer.iter().all(|i| i.key != "contract/newer-k2"));
}
