//! End-to-end archive chain: compose signed version and status
//! records, store them, and verify the chain from the blobs alone.

use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

use docvault::archive::{
    status_key, version_key, MemoryStore, ObjectStore, ObjectStoreError, SigningKey,
    SigningKeySet, StatusArchive, VersionArchive,
};

fn ts(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 10, minute, 0).unwrap()
}

fn keyset() -> SigningKeySet {
    let (key, _) = SigningKey::generate("1").unwrap();
    let mut set = SigningKeySet::new();
    set.insert(key);
    set
}

/// Archive `count` versions of one document the way the archiver
/// does: sign canonical bytes chained to the parent, then put the
/// blob under the deterministic key.
async fn archive_versions(
    store: &MemoryStore,
    keys: &SigningKeySet,
    uuid: Uuid,
    count: i64,
) -> Vec<String> {
    let mut parent = String::new();
    let mut signatures = Vec::new();

    for version in 1..=count {
        let mut record = VersionArchive {
            uuid,
            version,
            created: ts(version as u32),
            creator_uri: "core://user/alice".into(),
            meta: None,
            document_data: serde_json::json!({ "title": format!("rev {version}") }),
            parent_signature: parent.clone(),
            signature: None,
        };

        let signature = keys.sign(&record.canonical_bytes().unwrap()).unwrap();
        record.signature = Some(signature.clone());

        store
            .put(
                &version_key("archive", uuid, version),
                serde_json::to_vec(&record).unwrap(),
                "application/json",
            )
            .await
            .unwrap();

        parent = signature.clone();
        signatures.push(signature);
    }

    signatures
}

#[tokio::test]
async fn version_chain_verifies_from_blobs() {
    let store = MemoryStore::new();
    let keys = keyset();
    let uuid = Uuid::new_v4();

    archive_versions(&store, &keys, uuid, 3).await;

    assert_eq!(store.len().await, 3);

    // Walk the chain from the blobs alone: each signature must cover
    // the canonical bytes, and each parent_signature must equal the
    // previous record's signature.
    let mut parent = String::new();

    for version in 1..=3 {
        let blob = store
            .get(&version_key("archive", uuid, version))
            .await
            .unwrap();
        let record: VersionArchive = serde_json::from_slice(&blob).unwrap();

        assert_eq!(record.version, version);
        assert_eq!(record.parent_signature, parent);

        let signature = record.signature.clone().expect("archived blob is signed");
        keys.verify(&signature, &record.canonical_bytes().unwrap())
            .unwrap();

        parent = signature;
    }
}

#[tokio::test]
async fn tampered_blob_fails_verification() {
    let store = MemoryStore::new();
    let keys = keyset();
    let uuid = Uuid::new_v4();

    archive_versions(&store, &keys, uuid, 2).await;

    let key = version_key("archive", uuid, 2);
    let blob = store.get(&key).await.unwrap();
    let mut record: VersionArchive = serde_json::from_slice(&blob).unwrap();

    // Rewrite the payload but keep the original signature.
    record.document_data = serde_json::json!({ "title": "forged" });

    let signature = record.signature.clone().unwrap();
    assert!(keys
        .verify(&signature, &record.canonical_bytes().unwrap())
        .is_err());

    // Splicing a parent signature from another position breaks the
    // chain even though the record itself still verifies.
    let head: VersionArchive = serde_json::from_slice(
        &store.get(&version_key("archive", uuid, 1)).await.unwrap(),
    )
    .unwrap();
    assert_ne!(head.signature.unwrap(), record.parent_signature);
}

#[tokio::test]
async fn status_records_chain_to_their_version() {
    let store = MemoryStore::new();
    let keys = keyset();
    let uuid = Uuid::new_v4();

    let version_sigs = archive_versions(&store, &keys, uuid, 2).await;

    // Two "usable" statuses: id 1 pins version 1, id 2 pins version 2.
    let mut parent = String::new();

    for id in 1..=2i64 {
        let mut record = StatusArchive {
            uuid,
            name: "usable".into(),
            id,
            version: id,
            created: ts(10 + id as u32),
            creator_uri: "core://user/bob".into(),
            meta: None,
            version_signature: version_sigs[(id - 1) as usize].clone(),
            parent_signature: parent.clone(),
            signature: None,
        };

        let signature = keys.sign(&record.canonical_bytes().unwrap()).unwrap();
        record.signature = Some(signature.clone());

        store
            .put(
                &status_key("archive", uuid, "usable", id),
                serde_json::to_vec(&record).unwrap(),
                "application/json",
            )
            .await
            .unwrap();

        parent = signature;
    }

    // Verify both status blobs and their link to the version chain.
    let mut parent = String::new();

    for id in 1..=2i64 {
        let blob = store
            .get(&status_key("archive", uuid, "usable", id))
            .await
            .unwrap();
        let record: StatusArchive = serde_json::from_slice(&blob).unwrap();

        assert_eq!(record.parent_signature, parent);
        assert_eq!(record.version_signature, version_sigs[(id - 1) as usize]);

        let signature = record.signature.clone().unwrap();
        keys.verify(&signature, &record.canonical_bytes().unwrap())
            .unwrap();

        parent = signature;
    }
}

#[tokio::test]
async fn blob_keys_are_deterministic_and_disjoint() {
    let store = MemoryStore::new();
    let keys = keyset();
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();

    archive_versions(&store, &keys, a, 2).await;
    archive_versions(&store, &keys, b, 1).await;

    let stored = store.keys().await;
    assert_eq!(stored.len(), 3);
    assert!(stored.contains(&version_key("archive", a, 1)));
    assert!(stored.contains(&version_key("archive", a, 2)));
    assert!(stored.contains(&version_key("archive", b, 1)));

    match store.get(&version_key("archive", b, 2)).await {
        Err(ObjectStoreError::NotFound(_)) => {}
        other => panic!("expected NotFound, got {other:?}"),
    }
}
