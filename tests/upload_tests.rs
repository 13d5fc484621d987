mod common;

use std::sync::Arc;

use bytes::Bytes;
use common::{tiering, Harness};
use file_store::config::{TieringConfig, TransferMode};
use file_store::error::StoreError;
use file_store::fingerprint::Fingerprint;
use file_store::resolve::DeliveryPlan;
use file_store::storage::models::BlobLocation;
use file_store::tiering::TransferOutcome;

#[tokio::test]
async fn test_dedup_across_owners() {
    let harness = Harness::new(TieringConfig::default());
    let state = &harness.state;

    let first = state
        .uploader
        .upload_bytes("alice", "report.pdf", b"same bytes")
        .await
        .unwrap();
    let second = state
        .uploader
        .upload_bytes("bob", "copy-of-report.pdf", b"same bytes")
        .await
        .unwrap();

    assert!(!first.deduplicated);
    assert!(second.deduplicated);
    assert_eq!(first.fingerprint, second.fingerprint);
    assert_eq!(first.fingerprint, Fingerprint::of(b"same bytes"));

    assert_eq!(state.db.all_blobs().unwrap().len(), 1);
    assert_eq!(state.db.links_to(&first.fingerprint).unwrap().len(), 2);
    assert_eq!(harness.committed_blobs(), 1);
    assert_eq!(harness.pending_uploads(), 0);
}

#[tokio::test]
async fn test_relinking_same_name_is_idempotent() {
    let harness = Harness::new(TieringConfig::default());
    let state = &harness.state;

    let first = state
        .uploader
        .upload_bytes("alice", "a.txt", b"abc")
        .await
        .unwrap();
    let again = state
        .uploader
        .upload_bytes("alice", "a.txt", b"abc")
        .await
        .unwrap();

    assert!(first.link_created);
    assert!(!again.link_created);
    assert_eq!(state.db.links_to(&first.fingerprint).unwrap().len(), 1);
}

#[tokio::test]
async fn test_concurrent_identical_uploads_create_once() {
    let harness = Harness::new(tiering(TransferMode::Async));
    let state = Arc::clone(&harness.state);

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                state
                    .uploader
                    .upload_bytes(&format!("user-{i}"), "same.bin", b"identical content")
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut created = 0;
    for handle in handles {
        if !handle.await.unwrap().deduplicated {
            created += 1;
        }
    }

    assert_eq!(created, 1);
    assert_eq!(state.db.all_blobs().unwrap().len(), 1);
    assert_eq!(harness.committed_blobs(), 1);
    assert_eq!(harness.pending_uploads(), 0);
    // Exactly one transfer for the single new blob
    assert_eq!(state.queue.depth().unwrap(), 1);
}

#[tokio::test]
async fn test_abandoned_upload_creates_nothing() {
    let harness = Harness::new(tiering(TransferMode::Async));
    let state = &harness.state;

    let mut upload = state.uploader.begin().await.unwrap();
    upload.write(b"half of a fi").await.unwrap();
    // Client went away before the upload completed
    drop(upload);

    assert!(state.db.all_blobs().unwrap().is_empty());
    assert_eq!(state.queue.depth().unwrap(), 0);
    assert_eq!(harness.pending_uploads(), 0);
    assert_eq!(harness.committed_blobs(), 0);
}

#[tokio::test]
async fn test_stage_unwritable_fails_upload_without_record() {
    let harness = Harness::new(tiering(TransferMode::Async));
    let state = &harness.state;
    std::fs::remove_dir_all(harness.dir.path().join("stage").join("tmp")).unwrap();

    let result = state
        .uploader
        .upload_bytes("alice", "hello.txt", b"abc")
        .await;
    assert!(matches!(result, Err(StoreError::Io(_))));

    assert!(state.db.all_blobs().unwrap().is_empty());
    assert!(state.db.links_to(&Fingerprint::of(b"abc")).unwrap().is_empty());
    assert_eq!(state.queue.depth().unwrap(), 0);
}

#[tokio::test]
async fn test_failed_commit_discards_partial_upload() {
    let harness = Harness::new(tiering(TransferMode::Async));
    let state = &harness.state;

    let mut upload = state.uploader.begin().await.unwrap();
    upload.write(b"abc").await.unwrap();
    assert_eq!(harness.pending_uploads(), 1);

    // Committed content can no longer be published
    std::fs::remove_dir_all(harness.dir.path().join("stage").join("blobs")).unwrap();
    let result = state.uploader.complete("alice", "hello.txt", upload).await;
    assert!(matches!(result, Err(StoreError::Io(_))));

    assert!(state.db.lookup(&Fingerprint::of(b"abc")).unwrap().is_none());
    assert_eq!(harness.pending_uploads(), 0);
    assert_eq!(state.queue.depth().unwrap(), 0);
}

#[tokio::test]
async fn test_streamed_upload_fingerprints_full_content() {
    let harness = Harness::new(TieringConfig::default());
    let state = &harness.state;

    let mut upload = state.uploader.begin().await.unwrap();
    for chunk in [&b"hel"[..], b"lo ", b"world"] {
        upload.write(chunk).await.unwrap();
    }
    let receipt = state
        .uploader
        .complete("alice", "hello.txt", upload)
        .await
        .unwrap();

    assert_eq!(receipt.fingerprint, Fingerprint::of(b"hello world"));
    assert_eq!(receipt.size, 11);
    assert!(matches!(receipt.location, BlobLocation::Local { .. }));
}

#[tokio::test]
async fn test_fast_upload_links_without_bytes() {
    let harness = Harness::new(TieringConfig::default());
    let state = &harness.state;

    let unknown = Fingerprint::of(b"nobody has this");
    assert!(matches!(
        state.uploader.fast_upload("alice", &unknown, "x.bin"),
        Err(StoreError::NotFound(_))
    ));

    let original = state
        .uploader
        .upload_bytes("alice", "a.bin", b"payload")
        .await
        .unwrap();
    let fast = state
        .uploader
        .fast_upload("bob", &original.fingerprint, "b.bin")
        .unwrap();

    assert!(fast.deduplicated);
    assert_eq!(fast.size, 7);
    assert!(state
        .db
        .get_user_file("bob", &original.fingerprint, "b.bin")
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_async_upload_then_dedup_download_scenario() {
    let harness = Harness::new(tiering(TransferMode::Async));
    let state = &harness.state;

    let receipt = state
        .uploader
        .upload_bytes("alice", "hello.txt", b"abc")
        .await
        .unwrap();
    assert_eq!(receipt.fingerprint, Fingerprint::of(b"abc"));
    assert!(matches!(receipt.location, BlobLocation::Local { .. }));

    let outcome = harness.run_one().await.unwrap().unwrap();
    assert_eq!(outcome, TransferOutcome::Transferred);
    assert!(state
        .db
        .lookup(&receipt.fingerprint)
        .unwrap()
        .unwrap()
        .location
        .is_remote());

    let committed = harness.committed_blobs();
    let puts = harness.remote.put_count();

    let copy = state
        .uploader
        .upload_bytes("alice", "copy.txt", b"abc")
        .await
        .unwrap();
    assert!(copy.deduplicated);
    assert!(copy.location.is_remote());
    assert_eq!(harness.committed_blobs(), committed);
    assert_eq!(harness.remote.put_count(), puts);
    assert_eq!(state.queue.depth().unwrap(), 0);

    // Both names stay linked to the one record
    assert!(copy.link_created);
    assert_eq!(state.db.links_to(&copy.fingerprint).unwrap().len(), 2);

    for name in ["hello.txt", "copy.txt"] {
        let (link, plan) = state
            .resolver
            .plan_download(&state.db, "alice", &copy.fingerprint, Some(name))
            .await
            .unwrap();
        assert_eq!(link.file_name, name);
        assert!(matches!(plan, DeliveryPlan::ProxyRemoteFetch { ref display_name, .. } if display_name == name));
        assert_eq!(
            state.resolver.fetch(&plan).await.unwrap(),
            Some(Bytes::from_static(b"abc"))
        );
    }

    // Without a name the latest link is served
    let (link, _) = state
        .resolver
        .plan_download(&state.db, "alice", &copy.fingerprint, None)
        .await
        .unwrap();
    assert_eq!(link.file_name, "copy.txt");
}
