//! Interrupted transfers followed by a restart of the local process.

use std::sync::Arc;

use drift_repo::{FileRepository, InstrumentedRepository, RepoOp, Repository};
use drift_sync::{CancelToken, FailureKind, SyncPhase};
use drift_tests::{CHUNK, Site, test_data, write_file};

#[tokio::test]
async fn test_push_resumes_after_restart() {
    let repo_dir = tempfile::tempdir().unwrap();
    let backing: Arc<dyn Repository> = Arc::new(FileRepository::new(repo_dir.path()).unwrap());
    let repo = Arc::new(InstrumentedRepository::new(backing.clone()));

    let site = Site::new(repo.clone());
    let data = test_data(CHUNK as usize * 8);
    let path = write_file(&site.files(), "payload", &data);

    repo.interrupt_after_puts(3);
    let failure = site
        .engine
        .push_file(&path, None, &CancelToken::new())
        .await
        .unwrap_err();
    assert_eq!(failure.report.phase, SyncPhase::Failed(FailureKind::Remote));
    let id = failure.report.stream_id.unwrap();
    assert!(!backing.has_stream(id).await.unwrap());

    // The local stream survives the restart; only the missing chunks move.
    let site = site.restart();
    assert!(site.store.has_stream(&id).unwrap());
    repo.resume();
    repo.reset();

    let report = site.engine.push_stream(id, &CancelToken::new()).await.unwrap();
    assert_eq!(report.phase, SyncPhase::Done);
    assert_eq!(report.skipped + report.transferred, 8);
    assert_eq!(repo.count(RepoOp::PutChunk) as usize, report.transferred);
    assert!(report.skipped >= 3);
    assert!(backing.has_stream(id).await.unwrap());
}

#[tokio::test]
async fn test_failed_pull_leaves_only_collectable_chunks() {
    let repo_dir = tempfile::tempdir().unwrap();
    let backing: Arc<dyn Repository> = Arc::new(FileRepository::new(repo_dir.path()).unwrap());

    let alice = Site::new(backing.clone());
    let path = write_file(&alice.files(), "payload", &test_data(CHUNK as usize * 6));
    let id = alice
        .engine
        .push_file(&path, None, &CancelToken::new())
        .await
        .unwrap()
        .stream_id
        .unwrap();

    let flaky = Arc::new(InstrumentedRepository::new(backing.clone()));
    let stream = alice.store.get_stream(&id).unwrap();
    flaky.fail_chunk(stream.chunks[3], 100);

    let bob = Site::new(flaky.clone());
    let failure = bob.engine.pull(id, &CancelToken::new()).await.unwrap_err();
    assert_eq!(
        failure.report.phase,
        SyncPhase::Failed(FailureKind::RetriesExhausted)
    );
    assert!(!bob.store.has_stream(&id).unwrap());

    // After a restart, nothing references the partial download.
    let bob = bob.restart();
    bob.store.gc().await.unwrap();
    assert_eq!(bob.store.stats().await.unwrap().chunks, 0);

    let report = bob.engine.pull(id, &CancelToken::new()).await;
    assert!(report.is_err(), "faults are still armed on this site's repository");

    // A site talking to the healthy repository completes the same pull.
    let carol = Site::new(backing);
    let report = carol.engine.pull(id, &CancelToken::new()).await.unwrap();
    assert_eq!(report.transferred, 6);
}
