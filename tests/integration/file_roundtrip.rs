//! Push a tree from one site and pull it on another through a directory
//! repository, with both local stores on disk.

use std::sync::Arc;

use drift_repo::{FileRepository, Repository};
use drift_sync::{CancelToken, SyncPhase};
use drift_tests::{CHUNK, Site, test_data, write_file};

#[tokio::test]
async fn test_tree_roundtrip_between_sites() {
    let repo_dir = tempfile::tempdir().unwrap();
    let repo: Arc<dyn Repository> = Arc::new(FileRepository::new(repo_dir.path()).unwrap());

    let alice = Site::new(repo.clone());
    let tree = alice.files().join("tree");
    let files = [
        ("README", test_data(300)),
        ("bin/tool", test_data(CHUNK as usize * 5 + 11)),
        ("data/empty", Vec::new()),
        ("data/exact", test_data(CHUNK as usize * 2)),
    ];
    for (name, data) in &files {
        write_file(&tree, name, data);
    }

    let results = alice.engine.push_path(&tree, &CancelToken::new()).await.unwrap();
    assert_eq!(results.len(), files.len());
    let reports: Vec<_> = results.into_iter().map(|r| r.unwrap()).collect();

    let bob = Site::new(repo.clone());
    let out = bob.files().join("restored");
    for report in &reports {
        let id = report.stream_id.unwrap();
        let name = alice.store.get_stream(&id).unwrap().meta.path.unwrap();
        let pulled = bob
            .engine
            .pull_to(id, &out.join(&name), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(pulled.phase, SyncPhase::Done);
    }

    for (name, data) in &files {
        assert_eq!(&std::fs::read(out.join(name)).unwrap(), data, "{name}");
    }
}

#[tokio::test]
async fn test_tree_deploy_between_sites() {
    let repo_dir = tempfile::tempdir().unwrap();
    let repo: Arc<dyn Repository> = Arc::new(FileRepository::new(repo_dir.path()).unwrap());

    let alice = Site::new(repo.clone());
    let tree = alice.files().join("tree");
    let tool = test_data(CHUNK as usize * 3 + 5);
    write_file(&tree, "bin/tool", &tool);
    write_file(&tree, "share/empty", b"");
    #[cfg(unix)]
    std::os::unix::fs::symlink("bin/tool", tree.join("tool")).unwrap();

    let pushed = alice.engine.push_tree(&tree, &CancelToken::new()).await.unwrap();
    assert!(pushed.complete);
    let id = pushed.tree_id.unwrap();
    assert!(repo_dir.path().join("trees").join(id.to_string()).exists());

    let bob = Site::new(repo.clone());
    let out = bob.files().join("deployed");
    let deployed = bob.engine.pull_tree(id, &out, &CancelToken::new()).await.unwrap();
    assert!(deployed.complete);
    assert_eq!(deployed.files.len(), 2);

    assert_eq!(std::fs::read(out.join("bin/tool")).unwrap(), tool);
    assert_eq!(std::fs::read(out.join("share/empty")).unwrap(), Vec::<u8>::new());
    #[cfg(unix)]
    assert_eq!(std::fs::read(out.join("tool")).unwrap(), tool);
}

#[tokio::test]
async fn test_second_site_push_is_free() {
    let repo_dir = tempfile::tempdir().unwrap();
    let repo: Arc<dyn Repository> = Arc::new(FileRepository::new(repo_dir.path()).unwrap());
    let data = test_data(CHUNK as usize * 4 + 1);

    let alice = Site::new(repo.clone());
    let a = write_file(&alice.files(), "same.bin", &data);
    let first = alice.engine.push_file(&a, None, &CancelToken::new()).await.unwrap();
    assert_eq!(first.transferred, 5);

    // Same bytes elsewhere: every chunk is already remote.
    let bob = Site::new(repo.clone());
    let b = write_file(&bob.files(), "same.bin", &data);
    let second = bob.engine.push_file(&b, None, &CancelToken::new()).await.unwrap();
    assert_eq!(second.transferred, 0);
    assert_eq!(second.skipped, 5);
}

#[tokio::test]
async fn test_status_on_disk() {
    let repo_dir = tempfile::tempdir().unwrap();
    let repo: Arc<dyn Repository> = Arc::new(FileRepository::new(repo_dir.path()).unwrap());

    let site = Site::new(repo);
    let path = write_file(&site.files(), "doc", &test_data(CHUNK as usize * 3));
    assert!(!site.engine.status(&path, None).await.unwrap().in_sync());

    site.engine.push_file(&path, None, &CancelToken::new()).await.unwrap();
    assert!(site.engine.status(&path, None).await.unwrap().in_sync());
}
