use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tempfile::TempDir;

use sandfs_backend::{BlobBackend, DirBackend};
use sandfs_lock::LockRegistry;
use sandfs_symlink::{LinkError, LinkTable, MAX_LINK_DEPTH};

const LINKS_BLOB: &str = ".sandfs.links";

fn make_table(temp: &TempDir) -> (Arc<DirBackend>, LinkTable<DirBackend>) {
    let backend = Arc::new(DirBackend::new(temp.path()).unwrap());
    let locks = Arc::new(LockRegistry::new());
    let table = LinkTable::with_blob_name(backend.clone(), locks, LINKS_BLOB);
    (backend, table)
}

fn fresh_view(backend: &Arc<DirBackend>) -> LinkTable<DirBackend> {
    LinkTable::with_blob_name(backend.clone(), Arc::new(LockRegistry::new()), LINKS_BLOB)
}

/// Existence check standing in for a stat probe on a clear path.
async fn path_is_clear(path: String) -> Result<(), LinkError> {
    Err(LinkError::NotFound(path))
}

#[tokio::test]
async fn test_symlink_and_readlink() {
    let temp = TempDir::new().unwrap();
    let (_backend, table) = make_table(&temp);

    table
        .symlink("/a.txt", "/b.txt", path_is_clear)
        .await
        .unwrap();
    assert_eq!(table.readlink("/b.txt").await.unwrap(), "/a.txt");

    // Second link at the same path collides, and the original target stays.
    let err = table
        .symlink("/c.txt", "/b.txt", path_is_clear)
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::AlreadyExists(_)), "got {err:?}");
    assert_eq!(table.readlink("/b.txt").await.unwrap(), "/a.txt");
}

#[tokio::test]
async fn test_readlink_on_non_link() {
    let temp = TempDir::new().unwrap();
    let (_backend, table) = make_table(&temp);

    let err = table.readlink("/plain.txt").await.unwrap_err();
    assert!(matches!(err, LinkError::NotALink(_)));
}

#[tokio::test]
async fn test_dangling_target_is_allowed() {
    let temp = TempDir::new().unwrap();
    let (_backend, table) = make_table(&temp);

    table
        .symlink("/does/not/exist", "/link", path_is_clear)
        .await
        .unwrap();
    assert_eq!(table.resolve("/link").await.unwrap(), "/does/not/exist");
}

#[tokio::test]
async fn test_resolve_empty_table_is_identity() {
    let temp = TempDir::new().unwrap();
    let (_backend, table) = make_table(&temp);

    assert_eq!(table.resolve("/anything").await.unwrap(), "/anything");
}

#[tokio::test]
async fn test_resolve_chain_within_bound() {
    let temp = TempDir::new().unwrap();
    let (_backend, table) = make_table(&temp);

    // /l0 -> /l1 -> ... -> /l10, ten hops ending at a non-link.
    for i in 0..MAX_LINK_DEPTH {
        table
            .symlink(&format!("/l{}", i + 1), &format!("/l{}", i), path_is_clear)
            .await
            .unwrap();
    }
    assert_eq!(table.resolve("/l0").await.unwrap(), "/l10");

    // Resolving again hits the resolved-path cache.
    assert_eq!(table.resolve("/l0").await.unwrap(), "/l10");
}

#[tokio::test]
async fn test_resolve_chain_beyond_bound() {
    let temp = TempDir::new().unwrap();
    let (_backend, table) = make_table(&temp);

    // Eleven hops: one too many.
    for i in 0..(MAX_LINK_DEPTH + 1) {
        table
            .symlink(&format!("/l{}", i + 1), &format!("/l{}", i), path_is_clear)
            .await
            .unwrap();
    }
    let err = table.resolve("/l0").await.unwrap_err();
    assert!(matches!(err, LinkError::TooManyLinks(_)), "got {err:?}");
}

#[tokio::test]
async fn test_resolve_two_link_cycle() {
    let temp = TempDir::new().unwrap();
    let (_backend, table) = make_table(&temp);

    table
        .symlink("/b.txt", "/a.txt", path_is_clear)
        .await
        .unwrap();
    table
        .symlink("/a.txt", "/b.txt", path_is_clear)
        .await
        .unwrap();

    let err = table.resolve("/a.txt").await.unwrap_err();
    assert!(matches!(err, LinkError::TooManyLinks(_)));
}

#[tokio::test]
async fn test_resolve_self_reference() {
    let temp = TempDir::new().unwrap();
    let (_backend, table) = make_table(&temp);

    table
        .symlink("/loop", "/loop", path_is_clear)
        .await
        .unwrap();
    let err = table.resolve("/loop").await.unwrap_err();
    assert!(matches!(err, LinkError::TooManyLinks(_)));
}

#[tokio::test]
async fn test_resolve_reflects_mutations() {
    let temp = TempDir::new().unwrap();
    let (_backend, table) = make_table(&temp);

    table
        .symlink("/real.txt", "/alias", path_is_clear)
        .await
        .unwrap();
    assert_eq!(table.resolve("/alias").await.unwrap(), "/real.txt");

    // Unlink invalidates the resolved-path cache.
    assert!(table.unlink("/alias").await.unwrap());
    assert_eq!(table.resolve("/alias").await.unwrap(), "/alias");
}

#[tokio::test]
async fn test_existence_check_gates_insertion() {
    let temp = TempDir::new().unwrap();
    let (_backend, table) = make_table(&temp);

    // A check reporting a real file aborts the insertion.
    let err = table
        .symlink("/t", "/occupied", |p| async move {
            Err(LinkError::AlreadyExists(p))
        })
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::AlreadyExists(_)));
    assert!(table.readlink("/occupied").await.is_err());

    // Plain clearance also proceeds.
    table.symlink("/t", "/clear", |_| async { Ok(()) }).await.unwrap();
    assert_eq!(table.readlink("/clear").await.unwrap(), "/t");
}

#[tokio::test]
async fn test_unlink() {
    let temp = TempDir::new().unwrap();
    let (backend, table) = make_table(&temp);

    table.symlink("/a", "/b", path_is_clear).await.unwrap();
    assert!(table.unlink("/b").await.unwrap());
    assert!(!table.unlink("/b").await.unwrap());

    // Removal is persisted immediately.
    let fresh = fresh_view(&backend);
    assert!(fresh.readlink("/b").await.is_err());
}

#[tokio::test]
async fn test_rename_link_and_non_link() {
    let temp = TempDir::new().unwrap();
    let (backend, table) = make_table(&temp);

    table
        .symlink("/target", "/old", path_is_clear)
        .await
        .unwrap();
    assert!(table.rename("/old", "/new").await.unwrap());
    assert_eq!(table.readlink("/new").await.unwrap(), "/target");
    assert!(table.readlink("/old").await.is_err());

    // Not a link: the caller falls back to a plain rename.
    assert!(!table.rename("/plain.txt", "/elsewhere").await.unwrap());

    let fresh = fresh_view(&backend);
    assert_eq!(fresh.readlink("/new").await.unwrap(), "/target");
}

#[tokio::test]
async fn test_links_in_directory() {
    let temp = TempDir::new().unwrap();
    let (_backend, table) = make_table(&temp);

    table.symlink("/t1", "/dir/b", path_is_clear).await.unwrap();
    table.symlink("/t2", "/dir/a", path_is_clear).await.unwrap();
    table
        .symlink("/t3", "/other/c", path_is_clear)
        .await
        .unwrap();
    table
        .symlink("/t4", "/dir/sub/d", path_is_clear)
        .await
        .unwrap();

    assert_eq!(
        table.links_in_directory("/dir").await.unwrap(),
        vec!["/dir/a".to_string(), "/dir/b".to_string()]
    );
    assert_eq!(
        table.links_in_directory("/empty").await.unwrap(),
        Vec::<String>::new()
    );
}

#[tokio::test]
async fn test_paths_are_normalized() {
    let temp = TempDir::new().unwrap();
    let (_backend, table) = make_table(&temp);

    table
        .symlink("/dir/../real.txt", "/a//b/./link", path_is_clear)
        .await
        .unwrap();
    assert_eq!(table.readlink("/a/b/link").await.unwrap(), "/real.txt");
}

#[tokio::test]
async fn test_batch_creates_all_links_with_one_persist() {
    let temp = TempDir::new().unwrap();
    let (backend, table) = make_table(&temp);

    let checks = Arc::new(AtomicUsize::new(0));
    let counter = checks.clone();
    let links = vec![
        ("/t1".to_string(), "/l1".to_string()),
        ("/t2".to_string(), "/l2".to_string()),
        ("/t3".to_string(), "/l3".to_string()),
    ];
    table
        .symlink_batch(&links, move |p| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(LinkError::NotFound(p))
            }
        })
        .await
        .unwrap();

    assert_eq!(checks.load(Ordering::SeqCst), 3);
    let fresh = fresh_view(&backend);
    assert_eq!(fresh.readlink("/l1").await.unwrap(), "/t1");
    assert_eq!(fresh.readlink("/l2").await.unwrap(), "/t2");
    assert_eq!(fresh.readlink("/l3").await.unwrap(), "/t3");
}

#[tokio::test]
async fn test_batch_rejects_duplicates_before_io() {
    let temp = TempDir::new().unwrap();
    let (backend, table) = make_table(&temp);

    let checks = Arc::new(AtomicUsize::new(0));
    let counter = checks.clone();
    let links = vec![
        ("/t1".to_string(), "/dup".to_string()),
        ("/t2".to_string(), "/dup".to_string()),
    ];
    let err = table
        .symlink_batch(&links, move |p| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(LinkError::NotFound(p))
            }
        })
        .await
        .unwrap_err();

    assert!(matches!(err, LinkError::AlreadyExists(_)));
    // Pre-validation fails the batch before any existence-check I/O.
    assert_eq!(checks.load(Ordering::SeqCst), 0);
    assert!(!backend.exists(LINKS_BLOB).await.unwrap());
}

#[tokio::test]
async fn test_batch_aborts_on_check_failure() {
    let temp = TempDir::new().unwrap();
    let (backend, table) = make_table(&temp);

    let links = vec![
        ("/t1".to_string(), "/l1".to_string()),
        ("/t2".to_string(), "/occupied".to_string()),
        ("/t3".to_string(), "/l3".to_string()),
    ];
    let err = table
        .symlink_batch(&links, |p| async move {
            if p == "/occupied" {
                Err(LinkError::AlreadyExists(p))
            } else {
                Err(LinkError::NotFound(p))
            }
        })
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::AlreadyExists(_)));

    // All-or-nothing: no entry made it into memory or onto disk.
    assert!(table.is_empty().await.unwrap());
    assert!(!backend.exists(LINKS_BLOB).await.unwrap());
}

#[tokio::test]
async fn test_reset_drops_memory_only() {
    let temp = TempDir::new().unwrap();
    let (backend, table) = make_table(&temp);

    table.symlink("/t", "/l", path_is_clear).await.unwrap();
    table.reset().await;

    assert!(table.is_empty().await.unwrap());
    assert_eq!(table.resolve("/l").await.unwrap(), "/l");
    // The backing blob is the caller's to destroy.
    assert!(backend.exists(LINKS_BLOB).await.unwrap());

    // A fresh instance still sees the persisted link.
    let fresh = fresh_view(&backend);
    assert_eq!(fresh.readlink("/l").await.unwrap(), "/t");
}

#[tokio::test]
async fn test_invalidate_rereads_blob() {
    let temp = TempDir::new().unwrap();
    let (backend, table) = make_table(&temp);

    table.symlink("/t", "/l", path_is_clear).await.unwrap();

    // A second instance mutates the shared blob behind our back.
    let other = fresh_view(&backend);
    other.unlink("/l").await.unwrap();

    // Stale until invalidated.
    assert_eq!(table.readlink("/l").await.unwrap(), "/t");
    table.invalidate().await;
    assert!(table.readlink("/l").await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_mutations_serialize() {
    let temp = TempDir::new().unwrap();
    let backend = Arc::new(DirBackend::new(temp.path()).unwrap());
    let locks = Arc::new(LockRegistry::new());
    let table = Arc::new(LinkTable::with_blob_name(
        backend.clone(),
        locks,
        LINKS_BLOB,
    ));

    let mut handles = Vec::new();
    for i in 0..8 {
        let table = table.clone();
        handles.push(tokio::spawn(async move {
            table
                .symlink(&format!("/target-{i}"), &format!("/link-{i}"), |p| async move {
                    Err(LinkError::NotFound(p))
                })
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().expect("no SessionBusy under the serializer");
    }

    let fresh = fresh_view(&backend);
    assert_eq!(fresh.len().await.unwrap(), 8);
    for i in 0..8 {
        assert_eq!(
            fresh.readlink(&format!("/link-{i}")).await.unwrap(),
            format!("/target-{i}")
        );
    }
}
