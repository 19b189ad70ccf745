use std::collections::BTreeMap;
use std::sync::Arc;

use object_store::local::LocalFileSystem;
use substreams_sql_sink::bundler::{Bundler, RollOutcome};
use tempfile::tempdir;

fn row(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn columns() -> Vec<String> {
    vec!["id".to_string(), "name".to_string()]
}

#[tokio::test]
async fn test_bundler_uploads_block_aligned_bundles() {
    let dest = tempdir().unwrap();
    let work = tempdir().unwrap();
    let store = Arc::new(LocalFileSystem::new_with_prefix(dest.path()).unwrap());

    let mut bundler = Bundler::new(
        "users", columns(), 0, 2000, 1000, 1024, work.path(), store,
    )
    .unwrap();
    bundler.launch();

    // First boundary
    bundler.write_row(&row(&[("id", "1"), ("name", "Ada")])).unwrap();
    bundler.write_row(&row(&[("id", "2"), ("name", "Grace")])).unwrap();
    assert_eq!(bundler.roll(999).await.unwrap(), RollOutcome::Continue);
    assert_eq!(bundler.roll(1000).await.unwrap(), RollOutcome::Continue);

    // Second boundary
    bundler.write_row(&row(&[("id", "3"), ("name", "Edsger")])).unwrap();
    assert_eq!(bundler.roll(1500).await.unwrap(), RollOutcome::Continue);
    assert_eq!(
        bundler.roll(2000).await.unwrap(),
        RollOutcome::StopBlockReached
    );

    bundler.shutdown().await.unwrap();

    let first = std::fs::read_to_string(
        dest.path().join("users/0000000000-0000001000.csv"),
    )
    .unwrap();
    assert_eq!(first, "id,name\n1,Ada\n2,Grace\n");

    let second = std::fs::read_to_string(
        dest.path().join("users/0000001000-0000002000.csv"),
    )
    .unwrap();
    assert_eq!(second, "id,name\n3,Edsger\n");

    // Uploaded bundles are removed from the working directory
    assert!(!work.path().join("users/0000000000-0000001000.csv").exists());
    assert!(!work.path().join("users/pending.csv").exists());
}

#[tokio::test]
async fn test_bundler_skips_empty_boundaries() {
    let dest = tempdir().unwrap();
    let work = tempdir().unwrap();
    let store = Arc::new(LocalFileSystem::new_with_prefix(dest.path()).unwrap());

    let mut bundler = Bundler::new(
        "users", columns(), 0, 5000, 1000, 1024, work.path(), store,
    )
    .unwrap();
    bundler.launch();

    // Blocks 0..3000 carry no rows for this table, then one row lands in
    // the boundary starting at 3000.
    assert_eq!(bundler.roll(3000).await.unwrap(), RollOutcome::Continue);
    bundler.write_row(&row(&[("id", "9"), ("name", "Barbara")])).unwrap();
    assert_eq!(
        bundler.roll(5000).await.unwrap(),
        RollOutcome::StopBlockReached
    );
    bundler.shutdown().await.unwrap();

    let entries: Vec<_> = std::fs::read_dir(dest.path().join("users"))
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    assert_eq!(entries, vec!["0000003000-0000004000.csv"]);
}

#[tokio::test]
async fn test_bundler_shutdown_flushes_partial_boundary() {
    let dest = tempdir().unwrap();
    let work = tempdir().unwrap();
    let store = Arc::new(LocalFileSystem::new_with_prefix(dest.path()).unwrap());

    let mut bundler = Bundler::new(
        "users", columns(), 0, 2000, 1000, 1024, work.path(), store,
    )
    .unwrap();
    bundler.launch();

    bundler.write_row(&row(&[("id", "1"), ("name", "Ada")])).unwrap();
    assert_eq!(bundler.roll(1500).await.unwrap(), RollOutcome::Continue);

    // The stream ended before the stop block; the partial boundary is
    // closed at the stop block on shutdown.
    bundler.write_row(&row(&[("id", "2"), ("name", "Grace")])).unwrap();
    bundler.shutdown().await.unwrap();

    let first = std::fs::read_to_string(
        dest.path().join("users/0000000000-0000001000.csv"),
    )
    .unwrap();
    assert_eq!(first, "id,name\n1,Ada\n");

    let tail = std::fs::read_to_string(
        dest.path().join("users/0000001000-0000002000.csv"),
    )
    .unwrap();
    assert_eq!(tail, "id,name\n2,Grace\n");
}
