use substreams_sql_sink::state::FileStateStore;
use substreams_sql_sink::{BlockRef, Cursor};
use tempfile::tempdir;

#[tokio::test]
async fn test_state_store_roundtrip() {
    let dir = tempdir().unwrap();
    let store = FileStateStore::new(dir.path().join("state.yaml"));

    // Nothing saved yet
    assert!(store.read_cursor().await.unwrap().is_none());

    let cursor = Cursor::new("cursor-token", BlockRef::new(1000, "0xabc"));
    store.save(&cursor).await.unwrap();

    let loaded = store.read_cursor().await.unwrap().unwrap();
    assert_eq!(loaded, cursor);
}

#[tokio::test]
async fn test_state_store_overwrites_previous_cursor() {
    let dir = tempdir().unwrap();
    let store = FileStateStore::new(dir.path().join("state.yaml"));

    store
        .save(&Cursor::new("first", BlockRef::new(1000, "0xaaa")))
        .await
        .unwrap();
    store
        .save(&Cursor::new("second", BlockRef::new(2000, "0xbbb")))
        .await
        .unwrap();

    let loaded = store.read_cursor().await.unwrap().unwrap();
    assert_eq!(loaded.cursor, "second");
    assert_eq!(loaded.block.num, 2000);

    // The temp file from the atomic replace is gone
    assert!(!dir.path().join("state.yaml.tmp").exists());
}

#[tokio::test]
async fn test_state_store_creates_missing_directories() {
    let dir = tempdir().unwrap();
    let store = FileStateStore::new(dir.path().join("nested/deeper/state.yaml"));

    let cursor = Cursor::new("tok", BlockRef::new(5, "0x5"));
    store.save(&cursor).await.unwrap();
    assert_eq!(store.read_cursor().await.unwrap().unwrap(), cursor);
}

#[tokio::test]
async fn test_state_store_rejects_garbage() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state.yaml");
    std::fs::write(&path, ": not valid yaml {{{").unwrap();

    let store = FileStateStore::new(path);
    assert!(store.read_cursor().await.is_err());
}
