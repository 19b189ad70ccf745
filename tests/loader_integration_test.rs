// ABOUTME: Integration tests for the loader against a real PostgreSQL database
// ABOUTME: Covers flush, revert, merge-through-flush and the insert-only dialect rejections

use std::collections::BTreeMap;
use std::env;

use substreams_sql_sink::db::Loader;
use substreams_sql_sink::{BlockRef, Cursor, Error, OnModuleHashMismatch};

/// Helper to get the test database URL from the environment
fn get_test_url() -> Option<String> {
    env::var("TEST_DATABASE_URL").ok()
}

fn pk(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// DSN scoped to a dedicated schema so tests never see each other's tables
fn dsn_for(url: &str, schema: &str) -> String {
    if url.contains('?') {
        format!("{url}&schema={schema}")
    } else {
        format!("{url}?schema={schema}")
    }
}

async fn connect_raw(url: &str) -> tokio_postgres::Client {
    let (client, connection) = tokio_postgres::connect(url, tokio_postgres::NoTls)
        .await
        .expect("Failed to connect to test database");
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

/// Helper to create a fresh schema with one user table and the cursors table
async fn setup_schema(client: &tokio_postgres::Client, schema: &str) {
    client
        .batch_execute(&format!(
            r#"
            DROP SCHEMA IF EXISTS "{schema}" CASCADE;
            CREATE SCHEMA "{schema}";
            CREATE TABLE "{schema}"."users" (
                id TEXT PRIMARY KEY,
                name TEXT,
                __block_num__ BIGINT
            );
            CREATE TABLE "{schema}"."cursors" (
                id TEXT PRIMARY KEY,
                cursor TEXT,
                block_num BIGINT,
                block_id TEXT
            );
            "#
        ))
        .await
        .expect("Failed to setup test schema");
}

async fn cleanup_schema(client: &tokio_postgres::Client, schema: &str) {
    let _ = client
        .batch_execute(&format!(r#"DROP SCHEMA IF EXISTS "{schema}" CASCADE"#))
        .await;
}

/// Test: flush applies journaled rows and the cursor in one transaction
#[tokio::test]
#[ignore]
async fn test_flush_applies_rows_and_advances_cursor() {
    let url = get_test_url().expect("TEST_DATABASE_URL must be set");
    let schema = "sink_test_flush";

    let raw = connect_raw(&url).await;
    setup_schema(&raw, schema).await;

    let mut loader = Loader::new(&dsn_for(&url, schema), 10, OnModuleHashMismatch::Error)
        .await
        .expect("Failed to connect loader");
    loader.load_tables().await.expect("Failed to load tables");

    loader
        .insert_cursor("hash-1", &Cursor::blank())
        .await
        .expect("Failed to write blank cursor");

    loader
        .insert("users", pk(&[("id", "42")]), pk(&[("name", "Ada")]), None)
        .expect("Failed to schedule insert");
    loader
        .insert("users", pk(&[("id", "43")]), pk(&[("name", "Grace")]), None)
        .expect("Failed to schedule insert");
    assert_eq!(loader.entries_count(), 2);

    let cursor = Cursor::new("cursor-110", BlockRef::new(110, "0xb110"));
    let rows = loader
        .flush("hash-1", &cursor, 110)
        .await
        .expect("Flush failed");

    assert_eq!(rows, 2, "Should have flushed 2 rows");
    assert_eq!(loader.entries_count(), 0, "Journal should be empty after flush");

    let count: i64 = raw
        .query_one(&format!(r#"SELECT COUNT(*) FROM "{schema}"."users""#), &[])
        .await
        .expect("Failed to count rows")
        .get(0);
    assert_eq!(count, 2, "Both rows should be in the database");

    let block_num: i64 = raw
        .query_one(
            &format!(r#"SELECT block_num FROM "{schema}"."cursors" WHERE id = 'hash-1'"#),
            &[],
        )
        .await
        .expect("Failed to read cursor row")
        .get(0);
    assert_eq!(block_num, 110, "Cursor should have advanced to block 110");

    println!("✓ Flush applied {rows} rows and advanced the cursor to block {block_num}");

    cleanup_schema(&raw, schema).await;
}

/// Test: an update merges into a pending insert, observable after flush
#[tokio::test]
#[ignore]
async fn test_update_merges_into_insert_through_flush() {
    let url = get_test_url().expect("TEST_DATABASE_URL must be set");
    let schema = "sink_test_merge";

    let raw = connect_raw(&url).await;
    setup_schema(&raw, schema).await;

    let mut loader = Loader::new(&dsn_for(&url, schema), 0, OnModuleHashMismatch::Error)
        .await
        .expect("Failed to connect loader");
    loader.load_tables().await.expect("Failed to load tables");
    loader
        .insert_cursor("hash-1", &Cursor::blank())
        .await
        .expect("Failed to write blank cursor");

    loader
        .insert("users", pk(&[("id", "42")]), pk(&[("name", "Ada")]), None)
        .expect("Failed to schedule insert");
    loader
        .update("users", pk(&[("id", "42")]), pk(&[("name", "Grace")]), None)
        .expect("Failed to schedule update");

    let cursor = Cursor::new("cursor-100", BlockRef::new(100, "0xb100"));
    let rows = loader
        .flush("hash-1", &cursor, 100)
        .await
        .expect("Flush failed");
    assert_eq!(rows, 1, "Merged operations flush as a single statement");

    let name: String = raw
        .query_one(
            &format!(r#"SELECT name FROM "{schema}"."users" WHERE id = '42'"#),
            &[],
        )
        .await
        .expect("Failed to read row")
        .get(0);
    assert_eq!(name, "Grace", "The merged insert should carry the updated field");

    println!("✓ Update merged into pending insert, row landed with name={name}");

    cleanup_schema(&raw, schema).await;
}

/// Test: insert followed by delete in the same window never reaches the table
#[tokio::test]
#[ignore]
async fn test_insert_then_delete_never_reaches_table() {
    let url = get_test_url().expect("TEST_DATABASE_URL must be set");
    let schema = "sink_test_delete";

    let raw = connect_raw(&url).await;
    setup_schema(&raw, schema).await;

    let mut loader = Loader::new(&dsn_for(&url, schema), 0, OnModuleHashMismatch::Error)
        .await
        .expect("Failed to connect loader");
    loader.load_tables().await.expect("Failed to load tables");
    loader
        .insert_cursor("hash-1", &Cursor::blank())
        .await
        .expect("Failed to write blank cursor");

    loader
        .insert("users", pk(&[("id", "42")]), pk(&[("name", "Ada")]), None)
        .expect("Failed to schedule insert");
    loader
        .delete("users", pk(&[("id", "42")]), None)
        .expect("Failed to schedule delete");

    let cursor = Cursor::new("cursor-100", BlockRef::new(100, "0xb100"));
    loader
        .flush("hash-1", &cursor, 100)
        .await
        .expect("Flush failed");

    let count: i64 = raw
        .query_one(&format!(r#"SELECT COUNT(*) FROM "{schema}"."users""#), &[])
        .await
        .expect("Failed to count rows")
        .get(0);
    assert_eq!(count, 0, "The primary key should never reach the database");

    println!("✓ Insert+delete in one window left the table empty");

    cleanup_schema(&raw, schema).await;
}

/// Test: double insert for the same primary key is a conflict, no flush
#[tokio::test]
#[ignore]
async fn test_double_insert_is_a_conflict() {
    let url = get_test_url().expect("TEST_DATABASE_URL must be set");
    let schema = "sink_test_conflict";

    let raw = connect_raw(&url).await;
    setup_schema(&raw, schema).await;

    let mut loader = Loader::new(&dsn_for(&url, schema), 0, OnModuleHashMismatch::Error)
        .await
        .expect("Failed to connect loader");
    loader.load_tables().await.expect("Failed to load tables");

    loader
        .insert("users", pk(&[("id", "42")]), pk(&[("name", "Ada")]), None)
        .expect("Failed to schedule insert");
    let err = loader
        .insert("users", pk(&[("id", "42")]), pk(&[("name", "Grace")]), None)
        .expect_err("Second insert for the same key must fail");
    assert!(matches!(err, Error::DuplicateInsert { .. }));

    println!("✓ Double insert rejected with a conflict error");

    cleanup_schema(&raw, schema).await;
}

/// Test: revert removes rows above the last valid block and moves the cursor back
#[tokio::test]
#[ignore]
async fn test_revert_removes_forked_rows() {
    let url = get_test_url().expect("TEST_DATABASE_URL must be set");
    let schema = "sink_test_revert";

    let raw = connect_raw(&url).await;
    setup_schema(&raw, schema).await;

    let mut loader = Loader::new(&dsn_for(&url, schema), 0, OnModuleHashMismatch::Error)
        .await
        .expect("Failed to connect loader");
    loader.load_tables().await.expect("Failed to load tables");
    loader
        .insert_cursor("hash-1", &Cursor::blank())
        .await
        .expect("Failed to write blank cursor");

    // Block 100 is above the final block 90, so the row carries the
    // reversibility marker and survives the flush-time prune.
    loader
        .insert(
            "users",
            pk(&[("id", "42")]),
            pk(&[("name", "Ada")]),
            Some(100),
        )
        .expect("Failed to schedule insert");
    let cursor = Cursor::new("cursor-100", BlockRef::new(100, "0xb100"));
    loader
        .flush("hash-1", &cursor, 90)
        .await
        .expect("Flush failed");

    let marker: i64 = raw
        .query_one(
            &format!(r#"SELECT __block_num__ FROM "{schema}"."users" WHERE id = '42'"#),
            &[],
        )
        .await
        .expect("Failed to read marker")
        .get(0);
    assert_eq!(marker, 100, "The reversibility marker should be recorded");

    let undo_cursor = Cursor::new("cursor-95", BlockRef::new(95, "0xb95"));
    loader
        .revert("hash-1", &undo_cursor, 95)
        .await
        .expect("Revert failed");

    let count: i64 = raw
        .query_one(&format!(r#"SELECT COUNT(*) FROM "{schema}"."users""#), &[])
        .await
        .expect("Failed to count rows")
        .get(0);
    assert_eq!(count, 0, "Rows above the last valid block should be gone");

    let block_num: i64 = raw
        .query_one(
            &format!(r#"SELECT block_num FROM "{schema}"."cursors" WHERE id = 'hash-1'"#),
            &[],
        )
        .await
        .expect("Failed to read cursor row")
        .get(0);
    assert_eq!(block_num, 95, "Cursor should have moved back to block 95");

    println!("✓ Revert deleted the forked row and moved the cursor back to {block_num}");

    cleanup_schema(&raw, schema).await;
}

/// Test: markers at or below the final block are pruned on flush
#[tokio::test]
#[ignore]
async fn test_flush_prunes_final_markers() {
    let url = get_test_url().expect("TEST_DATABASE_URL must be set");
    let schema = "sink_test_prune";

    let raw = connect_raw(&url).await;
    setup_schema(&raw, schema).await;

    let mut loader = Loader::new(&dsn_for(&url, schema), 0, OnModuleHashMismatch::Error)
        .await
        .expect("Failed to connect loader");
    loader.load_tables().await.expect("Failed to load tables");
    loader
        .insert_cursor("hash-1", &Cursor::blank())
        .await
        .expect("Failed to write blank cursor");

    loader
        .insert(
            "users",
            pk(&[("id", "42")]),
            pk(&[("name", "Ada")]),
            Some(100),
        )
        .expect("Failed to schedule insert");
    loader
        .flush(
            "hash-1",
            &Cursor::new("cursor-100", BlockRef::new(100, "0xb100")),
            90,
        )
        .await
        .expect("First flush failed");

    // The chain finalised past block 100; the next flush clears the marker.
    loader
        .flush(
            "hash-1",
            &Cursor::new("cursor-120", BlockRef::new(120, "0xb120")),
            120,
        )
        .await
        .expect("Second flush failed");

    let marker: Option<i64> = raw
        .query_one(
            &format!(r#"SELECT __block_num__ FROM "{schema}"."users" WHERE id = '42'"#),
            &[],
        )
        .await
        .expect("Failed to read marker")
        .get(0);
    assert_eq!(marker, None, "Finalised rows should lose their marker");

    println!("✓ Flush pruned the reversibility marker once the block was final");

    cleanup_schema(&raw, schema).await;
}

/// Test: the insert-only dialect rejects updates and deletes outright
#[tokio::test]
#[ignore]
async fn test_insert_only_dialect_rejects_updates_and_deletes() {
    let url = get_test_url().expect("TEST_DATABASE_URL must be set");

    // The dialect is picked from the DSN scheme; the wire protocol stays
    // postgres-compatible, so the shared test database can stand in.
    let ch_url = url
        .replacen("postgresql://", "clickhouse://", 1)
        .replacen("postgres://", "clickhouse://", 1);

    let mut loader = Loader::new(&ch_url, 0, OnModuleHashMismatch::Error)
        .await
        .expect("Failed to connect loader");

    let err = loader
        .update("users", pk(&[("id", "42")]), pk(&[("name", "Ada")]), None)
        .expect_err("Update must be rejected by an insert-only dialect");
    assert!(matches!(err, Error::Unsupported { .. }));

    let err = loader
        .delete("users", pk(&[("id", "42")]), None)
        .expect_err("Delete must be rejected by an insert-only dialect");
    assert!(matches!(err, Error::Unsupported { .. }));

    println!("✓ Insert-only dialect rejected update and delete");
}

/// Test: module hash mismatch follows the configured policy
#[tokio::test]
#[ignore]
async fn test_module_hash_mismatch_policy() {
    let url = get_test_url().expect("TEST_DATABASE_URL must be set");
    let schema = "sink_test_mismatch";

    let raw = connect_raw(&url).await;
    setup_schema(&raw, schema).await;

    let strict = Loader::new(&dsn_for(&url, schema), 0, OnModuleHashMismatch::Error)
        .await
        .expect("Failed to connect loader");
    strict
        .insert_cursor(
            "hash-old",
            &Cursor::new("cursor-100", BlockRef::new(100, "0xb100")),
        )
        .await
        .expect("Failed to write cursor");

    let err = strict
        .get_cursor("hash-new")
        .await
        .expect_err("A different hash must fail under the error policy");
    assert!(matches!(err, Error::ModuleHashMismatch { .. }));

    let lenient = Loader::new(&dsn_for(&url, schema), 0, OnModuleHashMismatch::Warn)
        .await
        .expect("Failed to connect loader");
    let (cursor, mismatch) = lenient
        .get_cursor("hash-new")
        .await
        .expect("Warn policy should adopt the highest cursor");
    assert!(mismatch, "Adoption must be flagged");
    assert_eq!(cursor.block.num, 100, "The highest cursor wins");

    println!("✓ Mismatch policy: error rejected, warn adopted block {}", cursor.block.num);

    cleanup_schema(&raw, schema).await;
}
