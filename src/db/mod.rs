// ABOUTME: Loader owning the database connection, table metadata and journal
// ABOUTME: Mutations accumulate in the journal; flush applies them in one transaction

pub mod cursor;
pub mod dialect;
pub mod flush;
pub mod journal;
pub mod ops;
pub mod schema;
pub mod table;

use std::collections::HashMap;
use std::time::Duration;

use tokio_postgres::NoTls;
use url::Url;

use crate::cursor::OnModuleHashMismatch;
use crate::error::Error;

pub use dialect::{Dialect, Statement};
pub use journal::{Journal, Operation, OperationKind};
pub use table::{ColumnInfo, ScanType, TableInfo, REVERSIBLE_BLOCK_COLUMN};

/// Reserved table holding one cursor row per module hash.
pub const CURSORS_TABLE: &str = "cursors";

/// Applies block-scoped change sets to the target database.
///
/// Mutations (`insert`/`update`/`delete`) land in an in-memory journal;
/// `flush` writes the journal and the cursor in a single transaction. The
/// loader is driven from a single handler task and needs no locking.
pub struct Loader {
    client: tokio_postgres::Client,
    dialect: Dialect,
    database: String,
    schema: String,
    /// Blocks between flushes while processing historical segments.
    /// Zero means the sinker's historical default.
    flush_interval: u64,
    on_module_hash_mismatch: OnModuleHashMismatch,
    tables: HashMap<String, TableInfo>,
    journal: Journal,
}

impl Loader {
    /// Connect to the target database. The dialect is picked from the DSN
    /// scheme; the working schema comes from the `schema` query parameter,
    /// defaulting to `public`.
    pub async fn new(
        dsn: &str,
        flush_interval: u64,
        on_module_hash_mismatch: OnModuleHashMismatch,
    ) -> Result<Self, Error> {
        let url =
            Url::parse(dsn).map_err(|e| Error::Config(format!("invalid DSN {dsn:?}: {e}")))?;
        let dialect = Dialect::from_dsn(&url)?;

        let schema = url
            .query_pairs()
            .find(|(key, _)| key == "schema")
            .map(|(_, value)| value.into_owned())
            .unwrap_or_else(|| "public".to_string());
        let database = url.path().trim_start_matches('/').to_string();
        if database.is_empty() {
            return Err(Error::Config("DSN is missing a database name".to_string()));
        }

        let client = connect_with_retry(&url).await?;

        Ok(Self {
            client,
            dialect,
            database,
            schema,
            flush_interval,
            on_module_hash_mismatch,
            tables: HashMap::new(),
            journal: Journal::new(),
        })
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn flush_interval(&self) -> u64 {
        self.flush_interval
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn table(&self, name: &str) -> Option<&TableInfo> {
        self.tables.get(name)
    }

    /// User table names, sorted for stable error messages and CSV layout.
    pub fn available_tables(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of operations pending in the journal.
    pub fn entries_count(&self) -> usize {
        self.journal.len()
    }

    pub fn create_cursors_table_sql(&self) -> String {
        self.dialect.create_cursors_table_ddl(&self.schema)
    }
}

/// Connect over the postgres wire protocol, retrying transient failures
/// with exponential backoff.
async fn connect_with_retry(url: &Url) -> Result<tokio_postgres::Client, Error> {
    let mut config = tokio_postgres::Config::new();
    if let Some(host) = url.host_str() {
        config.host(host);
    }
    if let Some(port) = url.port() {
        config.port(port);
    }
    if !url.username().is_empty() {
        config.user(url.username());
    }
    if let Some(password) = url.password() {
        config.password(password);
    }
    let dbname = url.path().trim_start_matches('/');
    if !dbname.is_empty() {
        config.dbname(dbname);
    }

    const MAX_ATTEMPTS: u32 = 5;
    let mut attempt = 0;
    loop {
        attempt += 1;
        match config.connect(NoTls).await {
            Ok((client, connection)) => {
                // The connection object drives the socket; it must be
                // polled for the client to make progress.
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        tracing::error!("database connection error: {e}");
                    }
                });
                return Ok(client);
            }
            Err(e) if attempt < MAX_ATTEMPTS => {
                let backoff = Duration::from_secs(1u64 << attempt.min(4));
                tracing::warn!(
                    attempt,
                    "failed to connect to database: {e}, retrying in {backoff:?}"
                );
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}
