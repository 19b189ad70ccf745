// ABOUTME: Classified error type shared by the loader, sinkers and bundlers
// ABOUTME: Mutation and handler errors are fatal to the owning sinker task

/// Errors surfaced by the sink.
///
/// Handler and mutate-path errors are fatal: the sinker shuts the upstream
/// stream down and propagates them. Flush errors roll the transaction back
/// and leave the journal intact.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("table {schema}.{table} has no primary key, the sink requires one on every table")]
    NoPrimaryKey { schema: String, table: String },

    #[error("primary key column {column} not found in table {table}")]
    PrimaryKeyColumnMissing { table: String, column: String },

    #[error("unknown table {table}, available tables: {}", available.join(", "))]
    UnknownTable {
        table: String,
        available: Vec<String>,
    },

    #[error("unknown column {column} for table {table}")]
    UnknownColumn { table: String, column: String },

    /// The cursors table is missing or its columns deviate from the
    /// expected set. Carries the DDL needed to create or repair it.
    #[error("cursors table is invalid: {reason}")]
    InvalidCursorsTable { reason: String, remediation: String },

    #[error("no cursor found for module {0}")]
    CursorNotFound(String),

    #[error(
        "cursor in database was saved for module(s) {}, but the manifest resolves to {configured}; \
         pass --on-module-hash-mistmatch 'warn' or 'ignore' to resume from the highest cursor instead",
        known.join(", ")
    )]
    ModuleHashMismatch {
        configured: String,
        known: Vec<String>,
    },

    #[error("received data for output module {received}, expected {expected}")]
    WrongOutputModule { expected: String, received: String },

    #[error("cannot decode map output of unknown type {0}")]
    UnsupportedTypeUrl(String),

    #[error("module {0} not found in package")]
    UnknownModule(String),

    #[error("table change for {table} carries no primary key")]
    MissingPrimaryKey { table: String },

    #[error(
        "the stream sent a single primary key, but table {table} has a composite primary key ({})",
        columns.join(", ")
    )]
    CompositeKeyMismatch { table: String, columns: Vec<String> },

    #[error("{operation} is not supported by the current database")]
    Unsupported { operation: &'static str },

    #[error("delete requires exactly one primary key column, table {table} has {count}")]
    DeleteNeedsSingleKey { table: String, count: usize },

    #[error(
        "primary key {row_id} in table {table} is already scheduled for insertion, \
         insert must be called once per primary key"
    )]
    DuplicateInsert { table: String, row_id: String },

    #[error("primary key {row_id} in table {table} is scheduled for deletion and cannot be updated")]
    UpdateAfterDelete { table: String, row_id: String },

    #[error("column {column} in table {table} cannot hold value {value:?}: {reason}")]
    InvalidValue {
        table: String,
        column: String,
        value: String,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("upstream reported a fatal error: {0}")]
    UpstreamFatal(String),

    #[error("database error: {0}")]
    Sql(#[from] tokio_postgres::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("object store error: {0}")]
    Store(#[from] object_store::Error),

    #[error("protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("grpc transport error: {0}")]
    Connect(#[from] tonic::transport::Error),

    #[error("stream error: {0}")]
    Stream(#[from] tonic::Status),

    #[error("state file error: {0}")]
    State(#[from] serde_yaml::Error),

    #[error("manifest fetch failed: {0}")]
    Manifest(#[from] reqwest::Error),
}

impl Error {
    /// The SQL statement that fixes the problem, when one exists.
    pub fn remediation(&self) -> Option<&str> {
        match self {
            Error::InvalidCursorsTable { remediation, .. } => Some(remediation),
            _ => None,
        }
    }
}
