// ABOUTME: SQL dialects as a capability-bearing sum type
// ABOUTME: Emits parameterised statements and DDL; picked from the DSN scheme

use tokio_postgres::types::ToSql;
use url::Url;

use crate::cursor::Cursor;
use crate::db::journal::{Operation, OperationKind};
use crate::db::table::{escape_identifier, ColumnInfo, TableInfo, REVERSIBLE_BLOCK_COLUMN};
use crate::error::Error;

/// One parameterised statement with its argument list.
pub struct Statement {
    pub sql: String,
    pub params: Vec<Box<dyn ToSql + Sync + Send>>,
}

impl std::fmt::Debug for Statement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Statement")
            .field("sql", &self.sql)
            .field("params", &format!("<{} param(s)>", self.params.len()))
            .finish()
    }
}

/// Target SQL flavor.
///
/// ClickHouse is reached over its PostgreSQL wire-compatibility port, so
/// the dialect only has to cover text and capability differences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Clickhouse,
}

impl Dialect {
    pub fn from_dsn(dsn: &Url) -> Result<Self, Error> {
        match dsn.scheme() {
            "postgres" | "postgresql" | "psql" => Ok(Dialect::Postgres),
            "clickhouse" => Ok(Dialect::Clickhouse),
            other => Err(Error::Config(format!(
                "unsupported DSN scheme {other:?}, expected postgres:// or clickhouse://"
            ))),
        }
    }

    /// ClickHouse is append-only for our purposes; the loader rejects
    /// updates and deletes outright.
    pub fn only_inserts(self) -> bool {
        matches!(self, Dialect::Clickhouse)
    }

    /// Whether rows can carry the reversible block marker and be rolled
    /// back by a revert.
    pub fn supports_reversibility(self) -> bool {
        matches!(self, Dialect::Postgres)
    }

    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::Clickhouse => "?".to_string(),
        }
    }

    fn value_placeholder(self, index: usize, column: &ColumnInfo) -> String {
        match (self, column.scan_type.placeholder_cast()) {
            (Dialect::Postgres, Some(cast)) => {
                format!("{}::{}", self.placeholder(index), cast)
            }
            _ => self.placeholder(index),
        }
    }

    pub fn create_cursors_table_ddl(self, schema: &str) -> String {
        let schema = escape_identifier(schema);
        match self {
            Dialect::Postgres => format!(
                "CREATE TABLE IF NOT EXISTS {schema}.{} (\n\
                 \tid TEXT PRIMARY KEY,\n\
                 \tcursor TEXT,\n\
                 \tblock_num BIGINT,\n\
                 \tblock_id TEXT\n\
                 );",
                escape_identifier("cursors")
            ),
            Dialect::Clickhouse => format!(
                "CREATE TABLE IF NOT EXISTS {schema}.{} (\n\
                 \tid String,\n\
                 \tcursor String,\n\
                 \tblock_num UInt64,\n\
                 \tblock_id String\n\
                 ) ENGINE = ReplacingMergeTree() ORDER BY id;",
                escape_identifier("cursors")
            ),
        }
    }

    /// Build the statement for one journal operation.
    pub fn operation_statement(
        self,
        table: &TableInfo,
        op: &Operation,
    ) -> Result<Statement, Error> {
        match op.kind {
            OperationKind::Insert => self.insert_statement(table, op),
            OperationKind::Update => self.update_statement(table, op),
            OperationKind::Delete => self.delete_statement(table, op),
        }
    }

    fn insert_statement(self, table: &TableInfo, op: &Operation) -> Result<Statement, Error> {
        let mut columns = Vec::with_capacity(op.data.len() + 1);
        let mut placeholders = Vec::with_capacity(op.data.len() + 1);
        let mut params: Vec<Box<dyn ToSql + Sync + Send>> = Vec::with_capacity(op.data.len() + 1);

        for (name, value) in &op.data {
            let column = table.column(name).ok_or_else(|| Error::UnknownColumn {
                table: table.name.clone(),
                column: name.clone(),
            })?;
            columns.push(column.escaped_name.clone());
            placeholders.push(self.value_placeholder(params.len() + 1, column));
            params.push(column.bind_value(&table.name, value)?);
        }

        if let Some(block_num) = self.reversible_marker(table, op) {
            columns.push(escape_identifier(REVERSIBLE_BLOCK_COLUMN));
            placeholders.push(self.placeholder(params.len() + 1));
            params.push(Box::new(block_num));
        }

        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table.identifier,
            columns.join(", "),
            placeholders.join(", "),
        );
        Ok(Statement { sql, params })
    }

    fn update_statement(self, table: &TableInfo, op: &Operation) -> Result<Statement, Error> {
        let mut assignments = Vec::with_capacity(op.data.len() + 1);
        let mut params: Vec<Box<dyn ToSql + Sync + Send>> = Vec::with_capacity(op.data.len() + 1);

        for (name, value) in &op.data {
            let column = table.column(name).ok_or_else(|| Error::UnknownColumn {
                table: table.name.clone(),
                column: name.clone(),
            })?;
            assignments.push(format!(
                "{} = {}",
                column.escaped_name,
                self.value_placeholder(params.len() + 1, column)
            ));
            params.push(column.bind_value(&table.name, value)?);
        }

        if let Some(block_num) = self.reversible_marker(table, op) {
            assignments.push(format!(
                "{} = {}",
                escape_identifier(REVERSIBLE_BLOCK_COLUMN),
                self.placeholder(params.len() + 1)
            ));
            params.push(Box::new(block_num));
        }

        let mut conditions = Vec::with_capacity(table.primary_columns.len());
        for column in &table.primary_columns {
            let value = op
                .primary_key
                .get(&column.name)
                .ok_or_else(|| Error::PrimaryKeyColumnMissing {
                    table: table.name.clone(),
                    column: column.name.clone(),
                })?;
            conditions.push(format!(
                "{} = {}",
                column.escaped_name,
                self.value_placeholder(params.len() + 1, column)
            ));
            params.push(column.bind_value(&table.name, value)?);
        }

        let sql = format!(
            "UPDATE {} SET {} WHERE {}",
            table.identifier,
            assignments.join(", "),
            conditions.join(" AND "),
        );
        Ok(Statement { sql, params })
    }

    fn delete_statement(self, table: &TableInfo, op: &Operation) -> Result<Statement, Error> {
        let mut conditions = Vec::with_capacity(table.primary_columns.len());
        let mut params: Vec<Box<dyn ToSql + Sync + Send>> =
            Vec::with_capacity(table.primary_columns.len());

        for column in &table.primary_columns {
            let value = op
                .primary_key
                .get(&column.name)
                .ok_or_else(|| Error::PrimaryKeyColumnMissing {
                    table: table.name.clone(),
                    column: column.name.clone(),
                })?;
            conditions.push(format!(
                "{} = {}",
                column.escaped_name,
                self.value_placeholder(params.len() + 1, column)
            ));
            params.push(column.bind_value(&table.name, value)?);
        }

        let sql = format!(
            "DELETE FROM {} WHERE {}",
            table.identifier,
            conditions.join(" AND "),
        );
        Ok(Statement { sql, params })
    }

    fn reversible_marker(self, table: &TableInfo, op: &Operation) -> Option<i64> {
        if !self.supports_reversibility() || !table.has_reversible_block_column() {
            return None;
        }
        op.reversible_block.map(|b| b as i64)
    }

    /// Delete every row written above `last_valid_block`, or `None` when
    /// the table does not carry the marker column.
    pub fn revert_statement(
        self,
        table: &TableInfo,
        last_valid_block: u64,
    ) -> Option<Statement> {
        if !self.supports_reversibility() || !table.has_reversible_block_column() {
            return None;
        }
        Some(Statement {
            sql: format!(
                "DELETE FROM {} WHERE {} > {}",
                table.identifier,
                escape_identifier(REVERSIBLE_BLOCK_COLUMN),
                self.placeholder(1),
            ),
            params: vec![Box::new(last_valid_block as i64)],
        })
    }

    /// Clear markers on rows that have become final, keeping the
    /// reversibility window bounded.
    pub fn prune_reversible_statement(
        self,
        table: &TableInfo,
        final_block: u64,
    ) -> Option<Statement> {
        if !self.supports_reversibility() || !table.has_reversible_block_column() {
            return None;
        }
        let marker = escape_identifier(REVERSIBLE_BLOCK_COLUMN);
        Some(Statement {
            sql: format!(
                "UPDATE {} SET {marker} = NULL WHERE {marker} <= {}",
                table.identifier,
                self.placeholder(1),
            ),
            params: vec![Box::new(final_block as i64)],
        })
    }

    pub fn insert_cursor_statement(
        self,
        schema: &str,
        module_hash: &str,
        cursor: &Cursor,
    ) -> Statement {
        Statement {
            sql: format!(
                "INSERT INTO {}.{} (id, cursor, block_num, block_id) VALUES ({}, {}, {}, {})",
                escape_identifier(schema),
                escape_identifier("cursors"),
                self.placeholder(1),
                self.placeholder(2),
                self.placeholder(3),
                self.placeholder(4),
            ),
            params: vec![
                Box::new(module_hash.to_string()),
                Box::new(cursor.cursor.clone()),
                Box::new(cursor.block.num as i64),
                Box::new(cursor.block.id.clone()),
            ],
        }
    }

    /// Advance the cursor row. ClickHouse has no UPDATE, so it re-inserts
    /// and lets ReplacingMergeTree collapse on the id.
    pub fn update_cursor_statement(
        self,
        schema: &str,
        module_hash: &str,
        cursor: &Cursor,
    ) -> Statement {
        match self {
            Dialect::Postgres => Statement {
                sql: format!(
                    "UPDATE {}.{} SET cursor = $1, block_num = $2, block_id = $3 WHERE id = $4",
                    escape_identifier(schema),
                    escape_identifier("cursors"),
                ),
                params: vec![
                    Box::new(cursor.cursor.clone()),
                    Box::new(cursor.block.num as i64),
                    Box::new(cursor.block.id.clone()),
                    Box::new(module_hash.to_string()),
                ],
            },
            Dialect::Clickhouse => self.insert_cursor_statement(schema, module_hash, cursor),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::cursor::BlockRef;
    use crate::db::table::test_table;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn insert_op(table: &str, pk: &[(&str, &str)], data: &[(&str, &str)]) -> Operation {
        Operation {
            kind: OperationKind::Insert,
            table: table.to_string(),
            primary_key: map(pk),
            data: map(data),
            reversible_block: None,
        }
    }

    #[test]
    fn test_dialect_from_dsn() {
        let dsn = Url::parse("postgres://u:p@localhost:5432/db").unwrap();
        assert_eq!(Dialect::from_dsn(&dsn).unwrap(), Dialect::Postgres);

        let dsn = Url::parse("clickhouse://u:p@localhost:9005/db").unwrap();
        assert_eq!(Dialect::from_dsn(&dsn).unwrap(), Dialect::Clickhouse);

        let dsn = Url::parse("mysql://u:p@localhost/db").unwrap();
        assert!(Dialect::from_dsn(&dsn).is_err());
    }

    #[test]
    fn test_capabilities() {
        assert!(!Dialect::Postgres.only_inserts());
        assert!(Dialect::Postgres.supports_reversibility());
        assert!(Dialect::Clickhouse.only_inserts());
        assert!(!Dialect::Clickhouse.supports_reversibility());
    }

    #[test]
    fn test_insert_statement_postgres() {
        let table = test_table("users", &["id"], &["id", "name"]);
        let op = insert_op("users", &[("id", "42")], &[("id", "42"), ("name", "Ada")]);

        let stmt = Dialect::Postgres.operation_statement(&table, &op).unwrap();
        assert_eq!(
            stmt.sql,
            "INSERT INTO \"public\".\"users\" (\"id\", \"name\") VALUES ($1, $2)"
        );
        assert_eq!(stmt.params.len(), 2);
    }

    #[test]
    fn test_insert_statement_clickhouse_placeholders() {
        let table = test_table("users", &["id"], &["id", "name"]);
        let op = insert_op("users", &[("id", "42")], &[("id", "42"), ("name", "Ada")]);

        let stmt = Dialect::Clickhouse.operation_statement(&table, &op).unwrap();
        assert_eq!(
            stmt.sql,
            "INSERT INTO \"public\".\"users\" (\"id\", \"name\") VALUES (?, ?)"
        );
    }

    #[test]
    fn test_insert_records_reversible_block_when_column_present() {
        let table = test_table("users", &["id"], &["id", "name", REVERSIBLE_BLOCK_COLUMN]);
        let mut op = insert_op("users", &[("id", "42")], &[("id", "42")]);
        op.reversible_block = Some(100);

        let stmt = Dialect::Postgres.operation_statement(&table, &op).unwrap();
        assert!(stmt.sql.contains("\"__block_num__\""));
        assert_eq!(stmt.params.len(), 2);
    }

    #[test]
    fn test_insert_skips_reversible_block_without_column() {
        let table = test_table("users", &["id"], &["id", "name"]);
        let mut op = insert_op("users", &[("id", "42")], &[("id", "42")]);
        op.reversible_block = Some(100);

        let stmt = Dialect::Postgres.operation_statement(&table, &op).unwrap();
        assert!(!stmt.sql.contains("__block_num__"));
    }

    #[test]
    fn test_update_statement() {
        let table = test_table("users", &["id"], &["id", "name"]);
        let op = Operation {
            kind: OperationKind::Update,
            table: "users".to_string(),
            primary_key: map(&[("id", "42")]),
            data: map(&[("name", "Grace")]),
            reversible_block: None,
        };

        let stmt = Dialect::Postgres.operation_statement(&table, &op).unwrap();
        assert_eq!(
            stmt.sql,
            "UPDATE \"public\".\"users\" SET \"name\" = $1 WHERE \"id\" = $2"
        );
        assert_eq!(stmt.params.len(), 2);
    }

    #[test]
    fn test_delete_statement() {
        let table = test_table("users", &["id"], &["id", "name"]);
        let op = Operation {
            kind: OperationKind::Delete,
            table: "users".to_string(),
            primary_key: map(&[("id", "42")]),
            data: BTreeMap::new(),
            reversible_block: None,
        };

        let stmt = Dialect::Postgres.operation_statement(&table, &op).unwrap();
        assert_eq!(stmt.sql, "DELETE FROM \"public\".\"users\" WHERE \"id\" = $1");
        assert_eq!(stmt.params.len(), 1);
    }

    #[test]
    fn test_unknown_column_rejected() {
        let table = test_table("users", &["id"], &["id"]);
        let op = insert_op("users", &[("id", "42")], &[("ghost", "1")]);
        let err = Dialect::Postgres.operation_statement(&table, &op).unwrap_err();
        assert!(matches!(err, Error::UnknownColumn { .. }));
    }

    #[test]
    fn test_revert_statement() {
        let with_marker = test_table("users", &["id"], &["id", REVERSIBLE_BLOCK_COLUMN]);
        let stmt = Dialect::Postgres.revert_statement(&with_marker, 95).unwrap();
        assert_eq!(
            stmt.sql,
            "DELETE FROM \"public\".\"users\" WHERE \"__block_num__\" > $1"
        );

        let without_marker = test_table("users", &["id"], &["id"]);
        assert!(Dialect::Postgres.revert_statement(&without_marker, 95).is_none());
        assert!(Dialect::Clickhouse.revert_statement(&with_marker, 95).is_none());
    }

    #[test]
    fn test_cursor_statements() {
        let cursor = Cursor::new("tok", BlockRef::new(110, "0xabc"));

        let stmt = Dialect::Postgres.update_cursor_statement("public", "deadbeef", &cursor);
        assert_eq!(
            stmt.sql,
            "UPDATE \"public\".\"cursors\" SET cursor = $1, block_num = $2, block_id = $3 WHERE id = $4"
        );

        let stmt = Dialect::Clickhouse.update_cursor_statement("public", "deadbeef", &cursor);
        assert!(stmt.sql.starts_with("INSERT INTO \"public\".\"cursors\""));
        assert_eq!(stmt.params.len(), 4);
    }

    #[test]
    fn test_cursors_table_ddl() {
        let ddl = Dialect::Postgres.create_cursors_table_ddl("public");
        assert!(ddl.contains("id TEXT PRIMARY KEY"));
        assert!(ddl.contains("block_num BIGINT"));

        let ddl = Dialect::Clickhouse.create_cursors_table_ddl("public");
        assert!(ddl.contains("ReplacingMergeTree"));
    }
}
