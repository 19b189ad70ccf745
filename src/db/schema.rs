// ABOUTME: Schema introspection building TableInfo for every user table
// ABOUTME: Validates the reserved cursors table and returns remediation DDL when broken

use std::collections::HashMap;

use crate::db::table::{ColumnInfo, TableInfo};
use crate::db::{Dialect, Loader, CURSORS_TABLE};
use crate::error::Error;

const LIST_TABLES: &str = "SELECT table_name
     FROM information_schema.tables
     WHERE table_schema = $1 AND table_type = 'BASE TABLE'
     ORDER BY table_name";

const LIST_COLUMNS: &str = "SELECT column_name, data_type, udt_name
     FROM information_schema.columns
     WHERE table_schema = $1 AND table_name = $2
     ORDER BY ordinal_position";

const POSTGRES_PRIMARY_KEY: &str = "SELECT a.attname
     FROM pg_index i
     JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
     JOIN pg_class c ON c.oid = i.indrelid
     JOIN pg_namespace n ON n.oid = c.relnamespace
     WHERE i.indisprimary
       AND n.nspname = $1
       AND c.relname = $2
     ORDER BY array_position(i.indkey, a.attnum)";

const CLICKHOUSE_PRIMARY_KEY: &str = "SELECT name
     FROM system.columns
     WHERE database = $1 AND table = $2 AND is_in_primary_key = 1
     ORDER BY position";

/// Columns the cursors table must have, sorted.
const CURSORS_COLUMNS: [&str; 4] = ["block_id", "block_num", "cursor", "id"];

impl Loader {
    /// Introspect the configured schema and build metadata for every user
    /// table. Fails if any table has no primary key or the cursors table
    /// is missing or malformed.
    pub async fn load_tables(&mut self) -> Result<(), Error> {
        let rows = self.client.query(LIST_TABLES, &[&self.schema]).await?;

        let mut tables = HashMap::new();
        let mut cursors_seen = false;

        for row in rows {
            let table_name: String = row.get(0);
            let columns = self.introspect_columns(&table_name).await?;

            if table_name == CURSORS_TABLE {
                self.validate_cursors_table(&columns)?;
                cursors_seen = true;
                continue;
            }

            let pk_list = self.introspect_primary_key(&table_name).await?;
            if pk_list.is_empty() {
                return Err(Error::NoPrimaryKey {
                    schema: self.schema.clone(),
                    table: table_name,
                });
            }

            let columns_by_name: HashMap<String, ColumnInfo> = columns
                .into_iter()
                .map(|(name, data_type, udt_name)| {
                    let info = ColumnInfo::new(&name, &data_type, &udt_name);
                    (name, info)
                })
                .collect();

            let info = TableInfo::new(&self.schema, &table_name, &pk_list, columns_by_name)?;
            tables.insert(table_name, info);
        }

        if !cursors_seen {
            return Err(Error::InvalidCursorsTable {
                reason: format!("table {}.{CURSORS_TABLE} does not exist", self.schema),
                remediation: self.create_cursors_table_sql(),
            });
        }

        tracing::info!(
            schema = %self.schema,
            tables = tables.len(),
            "loaded table metadata"
        );
        self.tables = tables;
        Ok(())
    }

    async fn introspect_columns(
        &self,
        table_name: &str,
    ) -> Result<Vec<(String, String, String)>, Error> {
        let rows = self
            .client
            .query(LIST_COLUMNS, &[&self.schema, &table_name])
            .await?;
        Ok(rows
            .iter()
            .map(|row| (row.get(0), row.get(1), row.get(2)))
            .collect())
    }

    async fn introspect_primary_key(&self, table_name: &str) -> Result<Vec<String>, Error> {
        let query = match self.dialect {
            Dialect::Postgres => POSTGRES_PRIMARY_KEY,
            Dialect::Clickhouse => CLICKHOUSE_PRIMARY_KEY,
        };
        let rows = self
            .client
            .query(query, &[&self.schema, &table_name])
            .await?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    fn validate_cursors_table(
        &self,
        columns: &[(String, String, String)],
    ) -> Result<(), Error> {
        let mut names: Vec<&str> = columns.iter().map(|(name, _, _)| name.as_str()).collect();
        names.sort_unstable();

        if names != CURSORS_COLUMNS {
            return Err(Error::InvalidCursorsTable {
                reason: format!(
                    "table {}.{CURSORS_TABLE} has columns ({}), expected (id, cursor, block_num, block_id)",
                    self.schema,
                    names.join(", "),
                ),
                remediation: self.create_cursors_table_sql(),
            });
        }
        Ok(())
    }
}
