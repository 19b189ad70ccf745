// ABOUTME: Flush and revert: the only paths that write to the database
// ABOUTME: Row operations and the cursor commit atomically in one transaction

use std::time::Instant;

use tokio_postgres::types::ToSql;
use tokio_postgres::Transaction;

use crate::cursor::Cursor;
use crate::db::{Loader, Statement};
use crate::error::Error;

impl Loader {
    /// Apply every pending journal operation plus the cursor advance in a
    /// single transaction, then clear the journal.
    ///
    /// Statements run in (table-first-seen, row-insertion) order. On error
    /// the transaction rolls back and the journal is left intact; callers
    /// treat that as fatal.
    pub async fn flush(
        &mut self,
        module_hash: &str,
        cursor: &Cursor,
        final_block: u64,
    ) -> Result<usize, Error> {
        let start = Instant::now();
        let tx = self.client.transaction().await?;

        let mut rows_flushed = 0usize;
        for (table_name, ops) in self.journal.iter() {
            let table = self
                .tables
                .get(table_name)
                .ok_or_else(|| Error::UnknownTable {
                    table: table_name.to_string(),
                    available: Vec::new(),
                })?;
            for (_row_id, op) in ops.iter() {
                let stmt = self.dialect.operation_statement(table, op)?;
                execute(&tx, &stmt).await?;
                rows_flushed += 1;
            }
        }

        // Rows at or below the final block can no longer be undone; drop
        // their reversibility markers.
        if self.dialect.supports_reversibility() {
            for table in self.tables.values() {
                if let Some(stmt) = self.dialect.prune_reversible_statement(table, final_block) {
                    execute(&tx, &stmt).await?;
                }
            }
        }

        let stmt = self
            .dialect
            .update_cursor_statement(&self.schema, module_hash, cursor);
        execute(&tx, &stmt).await?;

        tx.commit().await?;

        self.journal.clear();
        tracing::debug!(
            rows = rows_flushed,
            block = %cursor.block,
            took = ?start.elapsed(),
            "flushed journal"
        );
        Ok(rows_flushed)
    }

    /// Roll back every row written above `last_valid_block` and move the
    /// cursor back, atomically.
    ///
    /// The upstream re-sends the canonical segment after an undo signal,
    /// which recreates any row that survives the fork.
    pub async fn revert(
        &mut self,
        module_hash: &str,
        cursor: &Cursor,
        last_valid_block: u64,
    ) -> Result<(), Error> {
        if !self.dialect.supports_reversibility() {
            return Err(Error::Unsupported {
                operation: "revert",
            });
        }

        tracing::info!(
            last_valid_block,
            cursor = %cursor,
            "undo signal received, reverting forked rows"
        );

        let tx = self.client.transaction().await?;

        // Deterministic table order keeps revert behavior observable.
        let mut names: Vec<&String> = self.tables.keys().collect();
        names.sort();
        for name in names {
            let table = &self.tables[name];
            if let Some(stmt) = self.dialect.revert_statement(table, last_valid_block) {
                let deleted = execute(&tx, &stmt).await?;
                if deleted > 0 {
                    tracing::info!(table = %table.name, deleted, "deleted forked rows");
                }
            }
        }

        let stmt = self
            .dialect
            .update_cursor_statement(&self.schema, module_hash, cursor);
        execute(&tx, &stmt).await?;

        tx.commit().await?;
        Ok(())
    }
}

async fn execute(tx: &Transaction<'_>, stmt: &Statement) -> Result<u64, Error> {
    let params: Vec<&(dyn ToSql + Sync)> = stmt
        .params
        .iter()
        .map(|p| p.as_ref() as &(dyn ToSql + Sync))
        .collect();
    Ok(tx.execute(stmt.sql.as_str(), &params).await?)
}
