// ABOUTME: Cursor persistence: one row per module hash in the cursors table
// ABOUTME: Resolves module-hash mismatches according to the configured policy

use crate::cursor::{BlockRef, Cursor, OnModuleHashMismatch};
use crate::db::table::escape_identifier;
use crate::db::{Loader, Statement, CURSORS_TABLE};
use crate::error::Error;

impl Loader {
    /// Read the cursor saved for `module_hash`.
    ///
    /// Returns the cursor and whether it was taken from a different module
    /// hash under the warn/ignore mismatch policy. `Error::CursorNotFound`
    /// means the table holds no cursor at all.
    pub async fn get_cursor(&self, module_hash: &str) -> Result<(Cursor, bool), Error> {
        let sql = format!(
            "SELECT cursor, block_num, block_id FROM {}.{} WHERE id = $1",
            escape_identifier(&self.schema),
            escape_identifier(CURSORS_TABLE),
        );
        if let Some(row) = self.client.query_opt(&sql, &[&module_hash]).await? {
            let cursor: Option<String> = row.get(0);
            let block_num: Option<i64> = row.get(1);
            let block_id: Option<String> = row.get(2);
            return Ok((
                Cursor::new(
                    cursor.unwrap_or_default(),
                    BlockRef::new(block_num.unwrap_or(0) as u64, block_id.unwrap_or_default()),
                ),
                false,
            ));
        }

        // No row for this hash. Any cursor under another hash means the
        // manifest changed since the last run.
        let others = self.all_cursors().await?;
        if others.is_empty() {
            return Err(Error::CursorNotFound(module_hash.to_string()));
        }

        let known: Vec<String> = others.iter().map(|(hash, _)| hash.clone()).collect();
        match self.on_module_hash_mismatch {
            OnModuleHashMismatch::Error => Err(Error::ModuleHashMismatch {
                configured: module_hash.to_string(),
                known,
            }),
            OnModuleHashMismatch::Warn => {
                let (hash, cursor) = &others[0];
                tracing::warn!(
                    configured = module_hash,
                    found = %hash,
                    block = %cursor.block,
                    "module hash in database differs from manifest, resuming from highest cursor"
                );
                Ok((cursor.clone(), true))
            }
            OnModuleHashMismatch::Ignore => Ok((others[0].1.clone(), true)),
        }
    }

    /// Every saved cursor, highest block first.
    pub async fn all_cursors(&self) -> Result<Vec<(String, Cursor)>, Error> {
        let sql = format!(
            "SELECT id, cursor, block_num, block_id FROM {}.{} ORDER BY block_num DESC",
            escape_identifier(&self.schema),
            escape_identifier(CURSORS_TABLE),
        );
        let rows = self.client.query(&sql, &[]).await?;
        Ok(rows
            .iter()
            .map(|row| {
                let id: String = row.get(0);
                let cursor: Option<String> = row.get(1);
                let block_num: Option<i64> = row.get(2);
                let block_id: Option<String> = row.get(3);
                (
                    id,
                    Cursor::new(
                        cursor.unwrap_or_default(),
                        BlockRef::new(
                            block_num.unwrap_or(0) as u64,
                            block_id.unwrap_or_default(),
                        ),
                    ),
                )
            })
            .collect())
    }

    /// Write a cursor row for `module_hash`. Used for the startup blank
    /// sentinel and when adopting a cursor after a hash mismatch; flushes
    /// only ever UPDATE.
    pub async fn insert_cursor(&self, module_hash: &str, cursor: &Cursor) -> Result<(), Error> {
        let stmt = self
            .dialect
            .insert_cursor_statement(&self.schema, module_hash, cursor);
        self.execute_statement(&stmt).await?;
        Ok(())
    }

    pub(crate) async fn execute_statement(&self, stmt: &Statement) -> Result<u64, Error> {
        let params: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> = stmt
            .params
            .iter()
            .map(|p| p.as_ref() as &(dyn tokio_postgres::types::ToSql + Sync))
            .collect();
        Ok(self.client.execute(stmt.sql.as_str(), &params).await?)
    }
}
