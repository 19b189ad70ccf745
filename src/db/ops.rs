// ABOUTME: Loader mutation API: schedule inserts, updates and deletes in the journal
// ABOUTME: Conflict and capability rules are enforced here, before anything touches SQL

use std::collections::BTreeMap;

use crate::db::Loader;
use crate::error::Error;

impl Loader {
    /// Schedule a row insert. The table must exist and the primary key
    /// must not already be scheduled for anything in this flush window.
    pub fn insert(
        &mut self,
        table_name: &str,
        primary_key: BTreeMap<String, String>,
        data: BTreeMap<String, String>,
        reversible_block: Option<u64>,
    ) -> Result<(), Error> {
        tracing::trace!(
            table = table_name,
            fields = data.len(),
            "processing insert operation"
        );

        let Some(table) = self.tables.get(table_name) else {
            return Err(Error::UnknownTable {
                table: table_name.to_string(),
                available: self.available_tables(),
            });
        };

        self.journal.insert(table, primary_key, data, reversible_block)
    }

    /// Schedule a row update, merging into any pending operation for the
    /// same key. Rejected on insert-only dialects.
    pub fn update(
        &mut self,
        table_name: &str,
        primary_key: BTreeMap<String, String>,
        data: BTreeMap<String, String>,
        reversible_block: Option<u64>,
    ) -> Result<(), Error> {
        if self.dialect.only_inserts() {
            return Err(Error::Unsupported {
                operation: "update",
            });
        }

        tracing::trace!(
            table = table_name,
            fields = data.len(),
            "processing update operation"
        );

        let Some(table) = self.tables.get(table_name) else {
            return Err(Error::UnknownTable {
                table: table_name.to_string(),
                available: self.available_tables(),
            });
        };

        self.journal.update(table, primary_key, data, reversible_block)
    }

    /// Schedule a row delete, replacing any pending operation for the
    /// same key. Rejected on insert-only dialects; the table must have
    /// exactly one primary key column.
    pub fn delete(
        &mut self,
        table_name: &str,
        primary_key: BTreeMap<String, String>,
        reversible_block: Option<u64>,
    ) -> Result<(), Error> {
        if self.dialect.only_inserts() {
            return Err(Error::Unsupported {
                operation: "delete",
            });
        }

        tracing::trace!(table = table_name, "processing delete operation");

        let Some(table) = self.tables.get(table_name) else {
            return Err(Error::UnknownTable {
                table: table_name.to_string(),
                available: self.available_tables(),
            });
        };

        if table.primary_columns.len() != 1 {
            return Err(Error::DeleteNeedsSingleKey {
                table: table_name.to_string(),
                count: table.primary_columns.len(),
            });
        }

        self.journal.delete(table, primary_key, reversible_block)
    }

    /// Expand a single primary key value sent by the stream into a column
    /// map. Composite-key tables cannot accept a single value.
    pub fn resolve_single_primary_key(
        &self,
        table_name: &str,
        pk: &str,
    ) -> Result<BTreeMap<String, String>, Error> {
        let Some(table) = self.tables.get(table_name) else {
            return Err(Error::UnknownTable {
                table: table_name.to_string(),
                available: self.available_tables(),
            });
        };

        match table.primary_columns.as_slice() {
            [only] => Ok(BTreeMap::from([(only.name.clone(), pk.to_string())])),
            columns => Err(Error::CompositeKeyMismatch {
                table: table_name.to_string(),
                columns: columns.iter().map(|c| c.name.clone()).collect(),
            }),
        }
    }
}
