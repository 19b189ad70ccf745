// ABOUTME: In-memory change journal holding pending operations between flushes
// ABOUTME: Insertion-ordered per table and per row so flush statement order is stable

use std::collections::{BTreeMap, HashMap};

use crate::db::table::TableInfo;
use crate::error::Error;

/// Kind of a pending row operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

/// A pending change against one row, held until the next flush.
///
/// Invariant: `data` is empty for deletes; for inserts the primary key
/// columns are copied into `data` so the first write carries them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub kind: OperationKind,
    pub table: String,
    pub primary_key: BTreeMap<String, String>,
    pub data: BTreeMap<String, String>,
    pub reversible_block: Option<u64>,
}

impl Operation {
    /// Merge new fields into this operation, last write wins per field.
    /// The operation kind is preserved.
    fn merge_data(&mut self, data: BTreeMap<String, String>) {
        self.data.extend(data);
    }
}

/// The journal row id: the bare primary key value for single-column keys,
/// otherwise the values joined by `/` in column-name order.
pub fn row_unique_id(primary_key: &BTreeMap<String, String>) -> String {
    if primary_key.len() == 1 {
        return primary_key.values().next().cloned().unwrap_or_default();
    }

    let values: Vec<&str> = primary_key.values().map(|v| v.as_str()).collect();
    values.join("/")
}

/// A map preserving first-insertion order of its keys.
///
/// Flush statement order is observable, so plain hash iteration is not an
/// option here.
#[derive(Debug)]
pub struct OrderedMap<V> {
    keys: Vec<String>,
    map: HashMap<String, V>,
}

impl<V> Default for OrderedMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> OrderedMap<V> {
    pub fn new() -> Self {
        Self {
            keys: Vec::new(),
            map: HashMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        self.map.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut V> {
        self.map.get_mut(key)
    }

    /// Insert or replace. A replaced key keeps its original position.
    pub fn insert(&mut self, key: String, value: V) {
        if !self.map.contains_key(&key) {
            self.keys.push(key.clone());
        }
        self.map.insert(key, value);
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.keys
            .iter()
            .map(|k| (k.as_str(), self.map.get(k).expect("key tracked but missing")))
    }
}

/// Pending operations for every table, in table-first-seen order.
#[derive(Debug, Default)]
pub struct Journal {
    tables: OrderedMap<OrderedMap<Operation>>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of pending operations.
    pub fn len(&self) -> usize {
        self.tables.iter().map(|(_, ops)| ops.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.tables = OrderedMap::new();
    }

    /// Iterate tables in first-seen order, rows in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &OrderedMap<Operation>)> {
        self.tables.iter()
    }

    pub fn get(&self, table: &str, row_id: &str) -> Option<&Operation> {
        self.tables.get(table).and_then(|ops| ops.get(row_id))
    }

    fn table_entry(&mut self, table: &str) -> &mut OrderedMap<Operation> {
        if self.tables.get(table).is_none() {
            tracing::trace!(table, "tracking table never seen before");
            self.tables.insert(table.to_string(), OrderedMap::new());
        }
        self.tables.get_mut(table).expect("entry just ensured")
    }

    /// Schedule an insert. Errors if the row is already scheduled for
    /// anything: insert must be called once per primary key per flush
    /// window.
    pub fn insert(
        &mut self,
        table: &TableInfo,
        primary_key: BTreeMap<String, String>,
        mut data: BTreeMap<String, String>,
        reversible_block: Option<u64>,
    ) -> Result<(), Error> {
        let row_id = row_unique_id(&primary_key);
        let entry = self.table_entry(&table.name);

        if entry.get(&row_id).is_some() {
            return Err(Error::DuplicateInsert {
                table: table.name.clone(),
                row_id,
            });
        }

        // The primary key columns go into the data so the first write
        // creates them.
        for column in &table.primary_columns {
            if let Some(value) = primary_key.get(&column.name) {
                data.insert(column.name.clone(), value.clone());
            }
        }

        entry.insert(
            row_id,
            Operation {
                kind: OperationKind::Insert,
                table: table.name.clone(),
                primary_key,
                data,
                reversible_block,
            },
        );
        Ok(())
    }

    /// Schedule an update, merging into any pending insert or update for
    /// the same row. Updating a row scheduled for deletion is an error.
    pub fn update(
        &mut self,
        table: &TableInfo,
        primary_key: BTreeMap<String, String>,
        data: BTreeMap<String, String>,
        reversible_block: Option<u64>,
    ) -> Result<(), Error> {
        let row_id = row_unique_id(&primary_key);
        let entry = self.table_entry(&table.name);

        if let Some(op) = entry.get_mut(&row_id) {
            if op.kind == OperationKind::Delete {
                return Err(Error::UpdateAfterDelete {
                    table: table.name.clone(),
                    row_id,
                });
            }

            tracing::trace!(table = %table.name, row_id = %row_id, "merging update into pending operation");
            op.merge_data(data);
            return Ok(());
        }

        entry.insert(
            row_id,
            Operation {
                kind: OperationKind::Update,
                table: table.name.clone(),
                primary_key,
                data,
                reversible_block,
            },
        );
        Ok(())
    }

    /// Schedule a delete, replacing any pending operation for the row.
    pub fn delete(
        &mut self,
        table: &TableInfo,
        primary_key: BTreeMap<String, String>,
        reversible_block: Option<u64>,
    ) -> Result<(), Error> {
        let row_id = row_unique_id(&primary_key);
        let entry = self.table_entry(&table.name);

        entry.insert(
            row_id,
            Operation {
                kind: OperationKind::Delete,
                table: table.name.clone(),
                primary_key,
                data: BTreeMap::new(),
                reversible_block,
            },
        );
        Ok(())
    }
}
