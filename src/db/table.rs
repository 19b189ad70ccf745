// ABOUTME: Table and column metadata captured from schema introspection
// ABOUTME: Columns keep a scan type used to bind incoming string values as SQL parameters

use std::collections::HashMap;

use tokio_postgres::types::ToSql;

use crate::error::Error;

/// Column carrying the sink's reversible block marker. Optional on user
/// tables; rows written above the final block height record their block
/// number here so a later revert can roll the fork back.
pub const REVERSIBLE_BLOCK_COLUMN: &str = "__block_num__";

/// Quote an identifier, doubling any embedded quotes.
pub fn escape_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Runtime type a column's values are bound and read back as.
///
/// Incoming change values are strings; the scan type decides how they are
/// parsed before being handed to the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanType {
    Bool,
    Int2,
    Int4,
    Int8,
    Float4,
    Float8,
    Text,
    Bytes,
    Date,
    Timestamp,
    Timestamptz,
    Uuid,
    Json,
    /// Bound as text and cast server-side to the named type.
    Other(String),
}

impl ScanType {
    pub fn from_database_type(data_type: &str, udt_name: &str) -> Self {
        match data_type {
            "boolean" | "bool" => ScanType::Bool,
            "smallint" | "int2" => ScanType::Int2,
            "integer" | "int4" => ScanType::Int4,
            "bigint" | "int8" => ScanType::Int8,
            "real" | "float4" => ScanType::Float4,
            "double precision" | "float8" => ScanType::Float8,
            "text" | "varchar" | "character varying" | "char" | "character" | "name" => {
                ScanType::Text
            }
            "bytea" => ScanType::Bytes,
            "date" => ScanType::Date,
            "timestamp without time zone" | "timestamp" => ScanType::Timestamp,
            "timestamp with time zone" | "timestamptz" => ScanType::Timestamptz,
            "uuid" => ScanType::Uuid,
            "json" | "jsonb" => ScanType::Json,
            _ => ScanType::Other(udt_name.to_string()),
        }
    }

    /// The explicit cast appended to this column's placeholder, if any.
    pub fn placeholder_cast(&self) -> Option<&str> {
        match self {
            ScanType::Other(udt) => Some(udt.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ColumnInfo {
    pub name: String,
    pub escaped_name: String,
    pub database_type_name: String,
    pub scan_type: ScanType,
}

impl ColumnInfo {
    pub fn new(name: &str, data_type: &str, udt_name: &str) -> Self {
        Self {
            name: name.to_string(),
            escaped_name: escape_identifier(name),
            database_type_name: data_type.to_string(),
            scan_type: ScanType::from_database_type(data_type, udt_name),
        }
    }

    /// Parse a change value into a driver parameter according to the scan
    /// type.
    pub fn bind_value(
        &self,
        table: &str,
        value: &str,
    ) -> Result<Box<dyn ToSql + Sync + Send>, Error> {
        let invalid = |reason: &str| Error::InvalidValue {
            table: table.to_string(),
            column: self.name.clone(),
            value: value.to_string(),
            reason: reason.to_string(),
        };

        Ok(match &self.scan_type {
            ScanType::Bool => Box::new(
                value
                    .parse::<bool>()
                    .map_err(|_| invalid("expected a boolean"))?,
            ),
            ScanType::Int2 => Box::new(
                value
                    .parse::<i16>()
                    .map_err(|_| invalid("expected a 16-bit integer"))?,
            ),
            ScanType::Int4 => Box::new(
                value
                    .parse::<i32>()
                    .map_err(|_| invalid("expected a 32-bit integer"))?,
            ),
            ScanType::Int8 => Box::new(
                value
                    .parse::<i64>()
                    .map_err(|_| invalid("expected a 64-bit integer"))?,
            ),
            ScanType::Float4 => Box::new(
                value
                    .parse::<f32>()
                    .map_err(|_| invalid("expected a float"))?,
            ),
            ScanType::Float8 => Box::new(
                value
                    .parse::<f64>()
                    .map_err(|_| invalid("expected a double"))?,
            ),
            ScanType::Text => Box::new(value.to_string()),
            ScanType::Bytes => {
                let hex_part = value
                    .strip_prefix("0x")
                    .or_else(|| value.strip_prefix("\\x"));
                match hex_part {
                    Some(h) => Box::new(
                        hex::decode(h).map_err(|_| invalid("expected hex-encoded bytes"))?,
                    ),
                    None => Box::new(value.as_bytes().to_vec()),
                }
            }
            ScanType::Date => Box::new(
                chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d")
                    .map_err(|_| invalid("expected a YYYY-MM-DD date"))?,
            ),
            ScanType::Timestamp => Box::new(
                chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
                    .or_else(|_| {
                        chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f")
                    })
                    .map_err(|_| invalid("expected a timestamp"))?,
            ),
            ScanType::Timestamptz => Box::new(
                chrono::DateTime::parse_from_rfc3339(value)
                    .map_err(|_| invalid("expected an RFC 3339 timestamp"))?
                    .with_timezone(&chrono::Utc),
            ),
            ScanType::Uuid => Box::new(
                value
                    .parse::<uuid::Uuid>()
                    .map_err(|_| invalid("expected a UUID"))?,
            ),
            ScanType::Json => Box::new(
                serde_json::from_str::<serde_json::Value>(value)
                    .map_err(|_| invalid("expected a JSON document"))?,
            ),
            // Cast server-side; see placeholder_cast().
            ScanType::Other(_) => Box::new(value.to_string()),
        })
    }
}

/// Immutable per-table metadata built once at startup from introspection.
#[derive(Debug, Clone)]
pub struct TableInfo {
    pub schema: String,
    pub name: String,
    /// Pre-computed `escape(schema).escape(name)` for query building.
    pub identifier: String,
    pub columns_by_name: HashMap<String, ColumnInfo>,
    pub primary_columns: Vec<ColumnInfo>,
}

impl TableInfo {
    pub fn new(
        schema: &str,
        name: &str,
        pk_list: &[String],
        columns_by_name: HashMap<String, ColumnInfo>,
    ) -> Result<Self, Error> {
        let mut primary_columns = Vec::with_capacity(pk_list.len());
        for pk_name in pk_list {
            let column = columns_by_name
                .get(pk_name)
                .ok_or_else(|| Error::PrimaryKeyColumnMissing {
                    table: name.to_string(),
                    column: pk_name.clone(),
                })?;
            primary_columns.push(column.clone());
        }

        if primary_columns.is_empty() {
            return Err(Error::NoPrimaryKey {
                schema: schema.to_string(),
                table: name.to_string(),
            });
        }

        Ok(Self {
            schema: schema.to_string(),
            name: name.to_string(),
            identifier: format!(
                "{}.{}",
                escape_identifier(schema),
                escape_identifier(name)
            ),
            columns_by_name,
            primary_columns,
        })
    }

    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns_by_name.get(name)
    }

    pub fn has_reversible_block_column(&self) -> bool {
        self.columns_by_name.contains_key(REVERSIBLE_BLOCK_COLUMN)
    }

    /// Column names sorted lexicographically, the order CSV bundles use.
    pub fn sorted_column_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.columns_by_name.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
pub(crate) fn test_table(name: &str, pk_list: &[&str], columns: &[&str]) -> TableInfo {
    let columns_by_name = columns
        .iter()
        .map(|c| (c.to_string(), ColumnInfo::new(c, "text", "text")))
        .collect();
    let pk_list: Vec<String> = pk_list.iter().map(|c| c.to_string()).collect();
    TableInfo::new("public", name, &pk_list, columns_by_name).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_identifier() {
        assert_eq!(escape_identifier("users"), "\"users\"");
        assert_eq!(escape_identifier("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_table_info_identifier() {
        let table = test_table("users", &["id"], &["id", "name"]);
        assert_eq!(table.identifier, "\"public\".\"users\"");
        assert_eq!(table.primary_columns.len(), 1);
        assert_eq!(table.primary_columns[0].name, "id");
    }

    #[test]
    fn test_table_info_requires_primary_key() {
        let columns: HashMap<String, ColumnInfo> = [("id".to_string(),
            ColumnInfo::new("id", "text", "text"))]
        .into_iter()
        .collect();
        let err = TableInfo::new("public", "users", &[], columns).unwrap_err();
        assert!(matches!(err, Error::NoPrimaryKey { .. }));
    }

    #[test]
    fn test_table_info_missing_pk_column() {
        let columns: HashMap<String, ColumnInfo> = [("id".to_string(),
            ColumnInfo::new("id", "text", "text"))]
        .into_iter()
        .collect();
        let err =
            TableInfo::new("public", "users", &["missing".to_string()], columns).unwrap_err();
        assert!(matches!(err, Error::PrimaryKeyColumnMissing { .. }));
    }

    #[test]
    fn test_scan_type_mapping() {
        assert_eq!(
            ScanType::from_database_type("bigint", "int8"),
            ScanType::Int8
        );
        assert_eq!(
            ScanType::from_database_type("character varying", "varchar"),
            ScanType::Text
        );
        assert_eq!(
            ScanType::from_database_type("numeric", "numeric"),
            ScanType::Other("numeric".to_string())
        );
    }

    #[test]
    fn test_bind_value_rejects_garbage() {
        let column = ColumnInfo::new("height", "bigint", "int8");
        let err = column.bind_value("blocks", "not-a-number").unwrap_err();
        assert!(matches!(err, Error::InvalidValue { .. }));
    }

    #[test]
    fn test_sorted_column_names() {
        let table = test_table("users", &["id"], &["name", "id", "email"]);
        assert_eq!(table.sorted_column_names(), vec!["email", "id", "name"]);
    }
}
