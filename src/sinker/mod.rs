// ABOUTME: Sinkers consuming the block stream: SQL flush loop and CSV bundle fan-out
// ABOUTME: Shared payload decoding and primary key resolution live here

pub mod csv;
pub mod sql;
pub mod stats;

use std::collections::BTreeMap;

use prost::Message as _;

use crate::db::Loader;
use crate::error::Error;
use crate::proto::sf::substreams::rpc::v2::MapModuleOutput;
use crate::proto::sf::substreams::sink::database::v1::{table_change, DatabaseChanges, TableChange};

pub use csv::CsvSinker;
pub use sql::SqlSinker;
pub use stats::Stats;

pub const DATABASE_CHANGES_TYPE: &str = "sf.substreams.sink.database.v1.DatabaseChanges";
pub const LEGACY_DATABASE_CHANGES_TYPE: &str = "sf.substreams.database.v1.DatabaseChanges";

/// Flush cadence while processing historical segments, when no explicit
/// flush interval is configured.
pub(crate) const HISTORICAL_BLOCK_FLUSH_EACH: u64 = 1000;
/// Flush cadence while live: every block.
pub(crate) const LIVE_BLOCK_FLUSH_EACH: u64 = 1;

/// Validate a block's map output and decode its `DatabaseChanges`.
///
/// The legacy and current schemas share the wire representation, so the
/// payload is decoded from the raw bytes after the type-url check rather
/// than through any typed unmarshalling.
pub(crate) fn decode_changes(
    output: &MapModuleOutput,
    expected_module: &str,
) -> Result<DatabaseChanges, Error> {
    if output.name != expected_module {
        return Err(Error::WrongOutputModule {
            expected: expected_module.to_string(),
            received: output.name.clone(),
        });
    }

    let any = output
        .map_output
        .as_ref()
        .ok_or_else(|| Error::UnsupportedTypeUrl("<empty>".to_string()))?;

    let type_name = any.type_url.rsplit('/').next().unwrap_or(&any.type_url);
    if type_name != DATABASE_CHANGES_TYPE && type_name != LEGACY_DATABASE_CHANGES_TYPE {
        return Err(Error::UnsupportedTypeUrl(any.type_url.clone()));
    }

    Ok(DatabaseChanges::decode(any.value.as_slice())?)
}

/// Expand a table change's primary key into a column map, whether the
/// stream sent a single value or a composite key.
pub(crate) fn resolve_primary_key(
    loader: &Loader,
    change: &TableChange,
) -> Result<BTreeMap<String, String>, Error> {
    match &change.primary_key {
        Some(table_change::PrimaryKey::Pk(pk)) => {
            loader.resolve_single_primary_key(&change.table, pk)
        }
        Some(table_change::PrimaryKey::CompositePk(composite)) => Ok(composite
            .keys
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()),
        None => Err(Error::MissingPrimaryKey {
            table: change.table.clone(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output_with(type_url: &str, changes: &DatabaseChanges) -> MapModuleOutput {
        MapModuleOutput {
            name: "db_out".to_string(),
            map_output: Some(prost_types::Any {
                type_url: type_url.to_string(),
                value: changes.encode_to_vec(),
            }),
        }
    }

    #[test]
    fn test_decode_changes_accepts_current_and_legacy_type() {
        let changes = DatabaseChanges {
            table_changes: vec![TableChange {
                table: "users".to_string(),
                ordinal: 0,
                operation: table_change::Operation::Create as i32,
                fields: vec![],
                primary_key: Some(table_change::PrimaryKey::Pk("42".to_string())),
            }],
        };

        for url in [
            "type.googleapis.com/sf.substreams.sink.database.v1.DatabaseChanges",
            "type.googleapis.com/sf.substreams.database.v1.DatabaseChanges",
        ] {
            let decoded = decode_changes(&output_with(url, &changes), "db_out").unwrap();
            assert_eq!(decoded.table_changes.len(), 1);
            assert_eq!(decoded.table_changes[0].table, "users");
        }
    }

    #[test]
    fn test_decode_changes_rejects_wrong_module() {
        let output = output_with(
            "type.googleapis.com/sf.substreams.sink.database.v1.DatabaseChanges",
            &DatabaseChanges::default(),
        );
        let err = decode_changes(&output, "other_module").unwrap_err();
        assert!(matches!(err, Error::WrongOutputModule { .. }));
    }

    #[test]
    fn test_decode_changes_rejects_unknown_type() {
        let output = output_with(
            "type.googleapis.com/sf.substreams.sink.kv.v1.KVOperations",
            &DatabaseChanges::default(),
        );
        let err = decode_changes(&output, "db_out").unwrap_err();
        assert!(matches!(err, Error::UnsupportedTypeUrl(_)));
    }
}
