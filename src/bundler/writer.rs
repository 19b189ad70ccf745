// ABOUTME: Buffered local file writer for one bundler's active boundary
// ABOUTME: CSV encoding helpers for headers and rows

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::Error;

/// Writes the active boundary's rows to a local working file; `close`
/// renames it to its final bundle name for upload.
pub struct BoundaryWriter {
    dir: PathBuf,
    buffer_size: usize,
    active: Option<BufWriter<File>>,
}

impl BoundaryWriter {
    pub fn new(working_dir: &Path, table: &str, buffer_size: usize) -> Result<Self, Error> {
        let dir = working_dir.join(table);
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            buffer_size,
            active: None,
        })
    }

    fn pending_path(&self) -> PathBuf {
        self.dir.join("pending.csv")
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<(), Error> {
        if self.active.is_none() {
            let file = File::create(self.pending_path())?;
            self.active = Some(BufWriter::with_capacity(self.buffer_size, file));
        }
        self.active
            .as_mut()
            .expect("writer just ensured")
            .write_all(bytes)?;
        Ok(())
    }

    /// Flush and rename the working file to `file_name`, returning its
    /// path. `None` when nothing was written to this boundary.
    pub fn close(&mut self, file_name: &str) -> Result<Option<PathBuf>, Error> {
        let Some(mut writer) = self.active.take() else {
            return Ok(None);
        };
        writer.flush()?;
        drop(writer);

        let target = self.dir.join(file_name);
        std::fs::rename(self.pending_path(), &target)?;
        Ok(Some(target))
    }

    /// Drop the working file without keeping it.
    pub fn discard(&mut self) -> Result<(), Error> {
        if self.active.take().is_some() {
            std::fs::remove_file(self.pending_path())?;
        }
        Ok(())
    }
}

/// The header row: column names joined by `,`, newline-terminated.
/// Callers pass columns already sorted lexicographically.
pub fn csv_header(columns: &[String]) -> Vec<u8> {
    let mut header = columns.join(",");
    header.push('\n');
    header.into_bytes()
}

/// Encode one row in column order; missing fields become empty cells.
pub fn encode_csv_row(columns: &[String], fields: &BTreeMap<String, String>) -> Vec<u8> {
    let cells: Vec<String> = columns
        .iter()
        .map(|column| escape_csv_field(fields.get(column).map(|v| v.as_str()).unwrap_or("")))
        .collect();
    let mut row = cells.join(",");
    row.push('\n');
    row.into_bytes()
}

fn escape_csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn columns(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_csv_header() {
        assert_eq!(
            csv_header(&columns(&["email", "id", "name"])),
            b"email,id,name\n"
        );
    }

    #[test]
    fn test_encode_csv_row_in_column_order() {
        let row = encode_csv_row(
            &columns(&["email", "id", "name"]),
            &fields(&[("id", "42"), ("name", "Ada"), ("email", "a@x")]),
        );
        assert_eq!(row, b"a@x,42,Ada\n");
    }

    #[test]
    fn test_encode_csv_row_missing_field_is_empty() {
        let row = encode_csv_row(&columns(&["id", "name"]), &fields(&[("id", "42")]));
        assert_eq!(row, b"42,\n");
    }

    #[test]
    fn test_encode_csv_row_escapes_special_characters() {
        let row = encode_csv_row(
            &columns(&["id", "name"]),
            &fields(&[("id", "42"), ("name", "Lovelace, \"Ada\"")]),
        );
        assert_eq!(row, b"42,\"Lovelace, \"\"Ada\"\"\"\n");
    }

    #[test]
    fn test_boundary_writer_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = BoundaryWriter::new(dir.path(), "users", 1024).unwrap();

        assert!(writer.close("empty.csv").unwrap().is_none());

        writer.write(b"id,name\n").unwrap();
        writer.write(b"42,Ada\n").unwrap();
        let path = writer.close("0000000000-0000001000.csv").unwrap().unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "id,name\n42,Ada\n");
        assert!(path.ends_with("users/0000000000-0000001000.csv"));
    }
}
