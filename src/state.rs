// ABOUTME: YAML state file holding the CSV mode cursor
// ABOUTME: Saves atomically by writing a sibling temp file and renaming over

use std::path::{Path, PathBuf};

use crate::cursor::Cursor;
use crate::error::Error;

/// Persists the cursor to `state.yaml` between runs of the CSV sinker,
/// which has no database to keep it in.
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The saved cursor, or `None` when no state file exists yet.
    pub async fn read_cursor(&self) -> Result<Option<Cursor>, Error> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => Ok(Some(serde_yaml::from_str(&contents)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomic replace: the state file is never observed half-written.
    pub async fn save(&self, cursor: &Cursor) -> Result<(), Error> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let contents = serde_yaml::to_string(cursor)?;
        let tmp = self.path.with_extension("yaml.tmp");
        tokio::fs::write(&tmp, contents).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
