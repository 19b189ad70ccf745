// ABOUTME: Cursor and block reference types shared across the sink
// ABOUTME: A cursor is the opaque upstream resume token plus the last block seen

use std::fmt;

use serde::{Deserialize, Serialize};

/// A block by number and id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    pub num: u64,
    pub id: String,
}

impl BlockRef {
    pub fn new(num: u64, id: impl Into<String>) -> Self {
        Self { num, id: id.into() }
    }
}

impl fmt::Display for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({})", self.num, self.id)
    }
}

/// Opaque resume token produced by the upstream, together with the last
/// block it covers. Persisted keyed by module hash.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub cursor: String,
    pub block: BlockRef,
}

impl Cursor {
    pub fn new(cursor: impl Into<String>, block: BlockRef) -> Self {
        Self {
            cursor: cursor.into(),
            block,
        }
    }

    /// The sentinel written at startup so the flush path can always
    /// use an UPDATE against the cursors table.
    pub fn blank() -> Self {
        Self::default()
    }

    pub fn is_blank(&self) -> bool {
        self.cursor.is_empty()
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_blank() {
            write!(f, "<blank>")
        } else {
            write!(f, "{}", self.block)
        }
    }
}

/// What to do when the module hash in the cursors table does not match
/// the one resolved from the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OnModuleHashMismatch {
    /// Pick the cursor at the highest block and overwrite the hash on the
    /// next flush.
    Ignore,
    /// Same as ignore, but log a warning.
    Warn,
    /// Exit with an error explaining the problem.
    Error,
}
