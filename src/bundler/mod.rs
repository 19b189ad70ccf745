// ABOUTME: Per-table bundler writing block-aligned CSV bundles and uploading them
// ABOUTME: The upload worker runs on its own task behind a bounded queue

pub mod writer;

use std::collections::BTreeMap;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::Error;
use crate::metrics::metrics;

pub use writer::{csv_header, encode_csv_row, BoundaryWriter};

/// Completed bundles waiting for upload; the producer stalls when the
/// queue is full so it can never outrun the object store.
const UPLOAD_QUEUE_DEPTH: usize = 8;
const UPLOAD_RETRIES: u32 = 3;

/// What a roll observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollOutcome {
    Continue,
    /// Orderly completion: the block is at or past the stop block.
    StopBlockReached,
}

struct UploadJob {
    local_path: PathBuf,
    object_path: ObjectPath,
}

/// Bundles one table's rows into block-aligned CSV files.
///
/// Boundaries are `[k*bundle_size, (k+1)*bundle_size)` aligned; rolling
/// past a boundary end renames the working file to
/// `<start>-<end>.csv` and enqueues it for upload under `<table>/`.
pub struct Bundler {
    table: String,
    columns: Vec<String>,
    bundle_size: u64,
    stop_block: u64,
    boundary_start: u64,
    boundary_end: u64,
    header_written: bool,
    dirty: bool,
    stop_reached: bool,
    writer: BoundaryWriter,
    store: Arc<dyn ObjectStore>,
    upload_tx: Option<mpsc::Sender<UploadJob>>,
    upload_rx: Option<mpsc::Receiver<UploadJob>>,
    upload_task: Option<JoinHandle<Result<(), Error>>>,
}

impl Bundler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        table: &str,
        columns: Vec<String>,
        start_block: u64,
        stop_block: u64,
        bundle_size: u64,
        buffer_size: usize,
        working_dir: &FsPath,
        store: Arc<dyn ObjectStore>,
    ) -> Result<Self, Error> {
        if bundle_size == 0 {
            return Err(Error::Config("bundle size must be positive".to_string()));
        }

        let (upload_tx, upload_rx) = mpsc::channel(UPLOAD_QUEUE_DEPTH);
        Ok(Self {
            table: table.to_string(),
            columns,
            bundle_size,
            stop_block,
            boundary_start: start_block,
            boundary_end: next_boundary(start_block, bundle_size),
            header_written: false,
            dirty: false,
            stop_reached: false,
            writer: BoundaryWriter::new(working_dir, table, buffer_size)?,
            store,
            upload_tx: Some(upload_tx),
            upload_rx: Some(upload_rx),
            upload_task: None,
        })
    }

    /// Start the upload worker. Must be called once before rolling.
    pub fn launch(&mut self) {
        let rx = self.upload_rx.take().expect("launch called more than once");
        let store = self.store.clone();
        let table = self.table.clone();
        self.upload_task = Some(tokio::spawn(upload_worker(rx, store, table)));
    }

    /// Append one CSV row to the active boundary, writing the header
    /// first if this boundary has none yet.
    pub fn write_row(&mut self, fields: &BTreeMap<String, String>) -> Result<(), Error> {
        if !self.header_written {
            self.writer.write(&csv_header(&self.columns))?;
            self.header_written = true;
        }
        self.writer.write(&encode_csv_row(&self.columns, fields))?;
        self.dirty = true;
        metrics().record_rows_written(1);
        Ok(())
    }

    /// Close every boundary `block_num` has moved past and open the next
    /// one. Signals `StopBlockReached` at or past the stop block.
    pub async fn roll(&mut self, block_num: u64) -> Result<RollOutcome, Error> {
        if self.stop_reached {
            return Ok(RollOutcome::StopBlockReached);
        }

        while block_num >= self.boundary_end {
            self.cut(self.boundary_end).await?;
            self.boundary_start = self.boundary_end;
            self.boundary_end += self.bundle_size;
        }

        if block_num >= self.stop_block {
            self.cut(self.stop_block.min(self.boundary_end)).await?;
            self.stop_reached = true;
            return Ok(RollOutcome::StopBlockReached);
        }

        Ok(RollOutcome::Continue)
    }

    /// Close the active boundary as `[boundary_start, end)` and enqueue
    /// it. A boundary that saw no rows produces no file.
    async fn cut(&mut self, end: u64) -> Result<(), Error> {
        self.header_written = false;
        if !self.dirty {
            return Ok(());
        }
        self.dirty = false;

        let file_name = format!("{:010}-{:010}.csv", self.boundary_start, end);
        let Some(local_path) = self.writer.close(&file_name)? else {
            return Ok(());
        };

        tracing::debug!(table = %self.table, file = %file_name, "boundary completed");

        let job = UploadJob {
            local_path,
            object_path: ObjectPath::from(format!("{}/{}", self.table, file_name)),
        };
        let tx = self
            .upload_tx
            .as_ref()
            .ok_or_else(|| Error::Io(std::io::Error::other("bundler already shut down")))?;
        if tx.send(job).await.is_err() {
            return Err(self.take_upload_error().await);
        }
        Ok(())
    }

    /// Flush any partial boundary, drain the upload queue and release the
    /// writer.
    pub async fn shutdown(&mut self) -> Result<(), Error> {
        if self.dirty {
            let end = if self.stop_block > 0 {
                self.stop_block.min(self.boundary_end)
            } else {
                self.boundary_end
            };
            self.cut(end).await?;
        } else {
            self.writer.discard()?;
        }

        // Closing the channel lets the worker drain and exit.
        self.upload_tx = None;
        if let Some(task) = self.upload_task.take() {
            match task.await {
                Ok(result) => result?,
                Err(join) => {
                    return Err(Error::Io(std::io::Error::other(format!(
                        "upload worker panicked: {join}"
                    ))))
                }
            }
        }
        Ok(())
    }

    /// The worker died before shutdown; surface what killed it.
    async fn take_upload_error(&mut self) -> Error {
        match self.upload_task.take() {
            Some(task) => match task.await {
                Ok(Ok(())) => Error::Io(std::io::Error::other("upload worker stopped early")),
                Ok(Err(e)) => e,
                Err(join) => {
                    Error::Io(std::io::Error::other(format!("upload worker panicked: {join}")))
                }
            },
            None => Error::Io(std::io::Error::other("upload worker was never launched")),
        }
    }
}

fn next_boundary(block: u64, bundle_size: u64) -> u64 {
    (block / bundle_size + 1) * bundle_size
}

async fn upload_worker(
    mut rx: mpsc::Receiver<UploadJob>,
    store: Arc<dyn ObjectStore>,
    table: String,
) -> Result<(), Error> {
    while let Some(job) = rx.recv().await {
        let payload = Bytes::from(tokio::fs::read(&job.local_path).await?);

        let mut attempt = 0;
        loop {
            attempt += 1;
            match store.put(&job.object_path, payload.clone().into()).await {
                Ok(_) => break,
                Err(e) if attempt < UPLOAD_RETRIES => {
                    tracing::warn!(
                        table = %table,
                        object = %job.object_path,
                        attempt,
                        "bundle upload failed: {e}, retrying"
                    );
                    tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        tokio::fs::remove_file(&job.local_path).await.ok();
        metrics().record_bundle_uploaded();
        tracing::debug!(table = %table, object = %job.object_path, "uploaded bundle");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_boundary_is_aligned() {
        assert_eq!(next_boundary(0, 1000), 1000);
        assert_eq!(next_boundary(999, 1000), 1000);
        assert_eq!(next_boundary(1000, 1000), 2000);
        assert_eq!(next_boundary(1500, 1000), 2000);
    }
}
