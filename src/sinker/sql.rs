// ABOUTME: SQL sinker: dispatches block changes into the loader and flushes on cadence
// ABOUTME: Live blocks flush one by one, historical segments in batches

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::sync::broadcast;

use crate::cursor::{BlockRef, Cursor};
use crate::db::Loader;
use crate::error::Error;
use crate::metrics::metrics;
use crate::proto::sf::substreams::rpc::v2::BlockScopedData;
use crate::proto::sf::substreams::sink::database::v1::{table_change, DatabaseChanges};
use crate::sinker::stats::Stats;
use crate::sinker::{
    decode_changes, resolve_primary_key, HISTORICAL_BLOCK_FLUSH_EACH, LIVE_BLOCK_FLUSH_EACH,
};
use crate::stream::{BlockSource, StreamEvent};

const SLOW_FLUSH_INFO: Duration = Duration::from_secs(5);
const SLOW_FLUSH_WARN: Duration = Duration::from_secs(30);

/// Consumes the block stream and materialises changes into the database.
pub struct SqlSinker<S> {
    loader: Loader,
    source: S,
    module_name: String,
    module_hash: String,
    stats: Stats,
}

impl<S: BlockSource> SqlSinker<S> {
    pub fn new(
        loader: Loader,
        source: S,
        module_name: impl Into<String>,
        module_hash: impl Into<String>,
    ) -> Self {
        Self {
            loader,
            source,
            module_name: module_name.into(),
            module_hash: module_hash.into(),
            stats: Stats::new(),
        }
    }

    /// Run until the stream completes, an error occurs or shutdown is
    /// signalled. Any handler error is fatal.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<(), Error> {
        let cursor = self.resolve_cursor().await?;

        tracing::info!(
            restarting_at = %cursor,
            database = self.loader.database(),
            schema = self.loader.schema(),
            "starting sql sink"
        );

        let stats_task = self.stats.start(shutdown.resubscribe());
        let mut events = self.source.events(cursor.clone());
        let mut last_cursor = cursor;

        let result = loop {
            tokio::select! {
                event = events.next() => match event {
                    Some(Ok(StreamEvent::BlockScopedData { data, is_live, cursor })) => {
                        last_cursor = cursor.clone();
                        if let Err(e) = self.handle_block_scoped_data(data, is_live, cursor).await {
                            break Err(e);
                        }
                    }
                    Some(Ok(StreamEvent::BlockUndoSignal { last_valid_block, cursor })) => {
                        last_cursor = cursor.clone();
                        if let Err(e) = self.handle_block_undo_signal(last_valid_block, cursor).await {
                            break Err(e);
                        }
                    }
                    Some(Err(e)) => break Err(e),
                    None => {
                        // Stream completed; flush whatever the journal
                        // still holds before declaring success.
                        if self.loader.entries_count() > 0 {
                            let final_block = last_cursor.block.num;
                            if let Err(e) = self.flush(&last_cursor, final_block).await {
                                break Err(e);
                            }
                        }
                        break Ok(());
                    }
                },
                _ = shutdown.recv() => {
                    tracing::info!("shutdown signal received, stopping sql sink");
                    break Ok(());
                }
            }
        };

        stats_task.abort();
        self.stats.log_now();
        tracing::info!(
            last_block = %last_cursor,
            "sql sinker terminating"
        );
        result
    }

    /// Resolve the resume cursor for our module hash, writing the blank
    /// sentinel or adopting a mismatched cursor as needed.
    async fn resolve_cursor(&mut self) -> Result<Cursor, Error> {
        match self.loader.get_cursor(&self.module_hash).await {
            Ok((cursor, mismatch)) => {
                if mismatch {
                    // Adopted from a different hash: write it under ours so
                    // flushes can keep using UPDATE.
                    self.loader.insert_cursor(&self.module_hash, &cursor).await?;
                }
                Ok(cursor)
            }
            Err(Error::CursorNotFound(_)) => {
                let cursor = Cursor::blank();
                self.loader.insert_cursor(&self.module_hash, &cursor).await?;
                Ok(cursor)
            }
            Err(e) => Err(e),
        }
    }

    async fn handle_block_scoped_data(
        &mut self,
        data: BlockScopedData,
        is_live: bool,
        cursor: Cursor,
    ) -> Result<(), Error> {
        let output = data
            .output
            .as_ref()
            .ok_or_else(|| Error::UnsupportedTypeUrl("<missing output>".to_string()))?;
        let changes = decode_changes(output, &self.module_name)?;

        let block_num = cursor.block.num;
        self.apply_database_changes(changes, block_num, data.final_block_height)?;

        metrics().record_block();
        self.stats.record_block(cursor.block.clone());

        if block_num % batch_block_modulo(is_live, self.loader.flush_interval()) == 0 {
            tracing::debug!(block = %cursor.block, is_live, "flushing to database");
            self.flush(&cursor, data.final_block_height).await?;
        }

        Ok(())
    }

    fn apply_database_changes(
        &mut self,
        changes: DatabaseChanges,
        block_num: u64,
        final_block: u64,
    ) -> Result<(), Error> {
        for change in &changes.table_changes {
            if !self.loader.has_table(&change.table) {
                return Err(Error::UnknownTable {
                    table: change.table.clone(),
                    available: self.loader.available_tables(),
                });
            }

            let primary_key = resolve_primary_key(&self.loader, change)?;
            let fields: BTreeMap<String, String> = change
                .fields
                .iter()
                .map(|f| (f.name.clone(), f.new_value.clone()))
                .collect();

            // Blocks above the final height may still be undone; mark
            // their rows so a revert can find them.
            let reversible_block = (block_num > final_block).then_some(block_num);

            let operation = table_change::Operation::try_from(change.operation)
                .unwrap_or(table_change::Operation::Unset);
            match operation {
                table_change::Operation::Create => {
                    self.loader
                        .insert(&change.table, primary_key, fields, reversible_block)?
                }
                table_change::Operation::Update => {
                    self.loader
                        .update(&change.table, primary_key, fields, reversible_block)?
                }
                table_change::Operation::Delete => {
                    self.loader
                        .delete(&change.table, primary_key, reversible_block)?
                }
                table_change::Operation::Unset => {}
            }
        }
        Ok(())
    }

    async fn handle_block_undo_signal(
        &mut self,
        last_valid_block: BlockRef,
        cursor: Cursor,
    ) -> Result<(), Error> {
        self.loader
            .revert(&self.module_hash, &cursor, last_valid_block.num)
            .await
    }

    async fn flush(&mut self, cursor: &Cursor, final_block: u64) -> Result<usize, Error> {
        let start = Instant::now();
        let rows = self
            .loader
            .flush(&self.module_hash, cursor, final_block)
            .await?;
        let took = start.elapsed();

        if took > SLOW_FLUSH_WARN {
            tracing::warn!(
                ?took,
                "flush to database took a long time to complete, could cause long sync time down the road"
            );
        } else if took > SLOW_FLUSH_INFO {
            tracing::info!(
                ?took,
                "flush to database took a long time to complete, could cause long sync time down the road"
            );
        }

        metrics().record_flush(rows as u64, took);
        Ok(rows)
    }
}

/// Flush every block when live; otherwise the configured interval,
/// falling back to the historical default.
fn batch_block_modulo(is_live: bool, flush_interval: u64) -> u64 {
    if is_live {
        return LIVE_BLOCK_FLUSH_EACH;
    }
    if flush_interval > 0 {
        return flush_interval;
    }
    HISTORICAL_BLOCK_FLUSH_EACH
}
