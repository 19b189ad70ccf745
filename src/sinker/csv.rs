// ABOUTME: CSV sinker: dumps CREATE changes into per-table bundles for bulk load
// ABOUTME: Append-only; updates, deletes and undo signals are fatal here

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::StreamExt;
use object_store::local::LocalFileSystem;
use object_store::prefix::PrefixStore;
use object_store::ObjectStore;
use tokio::sync::broadcast;
use url::Url;

use crate::bundler::{Bundler, RollOutcome};
use crate::cursor::Cursor;
use crate::db::Loader;
use crate::error::Error;
use crate::metrics::metrics;
use crate::proto::sf::substreams::rpc::v2::BlockScopedData;
use crate::proto::sf::substreams::sink::database::v1::{table_change, DatabaseChanges};
use crate::sinker::stats::Stats;
use crate::sinker::{decode_changes, resolve_primary_key};
use crate::state::FileStateStore;
use crate::stream::{BlockSource, StreamEvent};

enum Handled {
    Continue,
    Stop,
}

/// Consumes the block stream and writes one CSV bundle series per table.
///
/// The loader is only used for table metadata here; nothing is written to
/// the database.
pub struct CsvSinker<S> {
    loader: Loader,
    source: S,
    module_name: String,
    bundlers: HashMap<String, Bundler>,
    state: FileStateStore,
    bundle_size: u64,
    stats: Stats,
}

impl<S: BlockSource> CsvSinker<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        loader: Loader,
        source: S,
        module_name: impl Into<String>,
        dest_folder: &str,
        working_dir: &Path,
        start_block: u64,
        stop_block: u64,
        bundle_size: u64,
        buffer_size: usize,
    ) -> Result<Self, Error> {
        if stop_block == 0 {
            return Err(Error::Config(
                "generate-csv requires a stop block".to_string(),
            ));
        }

        let (store, state_dir) = build_output_store(dest_folder, working_dir)?;
        let state = FileStateStore::new(state_dir.join("state.yaml"));

        let mut bundlers = HashMap::new();
        for table_name in loader.available_tables() {
            let table = loader.table(&table_name).expect("listed table exists");
            let bundler = Bundler::new(
                &table_name,
                table.sorted_column_names(),
                start_block,
                stop_block,
                bundle_size,
                buffer_size,
                working_dir,
                store.clone(),
            )?;
            bundlers.insert(table_name, bundler);
        }

        Ok(Self {
            loader,
            source,
            module_name: module_name.into(),
            bundlers,
            state,
            bundle_size,
            stats: Stats::new(),
        })
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<(), Error> {
        let cursor = self.state.read_cursor().await?.unwrap_or_else(Cursor::blank);

        tracing::info!(
            restarting_at = %cursor,
            schema = self.loader.schema(),
            tables = self.bundlers.len(),
            "starting csv sink"
        );

        for bundler in self.bundlers.values_mut() {
            bundler.launch();
        }

        let stats_task = self.stats.start(shutdown.resubscribe());
        let mut events = self.source.events(cursor);

        let result = loop {
            tokio::select! {
                event = events.next() => match event {
                    Some(Ok(StreamEvent::BlockScopedData { data, cursor, .. })) => {
                        match self.handle_block_scoped_data(data, cursor).await {
                            Ok(Handled::Continue) => {}
                            Ok(Handled::Stop) => break Ok(()),
                            Err(e) => break Err(e),
                        }
                    }
                    Some(Ok(StreamEvent::BlockUndoSignal { .. })) => {
                        // The bundles already uploaded cannot be rewritten.
                        break Err(Error::Unsupported {
                            operation: "undo handling in csv mode",
                        });
                    }
                    Some(Err(e)) => break Err(e),
                    None => break Ok(()),
                },
                _ = shutdown.recv() => {
                    tracing::info!("shutdown signal received, stopping csv sink");
                    break Ok(());
                }
            }
        };

        let drained = self.shutdown_bundlers().await;
        stats_task.abort();
        self.stats.log_now();
        tracing::info!(
            last_block = %self.stats.last_block().map(|b| b.to_string()).unwrap_or_else(|| "none".to_string()),
            "csv sinker terminating"
        );
        result.and(drained)
    }

    async fn handle_block_scoped_data(
        &mut self,
        data: BlockScopedData,
        cursor: Cursor,
    ) -> Result<Handled, Error> {
        let output = data
            .output
            .as_ref()
            .ok_or_else(|| Error::UnsupportedTypeUrl("<missing output>".to_string()))?;
        let changes = decode_changes(output, &self.module_name)?;

        self.write_changes(&changes)?;

        metrics().record_block();
        self.stats.record_block(cursor.block.clone());

        // Saved before rolling: a roll can complete the run.
        if cursor.block.num % self.bundle_size == 0 {
            self.state.save(&cursor).await?;
        }

        let block_num = cursor.block.num;
        let rolls = futures::future::join_all(
            self.bundlers
                .values_mut()
                .map(|bundler| bundler.roll(block_num)),
        )
        .await;

        let mut stop = false;
        for outcome in rolls {
            if outcome? == RollOutcome::StopBlockReached {
                stop = true;
            }
        }
        Ok(if stop { Handled::Stop } else { Handled::Continue })
    }

    fn write_changes(&mut self, changes: &DatabaseChanges) -> Result<(), Error> {
        for change in &changes.table_changes {
            if !self.loader.has_table(&change.table) {
                return Err(Error::UnknownTable {
                    table: change.table.clone(),
                    available: self.loader.available_tables(),
                });
            }

            // Primary key columns seed the row's fields.
            let mut fields = resolve_primary_key(&self.loader, change)?;

            let operation = table_change::Operation::try_from(change.operation)
                .unwrap_or(table_change::Operation::Unset);
            match operation {
                table_change::Operation::Create => {
                    for field in &change.fields {
                        fields.insert(field.name.clone(), field.new_value.clone());
                    }
                    let bundler = self.bundlers.get_mut(&change.table).ok_or_else(|| {
                        Error::UnknownTable {
                            table: change.table.clone(),
                            available: Vec::new(),
                        }
                    })?;
                    bundler.write_row(&fields)?;
                }
                table_change::Operation::Update => {
                    return Err(Error::Unsupported {
                        operation: "update in csv mode",
                    })
                }
                table_change::Operation::Delete => {
                    return Err(Error::Unsupported {
                        operation: "delete in csv mode",
                    })
                }
                table_change::Operation::Unset => {
                    return Err(Error::Unsupported {
                        operation: "unset table change operation",
                    })
                }
            }
        }
        Ok(())
    }

    async fn shutdown_bundlers(&mut self) -> Result<(), Error> {
        let mut first_error = None;
        for (table, bundler) in self.bundlers.iter_mut() {
            if let Err(e) = bundler.shutdown().await {
                tracing::error!(table = %table, "bundler shutdown failed: {e}");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// The upload target for bundles, plus the directory the cursor state
/// file lives in: next to the bundles for a local destination, in the
/// working directory for a remote one.
fn build_output_store(
    dest_folder: &str,
    working_dir: &Path,
) -> Result<(Arc<dyn ObjectStore>, PathBuf), Error> {
    if let Ok(url) = Url::parse(dest_folder) {
        let (store, prefix) = object_store::parse_url(&url)?;
        let store: Arc<dyn ObjectStore> = Arc::new(PrefixStore::new(store, prefix));
        return Ok((store, working_dir.to_path_buf()));
    }

    std::fs::create_dir_all(dest_folder)?;
    let store = Arc::new(LocalFileSystem::new_with_prefix(dest_folder)?);
    Ok((store, PathBuf::from(dest_folder)))
}
