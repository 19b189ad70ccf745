// ABOUTME: Periodic progress logging for the sinkers
// ABOUTME: Ticks every 15 seconds, 5 when debug logging is enabled

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::cursor::BlockRef;
use crate::metrics::metrics;

#[derive(Clone, Default)]
pub struct Stats {
    last_block: Arc<Mutex<Option<BlockRef>>>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_block(&self, block: BlockRef) {
        *self.last_block.lock().expect("stats lock poisoned") = Some(block);
    }

    pub fn last_block(&self) -> Option<BlockRef> {
        self.last_block.lock().expect("stats lock poisoned").clone()
    }

    pub fn log_now(&self) {
        let m = metrics();
        let last_block = self
            .last_block()
            .map(|b| b.to_string())
            .unwrap_or_else(|| "none".to_string());
        tracing::info!(
            last_block = %last_block,
            blocks = m.blocks_handled(),
            flushes = m.flush_count(),
            flushed_rows = m.flushed_rows(),
            rows_written = m.rows_written(),
            bundles_uploaded = m.bundles_uploaded(),
            "sink progress"
        );
    }

    /// Spawn the progress ticker; it stops on the shutdown broadcast.
    pub fn start(&self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let log_each = if tracing::enabled!(tracing::Level::DEBUG) {
            Duration::from_secs(5)
        } else {
            Duration::from_secs(15)
        };

        let stats = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(log_each);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => stats.log_now(),
                    _ = shutdown.recv() => break,
                }
            }
        })
    }
}
