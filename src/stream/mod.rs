// ABOUTME: Events delivered by the upstream block stream to the sinkers
// ABOUTME: The concrete tonic client lives in stream::client

pub mod client;

use std::pin::Pin;

use futures::Stream;

use crate::cursor::{BlockRef, Cursor};
use crate::error::Error;
use crate::proto::sf::substreams::rpc::v2::BlockScopedData;

pub use client::{load_package, output_module_hash, SubstreamsClient};

/// One event from the upstream, delivered in order with its cursor.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    BlockScopedData {
        data: BlockScopedData,
        /// Whether the block is near the chain head; the sinker flushes
        /// every block while live.
        is_live: bool,
        cursor: Cursor,
    },
    BlockUndoSignal {
        last_valid_block: BlockRef,
        cursor: Cursor,
    },
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, Error>> + Send>>;

/// Anything able to produce an ordered stream of block events from a
/// resume cursor.
pub trait BlockSource {
    fn events(&self, resume: Cursor) -> EventStream;
}
