// ABOUTME: Library root for the Substreams SQL sink
// ABOUTME: Declares the loader, sinker, bundler and stream modules

pub mod bundler;
pub mod cursor;
pub mod db;
pub mod error;
pub mod metrics;
pub mod proto;
pub mod sinker;
pub mod state;
pub mod stream;

pub use cursor::{BlockRef, Cursor, OnModuleHashMismatch};
pub use error::Error;
