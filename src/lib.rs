//! Image storage and entity persistence for an image annotation tool.
//!
//! Images go through a `StorageAdapter` (browser key-value store, host
//! filesystem, S3 or a hybrid of the two), entities through a `DataAccess`
//! (in-process documents, SQLite inside the desktop host or a REST API).
//! `provider` picks both from the environment the process runs in.

#[macro_use]
extern crate tracing;

pub mod config;
pub mod data;
pub mod error;
pub mod host;
pub mod payload;
pub mod provider;
pub mod routes;
pub mod storage;
pub mod utils;

#[cfg(test)]
mod tests;

pub use data::DataAccess;
pub use error::{StorageError, StorageResult};
pub use payload::ImagePayload;
pub use storage::StorageAdapter;
