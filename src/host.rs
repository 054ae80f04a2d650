//! The privileged host process.
//!
//! The UI side may be sandboxed and unable to touch the filesystem or a
//! database directly, everything it needs from the host goes through a
//! generic `(command, args) -> result` channel.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{StorageError, StorageResult};

pub mod dispatcher;
pub mod ipc;
pub mod sqlite;

pub use dispatcher::HostDispatcher;
pub use ipc::IpcClient;

/// Command names understood by the host dispatcher.
pub mod commands {
    pub const FS_ENSURE_DIRECTORY: &str = "fs-ensure-directory";
    pub const FS_SAVE_IMAGE: &str = "fs-save-image";
    pub const FS_LOAD_IMAGE: &str = "fs-load-image";
    pub const FS_DELETE_IMAGE: &str = "fs-delete-image";
    pub const FS_LIST_IMAGES: &str = "fs-list-images";

    pub const SQLITE_GET: &str = "sqlite:get";
    pub const SQLITE_ALL: &str = "sqlite:all";
    pub const SQLITE_RUN: &str = "sqlite:run";
    pub const SQLITE_BATCH: &str = "sqlite:batch";
}

#[async_trait]
pub trait InvokeChannel: Send + Sync + 'static {
    async fn invoke(&self, command: &str, args: Value) -> StorageResult<Value>;
}

/// Invokes a command and deserializes its result.
pub async fn invoke_as<T: DeserializeOwned>(
    channel: &dyn InvokeChannel,
    command: &str,
    args: Value,
) -> StorageResult<T> {
    let value = channel.invoke(command, args).await?;
    serde_json::from_value(value).map_err(|e| {
        StorageError::transport(format!(
            "host returned an unexpected result for {}: {}",
            command, e
        ))
    })
}
