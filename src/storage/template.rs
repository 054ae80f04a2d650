use async_trait::async_trait;

use crate::error::{StorageError, StorageResult};
use crate::payload::ImagePayload;

/// The capability set every image storage backend provides.
///
/// Exactly one implementation is active per application instance, it is
/// built once at startup and handed to consumers as `Arc<dyn StorageAdapter>`.
/// Saving overwrites whatever was stored under the id, there is no merge
/// or versioning.
#[async_trait]
pub trait StorageAdapter: Sync + Send + 'static {
    /// A short name used when logging which backend handled a call.
    fn name(&self) -> &'static str;

    async fn save_image(&self, image_id: &str, data: ImagePayload) -> StorageResult<()>;

    /// Fails with `StorageError::NotFound` when nothing is stored under `image_id`.
    async fn load_image(&self, image_id: &str) -> StorageResult<ImagePayload>;

    async fn delete_image(&self, image_id: &str) -> StorageResult<()>;

    /// Every id currently stored in this adapter's namespace, in no
    /// particular order.
    async fn list_images(&self) -> StorageResult<Vec<String>>;
}

#[inline]
pub(crate) fn ensure_image_id(image_id: &str) -> StorageResult<()> {
    if image_id.is_empty() {
        Err(StorageError::invalid("image id must not be empty"))
    } else {
        Ok(())
    }
}
