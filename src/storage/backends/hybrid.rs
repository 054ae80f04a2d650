use std::sync::Arc;

use async_trait::async_trait;

use crate::error::StorageResult;
use crate::payload::ImagePayload;
use crate::storage::template::StorageAdapter;

/// Composes a local and a remote adapter, local first.
///
/// - Saves go to `local` then `remote`. A remote failure is returned to the
///   caller and the local copy is kept, the two can diverge until the next
///   successful save.
/// - Loads fall back to `remote` on *any* local failure, a missing local copy
///   and an unreachable local backend look the same to the caller.
/// - Deletes go to both, the first failure is returned.
/// - Listing only reports `local`. Images that exist only remotely can be
///   loaded but are never listed.
pub struct HybridStorageAdapter {
    local: Arc<dyn StorageAdapter>,
    remote: Arc<dyn StorageAdapter>,
}

impl HybridStorageAdapter {
    pub fn new(local: Arc<dyn StorageAdapter>, remote: Arc<dyn StorageAdapter>) -> Self {
        Self { local, remote }
    }

    pub fn local(&self) -> &Arc<dyn StorageAdapter> {
        &self.local
    }

    pub fn remote(&self) -> &Arc<dyn StorageAdapter> {
        &self.remote
    }
}

#[async_trait]
impl StorageAdapter for HybridStorageAdapter {
    fn name(&self) -> &'static str {
        "hybrid"
    }

    async fn save_image(&self, image_id: &str, data: ImagePayload) -> StorageResult<()> {
        self.local.save_image(image_id, data.clone()).await?;

        if let Err(e) = self.remote.save_image(image_id, data).await {
            error!(
                "image {} saved to {} but not to {}: {}",
                image_id,
                self.local.name(),
                self.remote.name(),
                e,
            );
            return Err(e);
        }

        Ok(())
    }

    async fn load_image(&self, image_id: &str) -> StorageResult<ImagePayload> {
        let payload = match self.local.load_image(image_id).await {
            Ok(payload) => payload,
            Err(e) => {
                warn!(
                    "local load of {} from {} failed, falling back to {}: {}",
                    image_id,
                    self.local.name(),
                    self.remote.name(),
                    e,
                );
                self.remote.load_image(image_id).await?
            }
        };

        payload.into_bytes().map(ImagePayload::Binary)
    }

    async fn delete_image(&self, image_id: &str) -> StorageResult<()> {
        self.local.delete_image(image_id).await?;
        self.remote.delete_image(image_id).await
    }

    async fn list_images(&self) -> StorageResult<Vec<String>> {
        self.local.list_images().await
    }
}
