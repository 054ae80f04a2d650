use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{StorageError, StorageResult};
use crate::payload::ImagePayload;
use crate::storage::kv::KeyValueStore;
use crate::storage::template::{ensure_image_id, StorageAdapter};

pub const DEFAULT_PREFIX: &str = "img_";

/// Stores images as base64 text in a key-value store under a fixed prefix.
///
/// The canonical representation is `ImagePayload::Text`.
pub struct Base64StorageAdapter {
    prefix: String,
    store: Arc<dyn KeyValueStore>,
}

impl Base64StorageAdapter {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_prefix(store, DEFAULT_PREFIX)
    }

    pub fn with_prefix(store: Arc<dyn KeyValueStore>, prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            store,
        }
    }

    #[inline]
    fn format_key(&self, image_id: &str) -> String {
        format!("{}{}", self.prefix, image_id)
    }
}

#[async_trait]
impl StorageAdapter for Base64StorageAdapter {
    fn name(&self) -> &'static str {
        "base64"
    }

    async fn save_image(&self, image_id: &str, data: ImagePayload) -> StorageResult<()> {
        ensure_image_id(image_id)?;
        let key = self.format_key(image_id);

        debug!("Storing image in key-value store @ {}", &key);
        self.store
            .set_item(&key, data.into_text())
            .map_err(|e| match e {
                StorageError::StorageWrite(_) => e,
                other => StorageError::write(format!("failed to save image: {}", other)),
            })
    }

    async fn load_image(&self, image_id: &str) -> StorageResult<ImagePayload> {
        ensure_image_id(image_id)?;
        let key = self.format_key(image_id);

        debug!("Retrieving image in key-value store @ {}", &key);
        self.store
            .get_item(&key)
            .filter(|data| !data.is_empty())
            .map(ImagePayload::Text)
            .ok_or_else(|| StorageError::not_found(format!("image {}", image_id)))
    }

    async fn delete_image(&self, image_id: &str) -> StorageResult<()> {
        ensure_image_id(image_id)?;
        let key = self.format_key(image_id);

        debug!("Purging image in key-value store @ {}", &key);
        self.store.remove_item(&key);
        Ok(())
    }

    async fn list_images(&self) -> StorageResult<Vec<String>> {
        // Empty entries are not loadable, so they are not listed either.
        let ids = self
            .store
            .keys()
            .into_iter()
            .filter(|key| self.store.get_item(key).map_or(false, |v| !v.is_empty()))
            .filter_map(|key| key.strip_prefix(self.prefix.as_str()).map(String::from))
            .collect();

        Ok(ids)
    }
}
