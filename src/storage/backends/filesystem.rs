use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::error::{StorageError, StorageResult};
use crate::host::{commands, invoke_as, InvokeChannel};
use crate::payload::ImagePayload;
use crate::storage::template::{ensure_image_id, StorageAdapter};

pub const IMAGE_EXTENSION: &str = "png";

/// Stores each image as `<directory>/<id>.png` on the host filesystem.
///
/// The adapter never touches the disk itself, every operation is a round
/// trip through the host channel. Loads return `ImagePayload::Binary`.
pub struct FileSystemStorageAdapter {
    directory: PathBuf,
    host: Arc<dyn InvokeChannel>,
}

impl FileSystemStorageAdapter {
    /// Creates the adapter and makes sure its directory exists.
    pub async fn connect(
        directory: impl Into<PathBuf>,
        host: Arc<dyn InvokeChannel>,
    ) -> StorageResult<Self> {
        let directory = directory.into();
        if directory.as_os_str().is_empty() {
            return Err(StorageError::configuration(
                "the filesystem backend requires a directory",
            ));
        }

        host.invoke(commands::FS_ENSURE_DIRECTORY, json!({ "path": &directory }))
            .await?;

        Ok(Self { directory, host })
    }

    pub fn directory(&self) -> &PathBuf {
        &self.directory
    }

    #[inline]
    fn format_path(&self, image_id: &str) -> StorageResult<PathBuf> {
        ensure_image_id(image_id)?;

        if image_id.contains('/') || image_id.contains('\\') || image_id == "." || image_id == ".." {
            return Err(StorageError::invalid(format!(
                "image id {:?} must not contain path separators",
                image_id
            )));
        }

        Ok(self
            .directory
            .join(format!("{}.{}", image_id, IMAGE_EXTENSION)))
    }
}

#[async_trait]
impl StorageAdapter for FileSystemStorageAdapter {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    async fn save_image(&self, image_id: &str, data: ImagePayload) -> StorageResult<()> {
        let path = self.format_path(image_id)?;

        debug!("Storing image @ {:?}", &path);
        self.host
            .invoke(
                commands::FS_SAVE_IMAGE,
                json!({ "path": path, "data": data.into_text() }),
            )
            .await?;

        Ok(())
    }

    async fn load_image(&self, image_id: &str) -> StorageResult<ImagePayload> {
        let path = self.format_path(image_id)?;

        debug!("Retrieving image @ {:?}", &path);
        let encoded: String =
            invoke_as(self.host.as_ref(), commands::FS_LOAD_IMAGE, json!({ "path": path }))
                .await?;

        let data = ImagePayload::Text(encoded)
            .into_bytes()
            .map_err(|e| StorageError::transport(format!("host sent a corrupt image: {}", e)))?;

        Ok(ImagePayload::Binary(data))
    }

    async fn delete_image(&self, image_id: &str) -> StorageResult<()> {
        let path = self.format_path(image_id)?;

        debug!("Purging image @ {:?}", &path);
        self.host
            .invoke(commands::FS_DELETE_IMAGE, json!({ "path": path }))
            .await?;

        Ok(())
    }

    async fn list_images(&self) -> StorageResult<Vec<String>> {
        let files: Vec<String> = invoke_as(
            self.host.as_ref(),
            commands::FS_LIST_IMAGES,
            json!({ "directory": &self.directory }),
        )
        .await?;

        let suffix = format!(".{}", IMAGE_EXTENSION);
        let ids = files
            .into_iter()
            .filter_map(|name| name.strip_suffix(&suffix).map(String::from))
            .filter(|id| !id.is_empty())
            .collect();

        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostDispatcher;
    use bytes::Bytes;
    use tempfile::TempDir;

    async fn adapter(temp: &TempDir) -> FileSystemStorageAdapter {
        let host: Arc<dyn InvokeChannel> = Arc::new(HostDispatcher::new());
        FileSystemStorageAdapter::connect(temp.path().join("images"), host)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn connect_creates_the_directory() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let adapter = adapter(&temp).await;
        assert!(adapter.directory().is_dir());
        Ok(())
    }

    #[tokio::test]
    async fn empty_directory_is_a_configuration_error() {
        let host: Arc<dyn InvokeChannel> = Arc::new(HostDispatcher::new());
        let err = FileSystemStorageAdapter::connect("", host)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StorageError::Configuration(_)));
    }

    #[tokio::test]
    async fn ids_round_trip_through_list_and_load() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let adapter = adapter(&temp).await;

        adapter.save_image("cat", vec![9u8, 8, 7].into()).await?;
        adapter
            .save_image("dog", base64::encode([1u8, 2]).into())
            .await?;
        std::fs::write(adapter.directory().join("notes.txt"), b"ignored")?;

        let mut ids = adapter.list_images().await?;
        ids.sort();
        assert_eq!(ids, vec!["cat".to_string(), "dog".to_string()]);

        let cat = adapter.load_image("cat").await?;
        assert_eq!(cat, ImagePayload::Binary(Bytes::from_static(&[9, 8, 7])));
        assert_eq!(adapter.load_image("dog").await?.into_bytes()?.as_ref(), &[1u8, 2]);
        Ok(())
    }

    #[tokio::test]
    async fn saving_overwrites_previous_data() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let adapter = adapter(&temp).await;

        adapter.save_image("a", vec![1u8].into()).await?;
        adapter.save_image("a", vec![2u8, 2].into()).await?;
        assert_eq!(adapter.load_image("a").await?.into_bytes()?.as_ref(), &[2u8, 2]);
        Ok(())
    }

    #[tokio::test]
    async fn missing_image_is_not_found_and_delete_is_idempotent() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let adapter = adapter(&temp).await;

        let err = adapter.load_image("ghost").await.unwrap_err();
        assert!(err.is_not_found());

        adapter.delete_image("ghost").await?;
        Ok(())
    }

    #[tokio::test]
    async fn rejects_ids_with_separators() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let adapter = adapter(&temp).await;

        for id in ["a/b", "..", ".", "x\\y", ""] {
            let err = adapter.save_image(id, vec![1u8].into()).await.unwrap_err();
            assert!(matches!(err, StorageError::InvalidInput(_)), "{}", id);
        }

        // Dots are fine as long as the id is not a directory reference.
        adapter.save_image("v1..2", vec![5u8].into()).await?;
        assert!(adapter.list_images().await?.contains(&"v1..2".to_string()));
        assert_eq!(adapter.load_image("v1..2").await?.into_bytes()?.as_ref(), &[5u8]);
        Ok(())
    }
}
