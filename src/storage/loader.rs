use bytes::Bytes;
use image::ImageFormat;

use crate::error::StorageResult;
use crate::storage::template::StorageAdapter;

pub const FALLBACK_CONTENT_TYPE: &str = "image/png";

/// An image ready to be handed to a viewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayImage {
    pub content_type: &'static str,
    pub data: Bytes,
}

/// Loads an image through any adapter and sniffs its content type.
///
/// Whatever representation the adapter returns is normalised into bytes
/// first, undetectable formats are reported as PNG.
pub async fn load_display_bytes(
    adapter: &dyn StorageAdapter,
    image_id: &str,
) -> StorageResult<DisplayImage> {
    let data = adapter.load_image(image_id).await?.into_bytes()?;

    Ok(DisplayImage {
        content_type: sniff_content_type(&data),
        data,
    })
}

pub fn sniff_content_type(data: &[u8]) -> &'static str {
    match image::guess_format(data) {
        Ok(ImageFormat::Jpeg) => "image/jpeg",
        Ok(ImageFormat::Gif) => "image/gif",
        Ok(ImageFormat::WebP) => "image/webp",
        Ok(ImageFormat::Bmp) => "image/bmp",
        Ok(ImageFormat::Tiff) => "image/tiff",
        _ => FALLBACK_CONTENT_TYPE,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::storage::backends::base64::Base64StorageAdapter;
    use crate::storage::kv::MemoryKeyValueStore;

    const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0];
    const JPEG_MAGIC: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0, 0];

    #[tokio::test]
    async fn text_payloads_are_decoded_and_sniffed() -> anyhow::Result<()> {
        let adapter = Base64StorageAdapter::new(Arc::new(MemoryKeyValueStore::new()));
        let url = format!("data:image/jpeg;base64,{}", base64::encode(JPEG_MAGIC));
        adapter.save_image("photo", url.into()).await?;

        let image = load_display_bytes(&adapter, "photo").await?;
        assert_eq!(image.content_type, "image/jpeg");
        assert_eq!(image.data.as_ref(), JPEG_MAGIC);
        Ok(())
    }

    #[test]
    fn unknown_formats_fall_back_to_png() {
        assert_eq!(sniff_content_type(PNG_MAGIC), "image/png");
        assert_eq!(sniff_content_type(b"plain text"), FALLBACK_CONTENT_TYPE);
    }
}
