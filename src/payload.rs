use bytes::Bytes;

use crate::error::{StorageError, StorageResult};

/// An image as it crosses an adapter boundary.
///
/// Browser-side backends deal in base64 text while the filesystem and
/// object storage deal in raw bytes. Adapters accept either form and
/// normalise it into their own canonical representation; whichever form
/// comes back out must decode into the original bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImagePayload {
    /// Base64 text, optionally wrapped in a `data:<mime>;base64,` URL.
    Text(String),

    /// The raw image bytes.
    Binary(Bytes),
}

impl ImagePayload {
    /// Normalise the payload into raw bytes.
    pub fn into_bytes(self) -> StorageResult<Bytes> {
        match self {
            Self::Binary(buff) => Ok(buff),
            Self::Text(text) => decode_text(&text).map(Bytes::from),
        }
    }

    /// Normalise the payload into base64 text.
    ///
    /// Text payloads are passed through untouched, including any data URL
    /// prefix the caller put on them.
    pub fn into_text(self) -> String {
        match self {
            Self::Text(text) => text,
            Self::Binary(buff) => base64::encode(&buff),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(text) => text.is_empty(),
            Self::Binary(buff) => buff.is_empty(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(buff) => buff.len(),
        }
    }
}

/// Strips the `data:image/png;base64,` prefix if present.
fn strip_data_url(text: &str) -> &str {
    if !text.starts_with("data:") {
        return text;
    }

    match text.find(";base64,") {
        Some(idx) => &text[idx + ";base64,".len()..],
        None => text,
    }
}

fn decode_text(text: &str) -> StorageResult<Vec<u8>> {
    let body = strip_data_url(text.trim());
    base64::decode(body)
        .map_err(|e| StorageError::invalid(format!("payload is not valid base64: {}", e)))
}

impl From<String> for ImagePayload {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&str> for ImagePayload {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<Vec<u8>> for ImagePayload {
    fn from(v: Vec<u8>) -> Self {
        Self::Binary(Bytes::from(v))
    }
}

impl From<Bytes> for ImagePayload {
    fn from(v: Bytes) -> Self {
        Self::Binary(v)
    }
}

impl From<&[u8]> for ImagePayload {
    fn from(v: &[u8]) -> Self {
        Self::Binary(Bytes::copy_from_slice(v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_decodes_into_original_bytes() {
        let payload = ImagePayload::from(base64::encode(b"abc"));
        assert_eq!(payload.into_bytes().unwrap(), Bytes::from_static(b"abc"));
    }

    #[test]
    fn data_url_prefix_is_stripped() {
        let text = format!("data:image/png;base64,{}", base64::encode([1u8, 2, 3]));
        let payload = ImagePayload::Text(text);
        assert_eq!(payload.into_bytes().unwrap().as_ref(), &[1u8, 2, 3]);
    }

    #[test]
    fn malformed_text_is_rejected() {
        let payload = ImagePayload::from("not base64!!");
        assert!(matches!(payload.into_bytes(), Err(StorageError::InvalidInput(_))));
    }

    #[test]
    fn binary_becomes_base64_text() {
        let payload = ImagePayload::from(vec![0u8, 255, 7]);
        let text = payload.into_text();
        assert_eq!(base64::decode(text).unwrap(), vec![0u8, 255, 7]);
    }
}
