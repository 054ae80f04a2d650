use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use rusoto_core::credential::{DefaultCredentialsProvider, StaticProvider};
use rusoto_core::{ByteStream, HttpClient, Region, RusotoError};
use rusoto_s3::{
    DeleteObjectRequest,
    GetObjectError,
    GetObjectRequest,
    ListObjectsV2Output,
    ListObjectsV2Request,
    PutObjectRequest,
    S3Client,
    S3,
};
use serde::Deserialize;

use crate::error::{StorageError, StorageResult};
use crate::payload::ImagePayload;
use crate::storage::template::{ensure_image_id, StorageAdapter};

/// Where the S3 client gets its credentials from.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase", tag = "source")]
pub enum S3Credentials {
    /// Explicit keys, the session token covers temporary/federated sessions.
    Static {
        access_key: String,
        secret_key: String,
        session_token: Option<String>,
    },

    /// The standard provider chain: environment, profile, web identity,
    /// container and instance metadata.
    Default,
}

impl Default for S3Credentials {
    fn default() -> Self {
        Self::Default
    }
}

/// The object store calls the adapter needs.
///
/// `get_object` returns the body as a stream (or `None` when the store sent
/// no body at all), draining it is the adapter's job.
#[async_trait]
pub trait ObjectClient: Send + Sync + 'static {
    async fn put_object(&self, bucket: &str, key: &str, data: Bytes) -> StorageResult<()>;

    async fn get_object(&self, bucket: &str, key: &str) -> StorageResult<Option<ByteStream>>;

    async fn delete_object(&self, bucket: &str, key: &str) -> StorageResult<()>;

    async fn list_objects(
        &self,
        bucket: &str,
        continuation_token: Option<String>,
    ) -> StorageResult<ListObjectsV2Output>;
}

#[async_trait]
impl ObjectClient for S3Client {
    async fn put_object(&self, bucket: &str, key: &str, data: Bytes) -> StorageResult<()> {
        let request = PutObjectRequest {
            bucket: bucket.to_string(),
            key: key.to_string(),
            content_length: Some(data.len() as i64),
            body: Some(ByteStream::from(data.to_vec())),
            ..Default::default()
        };

        S3::put_object(self, request)
            .await
            .map_err(|e| StorageError::write(format!("put {}/{} failed: {}", bucket, key, e)))?;

        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> StorageResult<Option<ByteStream>> {
        let request = GetObjectRequest {
            bucket: bucket.to_string(),
            key: key.to_string(),
            ..Default::default()
        };

        match S3::get_object(self, request).await {
            Ok(output) => Ok(output.body),
            Err(RusotoError::Service(GetObjectError::NoSuchKey(_))) => {
                Err(StorageError::not_found(format!("{}/{}", bucket, key)))
            }
            Err(RusotoError::Unknown(ref resp)) if resp.status.as_u16() == 404 => {
                Err(StorageError::not_found(format!("{}/{}", bucket, key)))
            }
            Err(other) => Err(StorageError::transport(format!(
                "get {}/{} failed: {}",
                bucket, key, other
            ))),
        }
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> StorageResult<()> {
        let request = DeleteObjectRequest {
            bucket: bucket.to_string(),
            key: key.to_string(),
            ..Default::default()
        };

        S3::delete_object(self, request)
            .await
            .map_err(|e| StorageError::write(format!("delete {}/{} failed: {}", bucket, key, e)))?;

        Ok(())
    }

    async fn list_objects(
        &self,
        bucket: &str,
        continuation_token: Option<String>,
    ) -> StorageResult<ListObjectsV2Output> {
        let request = ListObjectsV2Request {
            bucket: bucket.to_string(),
            continuation_token,
            ..Default::default()
        };

        S3::list_objects_v2(self, request)
            .await
            .map_err(|e| StorageError::transport(format!("listing {} failed: {}", bucket, e)))
    }
}

/// Stores images in an S3 compatible bucket, keyed by the bare image id.
///
/// Loads return `ImagePayload::Binary`.
pub struct S3StorageAdapter {
    bucket: String,
    client: Arc<dyn ObjectClient>,
}

impl S3StorageAdapter {
    pub fn new(
        bucket: String,
        region: String,
        endpoint: Option<String>,
        credentials: S3Credentials,
    ) -> StorageResult<Self> {
        if bucket.is_empty() {
            return Err(StorageError::configuration("the s3 backend requires a bucket"));
        }

        let region = match endpoint {
            Some(endpoint) => Region::Custom {
                name: region,
                endpoint,
            },
            None => Region::from_str(&region).map_err(|e| {
                StorageError::configuration(format!("unknown region {:?}: {}", region, e))
            })?,
        };

        let dispatcher = HttpClient::new()
            .map_err(|e| StorageError::configuration(format!("cannot build http client: {}", e)))?;

        let client = match credentials {
            S3Credentials::Static {
                access_key,
                secret_key,
                session_token,
            } => {
                let provider = StaticProvider::new(access_key, secret_key, session_token, None);
                S3Client::new_with(dispatcher, provider, region)
            }
            S3Credentials::Default => {
                let provider = DefaultCredentialsProvider::new().map_err(|e| {
                    StorageError::configuration(format!("no credentials available: {}", e))
                })?;
                S3Client::new_with(dispatcher, provider, region)
            }
        };

        Ok(Self::with_client(bucket, Arc::new(client)))
    }

    pub fn with_client(bucket: String, client: Arc<dyn ObjectClient>) -> Self {
        Self { bucket, client }
    }
}

/// Reads the stream to completion, chunks are appended in delivery order.
async fn drain_body(body: Option<ByteStream>) -> StorageResult<Bytes> {
    let mut stream = match body {
        Some(stream) => stream,
        None => return Ok(Bytes::new()),
    };

    let mut buffer = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| StorageError::transport(format!("body read failed: {}", e)))?;
        buffer.extend_from_slice(&chunk);
    }

    Ok(buffer.freeze())
}

#[async_trait]
impl StorageAdapter for S3StorageAdapter {
    fn name(&self) -> &'static str {
        "s3"
    }

    async fn save_image(&self, image_id: &str, data: ImagePayload) -> StorageResult<()> {
        ensure_image_id(image_id)?;
        let data = data.into_bytes()?;

        debug!("Storing image in bucket @ {}/{}", &self.bucket, image_id);
        self.client.put_object(&self.bucket, image_id, data).await
    }

    async fn load_image(&self, image_id: &str) -> StorageResult<ImagePayload> {
        ensure_image_id(image_id)?;

        debug!("Retrieving image in bucket @ {}/{}", &self.bucket, image_id);
        let body = self.client.get_object(&self.bucket, image_id).await?;
        let data = drain_body(body).await?;

        Ok(ImagePayload::Binary(data))
    }

    async fn delete_image(&self, image_id: &str) -> StorageResult<()> {
        ensure_image_id(image_id)?;

        debug!("Purging file in bucket @ {}/{}", &self.bucket, image_id);
        self.client.delete_object(&self.bucket, image_id).await
    }

    async fn list_images(&self) -> StorageResult<Vec<String>> {
        let mut keys = vec![];
        let mut continuation_token = None;

        loop {
            let page = self
                .client
                .list_objects(&self.bucket, continuation_token.take())
                .await?;

            keys.extend(
                page.contents
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|object| object.key),
            );

            match (page.is_truncated, page.next_continuation_token) {
                (Some(true), Some(token)) => continuation_token = Some(token),
                (Some(true), None) => {
                    warn!(
                        "bucket {} reported a truncated listing without a continuation token",
                        &self.bucket
                    );
                    break;
                }
                _ => break,
            }
        }

        debug!("listed {} objects in bucket {}", keys.len(), &self.bucket);
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hashbrown::HashMap;
    use parking_lot::Mutex;
    use rusoto_s3::Object;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves objects as a sequence of chunks and lists them `page_size` at a time.
    #[derive(Default)]
    struct MockObjectClient {
        objects: Mutex<HashMap<String, Vec<Vec<u8>>>>,
        missing_body: bool,
        missing_contents: bool,
        truncated_without_token: bool,
        page_size: usize,
        list_calls: AtomicUsize,
    }

    impl MockObjectClient {
        fn with_page_size(page_size: usize) -> Self {
            Self {
                page_size,
                ..Default::default()
            }
        }

        fn insert_chunks(&self, key: &str, chunks: Vec<Vec<u8>>) {
            self.objects.lock().insert(key.to_string(), chunks);
        }
    }

    #[async_trait]
    impl ObjectClient for MockObjectClient {
        async fn put_object(&self, _bucket: &str, key: &str, data: Bytes) -> StorageResult<()> {
            self.insert_chunks(key, vec![data.to_vec()]);
            Ok(())
        }

        async fn get_object(&self, _bucket: &str, key: &str) -> StorageResult<Option<ByteStream>> {
            let chunks = self
                .objects
                .lock()
                .get(key)
                .cloned()
                .ok_or_else(|| StorageError::not_found(key.to_string()))?;

            if self.missing_body {
                return Ok(None);
            }

            let chunks: Vec<Result<Bytes, std::io::Error>> =
                chunks.into_iter().map(|c| Ok(Bytes::from(c))).collect();
            Ok(Some(ByteStream::new(futures::stream::iter(chunks))))
        }

        async fn delete_object(&self, _bucket: &str, key: &str) -> StorageResult<()> {
            self.objects.lock().remove(key);
            Ok(())
        }

        async fn list_objects(
            &self,
            _bucket: &str,
            continuation_token: Option<String>,
        ) -> StorageResult<ListObjectsV2Output> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            if self.missing_contents {
                return Ok(ListObjectsV2Output::default());
            }

            let mut keys: Vec<String> = self.objects.lock().keys().cloned().collect();
            keys.sort();

            let start: usize = continuation_token
                .map(|t| t.parse().unwrap())
                .unwrap_or(0);
            let end = (start + self.page_size.max(1)).min(keys.len());
            let truncated = end < keys.len();

            Ok(ListObjectsV2Output {
                contents: Some(
                    keys[start..end]
                        .iter()
                        .map(|k| Object {
                            key: Some(k.clone()),
                            ..Default::default()
                        })
                        .collect(),
                ),
                is_truncated: Some(truncated),
                next_continuation_token: truncated
                    .then(|| end.to_string())
                    .filter(|_| !self.truncated_without_token),
                ..Default::default()
            })
        }
    }

    fn adapter(client: MockObjectClient) -> (Arc<MockObjectClient>, S3StorageAdapter) {
        let client = Arc::new(client);
        let adapter = S3StorageAdapter::with_client("bucket".into(), client.clone());
        (client, adapter)
    }

    #[tokio::test]
    async fn chunked_bodies_are_concatenated_in_order() -> anyhow::Result<()> {
        let (client, adapter) = adapter(MockObjectClient::with_page_size(10));
        client.insert_chunks("img", vec![vec![1, 2], vec![3, 4]]);

        let loaded = adapter.load_image("img").await?;
        assert_eq!(loaded, ImagePayload::Binary(Bytes::from(vec![1u8, 2, 3, 4])));
        Ok(())
    }

    #[tokio::test]
    async fn empty_body_is_an_empty_buffer() -> anyhow::Result<()> {
        let (client, adapter) = adapter(MockObjectClient {
            missing_body: true,
            ..MockObjectClient::with_page_size(10)
        });
        client.insert_chunks("img", vec![]);

        let loaded = adapter.load_image("img").await?;
        assert!(loaded.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn missing_contents_is_an_empty_listing() -> anyhow::Result<()> {
        let (_, adapter) = adapter(MockObjectClient {
            missing_contents: true,
            ..MockObjectClient::with_page_size(10)
        });

        assert!(adapter.list_images().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn listing_follows_continuation_tokens() -> anyhow::Result<()> {
        let (client, adapter) = adapter(MockObjectClient::with_page_size(2));
        for key in ["a", "b", "c", "d", "e"] {
            client.insert_chunks(key, vec![vec![0]]);
        }

        let keys = adapter.list_images().await?;
        assert_eq!(keys, vec!["a", "b", "c", "d", "e"]);
        Ok(())
    }

    #[tokio::test]
    async fn every_listed_id_across_pages_loads() -> anyhow::Result<()> {
        let (client, adapter) = adapter(MockObjectClient::with_page_size(2));
        for (i, key) in ["img1", "img2", "img3", "img4", "img5"].iter().enumerate() {
            client.insert_chunks(key, vec![vec![i as u8], vec![0xAA]]);
        }

        let keys = adapter.list_images().await?;
        assert_eq!(keys.len(), 5);
        assert_eq!(client.list_calls.load(Ordering::SeqCst), 3);

        for (i, key) in keys.iter().enumerate() {
            let data = adapter.load_image(key).await?.into_bytes()?;
            assert_eq!(data.as_ref(), &[i as u8, 0xAA]);
        }
        Ok(())
    }

    #[tokio::test]
    async fn truncated_listing_without_a_token_stops_after_one_page() -> anyhow::Result<()> {
        let (client, adapter) = adapter(MockObjectClient {
            truncated_without_token: true,
            ..MockObjectClient::with_page_size(2)
        });
        for key in ["a", "b", "c"] {
            client.insert_chunks(key, vec![vec![0]]);
        }

        let keys = adapter.list_images().await?;
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(client.list_calls.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn text_payloads_are_stored_as_bytes() -> anyhow::Result<()> {
        let (_, adapter) = adapter(MockObjectClient::with_page_size(10));
        adapter
            .save_image("img", base64::encode([5u8, 6, 7]).into())
            .await?;

        let loaded = adapter.load_image("img").await?.into_bytes()?;
        assert_eq!(loaded.as_ref(), &[5u8, 6, 7]);
        Ok(())
    }

    #[tokio::test]
    async fn deleted_images_are_not_found() -> anyhow::Result<()> {
        let (_, adapter) = adapter(MockObjectClient::with_page_size(10));
        adapter.save_image("img", vec![1u8].into()).await?;
        adapter.delete_image("img").await?;

        let err = adapter.load_image("img").await.unwrap_err();
        assert!(err.is_not_found());
        Ok(())
    }

    #[test]
    fn unknown_regions_are_rejected() {
        let err = S3StorageAdapter::new(
            "bucket".into(),
            "mars-north-1".into(),
            None,
            S3Credentials::Static {
                access_key: "a".into(),
                secret_key: "b".into(),
                session_token: None,
            },
        )
        .err()
        .unwrap();
        assert!(matches!(err, StorageError::Configuration(_)));
    }
}
