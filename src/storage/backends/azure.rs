use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::StatusCode;
use serde::Deserialize;
use urlencoding::encode;

use crate::error::{StorageError, StorageResult};
use crate::payload::ImagePayload;
use crate::storage::template::{ensure_image_id, StorageAdapter};

/// The Blob service version requests are made against.
const API_VERSION: &str = "2021-08-06";

pub type BlobStream = BoxStream<'static, StorageResult<Bytes>>;

/// One page of a flat container listing.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BlobPage {
    pub names: Vec<String>,

    /// Empty or `None` once the listing is complete.
    pub next_marker: Option<String>,
}

/// The container calls the adapter needs.
#[async_trait]
pub trait ContainerClient: Send + Sync + 'static {
    async fn upload_blob(&self, name: &str, data: Bytes) -> StorageResult<()>;

    /// The blob body as delivered, draining it is the adapter's job.
    async fn download_blob(&self, name: &str) -> StorageResult<BlobStream>;

    async fn delete_blob(&self, name: &str) -> StorageResult<()>;

    async fn list_blobs(&self, marker: Option<String>) -> StorageResult<BlobPage>;
}

/// Talks to the Blob service REST API, authorised by a shared access signature.
pub struct RestContainerClient {
    http: reqwest::Client,
    container: String,
    container_url: String,
    sas_token: Option<String>,
}

impl RestContainerClient {
    pub fn new(
        account: &str,
        container: &str,
        sas_token: Option<String>,
        endpoint: Option<String>,
    ) -> StorageResult<Self> {
        validate_account(account)?;
        validate_container(container)?;

        let endpoint = endpoint
            .unwrap_or_else(|| format!("https://{}.blob.core.windows.net", account));

        let mut headers = HeaderMap::new();
        headers.insert("x-ms-version", HeaderValue::from_static(API_VERSION));

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| StorageError::configuration(format!("cannot build http client: {}", e)))?;

        Ok(Self {
            http,
            container: container.to_string(),
            container_url: format!("{}/{}", endpoint.trim_end_matches('/'), container),
            sas_token: sas_token
                .map(|t| t.trim_start_matches('?').to_string())
                .filter(|t| !t.is_empty()),
        })
    }

    fn signed(&self, url: String) -> String {
        match self.sas_token.as_deref() {
            Some(sas) if url.contains('?') => format!("{}&{}", url, sas),
            Some(sas) => format!("{}?{}", url, sas),
            None => url,
        }
    }

    #[inline]
    fn blob_url(&self, name: &str) -> String {
        self.signed(format!("{}/{}", self.container_url, encode(name)))
    }
}

/// Reads the response body for an error message.
async fn failure_text(response: reqwest::Response) -> String {
    let status = response.status();
    match response.text().await {
        Ok(body) if !body.is_empty() => format!("{}: {}", status, body),
        _ => status.to_string(),
    }
}

#[async_trait]
impl ContainerClient for RestContainerClient {
    async fn upload_blob(&self, name: &str, data: Bytes) -> StorageResult<()> {
        let response = self
            .http
            .put(self.blob_url(name))
            .header("x-ms-blob-type", "BlockBlob")
            .body(data)
            .send()
            .await
            .map_err(|e| {
                StorageError::write(format!("put {}/{} failed: {}", &self.container, name, e.without_url()))
            })?;

        if !response.status().is_success() {
            return Err(StorageError::write(format!(
                "put {}/{} returned {}",
                &self.container,
                name,
                failure_text(response).await,
            )));
        }

        Ok(())
    }

    async fn download_blob(&self, name: &str) -> StorageResult<BlobStream> {
        let response = self
            .http
            .get(self.blob_url(name))
            .send()
            .await
            .map_err(|e| {
                StorageError::transport(format!("get {}/{} failed: {}", &self.container, name, e.without_url()))
            })?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(StorageError::not_found(format!("{}/{}", &self.container, name))),
            status if status.is_success() => Ok(response
                .bytes_stream()
                .map(|chunk| {
                    chunk.map_err(|e| StorageError::transport(format!("body read failed: {}", e.without_url())))
                })
                .boxed()),
            _ => Err(StorageError::transport(format!(
                "get {}/{} returned {}",
                &self.container,
                name,
                failure_text(response).await,
            ))),
        }
    }

    async fn delete_blob(&self, name: &str) -> StorageResult<()> {
        let response = self
            .http
            .delete(self.blob_url(name))
            .send()
            .await
            .map_err(|e| {
                StorageError::write(format!("delete {}/{} failed: {}", &self.container, name, e.without_url()))
            })?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(()),
            status if status.is_success() => Ok(()),
            _ => Err(StorageError::write(format!(
                "delete {}/{} returned {}",
                &self.container,
                name,
                failure_text(response).await,
            ))),
        }
    }

    async fn list_blobs(&self, marker: Option<String>) -> StorageResult<BlobPage> {
        let mut url = format!("{}?restype=container&comp=list", self.container_url);
        if let Some(marker) = marker {
            url.push_str(&format!("&marker={}", encode(&marker)));
        }

        let response = self
            .http
            .get(self.signed(url))
            .send()
            .await
            .map_err(|e| {
                StorageError::transport(format!("listing {} failed: {}", &self.container, e.without_url()))
            })?;

        if !response.status().is_success() {
            return Err(StorageError::transport(format!(
                "listing {} returned {}",
                &self.container,
                failure_text(response).await,
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| StorageError::transport(format!("listing {} failed: {}", &self.container, e.without_url())))?;

        parse_listing(&body)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EnumerationResults {
    #[serde(default)]
    blobs: BlobList,

    #[serde(default)]
    next_marker: String,
}

#[derive(Debug, Default, Deserialize)]
struct BlobList {
    #[serde(rename = "Blob", default)]
    items: Vec<BlobItem>,
}

#[derive(Debug, Deserialize)]
struct BlobItem {
    #[serde(rename = "Name")]
    name: String,
}

/// Parses a `List Blobs` response body.
pub fn parse_listing(xml: &str) -> StorageResult<BlobPage> {
    let results: EnumerationResults = quick_xml::de::from_str(xml.trim_start_matches('\u{feff}'))
        .map_err(|e| StorageError::transport(format!("unexpected listing body: {}", e)))?;

    Ok(BlobPage {
        names: results.blobs.items.into_iter().map(|b| b.name).collect(),
        next_marker: Some(results.next_marker).filter(|m| !m.is_empty()),
    })
}

/// 3 to 24 lowercase letters and digits.
fn validate_account(account: &str) -> StorageResult<()> {
    let valid = (3..=24).contains(&account.len())
        && account.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit());

    if valid {
        Ok(())
    } else {
        Err(StorageError::configuration(format!(
            "azure account name {:?} must be 3 to 24 lowercase letters and digits",
            account
        )))
    }
}

/// Lowercase letters, digits and inner hyphens.
fn validate_container(container: &str) -> StorageResult<()> {
    let valid = !container.is_empty()
        && !container.starts_with('-')
        && !container.ends_with('-')
        && container
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');

    if valid {
        Ok(())
    } else {
        Err(StorageError::configuration(format!(
            "azure container name {:?} may only hold lowercase letters, digits and inner hyphens",
            container
        )))
    }
}

/// Stores images as block blobs in an Azure storage container, named by
/// the bare image id.
///
/// Loads return `ImagePayload::Binary`.
pub struct AzureBlobStorageAdapter {
    client: Arc<dyn ContainerClient>,
}

impl AzureBlobStorageAdapter {
    pub fn new(
        account: &str,
        container: &str,
        sas_token: Option<String>,
        endpoint: Option<String>,
    ) -> StorageResult<Self> {
        let client = RestContainerClient::new(account, container, sas_token, endpoint)?;
        Ok(Self::with_client(Arc::new(client)))
    }

    pub fn with_client(client: Arc<dyn ContainerClient>) -> Self {
        Self { client }
    }
}

/// Reads the stream to completion, chunks are appended in delivery order.
async fn drain_blob(mut stream: BlobStream) -> StorageResult<Bytes> {
    let mut buffer = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        buffer.extend_from_slice(&chunk?);
    }

    Ok(buffer.freeze())
}

#[async_trait]
impl StorageAdapter for AzureBlobStorageAdapter {
    fn name(&self) -> &'static str {
        "azure"
    }

    async fn save_image(&self, image_id: &str, data: ImagePayload) -> StorageResult<()> {
        ensure_image_id(image_id)?;
        let data = data.into_bytes()?;

        debug!("Storing image in container @ {}", image_id);
        self.client.upload_blob(image_id, data).await
    }

    async fn load_image(&self, image_id: &str) -> StorageResult<ImagePayload> {
        ensure_image_id(image_id)?;

        debug!("Retrieving image in container @ {}", image_id);
        let stream = self.client.download_blob(image_id).await?;
        let data = drain_blob(stream).await?;

        Ok(ImagePayload::Binary(data))
    }

    async fn delete_image(&self, image_id: &str) -> StorageResult<()> {
        ensure_image_id(image_id)?;

        debug!("Purging blob in container @ {}", image_id);
        self.client.delete_blob(image_id).await
    }

    async fn list_images(&self) -> StorageResult<Vec<String>> {
        let mut names = vec![];
        let mut marker = None;

        loop {
            let page = self.client.list_blobs(marker.take()).await?;
            names.extend(page.names);

            match page.next_marker.filter(|m| !m.is_empty()) {
                Some(next) => marker = Some(next),
                None => break,
            }
        }

        debug!("listed {} blobs", names.len());
        Ok(names)
    }
}
