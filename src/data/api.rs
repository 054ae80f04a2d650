use std::time::Duration;

use async_trait::async_trait;
use moka::sync::Cache;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use urlencoding::encode;

use super::models::{AiModel, Annotation, History, ImageData, Label, Project, Setting};
use super::{DataAccess, Filter, Patch};
use crate::error::{StorageError, StorageResult};

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000/api";
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);
const CACHE_CAPACITY: u64 = 1_000;

#[derive(Debug, Clone)]
pub struct ApiClientOptions {
    pub base_url: String,

    /// Sent as a bearer token with every request.
    pub auth_token: Option<String>,

    /// Caches successful GET responses for `cache_ttl`.
    pub cache: bool,
    pub cache_ttl: Duration,
}

impl Default for ApiClientOptions {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            auth_token: None,
            cache: false,
            cache_ttl: DEFAULT_CACHE_TTL,
        }
    }
}

/// A JSON client for the labelstore REST API.
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    cache: Option<Cache<String, Value>>,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> StorageResult<Self> {
        Self::with_options(ApiClientOptions {
            base_url: base_url.into(),
            ..Default::default()
        })
    }

    pub fn with_options(options: ApiClientOptions) -> StorageResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        if let Some(token) = options.auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| StorageError::configuration(format!("invalid auth token: {}", e)))?;
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| StorageError::configuration(format!("cannot build http client: {}", e)))?;

        let cache = options.cache.then(|| {
            Cache::builder()
                .max_capacity(CACHE_CAPACITY)
                .time_to_live(options.cache_ttl)
                .build()
        });

        Ok(Self {
            http,
            base_url: options.base_url.trim_end_matches('/').to_string(),
            cache,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn clear_cache(&self) {
        if let Some(cache) = self.cache.as_ref() {
            cache.invalidate_all();
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> StorageResult<T> {
        self.get_with_query(path, &[]).await
    }

    pub async fn get_with_query<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(String, String)],
    ) -> StorageResult<T> {
        let url = self.url(path);
        let key = format!("GET:{}?{}", url, encode_query(query));

        if let Some(hit) = self.cache.as_ref().and_then(|c| c.get(&key)) {
            debug!("cache hit for {}", &key);
            return decode(hit);
        }

        let value = self.send(Method::GET, url, query, None).await?;
        if let Some(cache) = self.cache.as_ref() {
            cache.insert(key, value.clone());
        }

        decode(value)
    }

    pub async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> StorageResult<Value> {
        self.write(Method::POST, path, Some(to_body(body)?)).await
    }

    pub async fn put<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> StorageResult<Value> {
        self.write(Method::PUT, path, Some(to_body(body)?)).await
    }

    pub async fn delete(&self, path: &str) -> StorageResult<Value> {
        self.write(Method::DELETE, path, None).await
    }

    #[inline]
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Any write may change what a cached GET would return.
    async fn write(&self, method: Method, path: &str, body: Option<Value>) -> StorageResult<Value> {
        let value = self.send(method, self.url(path), &[], body).await?;
        self.clear_cache();
        Ok(value)
    }

    async fn send(
        &self,
        method: Method,
        url: String,
        query: &[(String, String)],
        body: Option<Value>,
    ) -> StorageResult<Value> {
        debug!("{} {}", &method, &url);

        let mut request = self.http.request(method.clone(), &url);
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| StorageError::transport(format!("{} {} failed: {}", method, url, e)))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(StorageError::not_found(url));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| StorageError::transport(format!("reading {} failed: {}", url, e)))?;

        if !status.is_success() {
            return Err(StorageError::transport(format!(
                "{} {} returned {}: {}",
                method,
                url,
                status,
                String::from_utf8_lossy(&body),
            )));
        }

        if status == StatusCode::NO_CONTENT || body.is_empty() {
            return Ok(Value::Null);
        }

        serde_json::from_slice(&body)
            .map_err(|e| StorageError::transport(format!("{} returned invalid json: {}", url, e)))
    }
}

fn encode_query(query: &[(String, String)]) -> String {
    query
        .iter()
        .map(|(k, v)| format!("{}={}", encode(k), encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

fn to_body<B: Serialize + ?Sized>(body: &B) -> StorageResult<Value> {
    serde_json::to_value(body).map_err(|e| StorageError::invalid(e.to_string()))
}

fn decode<T: DeserializeOwned>(value: Value) -> StorageResult<T> {
    serde_json::from_value(value)
        .map_err(|e| StorageError::transport(format!("unexpected response shape: {}", e)))
}

/// Turns a JSON filter into query parameters, strings are sent verbatim.
pub fn filter_to_query(filter: &Filter) -> Vec<(String, String)> {
    filter
        .iter()
        .map(|(k, v)| {
            let v = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), v)
        })
        .collect()
}

/// `DataAccess` over the REST API.
///
/// Ids are percent-encoded into a single path segment.
pub struct ApiDataAccess {
    api: ApiClient,
}

impl ApiDataAccess {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }

    pub fn client(&self) -> &ApiClient {
        &self.api
    }

    async fn optional<T: DeserializeOwned>(&self, path: &str) -> StorageResult<Option<T>> {
        match self.api.get::<Option<T>>(path).await {
            Err(e) if e.is_not_found() => Ok(None),
            other => other,
        }
    }
}

#[async_trait]
impl DataAccess for ApiDataAccess {
    fn name(&self) -> &'static str {
        "api"
    }

    async fn get_projects(&self) -> StorageResult<Vec<Project>> {
        self.api.get("/projects").await
    }

    async fn get_project_by_id(&self, id: &str) -> StorageResult<Option<Project>> {
        self.optional(&format!("/projects/{}", encode(id))).await
    }

    async fn get_project_with_images(&self, id: &str) -> StorageResult<Option<Project>> {
        let mut project = match self.get_project_by_id(id).await? {
            Some(project) => project,
            None => return Ok(None),
        };

        project.images = Some(self.get_images(id).await?);
        Ok(Some(project))
    }

    async fn create_project(&self, project: &Project) -> StorageResult<()> {
        self.api.post("/projects", project).await?;
        Ok(())
    }

    async fn update_project(&self, id: &str, patch: Patch) -> StorageResult<()> {
        self.api.put(&format!("/projects/{}", encode(id)), &patch).await?;
        Ok(())
    }

    async fn delete_project(&self, id: &str) -> StorageResult<()> {
        self.api.delete(&format!("/projects/{}", encode(id))).await?;
        Ok(())
    }

    async fn get_images(&self, project_id: &str) -> StorageResult<Vec<ImageData>> {
        self.api.get(&format!("/projects/{}/images", encode(project_id))).await
    }

    async fn get_images_with_pagination(
        &self,
        project_id: &str,
        offset: usize,
        limit: usize,
    ) -> StorageResult<Vec<ImageData>> {
        let query = [
            ("offset".to_string(), offset.to_string()),
            ("limit".to_string(), limit.to_string()),
        ];
        self.api
            .get_with_query(&format!("/projects/{}/images", encode(project_id)), &query)
            .await
    }

    async fn get_next_image_id(&self, current_image_id: &str) -> StorageResult<Option<String>> {
        self.optional(&format!("/images/{}/next", encode(current_image_id))).await
    }

    async fn get_previous_image_id(
        &self,
        current_image_id: &str,
    ) -> StorageResult<Option<String>> {
        self.optional(&format!("/images/{}/previous", encode(current_image_id)))
            .await
    }

    async fn create_image(&self, image: &ImageData) -> StorageResult<()> {
        self.api.post("/images", image).await?;
        Ok(())
    }

    async fn update_image(&self, id: &str, patch: Patch) -> StorageResult<()> {
        self.api.put(&format!("/images/{}", encode(id)), &patch).await?;
        Ok(())
    }

    async fn delete_image(&self, id: &str) -> StorageResult<()> {
        self.api.delete(&format!("/images/{}", encode(id))).await?;
        Ok(())
    }

    async fn get_annotations(&self, image_id: &str) -> StorageResult<Vec<Annotation>> {
        self.api.get(&format!("/images/{}/annotations", encode(image_id))).await
    }

    async fn get_annotations_with_filter(
        &self,
        image_id: &str,
        filter: Filter,
    ) -> StorageResult<Vec<Annotation>> {
        self.api
            .get_with_query(
                &format!("/images/{}/annotations", encode(image_id)),
                &filter_to_query(&filter),
            )
            .await
    }

    async fn create_annotation(&self, annotation: &Annotation) -> StorageResult<()> {
        self.api.post("/annotations", annotation).await?;
        Ok(())
    }

    async fn update_annotation(&self, id: &str, patch: Patch) -> StorageResult<()> {
        self.api.put(&format!("/annotations/{}", encode(id)), &patch).await?;
        Ok(())
    }

    async fn delete_annotation(&self, id: &str) -> StorageResult<()> {
        self.api.delete(&format!("/annotations/{}", encode(id))).await?;
        Ok(())
    }

    async fn get_labels(&self) -> StorageResult<Vec<Label>> {
        self.api.get("/labels").await
    }

    async fn get_label_by_id(&self, id: &str) -> StorageResult<Option<Label>> {
        self.optional(&format!("/labels/{}", encode(id))).await
    }

    async fn create_label(&self, label: &Label, annotation_ids: &[String]) -> StorageResult<()> {
        self.api.post("/labels", label).await?;

        for annotation_id in annotation_ids {
            self.api
                .put(
                    &format!("/annotations/{}", encode(annotation_id)),
                    &json!({ "labelId": &label.id }),
                )
                .await?;
        }

        Ok(())
    }

    async fn update_label(&self, id: &str, patch: Patch) -> StorageResult<()> {
        self.api.put(&format!("/labels/{}", encode(id)), &patch).await?;
        Ok(())
    }

    async fn delete_label(&self, id: &str) -> StorageResult<()> {
        self.api.delete(&format!("/labels/{}", encode(id))).await?;
        Ok(())
    }

    async fn get_settings(&self) -> StorageResult<Vec<Setting>> {
        self.api.get("/settings").await
    }

    async fn get_setting(&self, key: &str) -> StorageResult<Option<Setting>> {
        self.optional(&format!("/settings/{}", encode(key))).await
    }

    async fn update_setting(&self, key: &str, value: &str) -> StorageResult<()> {
        self.api
            .put(&format!("/settings/{}", encode(key)), &json!({ "value": value }))
            .await?;
        Ok(())
    }

    async fn get_history(&self) -> StorageResult<Vec<History>> {
        self.api.get("/history").await
    }

    async fn update_history(&self, history: &History) -> StorageResult<()> {
        self.api.put("/history", history).await?;
        Ok(())
    }

    async fn get_available_models(&self) -> StorageResult<Vec<AiModel>> {
        self.api.get("/models").await
    }

    async fn upload_custom_model(&self, model: &AiModel) -> StorageResult<()> {
        self.api.post("/models", model).await?;
        Ok(())
    }

    async fn select_model(&self, model_id: &str) -> StorageResult<()> {
        self.api
            .post(&format!("/models/{}/select", encode(model_id)), &json!({}))
            .await?;
        Ok(())
    }

    async fn get_selected_model(&self) -> StorageResult<Option<AiModel>> {
        self.optional("/models/selected").await
    }

    async fn delete_model(&self, model_id: &str) -> StorageResult<()> {
        self.api.delete(&format!("/models/{}", encode(model_id))).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_become_plain_query_pairs() {
        let mut filter = Filter::new();
        filter.insert("color".into(), json!("#ff0000"));
        filter.insert("isAIGenerated".into(), json!(true));

        let query = filter_to_query(&filter);
        assert_eq!(
            query,
            vec![
                ("color".to_string(), "#ff0000".to_string()),
                ("isAIGenerated".to_string(), "true".to_string()),
            ]
        );
    }

    #[test]
    fn query_cache_keys_do_not_collide() {
        let split = encode_query(&[("a".into(), "1&b=2".into())]);
        let joined = encode_query(&[("a".into(), "1".into()), ("b".into(), "2".into())]);
        assert_ne!(split, joined);
    }

    #[test]
    fn trailing_slashes_are_trimmed() {
        let client = ApiClient::new("http://localhost:9000/api/").unwrap();
        assert_eq!(client.base_url(), "http://localhost:9000/api");
    }

    #[tokio::test]
    async fn unreachable_servers_are_transport_errors() {
        let client = ApiClient::new("http://127.0.0.1:9/api").unwrap();
        let err = client.get::<Value>("/projects").await.unwrap_err();
        assert!(matches!(err, StorageError::Transport(_)));
    }
}
