use std::collections::HashMap;
use std::sync::Arc;

use poem::error::ResponseError;
use poem::http::StatusCode;
use poem::web::{Data, Json as RestJson, Path as RestPath, Query};
use poem::{get, handler, post, put, EndpointExt, Route};
use poem_openapi::param::Path;
use poem_openapi::payload::{Binary, Json};
use poem_openapi::{ApiResponse, Object, OpenApi, OpenApiService};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::data::{
    AiModel,
    Annotation,
    DataAccess,
    Filter,
    History,
    ImageData,
    Label,
    Patch,
    Project,
    Setting,
};
use crate::error::StorageError;
use crate::storage::loader::load_display_bytes;
use crate::storage::StorageAdapter;

impl ResponseError for StorageError {
    fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::StorageWrite(_) | Self::Transport(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

#[derive(Object, Debug)]
pub struct UploadInfo {
    /// The id the image is stored under.
    image_id: String,

    /// The crc32 checksum of the uploaded image.
    checksum: u32,

    /// The size of the uploaded image in bytes.
    size: u64,
}

#[derive(ApiResponse)]
pub enum FetchResponse {
    #[oai(status = 200)]
    Ok(Binary<Vec<u8>>, #[oai(header = "content-type")] String),

    #[oai(status = 404)]
    NotFound,
}

#[derive(ApiResponse)]
pub enum DeleteResponse {
    #[oai(status = 204)]
    Deleted,
}

/// Image storage over whichever adapter the process selected.
pub struct ImagesApi {
    storage: Arc<dyn StorageAdapter>,
}

impl ImagesApi {
    pub fn new(storage: Arc<dyn StorageAdapter>) -> Self {
        Self { storage }
    }

    async fn store(&self, image_id: String, data: Vec<u8>) -> poem::Result<Json<UploadInfo>> {
        let checksum = crate::utils::checksum(&data);
        let size = data.len() as u64;

        self.storage.save_image(&image_id, data.into()).await?;
        info!("stored image {} ({} bytes) via {}", &image_id, size, self.storage.name());

        Ok(Json(UploadInfo {
            image_id,
            checksum,
            size,
        }))
    }
}

#[OpenApi]
impl ImagesApi {
    /// List Images
    ///
    /// The ids of every stored image.
    #[oai(path = "/images", method = "get")]
    async fn list_images(&self) -> poem::Result<Json<Vec<String>>> {
        let mut ids = self.storage.list_images().await?;
        ids.sort();
        Ok(Json(ids))
    }

    /// Upload Image
    ///
    /// Stores the image under a newly generated id.
    #[oai(path = "/images", method = "post")]
    async fn upload_image(&self, data: Binary<Vec<u8>>) -> poem::Result<Json<UploadInfo>> {
        self.store(Uuid::new_v4().to_string(), data.0).await
    }

    /// Save Image
    ///
    /// Stores the image under the given id, replacing any existing image.
    #[oai(path = "/images/:image_id", method = "put")]
    async fn save_image(
        &self,
        image_id: Path<String>,
        data: Binary<Vec<u8>>,
    ) -> poem::Result<Json<UploadInfo>> {
        self.store(image_id.0, data.0).await
    }

    /// Fetch Image
    ///
    /// The raw image bytes, the content type is sniffed from the data.
    #[oai(path = "/images/:image_id", method = "get")]
    async fn fetch_image(&self, image_id: Path<String>) -> poem::Result<FetchResponse> {
        match load_display_bytes(self.storage.as_ref(), &image_id.0).await {
            Ok(image) => Ok(FetchResponse::Ok(
                Binary(image.data.to_vec()),
                image.content_type.to_string(),
            )),
            Err(e) if e.is_not_found() => Ok(FetchResponse::NotFound),
            Err(other) => Err(other.into()),
        }
    }

    /// Delete Image
    ///
    /// Deleting an image which does not exist is not an error.
    #[oai(path = "/images/:image_id", method = "delete")]
    async fn delete_image(&self, image_id: Path<String>) -> poem::Result<DeleteResponse> {
        self.storage.delete_image(&image_id.0).await?;
        Ok(DeleteResponse::Deleted)
    }
}

/// The full application: the image API under `/v1`, its docs under `/ui`
/// and the entity REST API under `/api`.
pub fn build_app(storage: Arc<dyn StorageAdapter>, access: Arc<dyn DataAccess>) -> Route {
    let api_service = OpenApiService::new(
        ImagesApi::new(storage),
        "Labelstore API",
        env!("CARGO_PKG_VERSION"),
    );
    let ui = api_service.redoc();

    Route::new()
        .nest("/v1", api_service)
        .nest("/ui", ui)
        .nest("/api", rest_routes(access))
}

#[derive(Debug, Deserialize)]
struct Pagination {
    offset: Option<usize>,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct NewLabel {
    #[serde(flatten)]
    label: Label,

    #[serde(default, rename = "annotationIds")]
    annotation_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SettingValue {
    value: String,
}

/// Entity CRUD over HTTP. The paths match what `ApiDataAccess` calls.
pub fn rest_routes(access: Arc<dyn DataAccess>) -> impl poem::Endpoint {
    Route::new()
        .at("/projects", get(list_projects).post(create_project))
        .at(
            "/projects/:id",
            get(fetch_project).put(update_project).delete(delete_project),
        )
        .at("/projects/:id/images", get(list_images))
        .at("/images", post(create_image))
        .at("/images/:id", put(update_image).delete(delete_image))
        .at("/images/:id/next", get(next_image))
        .at("/images/:id/previous", get(previous_image))
        .at("/images/:id/annotations", get(list_annotations))
        .at("/annotations", post(create_annotation))
        .at(
            "/annotations/:id",
            put(update_annotation).delete(delete_annotation),
        )
        .at("/labels", get(list_labels).post(create_label))
        .at(
            "/labels/:id",
            get(fetch_label).put(update_label).delete(delete_label),
        )
        .at("/settings", get(list_settings))
        .at("/settings/:key", get(fetch_setting).put(update_setting))
        .at("/history", get(list_history).put(update_history))
        .at("/models", get(list_models).post(upload_model))
        .at("/models/selected", get(selected_model))
        .at("/models/:id", poem::delete(delete_model))
        .at("/models/:id/select", post(select_model))
        .data(access)
}

/// Query values are strings on the wire, booleans are the only
/// non-string field an annotation can be filtered on.
fn query_to_filter(query: HashMap<String, String>) -> Filter {
    query
        .into_iter()
        .map(|(k, v)| {
            let value = match v.as_str() {
                "true" => Value::Bool(true),
                "false" => Value::Bool(false),
                _ => Value::String(v),
            };
            (k, value)
        })
        .collect()
}

fn missing(what: &str, id: &str) -> StorageError {
    StorageError::not_found(format!("{} {}", what, id))
}

#[handler]
async fn list_projects(Data(access): Data<&Arc<dyn DataAccess>>) -> poem::Result<RestJson<Vec<Project>>> {
    Ok(RestJson(access.get_projects().await?))
}

#[handler]
async fn fetch_project(
    Data(access): Data<&Arc<dyn DataAccess>>,
    RestPath(id): RestPath<String>,
) -> poem::Result<RestJson<Project>> {
    let project = access
        .get_project_by_id(&id)
        .await?
        .ok_or_else(|| missing("project", &id))?;
    Ok(RestJson(project))
}

#[handler]
async fn create_project(
    Data(access): Data<&Arc<dyn DataAccess>>,
    RestJson(project): RestJson<Project>,
) -> poem::Result<StatusCode> {
    access.create_project(&project).await?;
    Ok(StatusCode::CREATED)
}

#[handler]
async fn update_project(
    Data(access): Data<&Arc<dyn DataAccess>>,
    RestPath(id): RestPath<String>,
    RestJson(patch): RestJson<Patch>,
) -> poem::Result<StatusCode> {
    access.update_project(&id, patch).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[handler]
async fn delete_project(
    Data(access): Data<&Arc<dyn DataAccess>>,
    RestPath(id): RestPath<String>,
) -> poem::Result<StatusCode> {
    access.delete_project(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[handler]
async fn list_images(
    Data(access): Data<&Arc<dyn DataAccess>>,
    RestPath(project_id): RestPath<String>,
    Query(page): Query<Pagination>,
) -> poem::Result<RestJson<Vec<ImageData>>> {
    let images = match (page.offset, page.limit) {
        (None, None) => access.get_images(&project_id).await?,
        (offset, limit) => {
            access
                .get_images_with_pagination(
                    &project_id,
                    offset.unwrap_or(0),
                    limit.unwrap_or(usize::MAX),
                )
                .await?
        }
    };
    Ok(RestJson(images))
}

#[handler]
async fn create_image(
    Data(access): Data<&Arc<dyn DataAccess>>,
    RestJson(image): RestJson<ImageData>,
) -> poem::Result<StatusCode> {
    access.create_image(&image).await?;
    Ok(StatusCode::CREATED)
}

#[handler]
async fn update_image(
    Data(access): Data<&Arc<dyn DataAccess>>,
    RestPath(id): RestPath<String>,
    RestJson(patch): RestJson<Patch>,
) -> poem::Result<StatusCode> {
    access.update_image(&id, patch).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[handler]
async fn delete_image(
    Data(access): Data<&Arc<dyn DataAccess>>,
    RestPath(id): RestPath<String>,
) -> poem::Result<StatusCode> {
    access.delete_image(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[handler]
async fn next_image(
    Data(access): Data<&Arc<dyn DataAccess>>,
    RestPath(id): RestPath<String>,
) -> poem::Result<RestJson<Option<String>>> {
    Ok(RestJson(access.get_next_image_id(&id).await?))
}

#[handler]
async fn previous_image(
    Data(access): Data<&Arc<dyn DataAccess>>,
    RestPath(id): RestPath<String>,
) -> poem::Result<RestJson<Option<String>>> {
    Ok(RestJson(access.get_previous_image_id(&id).await?))
}

#[handler]
async fn list_annotations(
    Data(access): Data<&Arc<dyn DataAccess>>,
    RestPath(image_id): RestPath<String>,
    Query(query): Query<HashMap<String, String>>,
) -> poem::Result<RestJson<Vec<Annotation>>> {
    let annotations = if query.is_empty() {
        access.get_annotations(&image_id).await?
    } else {
        access
            .get_annotations_with_filter(&image_id, query_to_filter(query))
            .await?
    };
    Ok(RestJson(annotations))
}

#[handler]
async fn create_annotation(
    Data(access): Data<&Arc<dyn DataAccess>>,
    RestJson(annotation): RestJson<Annotation>,
) -> poem::Result<StatusCode> {
    access.create_annotation(&annotation).await?;
    Ok(StatusCode::CREATED)
}

#[handler]
async fn update_annotation(
    Data(access): Data<&Arc<dyn DataAccess>>,
    RestPath(id): RestPath<String>,
    RestJson(patch): RestJson<Patch>,
) -> poem::Result<StatusCode> {
    access.update_annotation(&id, patch).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[handler]
async fn delete_annotation(
    Data(access): Data<&Arc<dyn DataAccess>>,
    RestPath(id): RestPath<String>,
) -> poem::Result<StatusCode> {
    access.delete_annotation(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[handler]
async fn list_labels(Data(access): Data<&Arc<dyn DataAccess>>) -> poem::Result<RestJson<Vec<Label>>> {
    Ok(RestJson(access.get_labels().await?))
}

#[handler]
async fn fetch_label(
    Data(access): Data<&Arc<dyn DataAccess>>,
    RestPath(id): RestPath<String>,
) -> poem::Result<RestJson<Label>> {
    let label = access
        .get_label_by_id(&id)
        .await?
        .ok_or_else(|| missing("label", &id))?;
    Ok(RestJson(label))
}

#[handler]
async fn create_label(
    Data(access): Data<&Arc<dyn DataAccess>>,
    RestJson(new): RestJson<NewLabel>,
) -> poem::Result<StatusCode> {
    access.create_label(&new.label, &new.annotation_ids).await?;
    Ok(StatusCode::CREATED)
}

#[handler]
async fn update_label(
    Data(access): Data<&Arc<dyn DataAccess>>,
    RestPath(id): RestPath<String>,
    RestJson(patch): RestJson<Patch>,
) -> poem::Result<StatusCode> {
    access.update_label(&id, patch).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[handler]
async fn delete_label(
    Data(access): Data<&Arc<dyn DataAccess>>,
    RestPath(id): RestPath<String>,
) -> poem::Result<StatusCode> {
    access.delete_label(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[handler]
async fn list_settings(Data(access): Data<&Arc<dyn DataAccess>>) -> poem::Result<RestJson<Vec<Setting>>> {
    Ok(RestJson(access.get_settings().await?))
}

#[handler]
async fn fetch_setting(
    Data(access): Data<&Arc<dyn DataAccess>>,
    RestPath(key): RestPath<String>,
) -> poem::Result<RestJson<Setting>> {
    let setting = access
        .get_setting(&key)
        .await?
        .ok_or_else(|| missing("setting", &key))?;
    Ok(RestJson(setting))
}

#[handler]
async fn update_setting(
    Data(access): Data<&Arc<dyn DataAccess>>,
    RestPath(key): RestPath<String>,
    RestJson(body): RestJson<SettingValue>,
) -> poem::Result<StatusCode> {
    access.update_setting(&key, &body.value).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[handler]
async fn list_history(Data(access): Data<&Arc<dyn DataAccess>>) -> poem::Result<RestJson<Vec<History>>> {
    Ok(RestJson(access.get_history().await?))
}

#[handler]
async fn update_history(
    Data(access): Data<&Arc<dyn DataAccess>>,
    RestJson(history): RestJson<History>,
) -> poem::Result<StatusCode> {
    access.update_history(&history).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[handler]
async fn list_models(Data(access): Data<&Arc<dyn DataAccess>>) -> poem::Result<RestJson<Vec<AiModel>>> {
    Ok(RestJson(access.get_available_models().await?))
}

#[handler]
async fn upload_model(
    Data(access): Data<&Arc<dyn DataAccess>>,
    RestJson(model): RestJson<AiModel>,
) -> poem::Result<StatusCode> {
    access.upload_custom_model(&model).await?;
    Ok(StatusCode::CREATED)
}

#[handler]
async fn select_model(
    Data(access): Data<&Arc<dyn DataAccess>>,
    RestPath(id): RestPath<String>,
) -> poem::Result<StatusCode> {
    access.select_model(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[handler]
async fn selected_model(Data(access): Data<&Arc<dyn DataAccess>>) -> poem::Result<RestJson<Option<AiModel>>> {
    Ok(RestJson(access.get_selected_model().await?))
}

#[handler]
async fn delete_model(
    Data(access): Data<&Arc<dyn DataAccess>>,
    RestPath(id): RestPath<String>,
) -> poem::Result<StatusCode> {
    access.delete_model(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}
