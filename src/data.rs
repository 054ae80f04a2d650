//! Entity persistence for projects, images, labels, annotations, settings,
//! history and AI model descriptors.
//!
//! Three implementations exist: an in-process document store (browser),
//! SQLite reached through the host channel (desktop) and a REST client
//! (server side). `crate::provider` picks one per process.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::StorageResult;

pub mod api;
pub mod document;
pub mod models;
pub mod records;
pub mod relational;

pub use models::{AiModel, Annotation, AnnotationKind, History, ImageData, Label, Point, Project, Setting};

/// The changed fields of an update, keyed by their wire (camelCase) names.
pub type Patch = Map<String, Value>;

/// Field equalities every returned record must satisfy.
pub type Filter = Map<String, Value>;

/// The settings key holding the id of the selected AI model.
pub const SELECTED_MODEL_KEY: &str = "selectedModelId";

/// Entity CRUD.
///
/// `*_by_id` lookups return `Ok(None)` for unknown ids. Updates of an
/// unknown id fail with `StorageError::NotFound`, deletes of an unknown id
/// succeed.
#[async_trait]
pub trait DataAccess: Send + Sync + 'static {
    /// A short name used when logging which implementation is active.
    fn name(&self) -> &'static str;

    async fn get_projects(&self) -> StorageResult<Vec<Project>>;

    async fn get_project_by_id(&self, id: &str) -> StorageResult<Option<Project>>;

    /// The project with its `images` populated.
    async fn get_project_with_images(&self, id: &str) -> StorageResult<Option<Project>>;

    async fn create_project(&self, project: &Project) -> StorageResult<()>;

    async fn update_project(&self, id: &str, patch: Patch) -> StorageResult<()>;

    /// Removes the project together with its images, their annotations and
    /// the project's labels.
    async fn delete_project(&self, id: &str) -> StorageResult<()>;

    async fn get_images(&self, project_id: &str) -> StorageResult<Vec<ImageData>>;

    async fn get_images_with_pagination(
        &self,
        project_id: &str,
        offset: usize,
        limit: usize,
    ) -> StorageResult<Vec<ImageData>>;

    /// The smallest image id greater than `current_image_id`.
    async fn get_next_image_id(&self, current_image_id: &str) -> StorageResult<Option<String>>;

    /// The largest image id smaller than `current_image_id`.
    async fn get_previous_image_id(&self, current_image_id: &str)
        -> StorageResult<Option<String>>;

    async fn create_image(&self, image: &ImageData) -> StorageResult<()>;

    async fn update_image(&self, id: &str, patch: Patch) -> StorageResult<()>;

    async fn delete_image(&self, id: &str) -> StorageResult<()>;

    async fn get_annotations(&self, image_id: &str) -> StorageResult<Vec<Annotation>>;

    async fn get_annotations_with_filter(
        &self,
        image_id: &str,
        filter: Filter,
    ) -> StorageResult<Vec<Annotation>>;

    async fn create_annotation(&self, annotation: &Annotation) -> StorageResult<()>;

    async fn update_annotation(&self, id: &str, patch: Patch) -> StorageResult<()>;

    async fn delete_annotation(&self, id: &str) -> StorageResult<()>;

    async fn get_labels(&self) -> StorageResult<Vec<Label>>;

    async fn get_label_by_id(&self, id: &str) -> StorageResult<Option<Label>>;

    /// Creates the label and points every listed annotation at it.
    async fn create_label(&self, label: &Label, annotation_ids: &[String]) -> StorageResult<()>;

    async fn update_label(&self, id: &str, patch: Patch) -> StorageResult<()>;

    async fn delete_label(&self, id: &str) -> StorageResult<()>;

    async fn get_settings(&self) -> StorageResult<Vec<Setting>>;

    async fn get_setting(&self, key: &str) -> StorageResult<Option<Setting>>;

    /// Inserts or replaces.
    async fn update_setting(&self, key: &str, value: &str) -> StorageResult<()>;

    async fn get_history(&self) -> StorageResult<Vec<History>>;

    /// Inserts or replaces the snapshot with the same id.
    async fn update_history(&self, history: &History) -> StorageResult<()>;

    async fn get_available_models(&self) -> StorageResult<Vec<AiModel>>;

    /// Inserts or replaces.
    async fn upload_custom_model(&self, model: &AiModel) -> StorageResult<()>;

    async fn select_model(&self, model_id: &str) -> StorageResult<()>;

    async fn get_selected_model(&self) -> StorageResult<Option<AiModel>>;

    /// Also clears the selection if `model_id` was the selected model.
    async fn delete_model(&self, model_id: &str) -> StorageResult<()>;
}
