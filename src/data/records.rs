use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};
use strum::{Display, IntoStaticStr};

use super::models::{AiModel, Annotation, History, ImageData, Label, Project, Setting};
use super::{DataAccess, Filter, Patch, SELECTED_MODEL_KEY};
use crate::error::{StorageError, StorageResult};

/// The entity tables shared by the document store and the SQLite schema.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Display, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Table {
    Projects,
    Images,
    Labels,
    Annotations,
    Settings,
    History,
    AiModels,
}

impl Table {
    #[inline]
    pub fn name(self) -> &'static str {
        self.into()
    }

    pub fn key_column(self) -> &'static str {
        match self {
            Self::Settings => "key",
            _ => "id",
        }
    }

    pub fn columns(self) -> &'static [&'static str] {
        match self {
            Self::Projects => &[
                "id",
                "name",
                "description",
                "type",
                "status",
                "settings",
                "metadata",
                "createdAt",
                "updatedAt",
                "lastModified",
            ],
            Self::Images => &[
                "id",
                "projectId",
                "name",
                "data",
                "width",
                "height",
                "url",
                "createdAt",
                "updatedAt",
            ],
            Self::Labels => &[
                "id",
                "name",
                "description",
                "category",
                "isAIGenerated",
                "projectId",
                "color",
                "createdAt",
                "updatedAt",
            ],
            Self::Annotations => &[
                "id",
                "imageId",
                "labelId",
                "name",
                "type",
                "coordinates",
                "color",
                "isAIGenerated",
                "createdAt",
                "updatedAt",
            ],
            Self::Settings => &["key", "value"],
            Self::History => &["id", "labels", "historyIndex", "canUndo", "canRedo"],
            Self::AiModels => &[
                "id",
                "name",
                "description",
                "version",
                "createdAt",
                "updatedAt",
                "modelPath",
                "configPath",
                "modelSize",
                "isCustom",
            ],
        }
    }

    /// Columns holding nested JSON, stored as text by relational backends.
    pub fn json_columns(self) -> &'static [&'static str] {
        match self {
            Self::Projects => &["settings", "metadata"],
            Self::Annotations => &["coordinates"],
            Self::History => &["labels"],
            _ => &[],
        }
    }

    /// Columns holding booleans, stored as integers by relational backends.
    pub fn bool_columns(self) -> &'static [&'static str] {
        match self {
            Self::Labels | Self::Annotations => &["isAIGenerated"],
            Self::History => &["canUndo", "canRedo"],
            Self::AiModels => &["isCustom"],
            _ => &[],
        }
    }

    pub fn has_column(self, column: &str) -> bool {
        self.columns().contains(&column)
    }

    /// Rejects any field that is not a column of this table.
    pub fn check_fields(self, fields: &Map<String, Value>) -> StorageResult<()> {
        match fields.keys().find(|k| !self.has_column(k)) {
            Some(unknown) => Err(StorageError::invalid(format!(
                "{} has no column named {:?}",
                self, unknown
            ))),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    Next,
    Previous,
}

/// A single write, see `RecordStore::apply`.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Fails if the key is already taken.
    Insert { table: Table, record: Map<String, Value> },

    Upsert { table: Table, record: Map<String, Value> },

    /// Merges `patch` into the record stored under `key`.
    Update { table: Table, key: String, patch: Patch },

    /// Removes every record matching `filter`.
    DeleteWhere { table: Table, filter: Filter },
}

impl WriteOp {
    pub fn delete(table: Table, key: &str) -> Self {
        let mut filter = Filter::new();
        filter.insert(table.key_column().to_string(), Value::from(key));
        Self::DeleteWhere { table, filter }
    }

    pub fn delete_where(table: Table, column: &str, value: &str) -> Self {
        let mut filter = Filter::new();
        filter.insert(column.to_string(), Value::from(value));
        Self::DeleteWhere { table, filter }
    }
}

/// Table level storage of JSON records.
///
/// Records are objects keyed by their wire (camelCase) column names and
/// come back ordered by their key column.
#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn select(&self, table: Table, filter: &Filter) -> StorageResult<Vec<Value>>;

    async fn select_page(
        &self,
        table: Table,
        filter: &Filter,
        offset: usize,
        limit: usize,
    ) -> StorageResult<Vec<Value>>;

    async fn find(&self, table: Table, key: &str) -> StorageResult<Option<Value>>;

    /// The closest key after (or before) `key`. `key` itself need not exist.
    async fn neighbour(
        &self,
        table: Table,
        key: &str,
        direction: Direction,
    ) -> StorageResult<Option<String>>;

    /// Applies every op or none of them, returning the number of records
    /// touched.
    async fn apply(&self, ops: Vec<WriteOp>) -> StorageResult<u64>;
}

/// `DataAccess` over any `RecordStore`.
pub struct RecordDataAccess<S: RecordStore> {
    store: S,
}

impl<S: RecordStore> RecordDataAccess<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    async fn all<T: DeserializeOwned>(&self, table: Table, filter: &Filter) -> StorageResult<Vec<T>> {
        let rows = self.store.select(table, filter).await?;
        rows.into_iter().map(|row| decode(table, row)).collect()
    }

    async fn by_key<T: DeserializeOwned>(&self, table: Table, key: &str) -> StorageResult<Option<T>> {
        match self.store.find(table, key).await? {
            Some(row) => decode(table, row).map(Some),
            None => Ok(None),
        }
    }

    async fn insert<T: Serialize>(&self, table: Table, item: &T) -> StorageResult<()> {
        let record = encode(table, item)?;
        self.store.apply(vec![WriteOp::Insert { table, record }]).await?;
        Ok(())
    }

    async fn upsert<T: Serialize>(&self, table: Table, item: &T) -> StorageResult<()> {
        let record = encode(table, item)?;
        self.store.apply(vec![WriteOp::Upsert { table, record }]).await?;
        Ok(())
    }

    /// Merges `patch` into the stored record. The merged record must still
    /// decode as `T`, so a patch can never leave a row behind that later
    /// reads would choke on.
    async fn update<T: DeserializeOwned>(
        &self,
        table: Table,
        key: &str,
        patch: Patch,
    ) -> StorageResult<()> {
        table.check_fields(&patch)?;
        if patch.contains_key(table.key_column()) {
            return Err(StorageError::invalid(format!(
                "the {:?} of a {} record cannot be changed",
                table.key_column(),
                table
            )));
        }

        let mut merged = match self.store.find(table, key).await? {
            Some(Value::Object(record)) => record,
            _ => return Err(StorageError::not_found(format!("{} {}", table, key))),
        };
        for (field, value) in patch.iter() {
            merged.insert(field.clone(), value.clone());
        }
        serde_json::from_value::<T>(Value::Object(merged)).map_err(|e| {
            StorageError::invalid(format!("patch does not fit a {} record: {}", table, e))
        })?;

        if patch.is_empty() {
            return Ok(());
        }

        let op = WriteOp::Update {
            table,
            key: key.to_string(),
            patch,
        };

        match self.store.apply(vec![op]).await? {
            0 => Err(StorageError::not_found(format!("{} {}", table, key))),
            _ => Ok(()),
        }
    }

    async fn delete(&self, table: Table, key: &str) -> StorageResult<()> {
        self.store.apply(vec![WriteOp::delete(table, key)]).await?;
        Ok(())
    }
}

fn equals(column: &str, value: &str) -> Filter {
    let mut filter = Filter::new();
    filter.insert(column.to_string(), Value::from(value));
    filter
}

/// Serializes `item` keeping only the columns of `table`.
fn encode<T: Serialize>(table: Table, item: &T) -> StorageResult<Map<String, Value>> {
    match serde_json::to_value(item) {
        Ok(Value::Object(mut fields)) => {
            fields.retain(|k, _| table.has_column(k));
            Ok(fields)
        }
        Ok(other) => Err(StorageError::invalid(format!(
            "{} records must be objects, got {}",
            table, other
        ))),
        Err(e) => Err(StorageError::invalid(e.to_string())),
    }
}

fn decode<T: DeserializeOwned>(table: Table, row: Value) -> StorageResult<T> {
    serde_json::from_value(row)
        .map_err(|e| StorageError::transport(format!("malformed {} record: {}", table, e)))
}

#[async_trait]
impl<S: RecordStore> DataAccess for RecordDataAccess<S> {
    fn name(&self) -> &'static str {
        self.store.name()
    }

    async fn get_projects(&self) -> StorageResult<Vec<Project>> {
        self.all(Table::Projects, &Filter::new()).await
    }

    async fn get_project_by_id(&self, id: &str) -> StorageResult<Option<Project>> {
        self.by_key(Table::Projects, id).await
    }

    async fn get_project_with_images(&self, id: &str) -> StorageResult<Option<Project>> {
        let mut project: Project = match self.by_key(Table::Projects, id).await? {
            Some(project) => project,
            None => return Ok(None),
        };

        project.images = Some(self.get_images(id).await?);
        Ok(Some(project))
    }

    async fn create_project(&self, project: &Project) -> StorageResult<()> {
        self.insert(Table::Projects, project).await
    }

    async fn update_project(&self, id: &str, patch: Patch) -> StorageResult<()> {
        self.update::<Project>(Table::Projects, id, patch).await
    }

    async fn delete_project(&self, id: &str) -> StorageResult<()> {
        let images = self
            .store
            .select(Table::Images, &equals("projectId", id))
            .await?;

        let mut ops: Vec<WriteOp> = images
            .iter()
            .filter_map(|image| image.get("id").and_then(Value::as_str))
            .map(|image_id| WriteOp::delete_where(Table::Annotations, "imageId", image_id))
            .collect();

        ops.push(WriteOp::delete_where(Table::Images, "projectId", id));
        ops.push(WriteOp::delete_where(Table::Labels, "projectId", id));
        ops.push(WriteOp::delete(Table::Projects, id));

        let removed = self.store.apply(ops).await?;
        debug!("deleted project {} and {} records in total", id, removed);
        Ok(())
    }

    async fn get_images(&self, project_id: &str) -> StorageResult<Vec<ImageData>> {
        self.all(Table::Images, &equals("projectId", project_id)).await
    }

    async fn get_images_with_pagination(
        &self,
        project_id: &str,
        offset: usize,
        limit: usize,
    ) -> StorageResult<Vec<ImageData>> {
        let rows = self
            .store
            .select_page(Table::Images, &equals("projectId", project_id), offset, limit)
            .await?;

        rows.into_iter().map(|row| decode(Table::Images, row)).collect()
    }

    async fn get_next_image_id(&self, current_image_id: &str) -> StorageResult<Option<String>> {
        self.store
            .neighbour(Table::Images, current_image_id, Direction::Next)
            .await
    }

    async fn get_previous_image_id(
        &self,
        current_image_id: &str,
    ) -> StorageResult<Option<String>> {
        self.store
            .neighbour(Table::Images, current_image_id, Direction::Previous)
            .await
    }

    async fn create_image(&self, image: &ImageData) -> StorageResult<()> {
        self.insert(Table::Images, image).await
    }

    async fn update_image(&self, id: &str, patch: Patch) -> StorageResult<()> {
        self.update::<ImageData>(Table::Images, id, patch).await
    }

    async fn delete_image(&self, id: &str) -> StorageResult<()> {
        self.delete(Table::Images, id).await
    }

    async fn get_annotations(&self, image_id: &str) -> StorageResult<Vec<Annotation>> {
        self.all(Table::Annotations, &equals("imageId", image_id)).await
    }

    async fn get_annotations_with_filter(
        &self,
        image_id: &str,
        mut filter: Filter,
    ) -> StorageResult<Vec<Annotation>> {
        Table::Annotations.check_fields(&filter)?;
        filter.insert("imageId".to_string(), Value::from(image_id));
        self.all(Table::Annotations, &filter).await
    }

    async fn create_annotation(&self, annotation: &Annotation) -> StorageResult<()> {
        self.insert(Table::Annotations, annotation).await
    }

    async fn update_annotation(&self, id: &str, patch: Patch) -> StorageResult<()> {
        self.update::<Annotation>(Table::Annotations, id, patch).await
    }

    async fn delete_annotation(&self, id: &str) -> StorageResult<()> {
        self.delete(Table::Annotations, id).await
    }

    async fn get_labels(&self) -> StorageResult<Vec<Label>> {
        self.all(Table::Labels, &Filter::new()).await
    }

    async fn get_label_by_id(&self, id: &str) -> StorageResult<Option<Label>> {
        self.by_key(Table::Labels, id).await
    }

    async fn create_label(&self, label: &Label, annotation_ids: &[String]) -> StorageResult<()> {
        let mut ops = vec![WriteOp::Insert {
            table: Table::Labels,
            record: encode(Table::Labels, label)?,
        }];

        for annotation_id in annotation_ids {
            let mut patch = Patch::new();
            patch.insert("labelId".to_string(), Value::from(label.id.as_str()));
            ops.push(WriteOp::Update {
                table: Table::Annotations,
                key: annotation_id.clone(),
                patch,
            });
        }

        self.store.apply(ops).await?;
        Ok(())
    }

    async fn update_label(&self, id: &str, patch: Patch) -> StorageResult<()> {
        self.update::<Label>(Table::Labels, id, patch).await
    }

    async fn delete_label(&self, id: &str) -> StorageResult<()> {
        self.delete(Table::Labels, id).await
    }

    async fn get_settings(&self) -> StorageResult<Vec<Setting>> {
        self.all(Table::Settings, &Filter::new()).await
    }

    async fn get_setting(&self, key: &str) -> StorageResult<Option<Setting>> {
        self.by_key(Table::Settings, key).await
    }

    async fn update_setting(&self, key: &str, value: &str) -> StorageResult<()> {
        let setting = json!({ "key": key, "value": value });
        self.upsert(Table::Settings, &setting).await
    }

    async fn get_history(&self) -> StorageResult<Vec<History>> {
        self.all(Table::History, &Filter::new()).await
    }

    async fn update_history(&self, history: &History) -> StorageResult<()> {
        self.upsert(Table::History, history).await
    }

    async fn get_available_models(&self) -> StorageResult<Vec<AiModel>> {
        self.all(Table::AiModels, &Filter::new()).await
    }

    async fn upload_custom_model(&self, model: &AiModel) -> StorageResult<()> {
        info!("registering model {} ({})", &model.name, &model.id);
        self.upsert(Table::AiModels, model).await
    }

    async fn select_model(&self, model_id: &str) -> StorageResult<()> {
        self.update_setting(SELECTED_MODEL_KEY, model_id).await
    }

    async fn get_selected_model(&self) -> StorageResult<Option<AiModel>> {
        match self.get_setting(SELECTED_MODEL_KEY).await? {
            Some(setting) if !setting.value.is_empty() => {
                self.by_key(Table::AiModels, &setting.value).await
            }
            _ => Ok(None),
        }
    }

    async fn delete_model(&self, model_id: &str) -> StorageResult<()> {
        let mut ops = vec![WriteOp::delete(Table::AiModels, model_id)];

        let selected = self.get_setting(SELECTED_MODEL_KEY).await?;
        if matches!(selected, Some(ref s) if s.value == model_id) {
            ops.push(WriteOp::delete(Table::Settings, SELECTED_MODEL_KEY));
        }

        self.store.apply(ops).await?;
        Ok(())
    }
}
