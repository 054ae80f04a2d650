use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::commands;
use super::sqlite::{SqliteDatabase, Statement};
use super::InvokeChannel;
use crate::error::{StorageError, StorageResult};
use crate::payload::ImagePayload;

#[derive(Deserialize)]
struct PathArgs {
    path: PathBuf,
}

#[derive(Deserialize)]
struct SaveArgs {
    path: PathBuf,
    data: String,
}

#[derive(Deserialize)]
struct DirectoryArgs {
    directory: PathBuf,
}

/// Executes host commands on behalf of a sandboxed caller.
///
/// Filesystem commands may be confined to a root directory, anything
/// resolving outside of it is refused. SQLite commands are only available
/// once a database has been attached.
#[derive(Clone, Default)]
pub struct HostDispatcher {
    root: Option<PathBuf>,
    database: Option<SqliteDatabase>,
}

impl HostDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    pub fn with_database(mut self, database: SqliteDatabase) -> Self {
        self.database = Some(database);
        self
    }

    pub async fn handle(&self, command: &str, args: Value) -> StorageResult<Value> {
        debug!("handling host command {}", command);

        let result = match command {
            commands::FS_ENSURE_DIRECTORY => {
                let args: PathArgs = parse_args(command, args)?;
                self.ensure_directory(&args.path).await
            }
            commands::FS_SAVE_IMAGE => {
                let args: SaveArgs = parse_args(command, args)?;
                self.save_image(&args.path, args.data).await
            }
            commands::FS_LOAD_IMAGE => {
                let args: PathArgs = parse_args(command, args)?;
                self.load_image(&args.path).await
            }
            commands::FS_DELETE_IMAGE => {
                let args: PathArgs = parse_args(command, args)?;
                self.delete_image(&args.path).await
            }
            commands::FS_LIST_IMAGES => {
                let args: DirectoryArgs = parse_args(command, args)?;
                self.list_images(&args.directory).await
            }
            commands::SQLITE_GET => {
                let Statement(sql, params) = parse_args(command, args)?;
                self.database()?.get(&sql, params).await
            }
            commands::SQLITE_ALL => {
                let Statement(sql, params) = parse_args(command, args)?;
                self.database()?.all(&sql, params).await
            }
            commands::SQLITE_RUN => {
                let Statement(sql, params) = parse_args(command, args)?;
                let changes = self.database()?.run(&sql, params).await?;
                Ok(json!({ "changes": changes }))
            }
            commands::SQLITE_BATCH => {
                let statements: Vec<Statement> = parse_args(command, args)?;
                let changes = self.database()?.batch(statements).await?;
                Ok(json!({ "changes": changes }))
            }
            other => Err(StorageError::transport(format!(
                "command {} is not supported by the host",
                other
            ))),
        };

        if let Err(ref e) = result {
            if !e.is_not_found() {
                error!("host command {} failed: {}", command, e);
            }
        }

        result
    }

    fn database(&self) -> StorageResult<&SqliteDatabase> {
        self.database
            .as_ref()
            .ok_or_else(|| StorageError::configuration("no database is attached to the host"))
    }

    fn resolve(&self, path: &Path) -> StorageResult<PathBuf> {
        if path.as_os_str().is_empty() {
            return Err(StorageError::invalid("path must not be empty"));
        }

        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(StorageError::invalid("path traversal is not allowed"));
        }

        match self.root {
            None => Ok(path.to_path_buf()),
            Some(ref root) if path.is_absolute() => {
                if path.starts_with(root) {
                    Ok(path.to_path_buf())
                } else {
                    Err(StorageError::invalid(format!(
                        "{} is outside of the host root",
                        path.display()
                    )))
                }
            }
            Some(ref root) => Ok(root.join(path)),
        }
    }

    async fn ensure_directory(&self, path: &Path) -> StorageResult<Value> {
        let path = self.resolve(path)?;
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| StorageError::write(format!("cannot create {}: {}", path.display(), e)))?;
        Ok(Value::Null)
    }

    async fn save_image(&self, path: &Path, data: String) -> StorageResult<Value> {
        let path = self.resolve(path)?;
        let data = ImagePayload::Text(data).into_bytes()?;

        debug!("Storing image @ {:?}", &path);
        match tokio::fs::write(&path, &data).await {
            Ok(()) => {}
            Err(ref e) if e.kind() == ErrorKind::NotFound => {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(StorageError::write)?;
                }
                tokio::fs::write(&path, data)
                    .await
                    .map_err(StorageError::write)?;
            }
            Err(other) => return Err(StorageError::write(other)),
        }

        Ok(Value::Null)
    }

    async fn load_image(&self, path: &Path) -> StorageResult<Value> {
        let path = self.resolve(path)?;

        debug!("Retrieving image @ {:?}", &path);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Value::String(base64::encode(data))),
            Err(ref e) if e.kind() == ErrorKind::NotFound => {
                Err(StorageError::not_found(path.display().to_string()))
            }
            Err(other) => Err(StorageError::transport(other)),
        }
    }

    async fn delete_image(&self, path: &Path) -> StorageResult<Value> {
        let path = self.resolve(path)?;

        debug!("Purging image @ {:?}", &path);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(Value::Null),
            Err(ref e) if e.kind() == ErrorKind::NotFound => Ok(Value::Null),
            Err(other) => Err(StorageError::write(other)),
        }
    }

    async fn list_images(&self, directory: &Path) -> StorageResult<Value> {
        let directory = self.resolve(directory)?;

        let mut entries = match tokio::fs::read_dir(&directory).await {
            Ok(entries) => entries,
            Err(ref e) if e.kind() == ErrorKind::NotFound => return Ok(json!([])),
            Err(other) => return Err(StorageError::transport(other)),
        };

        let mut files = vec![];
        while let Some(entry) = entries.next_entry().await.map_err(StorageError::transport)? {
            let is_file = entry
                .file_type()
                .await
                .map(|t| t.is_file())
                .unwrap_or(false);

            if let (true, Some(name)) = (is_file, entry.file_name().to_str()) {
                files.push(Value::String(name.to_string()));
            }
        }

        Ok(Value::Array(files))
    }
}

#[async_trait]
impl InvokeChannel for HostDispatcher {
    async fn invoke(&self, command: &str, args: Value) -> StorageResult<Value> {
        self.handle(command, args).await
    }
}

fn parse_args<T: serde::de::DeserializeOwned>(command: &str, args: Value) -> StorageResult<T> {
    serde_json::from_value(args)
        .map_err(|e| StorageError::invalid(format!("bad arguments for {}: {}", command, e)))
}
