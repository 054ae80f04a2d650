//! Picks the active `DataAccess` and `StorageAdapter` for the process.
//!
//! Selection happens once. The resolved instances are handed out as
//! `Arc<dyn ...>` and never swapped for the rest of the process lifetime.

use std::sync::Arc;

use once_cell::sync::OnceCell;
use serde::Deserialize;
use strum::{Display, EnumString};

use crate::data::api::{ApiClient, ApiClientOptions, ApiDataAccess};
use crate::data::document::DocumentDataAccess;
use crate::data::relational::SqliteDataAccess;
use crate::data::DataAccess;
use crate::error::{StorageError, StorageResult};
use crate::host::InvokeChannel;
use crate::storage::backends::base64::Base64StorageAdapter;
use crate::storage::backends::filesystem::FileSystemStorageAdapter;
use crate::storage::kv::MemoryKeyValueStore;
use crate::storage::{BackendConfigs, StorageAdapter};

/// The directory images are kept in when running inside the desktop host
/// without an explicit backend.
pub const DEFAULT_IMAGE_DIRECTORY: &str = "images";

/// Where the process is running.
#[derive(Clone, Default)]
pub struct HostEnvironment {
    has_ui_context: bool,
    desktop_host: Option<Arc<dyn InvokeChannel>>,
}

impl HostEnvironment {
    /// Server side, no UI and no privileged host.
    pub fn server() -> Self {
        Self::default()
    }

    /// A plain browser tab.
    pub fn browser() -> Self {
        Self {
            has_ui_context: true,
            desktop_host: None,
        }
    }

    /// A UI running inside the desktop host, reached through `host`.
    pub fn desktop(host: Arc<dyn InvokeChannel>) -> Self {
        Self {
            has_ui_context: true,
            desktop_host: Some(host),
        }
    }

    #[inline]
    pub fn has_ui_context(&self) -> bool {
        self.has_ui_context
    }

    #[inline]
    pub fn is_desktop(&self) -> bool {
        self.desktop_host.is_some()
    }

    pub fn desktop_host(&self) -> Option<Arc<dyn InvokeChannel>> {
        self.desktop_host.clone()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DataAccessKind {
    Api,
    Document,
    Sqlite,
}

/// The selection policy.
///
/// Without a UI context the API is the only option. The desktop host gets
/// SQLite and a plain browser gets the document store. An override wins,
/// but SQLite outside of the desktop host has no transport and is refused.
pub fn select_data_access_kind(
    env: &HostEnvironment,
    overridden: Option<DataAccessKind>,
) -> StorageResult<DataAccessKind> {
    if let Some(kind) = overridden {
        if kind == DataAccessKind::Sqlite && !env.is_desktop() {
            return Err(StorageError::configuration(
                "sqlite data access is only available inside the desktop host",
            ));
        }
        return Ok(kind);
    }

    let kind = if !env.has_ui_context() {
        DataAccessKind::Api
    } else if env.is_desktop() {
        DataAccessKind::Sqlite
    } else {
        DataAccessKind::Document
    };

    Ok(kind)
}

/// Builds and memoises the active `DataAccess`.
pub struct DataAccessProvider {
    env: HostEnvironment,
    overridden: Option<DataAccessKind>,
    api: ApiClientOptions,
    resolved: OnceCell<Arc<dyn DataAccess>>,
}

impl DataAccessProvider {
    pub fn new(env: HostEnvironment) -> Self {
        Self {
            env,
            overridden: None,
            api: ApiClientOptions::default(),
            resolved: OnceCell::new(),
        }
    }

    pub fn with_override(mut self, kind: Option<DataAccessKind>) -> Self {
        self.overridden = kind;
        self
    }

    pub fn with_api_options(mut self, options: ApiClientOptions) -> Self {
        self.api = options;
        self
    }

    /// The active implementation, built on first call.
    pub fn get(&self) -> StorageResult<Arc<dyn DataAccess>> {
        self.resolved.get_or_try_init(|| self.build()).map(Clone::clone)
    }

    fn build(&self) -> StorageResult<Arc<dyn DataAccess>> {
        let kind = select_data_access_kind(&self.env, self.overridden)?;

        let access: Arc<dyn DataAccess> = match kind {
            DataAccessKind::Api => {
                Arc::new(ApiDataAccess::new(ApiClient::with_options(self.api.clone())?))
            }
            DataAccessKind::Document => Arc::new(DocumentDataAccess::shared()),
            DataAccessKind::Sqlite => {
                let host = self.env.desktop_host().ok_or_else(|| {
                    StorageError::configuration("no desktop host to reach sqlite through")
                })?;
                Arc::new(SqliteDataAccess::with_host(host))
            }
        };

        info!("using the {} data access", access.name());
        Ok(access)
    }
}

/// Picks the active `StorageAdapter`.
///
/// An explicit backend configuration always wins. Otherwise the desktop
/// host stores images on disk, a browser stores them in the shared
/// key-value store and a server has no default.
pub struct StorageProvider {
    env: HostEnvironment,
    backend: Option<BackendConfigs>,
    image_directory: String,
}

impl StorageProvider {
    pub fn new(env: HostEnvironment) -> Self {
        Self {
            env,
            backend: None,
            image_directory: DEFAULT_IMAGE_DIRECTORY.to_string(),
        }
    }

    pub fn with_backend(mut self, backend: Option<BackendConfigs>) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_image_directory(mut self, directory: impl Into<String>) -> Self {
        self.image_directory = directory.into();
        self
    }

    pub async fn connect(&self) -> StorageResult<Arc<dyn StorageAdapter>> {
        if let Some(backend) = self.backend.as_ref() {
            return backend.connect(&self.env).await;
        }

        if let Some(host) = self.env.desktop_host() {
            let adapter = FileSystemStorageAdapter::connect(&self.image_directory, host).await?;
            info!("storing images on the host filesystem");
            return Ok(Arc::new(adapter));
        }

        if self.env.has_ui_context() {
            info!("storing images in the browser key-value store");
            let store = MemoryKeyValueStore::shared(None);
            return Ok(Arc::new(Base64StorageAdapter::new(store)));
        }

        Err(StorageError::configuration(
            "no image storage backend is configured for a server environment",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostDispatcher;
    use std::str::FromStr;
    use tempfile::TempDir;

    fn desktop() -> HostEnvironment {
        HostEnvironment::desktop(Arc::new(HostDispatcher::new()))
    }

    #[test]
    fn without_a_ui_the_api_is_selected() {
        let kind = select_data_access_kind(&HostEnvironment::server(), None).unwrap();
        assert_eq!(kind, DataAccessKind::Api);
    }

    #[test]
    fn desktop_and_browser_defaults() {
        assert_eq!(
            select_data_access_kind(&desktop(), None).unwrap(),
            DataAccessKind::Sqlite
        );
        assert_eq!(
            select_data_access_kind(&HostEnvironment::browser(), None).unwrap(),
            DataAccessKind::Document
        );
    }

    #[test]
    fn overrides_win_except_sqlite_outside_the_host() {
        let kind =
            select_data_access_kind(&HostEnvironment::server(), Some(DataAccessKind::Document));
        assert_eq!(kind.unwrap(), DataAccessKind::Document);

        for env in [HostEnvironment::server(), HostEnvironment::browser()] {
            let err = select_data_access_kind(&env, Some(DataAccessKind::Sqlite)).unwrap_err();
            assert!(matches!(err, StorageError::Configuration(_)));
        }
    }

    #[test]
    fn kinds_parse_from_lowercase_names() {
        assert_eq!(DataAccessKind::from_str("sqlite").unwrap(), DataAccessKind::Sqlite);
        assert_eq!(DataAccessKind::Api.to_string(), "api");
        assert!(DataAccessKind::from_str("mongo").is_err());
    }

    #[test]
    fn provider_memoises_its_choice() {
        let provider = DataAccessProvider::new(HostEnvironment::browser());
        let first = provider.get().unwrap();
        let second = provider.get().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.name(), "document");
    }

    #[test]
    fn failed_selection_is_reported_every_time() {
        let provider = DataAccessProvider::new(HostEnvironment::browser())
            .with_override(Some(DataAccessKind::Sqlite));
        assert!(provider.get().is_err());
        assert!(provider.get().is_err());
    }

    #[tokio::test]
    async fn storage_defaults_follow_the_environment() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let dir = temp.path().join("imgs");
        let adapter = StorageProvider::new(desktop())
            .with_image_directory(dir.to_string_lossy())
            .connect()
            .await?;
        assert_eq!(adapter.name(), "filesystem");

        let adapter = StorageProvider::new(HostEnvironment::browser()).connect().await?;
        assert_eq!(adapter.name(), "base64");

        let err = StorageProvider::new(HostEnvironment::server())
            .connect()
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StorageError::Configuration(_)));
        Ok(())
    }
}
