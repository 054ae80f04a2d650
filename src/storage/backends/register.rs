use std::path::PathBuf;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Deserialize;

use super::azure::AzureBlobStorageAdapter;
use super::base64::{Base64StorageAdapter, DEFAULT_PREFIX};
use super::blob_storage::{S3Credentials, S3StorageAdapter};
use super::filesystem::FileSystemStorageAdapter;
use super::hybrid::HybridStorageAdapter;
use crate::error::{StorageError, StorageResult};
use crate::provider::HostEnvironment;
use crate::storage::kv::MemoryKeyValueStore;
use crate::storage::template::StorageAdapter;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum BackendConfigs {
    /// Base64 text in the process wide key-value store.
    Base64 {
        #[serde(default = "default_prefix")]
        prefix: String,

        /// The maximum number of bytes the store may hold.
        ///
        /// Only honoured by whichever adapter initialises the shared
        /// store first.
        quota: Option<usize>,
    },

    FileSystem {
        directory: PathBuf,
    },

    S3 {
        bucket: String,
        region: String,

        /// Set for S3 compatible stores, `region` then becomes a free form name.
        endpoint: Option<String>,

        #[serde(default)]
        credentials: S3Credentials,
    },

    Azure {
        account: String,
        container: String,

        /// A shared access signature granting read, write, delete and list.
        sas_token: Option<String>,

        /// Replaces `https://<account>.blob.core.windows.net`, e.g. for Azurite.
        endpoint: Option<String>,
    },

    Hybrid {
        local: Box<BackendConfigs>,
        remote: Box<BackendConfigs>,
    },
}

fn default_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

impl BackendConfigs {
    /// Builds the configured adapter, checking that it can operate in `env`.
    pub fn connect<'a>(
        &'a self,
        env: &'a HostEnvironment,
    ) -> BoxFuture<'a, StorageResult<Arc<dyn StorageAdapter>>> {
        async move {
            let adapter: Arc<dyn StorageAdapter> = match self {
                Self::Base64 { prefix, quota } => {
                    if !env.has_ui_context() {
                        return Err(StorageError::configuration(
                            "the base64 backend needs a browser context",
                        ));
                    }

                    let store = MemoryKeyValueStore::shared(*quota);
                    Arc::new(Base64StorageAdapter::with_prefix(store, prefix.clone()))
                }
                Self::FileSystem { directory } => {
                    let host = env.desktop_host().ok_or_else(|| {
                        StorageError::configuration(
                            "the filesystem backend is only available inside the desktop host",
                        )
                    })?;

                    Arc::new(FileSystemStorageAdapter::connect(directory.clone(), host).await?)
                }
                Self::S3 {
                    bucket,
                    region,
                    endpoint,
                    credentials,
                } => Arc::new(S3StorageAdapter::new(
                    bucket.clone(),
                    region.clone(),
                    endpoint.clone(),
                    credentials.clone(),
                )?),
                Self::Azure {
                    account,
                    container,
                    sas_token,
                    endpoint,
                } => Arc::new(AzureBlobStorageAdapter::new(
                    account,
                    container,
                    sas_token.clone(),
                    endpoint.clone(),
                )?),
                Self::Hybrid { local, remote } => {
                    let local = local.connect(env).await?;
                    let remote = remote.connect(env).await?;
                    Arc::new(HybridStorageAdapter::new(local, remote))
                }
            };

            info!("connected to the {} storage backend", adapter.name());
            Ok(adapter)
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HostDispatcher, InvokeChannel};
    use tempfile::TempDir;

    #[test]
    fn parses_nested_hybrid_configs() {
        let cfg: BackendConfigs = serde_yaml::from_str(
            r#"
type: hybrid
local:
  type: filesystem
  directory: ./images
remote:
  type: s3
  bucket: labels
  region: eu-west-1
  credentials:
    source: static
    access_key: key
    secret_key: secret
"#,
        )
        .unwrap();

        match cfg {
            BackendConfigs::Hybrid { local, remote } => {
                assert!(matches!(*local, BackendConfigs::FileSystem { .. }));
                assert!(matches!(
                    *remote,
                    BackendConfigs::S3 {
                        credentials: S3Credentials::Static { .. },
                        ..
                    }
                ));
            }
            other => panic!("unexpected config {:?}", other),
        }
    }

    #[tokio::test]
    async fn azure_configs_connect_anywhere() -> anyhow::Result<()> {
        let cfg: BackendConfigs = serde_yaml::from_str(
            r#"
type: azure
account: devstoreaccount1
container: label-images
sas_token: sv=2021&sig=abc
endpoint: http://127.0.0.1:10000/devstoreaccount1
"#,
        )?;

        let adapter = cfg.connect(&HostEnvironment::server()).await?;
        assert_eq!(adapter.name(), "azure");

        let bad: BackendConfigs =
            serde_yaml::from_str("type: azure\naccount: Bad_Name\ncontainer: images\n")?;
        let err = bad.connect(&HostEnvironment::server()).await.err().unwrap();
        assert!(matches!(err, StorageError::Configuration(_)));
        Ok(())
    }

    #[test]
    fn base64_prefix_defaults() {
        let cfg: BackendConfigs = serde_yaml::from_str("type: base64").unwrap();
        assert!(matches!(
            cfg,
            BackendConfigs::Base64 { ref prefix, quota: None } if prefix == "img_"
        ));
    }

    #[tokio::test]
    async fn filesystem_needs_the_desktop_host() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let cfg = BackendConfigs::FileSystem {
            directory: temp.path().to_path_buf(),
        };

        let err = cfg.connect(&HostEnvironment::browser()).await.err().unwrap();
        assert!(matches!(err, StorageError::Configuration(_)));

        let host: Arc<dyn InvokeChannel> = Arc::new(HostDispatcher::new());
        let adapter = cfg.connect(&HostEnvironment::desktop(host)).await?;
        assert_eq!(adapter.name(), "filesystem");
        Ok(())
    }

    #[tokio::test]
    async fn base64_needs_a_ui_context() {
        let cfg = BackendConfigs::Base64 {
            prefix: "img_".into(),
            quota: None,
        };

        let err = cfg.connect(&HostEnvironment::server()).await.err().unwrap();
        assert!(matches!(err, StorageError::Configuration(_)));
    }
}
