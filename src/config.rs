use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Result};
use once_cell::sync::OnceCell;
use serde::Deserialize;
use tracing::Level;

use crate::data::api::{ApiClientOptions, DEFAULT_CACHE_TTL};
use crate::provider::{DataAccessKind, DEFAULT_IMAGE_DIRECTORY};
use crate::storage::BackendConfigs;

static CONFIG: OnceCell<RuntimeConfig> = OnceCell::new();

/// The active configuration, if `init` has run.
pub fn config() -> Option<&'static RuntimeConfig> {
    CONFIG.get()
}

/// Loads the configuration at `path` and makes it the active one.
pub async fn init(path: &Path) -> Result<&'static RuntimeConfig> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| anyhow!("cannot read config file {:?}: {}", path, e))?;

    let cfg = RuntimeConfig::from_yaml(&raw)?;
    Ok(CONFIG.get_or_init(|| cfg))
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    /// `None` disables logging entirely.
    pub fn as_level(self) -> Option<Level> {
        match self {
            Self::Off => None,
            Self::Error => Some(Level::ERROR),
            Self::Warn => Some(Level::WARN),
            Self::Info => Some(Level::INFO),
            Self::Debug => Some(Level::DEBUG),
            Self::Trace => Some(Level::TRACE),
        }
    }
}

/// Which environment this process plays.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// No UI, entities go through the remote API.
    Server,

    /// The privileged desktop host: SQLite and the local filesystem.
    Desktop,

    /// A browser-like process with only in-memory stores.
    Browser,
}

impl Default for Environment {
    fn default() -> Self {
        Self::Desktop
    }
}

#[derive(Debug, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub log_level: LogLevel,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    /// Defaults to `desktop`.
    pub environment: Environment,

    /// Forces a data access implementation instead of deriving it from
    /// the environment.
    pub data_access: Option<DataAccessKind>,

    /// The REST API used by the `api` data access.
    ///
    /// Defaults to `/api` on this server's own address.
    pub api_base_url: Option<String>,

    /// A bearer token sent to the REST API.
    pub api_token: Option<String>,

    #[serde(default)]
    /// Cache GET responses from the REST API.
    pub api_cache: bool,

    #[serde(default = "default_cache_ttl")]
    /// How long cached responses live, in seconds.
    pub api_cache_ttl: u64,

    #[serde(default = "default_database_uri")]
    pub database_uri: String,

    #[serde(default = "default_pool_size")]
    pub database_pool_size: u32,

    /// Confines the host's filesystem commands to this directory.
    pub host_root: Option<PathBuf>,

    #[serde(default = "default_image_directory")]
    /// Where images are stored by default inside the desktop host.
    pub image_directory: String,

    /// The image storage backend, derived from the environment when unset.
    pub backend: Option<BackendConfigs>,
}

impl RuntimeConfig {
    pub fn from_yaml(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw).map_err(|e| anyhow!("invalid config: {}", e))
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn api_options(&self) -> ApiClientOptions {
        let base_url = self
            .api_base_url
            .clone()
            .unwrap_or_else(|| format!("http://{}/api", self.bind_address()));

        ApiClientOptions {
            base_url,
            auth_token: self.api_token.clone(),
            cache: self.api_cache,
            cache_ttl: Duration::from_secs(self.api_cache_ttl),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

const fn default_port() -> u16 {
    8000
}

fn default_cache_ttl() -> u64 {
    DEFAULT_CACHE_TTL.as_secs()
}

fn default_database_uri() -> String {
    "sqlite://labelstore.db?mode=rwc".to_string()
}

const fn default_pool_size() -> u32 {
    4
}

fn default_image_directory() -> String {
    DEFAULT_IMAGE_DIRECTORY.to_string()
}

/// A starting configuration using the given storage backend.
pub fn template(backend: &str) -> Result<String> {
    let backend_block = match backend {
        "base64" => "backend:\n  type: base64\n  prefix: img_\n",
        "filesystem" => "backend:\n  type: filesystem\n  directory: ./images\n",
        "s3" => concat!(
            "backend:\n",
            "  type: s3\n",
            "  bucket: labelstore-images\n",
            "  region: us-east-1\n",
            "  credentials:\n",
            "    source: default\n",
        ),
        "azure" => concat!(
            "backend:\n",
            "  type: azure\n",
            "  account: labelstore\n",
            "  container: labelstore-images\n",
            "  sas_token: \"\"\n",
        ),
        "hybrid" => concat!(
            "backend:\n",
            "  type: hybrid\n",
            "  local:\n",
            "    type: filesystem\n",
            "    directory: ./images\n",
            "  remote:\n",
            "    type: s3\n",
            "    bucket: labelstore-images\n",
            "    region: us-east-1\n",
        ),
        other => return Err(anyhow!("unknown backend {:?}, expected one of base64, filesystem, s3, azure, hybrid", other)),
    };

    let environment = if backend == "base64" { "browser" } else { "desktop" };
    let data_access = if backend == "base64" { "document" } else { "sqlite" };

    Ok(format!(
        "log_level: info\n\
         host: 127.0.0.1\n\
         port: 8000\n\
         environment: {}\n\
         data_access: {}\n\
         database_uri: {}\n\
         {}",
        environment,
        data_access,
        default_database_uri(),
        backend_block,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_template_parses() {
        for backend in ["base64", "filesystem", "s3", "azure", "hybrid"] {
            let raw = template(backend).unwrap();
            let cfg = RuntimeConfig::from_yaml(&raw).unwrap();
            assert!(cfg.backend.is_some(), "{}", backend);
        }

        assert!(template("ftp").is_err());
    }

    #[test]
    fn defaults_apply_to_an_empty_document() {
        let cfg = RuntimeConfig::from_yaml("{}").unwrap();
        assert_eq!(cfg.environment, Environment::Desktop);
        assert_eq!(cfg.log_level, LogLevel::Info);
        assert_eq!(cfg.bind_address(), "127.0.0.1:8000");
        assert_eq!(cfg.api_options().base_url, "http://127.0.0.1:8000/api");
        assert_eq!(cfg.api_options().cache_ttl, DEFAULT_CACHE_TTL);
        assert!(cfg.data_access.is_none());
    }

    #[test]
    fn overrides_parse() {
        let cfg = RuntimeConfig::from_yaml(
            "environment: server\ndata_access: document\nlog_level: debug\n",
        )
        .unwrap();
        assert_eq!(cfg.environment, Environment::Server);
        assert_eq!(cfg.data_access, Some(DataAccessKind::Document));
        assert_eq!(cfg.log_level.as_level(), Some(Level::DEBUG));
    }
}
