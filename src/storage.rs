//! Image storage.
//!
//! Every backend implements [`StorageAdapter`], the active one is chosen
//! once at startup (see [`crate::provider::StorageProvider`]) and shared as
//! an `Arc<dyn StorageAdapter>`.

pub mod backends;
pub mod kv;
pub mod loader;
mod template;

pub use backends::BackendConfigs;
pub use template::StorageAdapter;
