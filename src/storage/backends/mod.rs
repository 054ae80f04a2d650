pub mod azure;
pub mod base64;
pub mod blob_storage;
pub mod filesystem;
pub mod hybrid;
mod register;

pub use register::BackendConfigs;
