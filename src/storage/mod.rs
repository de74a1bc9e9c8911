pub mod folder;
pub mod result_store;

pub use folder::FolderStore;
pub use result_store::ResultStore;

use std::path::PathBuf;

use crate::checksum::{Buffer, Checksum};
use crate::error::Result;

/// Content-addressed buffer storage keyed by checksum
pub trait BufferStore: Send + Sync {
    /// Store a buffer under its checksum
    fn put(&self, checksum: &Checksum, buffer: &[u8]) -> Result<()>;

    /// Retrieve a buffer; content that does not hash to `checksum` is treated as absent
    fn get(&self, checksum: &Checksum) -> Result<Option<Buffer>>;

    fn exists(&self, checksum: &Checksum) -> Result<bool>;

    fn delete(&self, checksum: &Checksum) -> Result<()>;

    /// List all stored checksums
    fn list(&self) -> Result<Vec<Checksum>>;

    fn stats(&self) -> Result<StorageStats>;
}

/// Storage statistics
#[derive(Debug, Clone)]
pub struct StorageStats {
    pub total_buffers: u64,
    pub total_bytes: u64,
    pub root: PathBuf,
}
