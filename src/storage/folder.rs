use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;

use anyhow::Context;
use bytes::Bytes;
use tracing::{debug, warn};

use super::{BufferStore, StorageStats};
use crate::checksum::{calculate_checksum, Buffer, Checksum};
use crate::error::Result;

/// Flat directory of buffers, one file per checksum named by its hex form
///
/// Layout: `<root>/<64 hex chars>`. The same layout is used for local
/// persistent buffers and for read-only buffer folders shared between hosts.
pub struct FolderStore {
    root: PathBuf,
    read_only: bool,
}

impl FolderStore {
    /// Open (and create) a writable buffer folder
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create buffer folder {}", root.display()))?;
        Ok(Self {
            root,
            read_only: false,
        })
    }

    /// Open an existing folder for reading only; a missing folder simply has no buffers
    pub fn read_only<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            read_only: true,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, checksum: &Checksum) -> PathBuf {
        self.root.join(checksum.to_hex())
    }
}

impl BufferStore for FolderStore {
    fn put(&self, checksum: &Checksum, buffer: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(anyhow::anyhow!(
                "buffer folder {} is read-only",
                self.root.display()
            )
            .into());
        }
        let path = self.path_for(checksum);
        if path.exists() {
            return Ok(());
        }

        // PID + thread ID keep concurrent writers apart
        let temp_path = self.root.join(format!(
            "{}.tmp.{}.{:?}",
            checksum.to_hex(),
            std::process::id(),
            thread::current().id()
        ));

        let mut file = fs::File::create(&temp_path).context("Failed to create temp file")?;
        file.write_all(buffer).context("Failed to write buffer")?;
        file.sync_all().context("Failed to sync buffer file")?;
        fs::rename(&temp_path, &path).context("Failed to rename temp file")?;

        debug!(checksum = %checksum.short(), size_bytes = buffer.len(), "Wrote buffer to folder");
        Ok(())
    }

    fn get(&self, checksum: &Checksum) -> Result<Option<Buffer>> {
        let path = self.path_for(checksum);
        if !path.is_file() {
            return Ok(None);
        }

        let data = fs::read(&path)
            .with_context(|| format!("Failed to read buffer file {}", path.display()))?;
        let actual = calculate_checksum(&data);
        if actual != *checksum {
            warn!(
                checksum = %checksum,
                actual = %actual,
                folder = %self.root.display(),
                "Buffer folder entry has wrong content, ignoring"
            );
            return Ok(None);
        }
        Ok(Some(Bytes::from(data)))
    }

    fn exists(&self, checksum: &Checksum) -> Result<bool> {
        Ok(self.path_for(checksum).is_file())
    }

    fn delete(&self, checksum: &Checksum) -> Result<()> {
        let path = self.path_for(checksum);
        if path.exists() {
            fs::remove_file(&path).context("Failed to delete buffer file")?;
        }
        Ok(())
    }

    fn list(&self) -> Result<Vec<Checksum>> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let mut checksums = Vec::new();
        for entry in fs::read_dir(&self.root).context("Failed to list buffer folder")? {
            let entry = entry.context("Failed to read directory entry")?;
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(checksum) = Checksum::from_hex(name) {
                    checksums.push(checksum);
                }
            }
        }
        checksums.sort();
        Ok(checksums)
    }

    fn stats(&self) -> Result<StorageStats> {
        let mut total_buffers = 0u64;
        let mut total_bytes = 0u64;
        for checksum in self.list()? {
            if let Ok(meta) = fs::metadata(self.path_for(&checksum)) {
                total_buffers += 1;
                total_bytes += meta.len();
            }
        }
        Ok(StorageStats {
            total_buffers,
            total_bytes,
            root: self.root.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_folder_store() {
        let temp_dir = TempDir::new().unwrap();
        let store = FolderStore::new(temp_dir.path()).unwrap();

        let buffer = b"hello world";
        let checksum = calculate_checksum(buffer);
        store.put(&checksum, buffer).unwrap();

        assert!(temp_dir.path().join(checksum.to_hex()).is_file());
        assert_eq!(store.get(&checksum).unwrap().as_deref(), Some(&buffer[..]));
        assert!(store.exists(&checksum).unwrap());
        assert_eq!(store.list().unwrap(), vec![checksum]);

        let stats = store.stats().unwrap();
        assert_eq!(stats.total_buffers, 1);
        assert_eq!(stats.total_bytes, 11);

        store.delete(&checksum).unwrap();
        assert!(!store.exists(&checksum).unwrap());
    }

    #[test]
    fn test_corrupted_entry_is_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let checksum = calculate_checksum(b"expected");
        fs::write(temp_dir.path().join(checksum.to_hex()), b"tampered").unwrap();

        let store = FolderStore::read_only(temp_dir.path());
        assert_eq!(store.get(&checksum).unwrap(), None);
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let temp_dir = TempDir::new().unwrap();
        let store = FolderStore::read_only(temp_dir.path());
        let checksum = calculate_checksum(b"x");
        assert!(store.put(&checksum, b"x").is_err());
    }

    #[test]
    fn test_missing_read_folder_is_empty() {
        let store = FolderStore::read_only("/nonexistent/seamless/buffers");
        assert!(store.list().unwrap().is_empty());
        assert_eq!(store.get(&calculate_checksum(b"x")).unwrap(), None);
    }
}
