use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use rocksdb::{IteratorMode, Options, WriteBatch, DB};
use serde_json::Value as Json;
use tracing::debug;

use crate::checksum::Checksum;
use crate::error::Result;

/// RocksDB column families of the persisted transformation-result cache
///
/// All keys are lowercase hex checksums (sem2syn keys add celltype and
/// subcelltype). Values:
/// - "transformations": result checksum hex
/// - "sem2syn": JSON list of syntactic checksum hex strings
/// - "metadata": execution metadata as JSON text
/// - "exceptions": exception text
/// - "logs": captured logs
const CF_TRANSFORMATIONS: &str = "transformations";
const CF_SEM2SYN: &str = "sem2syn";
const CF_METADATA: &str = "metadata";
const CF_EXCEPTIONS: &str = "exceptions";
const CF_LOGS: &str = "logs";

/// Local, persistent implementation of the database operations
pub struct ResultStore {
    path: PathBuf,
    db: Arc<DB>,
}

impl ResultStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&path).context("Failed to create result store directory")?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Snappy);
        opts.increase_parallelism(num_cpus::get() as i32);
        opts.set_max_background_jobs(4);
        opts.set_statistics_level(rocksdb::statistics::StatsLevel::DisableAll);

        let db = DB::open_cf(
            &opts,
            &path,
            vec![CF_TRANSFORMATIONS, CF_SEM2SYN, CF_METADATA, CF_EXCEPTIONS, CF_LOGS],
        )
        .context("Failed to open result store")?;

        debug!(path = %path.display(), "Opened result store");
        Ok(Self {
            path,
            db: Arc::new(db),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily> {
        Ok(self
            .db
            .cf_handle(name)
            .with_context(|| format!("Missing column family {name}"))?)
    }

    fn get_text(&self, cf: &str, key: &str) -> Result<Option<String>> {
        let value = self
            .db
            .get_cf(self.cf(cf)?, key.as_bytes())
            .context("Failed to read result store")?;
        Ok(value.map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    fn put_text(&self, cf: &str, key: &str, value: &str) -> Result<()> {
        self.db
            .put_cf(self.cf(cf)?, key.as_bytes(), value.as_bytes())
            .context("Failed to write result store")?;
        Ok(())
    }

    fn delete_key(&self, cf: &str, key: &str) -> Result<()> {
        self.db
            .delete_cf(self.cf(cf)?, key.as_bytes())
            .context("Failed to delete from result store")?;
        Ok(())
    }

    pub fn get_transformation_result(&self, tf_checksum: &Checksum) -> Result<Option<Checksum>> {
        self.get_text(CF_TRANSFORMATIONS, &tf_checksum.to_hex())?
            .map(|hex| Checksum::from_hex(hex.trim()))
            .transpose()
    }

    pub fn set_transformation_result(&self, tf_checksum: &Checksum, result: &Checksum) -> Result<()> {
        self.put_text(CF_TRANSFORMATIONS, &tf_checksum.to_hex(), &result.to_hex())
    }

    /// Transformations known to produce `result`
    pub fn get_rev_transformations(&self, result: &Checksum) -> Result<Vec<Checksum>> {
        let cf = self.cf(CF_TRANSFORMATIONS)?;
        let wanted = result.to_hex();
        let mut found = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item.context("Failed to iterate result store")?;
            if value.as_ref() == wanted.as_bytes() {
                if let Ok(tf) = Checksum::from_hex(&String::from_utf8_lossy(&key)) {
                    found.push(tf);
                }
            }
        }
        Ok(found)
    }

    /// Forget a result if it is the one being contested
    ///
    /// Returns the HTTP-like status and text of a database `contest` request.
    pub fn contest(&self, tf_checksum: &Checksum, result: &Checksum) -> Result<(u16, String)> {
        match self.get_transformation_result(tf_checksum)? {
            None => Ok((404, "Unknown transformation".to_string())),
            Some(stored) if stored != *result => {
                Ok((400, format!("Stored result is {stored}, not {result}")))
            }
            Some(_) => {
                let key = tf_checksum.to_hex();
                let mut batch = WriteBatch::default();
                batch.delete_cf(self.cf(CF_TRANSFORMATIONS)?, key.as_bytes());
                batch.delete_cf(self.cf(CF_METADATA)?, key.as_bytes());
                self.db.write(batch).context("Failed to contest result")?;
                Ok((200, "OK".to_string()))
            }
        }
    }

    fn sem2syn_key(semantic: &Checksum, celltype: &str, subcelltype: Option<&str>) -> String {
        format!("{}-{}-{}", semantic.to_hex(), celltype, subcelltype.unwrap_or(""))
    }

    pub fn get_sem2syn(
        &self,
        semantic: &Checksum,
        celltype: &str,
        subcelltype: Option<&str>,
    ) -> Result<Option<Vec<Checksum>>> {
        let key = Self::sem2syn_key(semantic, celltype, subcelltype);
        let Some(text) = self.get_text(CF_SEM2SYN, &key)? else {
            return Ok(None);
        };
        let hexes: Vec<String> = serde_json::from_str(&text)?;
        let checksums = hexes
            .iter()
            .map(|h| Checksum::from_hex(h))
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(checksums))
    }

    /// Merge syntactic checksums into the stored list for a semantic key
    pub fn set_sem2syn(
        &self,
        semantic: &Checksum,
        celltype: &str,
        subcelltype: Option<&str>,
        syntactic: &[Checksum],
    ) -> Result<()> {
        let mut merged: BTreeSet<Checksum> = self
            .get_sem2syn(semantic, celltype, subcelltype)?
            .unwrap_or_default()
            .into_iter()
            .collect();
        merged.extend(syntactic.iter().copied());
        let hexes: Vec<String> = merged.iter().map(Checksum::to_hex).collect();
        let key = Self::sem2syn_key(semantic, celltype, subcelltype);
        self.put_text(CF_SEM2SYN, &key, &serde_json::to_string(&hexes)?)
    }

    pub fn get_metadata(&self, tf_checksum: &Checksum) -> Result<Option<Json>> {
        match self.get_text(CF_METADATA, &tf_checksum.to_hex())? {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    pub fn set_metadata(&self, tf_checksum: &Checksum, metadata: &Json) -> Result<()> {
        self.put_text(CF_METADATA, &tf_checksum.to_hex(), &metadata.to_string())
    }

    pub fn get_exception(&self, tf_checksum: &Checksum) -> Result<Option<String>> {
        self.get_text(CF_EXCEPTIONS, &tf_checksum.to_hex())
    }

    pub fn set_exception(&self, tf_checksum: &Checksum, exception: &str) -> Result<()> {
        self.put_text(CF_EXCEPTIONS, &tf_checksum.to_hex(), exception)
    }

    pub fn clear_exception(&self, tf_checksum: &Checksum) -> Result<()> {
        self.delete_key(CF_EXCEPTIONS, &tf_checksum.to_hex())
    }

    pub fn get_logs(&self, tf_checksum: &Checksum) -> Result<Option<String>> {
        self.get_text(CF_LOGS, &tf_checksum.to_hex())
    }

    pub fn set_logs(&self, tf_checksum: &Checksum, logs: &str) -> Result<()> {
        self.put_text(CF_LOGS, &tf_checksum.to_hex(), logs)
    }

    /// Number of stored transformation results
    pub fn count_results(&self) -> Result<usize> {
        let cf = self.cf(CF_TRANSFORMATIONS)?;
        let mut count = 0;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            item.context("Failed to iterate result store")?;
            count += 1;
        }
        Ok(count)
    }
}

impl Drop for ResultStore {
    fn drop(&mut self) {
        if let Err(e) = self.db.flush() {
            eprintln!("Warning: Failed to flush result store on shutdown: {}", e);
        }
        // Avoids pthread lock errors on Linux when the process exits right after
        self.db.cancel_all_background_work(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::calculate_checksum;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_transformation_results() {
        let temp_dir = TempDir::new().unwrap();
        let store = ResultStore::open(temp_dir.path()).unwrap();

        let tf = calculate_checksum(b"tf");
        let result = calculate_checksum(b"5\n");
        assert_eq!(store.get_transformation_result(&tf).unwrap(), None);

        store.set_transformation_result(&tf, &result).unwrap();
        assert_eq!(store.get_transformation_result(&tf).unwrap(), Some(result));
        assert_eq!(store.get_rev_transformations(&result).unwrap(), vec![tf]);
        assert_eq!(store.count_results().unwrap(), 1);
    }

    #[test]
    fn test_contest() {
        let temp_dir = TempDir::new().unwrap();
        let store = ResultStore::open(temp_dir.path()).unwrap();
        let tf = calculate_checksum(b"tf");
        let result = calculate_checksum(b"5\n");
        let other = calculate_checksum(b"6\n");

        assert_eq!(store.contest(&tf, &result).unwrap().0, 404);
        store.set_transformation_result(&tf, &result).unwrap();
        assert_eq!(store.contest(&tf, &other).unwrap().0, 400);
        assert_eq!(store.contest(&tf, &result).unwrap().0, 200);
        assert_eq!(store.get_transformation_result(&tf).unwrap(), None);
    }

    #[test]
    fn test_sem2syn_merges() {
        let temp_dir = TempDir::new().unwrap();
        let store = ResultStore::open(temp_dir.path()).unwrap();
        let sem = calculate_checksum(b"sem");
        let syn1 = calculate_checksum(b"syn1");
        let syn2 = calculate_checksum(b"syn2");

        store.set_sem2syn(&sem, "python", Some("transformer"), &[syn1]).unwrap();
        store.set_sem2syn(&sem, "python", Some("transformer"), &[syn2, syn1]).unwrap();

        let mut stored = store
            .get_sem2syn(&sem, "python", Some("transformer"))
            .unwrap()
            .unwrap();
        stored.sort();
        let mut expected = vec![syn1, syn2];
        expected.sort();
        assert_eq!(stored, expected);
        assert_eq!(store.get_sem2syn(&sem, "python", None).unwrap(), None);
    }

    #[test]
    fn test_metadata_exceptions_logs() {
        let temp_dir = TempDir::new().unwrap();
        let store = ResultStore::open(temp_dir.path()).unwrap();
        let tf = calculate_checksum(b"tf");

        store.set_metadata(&tf, &json!({"Executor": "seamless-in-process"})).unwrap();
        assert_eq!(
            store.get_metadata(&tf).unwrap(),
            Some(json!({"Executor": "seamless-in-process"}))
        );

        store.set_exception(&tf, "ZeroDivisionError").unwrap();
        store.set_logs(&tf, "stdout line\n").unwrap();
        assert_eq!(store.get_exception(&tf).unwrap().as_deref(), Some("ZeroDivisionError"));
        assert_eq!(store.get_logs(&tf).unwrap().as_deref(), Some("stdout line\n"));

        store.clear_exception(&tf).unwrap();
        assert_eq!(store.get_exception(&tf).unwrap(), None);
    }

    #[test]
    fn test_persists_across_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let tf = calculate_checksum(b"tf");
        let result = calculate_checksum(b"5\n");
        {
            let store = ResultStore::open(temp_dir.path()).unwrap();
            store.set_transformation_result(&tf, &result).unwrap();
        }
        let store = ResultStore::open(temp_dir.path()).unwrap();
        assert_eq!(store.get_transformation_result(&tf).unwrap(), Some(result));
    }
}
