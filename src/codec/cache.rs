use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};

use lru::LruCache;

use super::{deserialize, Celltype, Value};
use crate::checksum::Checksum;
use crate::error::Result;

const DEFAULT_CAPACITY: NonZeroUsize = match NonZeroUsize::new(256) {
    Some(capacity) => capacity,
    None => unreachable!(),
};

type Entries = LruCache<(Checksum, Celltype), Arc<Value>>;

/// Bounded cache of deserialized values keyed by (checksum, celltype)
///
/// Entries are shared read-only. Callers that want to mutate a value ask for
/// a copy, which never aliases the cached entry.
pub struct DeserializeCache {
    entries: Mutex<Entries>,
}

impl Default for DeserializeCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY.get())
    }
}

impl DeserializeCache {
    /// A capacity of zero is raised to one
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn entries(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Deserialize `buffer`, verifying it against `checksum`, reusing a cached value if present
    pub fn deserialize(
        &self,
        buffer: &[u8],
        checksum: &Checksum,
        celltype: Celltype,
        copy: bool,
    ) -> Result<Arc<Value>> {
        let key = (*checksum, celltype);
        let hit = self.entries().get(&key).cloned();
        let value = match hit {
            Some(value) => value,
            None => {
                let value = Arc::new(deserialize(buffer, Some(checksum), celltype)?);
                self.entries().put(key, Arc::clone(&value));
                value
            }
        };
        Ok(if copy { Arc::new((*value).clone()) } else { value })
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn clear(&self) {
        self.entries().clear();
    }
}
