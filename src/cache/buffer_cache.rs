//! Checksum-to-buffer cache with refcounting and tiered lookup
//!
//! Lookup order: builtin buffers, memory, the local persistent buffer folder,
//! then (when `remote` is requested) buffer read folders and servers, and
//! finally FAIR servers. Buffers fetched from a remote tier are cached in
//! memory for a short while.
//!
//! Unreferenced buffers stay in memory for `lifetime_temp`, or
//! `lifetime_temp_small` when smaller than `small_buffer_limit`. A referenced
//! buffer leaves memory only when another tier can serve it again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::eviction::{EvictionReport, Evictable};
use crate::checksum::{builtin_buffer, calculate_checksum, Buffer, Checksum};
use crate::error::{Result, SeamlessError};
use crate::logging::{operations, services, status};
use crate::remote::{BufferRemote, FairClient};
use crate::storage::{BufferStore, FolderStore};

/// Lifetimes of unreferenced buffers
#[derive(Debug, Clone, Copy)]
pub struct BufferLifetimes {
    pub temp: Duration,
    pub temp_small: Duration,
    pub small_buffer_limit: usize,
}

impl Default for BufferLifetimes {
    fn default() -> Self {
        Self {
            temp: Duration::from_secs(20),
            temp_small: Duration::from_secs(600),
            small_buffer_limit: 100_000,
        }
    }
}

impl BufferLifetimes {
    fn for_length(&self, length: usize) -> Duration {
        if length < self.small_buffer_limit {
            self.temp_small
        } else {
            self.temp
        }
    }
}

/// Refcounts of one checksum, split by persistence class
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefEntry {
    pub persistent: u32,
    pub transient: u32,
}

impl RefEntry {
    pub fn total(&self) -> u32 {
        self.persistent + self.transient
    }
}

#[derive(Default)]
struct State {
    buffers: HashMap<Checksum, Buffer>,
    /// Last use of buffers that are subject to lifetime expiry
    last_time: HashMap<Checksum, Instant>,
    refcounts: HashMap<Checksum, RefEntry>,
    /// Referenced checksums whose buffer is not known yet; value = persistent
    missing: HashMap<Checksum, bool>,
    lengths: HashMap<Checksum, usize>,
}

/// Snapshot of cache occupancy
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferCacheStats {
    pub buffers_in_memory: usize,
    pub bytes_in_memory: usize,
    pub referenced: usize,
    pub missing: usize,
}

pub struct BufferCache {
    state: Mutex<State>,
    remote: Arc<BufferRemote>,
    fair: Option<Arc<FairClient>>,
    local: Option<FolderStore>,
    lifetimes: BufferLifetimes,
}

impl BufferCache {
    pub fn new(
        remote: Arc<BufferRemote>,
        fair: Option<Arc<FairClient>>,
        local: Option<FolderStore>,
        lifetimes: BufferLifetimes,
    ) -> Self {
        Self {
            state: Mutex::new(State::default()),
            remote,
            fair,
            local,
            lifetimes,
        }
    }

    /// Memory-only cache without remote tiers
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(BufferRemote::disabled()),
            None,
            None,
            BufferLifetimes::default(),
        )
    }

    pub fn remote(&self) -> &Arc<BufferRemote> {
        &self.remote
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A poisoned lock only means another thread panicked mid-update; the maps stay usable
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Cache a buffer locally for a short while, without touching its refcount
    ///
    /// Resolves a pending persistent incref of the same checksum.
    pub async fn cache_buffer(&self, checksum: Checksum, buffer: Buffer) {
        if builtin_buffer(&checksum).is_some() {
            return;
        }
        let write_out = {
            let mut state = self.lock();
            state.lengths.insert(checksum, buffer.len());
            state.buffers.insert(checksum, buffer.clone());
            state.last_time.insert(checksum, Instant::now());
            match state.missing.remove(&checksum) {
                Some(persistent) => {
                    debug!(checksum = %checksum.short(), "Found missing buffer");
                    persistent
                }
                None => false,
            }
        };
        if write_out {
            self.write_persistent(&checksum, &buffer).await;
        }
    }

    /// Cache a buffer after verifying it hashes to `checksum`
    pub async fn cache_verified(&self, checksum: Checksum, buffer: Buffer) -> Result<()> {
        let actual = calculate_checksum(&buffer);
        if actual != checksum {
            return Err(SeamlessError::ChecksumMismatch {
                expected: checksum,
                actual,
            });
        }
        self.cache_buffer(checksum, buffer).await;
        Ok(())
    }

    /// Increment the refcount; an unknown buffer is registered as missing
    pub async fn incref(&self, checksum: Checksum, persistent: bool) {
        if builtin_buffer(&checksum).is_some() {
            return;
        }
        let buffer = {
            let mut state = self.lock();
            let entry = state.refcounts.entry(checksum).or_default();
            if persistent {
                entry.persistent += 1;
            } else {
                entry.transient += 1;
            }
            let buffer = state.buffers.get(&checksum).cloned();
            if buffer.is_none() {
                let was_persistent = state.missing.get(&checksum).copied().unwrap_or(false);
                state.missing.insert(checksum, persistent || was_persistent);
            }
            buffer
        };

        match buffer {
            Some(buffer) if persistent => self.write_persistent(&checksum, &buffer).await,
            Some(_) => {}
            None => {
                if !self.remote.is_known(&checksum) {
                    debug!(checksum = %checksum.short(), persistent, "Incref of missing buffer");
                }
            }
        }
    }

    /// Increment the refcount of a buffer that is provided along with it
    pub async fn incref_buffer(&self, checksum: Checksum, buffer: Buffer, persistent: bool) {
        self.cache_buffer(checksum, buffer).await;
        self.incref(checksum, persistent).await;
    }

    /// Decrement the refcount of one persistence class
    ///
    /// When no references remain, the buffer stays in memory for its temporary lifetime.
    pub fn decref(&self, checksum: &Checksum, persistent: bool) {
        if builtin_buffer(checksum).is_some() {
            return;
        }
        let mut state = self.lock();
        let Some(entry) = state.refcounts.get_mut(checksum) else {
            warn!(checksum = %checksum, "double decref");
            return;
        };
        let class = if persistent {
            &mut entry.persistent
        } else {
            &mut entry.transient
        };
        if *class == 0 {
            warn!(checksum = %checksum, persistent, "double decref");
            return;
        }
        *class -= 1;
        if entry.total() == 0 {
            state.refcounts.remove(checksum);
            state.missing.remove(checksum);
            if state.buffers.contains_key(checksum) {
                state.last_time.insert(*checksum, Instant::now());
            }
        }
    }

    pub fn refcount(&self, checksum: &Checksum) -> RefEntry {
        self.lock().refcounts.get(checksum).copied().unwrap_or_default()
    }

    pub fn is_missing(&self, checksum: &Checksum) -> bool {
        self.lock().missing.contains_key(checksum)
    }

    /// Retrieve a buffer, optionally consulting remote tiers
    ///
    /// Unreachable remote tiers count as a miss here; see [`Self::fetch_buffer`].
    pub async fn get_buffer(&self, checksum: &Checksum, remote: bool) -> Option<Buffer> {
        match self.fetch_buffer(checksum, remote).await {
            Ok(buffer) => buffer,
            Err(e) => {
                warn!(
                    service = services::BUFFER_CACHE,
                    checksum = %checksum.short(),
                    error = %e,
                    "Remote buffer tiers unavailable"
                );
                None
            }
        }
    }

    /// Retrieve a buffer, failing with `Connection` when every buffer server was unreachable
    pub async fn fetch_buffer(&self, checksum: &Checksum, remote: bool) -> Result<Option<Buffer>> {
        if let Some(buffer) = builtin_buffer(checksum) {
            return Ok(Some(buffer));
        }
        {
            let mut state = self.lock();
            if let Some(buffer) = state.buffers.get(checksum).cloned() {
                if let Some(t) = state.last_time.get_mut(checksum) {
                    *t = Instant::now();
                }
                return Ok(Some(buffer));
            }
        }

        if let Some(local) = &self.local {
            match local.get(checksum) {
                Ok(Some(buffer)) => return Ok(Some(buffer)),
                Ok(None) => {}
                Err(e) => warn!(checksum = %checksum, error = %e, "Local buffer folder read failed"),
            }
        }

        if !remote {
            return Ok(None);
        }

        let (mut buffer, unavailable) = match self.remote.get_buffer(checksum).await {
            Ok(buffer) => (buffer, None),
            Err(e) => (None, Some(e)),
        };
        if buffer.is_none() {
            if let Some(fair) = &self.fair {
                buffer = fair.get_buffer(checksum).await;
            }
        }
        match (buffer, unavailable) {
            (Some(buffer), _) => {
                debug!(
                    service = services::BUFFER_CACHE,
                    operation = operations::GET,
                    status = status::HIT,
                    checksum = %checksum.short(),
                    size_bytes = buffer.len(),
                    "Buffer obtained remotely"
                );
                self.cache_buffer(*checksum, buffer.clone()).await;
                Ok(Some(buffer))
            }
            (None, Some(e)) => Err(e),
            (None, None) => {
                debug!(
                    service = services::BUFFER_CACHE,
                    operation = operations::GET,
                    status = status::MISS,
                    checksum = %checksum.short(),
                    "Buffer not found in any tier"
                );
                Ok(None)
            }
        }
    }

    /// Like `fetch_buffer` with remote tiers, but a miss is an error
    pub async fn require_buffer(&self, checksum: &Checksum) -> Result<Buffer> {
        self.fetch_buffer(checksum, true)
            .await?
            .ok_or(SeamlessError::CacheMiss(*checksum))
    }

    /// Whether any tier is known to hold the buffer, without downloading it
    pub async fn has_buffer(&self, checksum: &Checksum, remote: bool) -> bool {
        if builtin_buffer(checksum).is_some() || self.lock().buffers.contains_key(checksum) {
            return true;
        }
        if let Some(local) = &self.local {
            if local.exists(checksum).unwrap_or(false) {
                return true;
            }
        }
        remote && self.remote.can_read_buffer(checksum).await
    }

    pub fn buffer_length(&self, checksum: &Checksum) -> Option<usize> {
        if let Some(buffer) = builtin_buffer(checksum) {
            return Some(buffer.len());
        }
        self.lock().lengths.get(checksum).copied()
    }

    /// Write a referenced buffer to the write tier
    ///
    /// The buffer write server is preferred; without one, the local buffer
    /// folder keeps it. Failures are logged, never returned.
    async fn write_persistent(&self, checksum: &Checksum, buffer: &Buffer) {
        if self.remote.can_write() {
            if self.remote.is_known(checksum) {
                return;
            }
            if let Err(e) = self.remote.write_buffer(checksum, buffer).await {
                warn!(
                    service = services::BUFFER_SERVER,
                    checksum = %checksum.short(),
                    error = %e,
                    "Buffer write failed"
                );
            }
        } else if let Some(local) = &self.local {
            if let Err(e) = local.put(checksum, buffer) {
                warn!(checksum = %checksum.short(), error = %e, "Local buffer write failed");
            }
        }
    }

    /// Drop a buffer from memory and the local folder, regardless of references
    ///
    /// Remote tiers are left alone.
    pub fn forget_buffer(&self, checksum: &Checksum) {
        {
            let mut state = self.lock();
            state.buffers.remove(checksum);
            state.last_time.remove(checksum);
            if state.refcounts.contains_key(checksum) {
                let persistent = state
                    .refcounts
                    .get(checksum)
                    .map(|e| e.persistent > 0)
                    .unwrap_or(false);
                state.missing.insert(*checksum, persistent);
            }
        }
        if let Some(local) = &self.local {
            if let Err(e) = local.delete(checksum) {
                warn!(checksum = %checksum, error = %e, "Failed to delete local buffer");
            }
        }
    }

    pub fn stats(&self) -> BufferCacheStats {
        let state = self.lock();
        BufferCacheStats {
            buffers_in_memory: state.buffers.len(),
            bytes_in_memory: state.buffers.values().map(|b| b.len()).sum(),
            referenced: state.refcounts.len(),
            missing: state.missing.len(),
        }
    }

    fn can_be_served_elsewhere(&self, checksum: &Checksum) -> bool {
        if self.remote.is_known(checksum) {
            return true;
        }
        self.local
            .as_ref()
            .map(|l| l.exists(checksum).unwrap_or(false))
            .unwrap_or(false)
    }
}

/// A buffer past its lifetime, as seen when the expiry scan ran
struct Expired {
    checksum: Checksum,
    last_time: Instant,
    referenced: bool,
}

impl BufferCache {
    fn expired(&self, now: Instant) -> Vec<Expired> {
        let state = self.lock();
        state
            .last_time
            .iter()
            .filter(|(checksum, last)| {
                let length = state.lengths.get(*checksum).copied().unwrap_or(usize::MAX);
                now.saturating_duration_since(**last) >= self.lifetimes.for_length(length)
            })
            .map(|(checksum, last)| Expired {
                checksum: *checksum,
                last_time: *last,
                referenced: state.refcounts.contains_key(checksum),
            })
            .collect()
    }

    /// Drop scanned buffers that nobody touched since the scan
    fn evict(&self, expired: Vec<Expired>) -> EvictionReport {
        let mut report = EvictionReport::default();
        let mut state = self.lock();
        for candidate in expired {
            if state.last_time.get(&candidate.checksum) != Some(&candidate.last_time) {
                continue;
            }
            if !candidate.referenced && state.refcounts.contains_key(&candidate.checksum) {
                continue;
            }
            state.last_time.remove(&candidate.checksum);
            if let Some(buffer) = state.buffers.remove(&candidate.checksum) {
                report.buffers += 1;
                report.bytes += buffer.len() as u64;
            }
        }
        report
    }
}

impl Evictable for BufferCache {
    fn purge_expired(&self, now: Instant) -> EvictionReport {
        // Referenced buffers may only go when another tier serves them; that check hits the disk
        let evictable: Vec<Expired> = self
            .expired(now)
            .into_iter()
            .filter(|candidate| !candidate.referenced || self.can_be_served_elsewhere(&candidate.checksum))
            .collect();
        let report = self.evict(evictable);
        if report.buffers > 0 {
            debug!(
                service = services::BUFFER_CACHE,
                operation = operations::EVICT,
                buffers = report.buffers,
                size_bytes = report.bytes,
                "Purged expired buffers"
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::TempDir;

    fn sample(text: &str) -> (Checksum, Buffer) {
        let buffer = Bytes::from(text.to_string());
        (calculate_checksum(&buffer), buffer)
    }

    #[tokio::test]
    async fn test_cache_and_get() {
        let cache = BufferCache::in_memory();
        let (checksum, buffer) = sample("1\n");
        assert_eq!(cache.get_buffer(&checksum, true).await, None);

        cache.cache_buffer(checksum, buffer.clone()).await;
        assert_eq!(cache.get_buffer(&checksum, false).await, Some(buffer));
        assert_eq!(cache.buffer_length(&checksum), Some(2));
    }

    #[tokio::test]
    async fn test_builtin_buffers_always_resolve() {
        let cache = BufferCache::in_memory();
        let dict = crate::checksum::empty_dict_checksum();
        assert_eq!(cache.get_buffer(&dict, false).await.as_deref(), Some(&b"{}\n"[..]));
        cache.incref(dict, true).await;
        assert_eq!(cache.refcount(&dict), RefEntry::default());
    }

    #[tokio::test]
    async fn test_refcount_classes() {
        let cache = BufferCache::in_memory();
        let (checksum, buffer) = sample("refcounted\n");
        cache.incref_buffer(checksum, buffer, true).await;
        cache.incref(checksum, false).await;
        assert_eq!(cache.refcount(&checksum), RefEntry { persistent: 1, transient: 1 });

        // decref of the wrong class leaves the other untouched
        cache.decref(&checksum, false);
        cache.decref(&checksum, false);
        assert_eq!(cache.refcount(&checksum), RefEntry { persistent: 1, transient: 0 });

        cache.decref(&checksum, true);
        assert_eq!(cache.refcount(&checksum), RefEntry::default());
        assert_eq!(cache.stats().referenced, 0);
    }

    #[tokio::test]
    async fn test_missing_buffer_is_resolved_by_cache_buffer() {
        let temp_dir = TempDir::new().unwrap();
        let cache = BufferCache::new(
            Arc::new(BufferRemote::disabled()),
            None,
            Some(FolderStore::new(temp_dir.path()).unwrap()),
            BufferLifetimes::default(),
        );
        let (checksum, buffer) = sample("late\n");
        cache.incref(checksum, true).await;
        assert!(cache.is_missing(&checksum));

        cache.cache_buffer(checksum, buffer).await;
        assert!(!cache.is_missing(&checksum));
        // persistent references land in the local buffer folder
        assert!(temp_dir.path().join(checksum.to_hex()).is_file());
    }

    #[tokio::test]
    async fn test_unreferenced_buffers_expire() {
        let cache = BufferCache::new(
            Arc::new(BufferRemote::disabled()),
            None,
            None,
            BufferLifetimes {
                temp: Duration::from_secs(20),
                temp_small: Duration::from_secs(600),
                small_buffer_limit: 4,
            },
        );
        let (small, small_buffer) = sample("ab");
        let (large, large_buffer) = sample("large buffer");
        cache.cache_buffer(small, small_buffer).await;
        cache.cache_buffer(large, large_buffer).await;

        let later = Instant::now() + Duration::from_secs(30);
        let report = cache.purge_expired(later);
        assert_eq!(report.buffers, 1);
        assert!(cache.get_buffer(&small, false).await.is_some());
        assert!(cache.get_buffer(&large, false).await.is_none());
    }

    #[tokio::test]
    async fn test_referenced_buffer_survives_expiry() {
        let cache = BufferCache::in_memory();
        let (checksum, buffer) = sample("kept\n");
        cache.incref_buffer(checksum, buffer, false).await;
        let report = cache.purge_expired(Instant::now() + Duration::from_secs(3600));
        assert_eq!(report.buffers, 0);
        assert!(cache.get_buffer(&checksum, false).await.is_some());

        cache.decref(&checksum, false);
        let report = cache.purge_expired(Instant::now() + Duration::from_secs(3600));
        assert_eq!(report.buffers, 1);
    }

    #[tokio::test]
    async fn test_referenced_buffer_on_disk_is_released_from_memory() {
        let temp_dir = TempDir::new().unwrap();
        let cache = BufferCache::new(
            Arc::new(BufferRemote::disabled()),
            None,
            Some(FolderStore::new(temp_dir.path()).unwrap()),
            BufferLifetimes::default(),
        );
        let (on_disk, disk_buffer) = sample("persistent\n");
        let (in_memory, memory_buffer) = sample("transient\n");
        cache.incref_buffer(on_disk, disk_buffer.clone(), true).await;
        cache.incref_buffer(in_memory, memory_buffer, false).await;

        let report = cache.purge_expired(Instant::now() + Duration::from_secs(3600));
        assert_eq!(report.buffers, 1);
        assert_eq!(cache.get_buffer(&on_disk, false).await, Some(disk_buffer));
        assert!(cache.get_buffer(&in_memory, false).await.is_some());
    }

    #[tokio::test]
    async fn test_buffer_touched_after_scan_is_kept() {
        let cache = BufferCache::in_memory();
        let (checksum, buffer) = sample("busy\n");
        cache.cache_buffer(checksum, buffer).await;

        let expired = cache.expired(Instant::now() + Duration::from_secs(3600));
        assert_eq!(expired.len(), 1);
        // a reader refreshes it while the disk is consulted
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(cache.get_buffer(&checksum, false).await.is_some());

        assert_eq!(cache.evict(expired).buffers, 0);
        assert!(cache.get_buffer(&checksum, false).await.is_some());
    }

    #[tokio::test]
    async fn test_forget_buffer_marks_missing() {
        let cache = BufferCache::in_memory();
        let (checksum, buffer) = sample("forgotten\n");
        cache.incref_buffer(checksum, buffer, true).await;
        cache.forget_buffer(&checksum);
        assert!(cache.get_buffer(&checksum, true).await.is_none());
        assert!(cache.is_missing(&checksum));
        assert!(cache.require_buffer(&checksum).await.unwrap_err().is_cache_miss());
    }

    #[tokio::test]
    async fn test_unreachable_buffer_servers_fail_the_lookup() {
        let remote = BufferRemote::new(
            vec!["http://127.0.0.1:9".to_string()],
            vec![],
            None,
            Duration::from_millis(200),
        )
        .unwrap();
        let cache = BufferCache::new(Arc::new(remote), None, None, BufferLifetimes::default());
        let (checksum, buffer) = sample("elsewhere\n");

        let err = cache.require_buffer(&checksum).await.unwrap_err();
        assert!(matches!(err, SeamlessError::Connection { .. }), "{err}");
        assert_eq!(cache.get_buffer(&checksum, true).await, None);

        // memory still answers without asking the servers
        cache.cache_buffer(checksum, buffer.clone()).await;
        assert_eq!(cache.require_buffer(&checksum).await.unwrap(), buffer);
    }

    #[tokio::test]
    async fn test_cache_verified_rejects_wrong_content() {
        let cache = BufferCache::in_memory();
        let (checksum, _) = sample("right\n");
        let err = cache
            .cache_verified(checksum, Bytes::from_static(b"wrong\n"))
            .await
            .unwrap_err();
        assert!(matches!(err, SeamlessError::ChecksumMismatch { .. }));
    }
}
