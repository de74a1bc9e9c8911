//! The cache service
//!
//! [`CacheService`] owns the buffer cache, the transformation cache, the
//! semantic checksum registry, the optional database and the language
//! runners. It is a cheap handle; clones share one service. Tests build a
//! fresh service per test with [`CacheService::builder`].

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use serde_json::Value as Json;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::cache::{
    spawn_eviction, BufferCache, BufferCacheStats, BufferLifetimes, EvictionHandle, TransformationCache,
    TransformationCacheStats, TransformerId,
};
use crate::checksum::{calculate_checksum, Buffer, Checksum};
use crate::codec::{serialize, Celltype, DeserializeCache, Value};
use crate::config::{parse_duration, ExecutionStrategy, SeamlessConfig};
use crate::error::{Result, SeamlessError};
use crate::execution::{
    prepare_draft, ExecutionSettings, JobTable, PreparedTransformation, RemoteCompute, RunOptions, SemanticPair,
    TransformationStatus,
};
use crate::logging::{operations, services, status};
use crate::remote::{BufferRemote, Database, DatabaseClient, FairClient};
use crate::runner::RunnerRegistry;
use crate::storage::{FolderStore, ResultStore};
use crate::transformation::{
    register_transformation_dict, tf_get_buffer, PinValue, Transformation, TransformationDraft,
    TransformationDunder,
};

const VALUE_CACHE_CAPACITY: usize = 1000;

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Checksums of running transformations, outermost first
pub(crate) type Lineage = Arc<Vec<Checksum>>;

pub(crate) struct ServiceInner {
    pub(crate) buffers: Arc<BufferCache>,
    pub(crate) values: DeserializeCache,
    pub(crate) semantic: crate::transformation::SemanticRegistry,
    pub(crate) transformations: Mutex<TransformationCache>,
    pub(crate) database: Option<Database>,
    pub(crate) runners: RunnerRegistry,
    pub(crate) jobs: JobTable,
    /// Held by whoever mutates shared state in the local strategy: the service or one worker
    pub(crate) lock: Arc<Semaphore>,
    pub(crate) settings: ExecutionSettings,
    pub(crate) remote_compute: Option<RemoteCompute>,
    eviction: Mutex<Option<EvictionHandle>>,
    next_transformer: AtomicU64,
    shut_down: AtomicBool,
}

#[derive(Clone)]
pub struct CacheService {
    pub(crate) inner: Arc<ServiceInner>,
}

/// Occupancy of the service caches
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceStats {
    pub buffers: BufferCacheStats,
    pub transformations: TransformationCacheStats,
    pub semantic_entries: usize,
}

#[derive(Default)]
pub struct CacheServiceBuilder {
    buffers: Option<BufferCache>,
    database: Option<Database>,
    runners: Option<RunnerRegistry>,
    settings: ExecutionSettings,
    remote_url: Option<String>,
    eviction_interval: Option<Duration>,
}

impl CacheServiceBuilder {
    pub fn buffer_cache(mut self, buffers: BufferCache) -> Self {
        self.buffers = Some(buffers);
        self
    }

    pub fn database(mut self, database: Database) -> Self {
        self.database = Some(database);
        self
    }

    pub fn runners(mut self, runners: RunnerRegistry) -> Self {
        self.runners = Some(runners);
        self
    }

    pub fn settings(mut self, settings: ExecutionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn strategy(mut self, strategy: ExecutionStrategy) -> Self {
        self.settings.strategy = strategy;
        self
    }

    pub fn remote_compute(mut self, url: impl Into<String>) -> Self {
        self.remote_url = Some(url.into());
        self
    }

    /// Purge expired buffers periodically; needs a running tokio runtime
    pub fn eviction(mut self, interval: Duration) -> Self {
        self.eviction_interval = Some(interval);
        self
    }

    pub fn build(self) -> Result<CacheService> {
        let remote_compute = self
            .remote_url
            .as_deref()
            .map(|url| {
                RemoteCompute::new(url, self.settings.poll_interval, self.settings.delegation_timeout)
            })
            .transpose()?;
        if self.settings.strategy == ExecutionStrategy::Remote && remote_compute.is_none() {
            return Err(anyhow::anyhow!("the remote execution strategy needs a compute service URL").into());
        }

        let buffers = Arc::new(self.buffers.unwrap_or_else(BufferCache::in_memory));
        let eviction = match self.eviction_interval {
            Some(interval) => {
                if Handle::try_current().is_err() {
                    return Err(anyhow::anyhow!("buffer eviction needs a running tokio runtime").into());
                }
                Some(spawn_eviction(Arc::clone(&buffers), interval))
            }
            None => None,
        };

        Ok(CacheService {
            inner: Arc::new(ServiceInner {
                buffers,
                values: DeserializeCache::new(VALUE_CACHE_CAPACITY),
                semantic: Default::default(),
                transformations: Mutex::new(TransformationCache::new()),
                database: self.database,
                runners: self.runners.unwrap_or_default(),
                jobs: JobTable::default(),
                lock: Arc::new(Semaphore::new(1)),
                settings: self.settings,
                remote_compute,
                eviction: Mutex::new(eviction),
                next_transformer: AtomicU64::new(1),
                shut_down: AtomicBool::new(false),
            }),
        })
    }
}

/// Run a future to completion on a private runtime
///
/// Refuses to run when called from inside a runtime, where blocking would stall it.
pub(crate) fn block_on<T>(what: &'static str, future: impl Future<Output = Result<T>>) -> Result<T> {
    if Handle::try_current().is_ok() {
        return Err(SeamlessError::InsideRuntime(what));
    }
    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(future)
}

/// Detaches its transformer from a transformation when dropped
struct TransformerGuard<'a> {
    service: &'a CacheService,
    tf_checksum: Checksum,
    transformer: TransformerId,
}

impl Drop for TransformerGuard<'_> {
    fn drop(&mut self) {
        self.service.decref_transformation(&self.tf_checksum, self.transformer);
    }
}

impl CacheService {
    pub fn builder() -> CacheServiceBuilder {
        CacheServiceBuilder::default()
    }

    /// Build a service from configuration, connecting to the database if one is configured
    pub async fn from_config(config: &SeamlessConfig) -> Result<Self> {
        config.validate()?;
        let remote = BufferRemote::new(
            config.buffer_remote.read_servers.clone(),
            config.buffer_remote.read_folders.iter().map(Into::into).collect(),
            config.buffer_remote.write_server.clone(),
            parse_duration(&config.buffer_remote.timeout)?,
        )?;
        let fair = if config.fair.servers.is_empty() {
            None
        } else {
            Some(Arc::new(FairClient::new(config.fair.servers.clone())?))
        };
        let lifetimes = BufferLifetimes {
            temp: parse_duration(&config.cache.lifetime_temp)?,
            temp_small: parse_duration(&config.cache.lifetime_temp_small)?,
            small_buffer_limit: config.cache.small_buffer_limit,
        };
        let local = FolderStore::new(config.buffer_dir())?;
        let buffers = BufferCache::new(Arc::new(remote), fair, Some(local), lifetimes);

        let database = match &config.database.url {
            Some(url) => Some(Database::Remote(
                DatabaseClient::connect(url, parse_duration(&config.database.timeout)?).await?,
            )),
            None if config.cache.persist_results => {
                Some(Database::Local(ResultStore::open(config.result_store_dir())?))
            }
            None => None,
        };

        let mut builder = CacheService::builder()
            .buffer_cache(buffers)
            .settings(ExecutionSettings::from_config(&config.execution)?)
            .eviction(parse_duration(&config.cache.eviction_interval)?);
        if let Some(database) = database {
            builder = builder.database(database);
        }
        if let Some(url) = &config.execution.remote_url {
            builder = builder.remote_compute(url.clone());
        }
        let service = builder.build()?;
        info!(
            cache_dir = %config.cache_dir().display(),
            strategy = ?config.execution.strategy,
            database = service.inner.database.is_some(),
            "Cache service ready"
        );
        Ok(service)
    }

    /// Cancel running jobs and stop background eviction
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let cancelled = self.inner.jobs.cancel_all();
        let eviction = self
            .inner
            .eviction
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(eviction) = eviction {
            eviction.shutdown().await;
        }
        info!(cancelled_jobs = cancelled, "Cache service shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    pub fn buffer_cache(&self) -> &Arc<BufferCache> {
        &self.inner.buffers
    }

    pub fn database(&self) -> Option<&Database> {
        self.inner.database.as_ref()
    }

    pub fn runners(&self) -> &RunnerRegistry {
        &self.inner.runners
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            buffers: self.inner.buffers.stats(),
            transformations: self.tc().stats(),
            semantic_entries: self.inner.semantic.len(),
        }
    }

    pub(crate) fn tc(&self) -> MutexGuard<'_, TransformationCache> {
        self.inner
            .transformations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    // ---- buffers and values ----

    /// Serialize a value, cache its buffer and return its checksum
    pub async fn cache_value(&self, value: &Value, celltype: Celltype) -> Result<Checksum> {
        let buffer = serialize(value, celltype)?;
        let checksum = calculate_checksum(&buffer);
        self.inner.buffers.cache_buffer(checksum, buffer).await;
        Ok(checksum)
    }

    /// Buffer of a checksum from any tier, reconstructing it when needed
    pub async fn get_buffer(&self, checksum: &Checksum) -> Result<Buffer> {
        if let Some(buffer) = self.inner.buffers.get_buffer(checksum, false).await {
            return Ok(buffer);
        }
        self.fingertip_async(*checksum).await
    }

    /// Deserialized value of a checksum, shared through the value cache
    pub async fn get_value_async(&self, checksum: Checksum, celltype: Celltype) -> Result<Arc<Value>> {
        let buffer = self.get_buffer(&checksum).await?;
        self.inner.values.deserialize(&buffer, &checksum, celltype, false)
    }

    pub fn get_value(&self, checksum: Checksum, celltype: Celltype) -> Result<Arc<Value>> {
        block_on("get_value", self.get_value_async(checksum, celltype))
    }

    // ---- semantic checksums ----

    /// Remember a syntactic/semantic pair, locally and in the database
    pub async fn record_semantic(&self, pair: &SemanticPair) {
        let updated = self.inner.semantic.record(
            pair.syntactic,
            pair.semantic,
            pair.celltype,
            pair.subcelltype.as_deref(),
        );
        let (Some(syntactic), Some(database)) = (updated, &self.inner.database) else {
            return;
        };
        if let Err(e) = database
            .set_sem2syn(
                &pair.semantic,
                pair.celltype.as_str(),
                pair.subcelltype.as_deref(),
                &syntactic,
            )
            .await
        {
            warn!(service = services::DATABASE, error = %e, "Cannot store semantic checksum");
        }
    }

    /// Syntactic checksums known for a semantic checksum, asking the database on a local miss
    pub async fn semantic_to_syntactic(
        &self,
        semantic: &Checksum,
        celltype: Celltype,
        subcelltype: Option<&str>,
    ) -> Result<Option<Vec<Checksum>>> {
        if celltype.syntactic_is_semantic() {
            return Ok(Some(vec![*semantic]));
        }
        let key = (*semantic, celltype, subcelltype.map(str::to_string));
        if let Some(syntactic) = self.inner.semantic.syntactic(&key) {
            return Ok(Some(syntactic));
        }
        let Some(database) = &self.inner.database else {
            return Ok(None);
        };
        let remote = database
            .get_sem2syn(semantic, celltype.as_str(), subcelltype)
            .await?;
        Ok(remote.map(|syntactic| self.inner.semantic.merge(key, &syntactic)))
    }

    /// Semantic checksum of a syntactic buffer, computing and recording it if unknown
    pub async fn syntactic_to_semantic(
        &self,
        syntactic: &Checksum,
        celltype: Celltype,
        subcelltype: Option<&str>,
    ) -> Result<Checksum> {
        if celltype.syntactic_is_semantic() {
            return Ok(*syntactic);
        }
        let key = (*syntactic, celltype, subcelltype.map(str::to_string));
        if let Some(semantic) = self.inner.semantic.semantic(&key) {
            return Ok(semantic);
        }
        let buffer = self.get_buffer(syntactic).await?;
        let source = text_of(&buffer, celltype)?;
        let semantic_buffer = match self.inner.runners.canonicalize(celltype, &source)? {
            Some(canonical) => serialize(&Value::Text(canonical), celltype)?,
            None => buffer,
        };
        let semantic = calculate_checksum(&semantic_buffer);
        self.inner.buffers.cache_buffer(semantic, semantic_buffer).await;
        self.record_semantic(&SemanticPair {
            syntactic: *syntactic,
            semantic,
            celltype,
            subcelltype: subcelltype.map(str::to_string),
        })
        .await;
        Ok(semantic)
    }

    /// Syntactic checksums worth trying for a pin, best first; the pin checksum itself comes last
    pub(crate) async fn syntactic_candidates(
        &self,
        checksum: &Checksum,
        celltype: Celltype,
        subcelltype: Option<&str>,
    ) -> Result<Vec<Checksum>> {
        let mut candidates = self
            .semantic_to_syntactic(checksum, celltype, subcelltype)
            .await?
            .unwrap_or_default();
        if !candidates.contains(checksum) {
            candidates.push(*checksum);
        }
        Ok(candidates)
    }

    // ---- transformations ----

    pub(crate) fn register_transformer(&self) -> TransformerId {
        let transformer = TransformerId(self.inner.next_transformer.fetch_add(1, Ordering::SeqCst));
        self.tc().register_transformer(transformer);
        transformer
    }

    /// Register a transformation for a transformer
    ///
    /// The first registration caches the transformation buffer, writes it
    /// out, and takes references on the input buffers, the environment and
    /// the known result.
    pub async fn incref_transformation(
        &self,
        tf_checksum: Checksum,
        transformation: &Transformation,
        transformer: TransformerId,
    ) -> Result<()> {
        let (first, previous) = {
            let mut tc = self.tc();
            tc.register_transformer(transformer);
            let first = tc.add_transformation(tf_checksum, transformation.clone());
            let previous = tc.attach(tf_checksum, transformer);
            (first, previous)
        };
        if let Some(previous) = previous {
            self.decref_transformation(&previous, transformer);
        }
        if !first {
            return Ok(());
        }

        let buffers = &self.inner.buffers;
        buffers.cache_buffer(tf_checksum, tf_get_buffer(transformation)).await;
        buffers.incref(tf_checksum, true).await;
        buffers.decref(&tf_checksum, true);
        buffers.incref(tf_checksum, false).await;
        for pin in transformation.pins.values() {
            if let Some(checksum) = pin.checksum {
                buffers.incref(checksum, false).await;
            }
        }
        if let Some(env) = transformation.dunder.env {
            buffers.incref(env, true).await;
        }
        let held = self.tc().hold_result(&tf_checksum);
        if let Some(result) = held {
            buffers.incref(result, false).await;
        }
        debug!(
            service = services::TRANSFORMATION_CACHE,
            checksum = %tf_checksum.short(),
            "Registered transformation"
        );
        Ok(())
    }

    /// Detach a transformer; the last one schedules destruction after the keep-alive period
    pub fn decref_transformation(&self, tf_checksum: &Checksum, transformer: TransformerId) {
        let (remaining, delay) = {
            let mut tc = self.tc();
            let remaining = tc.detach(tf_checksum, transformer);
            if tc.transformation_of(transformer).is_none() {
                tc.destroy_transformer(transformer);
            }
            let delay = tc.keep_alive(tf_checksum, Instant::now(), &self.inner.settings.keep_alive);
            (remaining, delay)
        };
        if remaining > 0 {
            return;
        }
        let tf_checksum = *tf_checksum;
        match Handle::try_current() {
            Ok(handle) => {
                let inner: Weak<ServiceInner> = Arc::downgrade(&self.inner);
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(inner) = inner.upgrade() {
                        CacheService { inner }.destroy_transformation(&tf_checksum);
                    }
                });
            }
            Err(_) => self.destroy_transformation(&tf_checksum),
        }
    }

    /// Drop an unreferenced transformation and release the buffers it held
    fn destroy_transformation(&self, tf_checksum: &Checksum) {
        let destroyed = self.tc().destroy(tf_checksum);
        let Some(destroyed) = destroyed else {
            return;
        };
        if self.inner.jobs.cancel(tf_checksum, crate::execution::JobOutcome::Cancelled) {
            self.tc().job_finished(tf_checksum);
        }
        let buffers = &self.inner.buffers;
        buffers.decref(tf_checksum, false);
        for pin in destroyed.transformation.pins.values() {
            if let Some(checksum) = &pin.checksum {
                buffers.decref(checksum, false);
            }
        }
        if let Some(env) = &destroyed.transformation.dunder.env {
            buffers.decref(env, true);
        }
        for result in destroyed.preliminary.iter().chain(destroyed.held.iter()) {
            buffers.decref(result, false);
        }
        debug!(
            service = services::TRANSFORMATION_CACHE,
            checksum = %tf_checksum.short(),
            "Destroyed transformation"
        );
    }

    /// Record the result of a transformation that was computed elsewhere
    pub fn register_known_transformation(&self, tf_checksum: Checksum, result: Checksum) {
        self.tc().register_known(tf_checksum, result);
    }

    /// Store a result; a final result is never overwritten
    ///
    /// Returns false when a final result was already present.
    pub(crate) async fn set_transformation_result(
        &self,
        tf_checksum: Checksum,
        result: Checksum,
        prelim: bool,
        update_database: bool,
    ) -> bool {
        let update = self.tc().set_result(tf_checksum, result, prelim);
        let crate::cache::ResultUpdate::Stored { replaced } = update else {
            return false;
        };
        self.inner.buffers.incref(result, false).await;
        if let Some(replaced) = replaced {
            self.inner.buffers.decref(&replaced, false);
        }
        if prelim || !update_database {
            return true;
        }
        if let Some(database) = &self.inner.database {
            if let Err(e) = database.set_transformation_result(&tf_checksum, &result).await {
                warn!(
                    service = services::DATABASE,
                    checksum = %tf_checksum.short(),
                    error = %e,
                    "Cannot store transformation result"
                );
            }
        }
        true
    }

    /// Result of a transformation from memory or the database, as `(result, preliminary)`
    pub async fn transformation_result(&self, tf_checksum: &Checksum) -> Result<Option<(Checksum, bool)>> {
        let local = self.tc().result(tf_checksum);
        if local.is_some() {
            return Ok(local);
        }
        let Some(database) = &self.inner.database else {
            return Ok(None);
        };
        let remote = match database.get_transformation_result(tf_checksum).await {
            Ok(remote) => remote,
            Err(e) => {
                warn!(service = services::DATABASE, error = %e, "Result lookup failed");
                None
            }
        };
        let Some(result) = remote else {
            return Ok(None);
        };
        let adopted = self.tc().adopt_result(*tf_checksum, result);
        if adopted {
            self.inner.buffers.incref(result, false).await;
        }
        Ok(Some((result, false)))
    }

    /// The registered transformation dict, including metadata
    pub fn get_transformation_dict(&self, tf_checksum: &Checksum) -> Option<Json> {
        self.tc().transformation(tf_checksum).map(Transformation::to_json)
    }

    /// A transformation by checksum, parsed from its buffer when not registered
    pub async fn get_transformation(&self, tf_checksum: &Checksum) -> Result<Option<Transformation>> {
        let registered = self.tc().transformation(tf_checksum).cloned();
        if registered.is_some() {
            return Ok(registered);
        }
        let Some(buffer) = self.inner.buffers.get_buffer(tf_checksum, true).await else {
            return Ok(None);
        };
        let dict: Json = serde_json::from_slice(&buffer)?;
        Ok(Some(Transformation::from_json(&dict)?))
    }

    /// Canonicalize a transformation dict and cache its buffer
    ///
    /// A `__code_checksum__` entry is recorded as the syntactic form of the code pin.
    pub async fn register_transformation_dict(&self, dict: &Json) -> Result<(Checksum, Transformation)> {
        let (tf_checksum, buffer, transformation) = register_transformation_dict(dict)?;
        self.inner.buffers.cache_buffer(tf_checksum, buffer).await;
        if let (Some(syntactic), Some(code)) = (transformation.code_checksum, transformation.code()) {
            if let Some(semantic) = code.checksum {
                if syntactic != semantic {
                    self.record_semantic(&SemanticPair {
                        syntactic,
                        semantic,
                        celltype: code.celltype,
                        subcelltype: code.subcelltype.clone(),
                    })
                    .await;
                }
            }
        }
        Ok((tf_checksum, transformation))
    }

    async fn register_prepared(&self, prepared: &PreparedTransformation) {
        for (checksum, buffer) in &prepared.buffers {
            self.inner.buffers.cache_buffer(*checksum, buffer.clone()).await;
        }
        for pair in &prepared.semantic_pairs {
            self.record_semantic(pair).await;
        }
        self.inner
            .buffers
            .cache_buffer(prepared.checksum, tf_get_buffer(&prepared.transformation))
            .await;
    }

    // ---- running ----

    /// Run a transformation by checksum and return its result checksum
    ///
    /// A known final result is returned without running, unless `fingertip`
    /// asks for the result buffer to be regenerated. A recorded exception is
    /// returned as an error until [`CacheService::clear_exception`] is called.
    pub async fn run_transformation_async(
        &self,
        tf_checksum: Checksum,
        dunder: Option<&TransformationDunder>,
        options: RunOptions,
    ) -> Result<Checksum> {
        self.run_transformation_in(tf_checksum, dunder, options, Lineage::default())
            .await
    }

    pub fn run_transformation(
        &self,
        tf_checksum: Checksum,
        dunder: Option<&TransformationDunder>,
        options: RunOptions,
    ) -> Result<Checksum> {
        block_on(
            "run_transformation",
            self.run_transformation_async(tf_checksum, dunder, options),
        )
    }

    /// Register and run a raw transformation dict
    pub async fn run_transformation_dict_async(&self, dict: &Json, options: RunOptions) -> Result<Checksum> {
        let (tf_checksum, transformation) = self.register_transformation_dict(dict).await?;
        self.run_transformation_async(tf_checksum, Some(&transformation.dunder), options)
            .await
    }

    pub fn run_transformation_dict(&self, dict: &Json, options: RunOptions) -> Result<Checksum> {
        block_on(
            "run_transformation_dict",
            self.run_transformation_dict_async(dict, options),
        )
    }

    /// Prepare and run a draft, computing nested drafts first
    pub async fn run_draft_async(&self, draft: TransformationDraft, options: RunOptions) -> Result<Checksum> {
        self.run_draft_in(draft, options, Lineage::default()).await
    }

    pub fn run_draft(&self, draft: TransformationDraft, options: RunOptions) -> Result<Checksum> {
        block_on("run_draft", self.run_draft_async(draft, options))
    }

    /// Prepare a draft without running it
    pub async fn prepare(&self, draft: &TransformationDraft) -> Result<PreparedTransformation> {
        let prepared = prepare_draft(draft, &self.inner.runners)?;
        self.register_prepared(&prepared).await;
        Ok(prepared)
    }

    pub(crate) fn run_draft_in(
        &self,
        mut draft: TransformationDraft,
        options: RunOptions,
        lineage: Lineage,
    ) -> BoxFuture<'_, Result<Checksum>> {
        Box::pin(async move {
            for (_, _, value) in draft.pins.values_mut() {
                if let PinValue::Transformation(nested) = value {
                    let nested = (**nested).clone();
                    let result = self
                        .run_draft_in(nested, RunOptions::default(), Arc::clone(&lineage))
                        .await?;
                    *value = PinValue::Checksum(result);
                }
            }
            let prepared = self.prepare(&draft).await?;
            if lineage.contains(&prepared.checksum) {
                return Err(SeamlessError::Recursion(prepared.checksum));
            }
            self.run_transformation_in(
                prepared.checksum,
                Some(&prepared.transformation.dunder),
                options,
                lineage,
            )
            .await
        })
    }

    pub(crate) async fn run_transformation_in(
        &self,
        tf_checksum: Checksum,
        dunder: Option<&TransformationDunder>,
        options: RunOptions,
        lineage: Lineage,
    ) -> Result<Checksum> {
        if self.is_shut_down() {
            return Err(SeamlessError::Shutdown);
        }
        if let Some((result, false)) = self.transformation_result(&tf_checksum).await? {
            self.register_known_transformation(tf_checksum, result);
            if !options.fingertip {
                debug!(
                    service = services::TRANSFORMATION_CACHE,
                    operation = operations::GET,
                    status = status::HIT,
                    checksum = %tf_checksum.short(),
                    "Transformation result cached"
                );
                return Ok(result);
            }
        }
        if let Some(message) = self.exception(&tf_checksum).await? {
            return Err(SeamlessError::Transformation {
                checksum: tf_checksum,
                message,
            });
        }

        let mut transformation = self
            .get_transformation(&tf_checksum)
            .await?
            .ok_or(SeamlessError::CacheMiss(tf_checksum))?;
        if let Some(dunder) = dunder {
            transformation.apply_dunder(dunder);
        }

        let transformer = self.register_transformer();
        let _guard = TransformerGuard {
            service: self,
            tf_checksum,
            transformer,
        };
        self.incref_transformation(tf_checksum, &transformation, transformer)
            .await?;
        let result = self.execute(tf_checksum, transformation, options, lineage).await?;
        self.register_known_transformation(tf_checksum, result);
        Ok(result)
    }

    // ---- control ----

    /// Forget the result of a transformation so that the next run recomputes it
    ///
    /// Refused while a transformer still refers to the transformation. With a
    /// database, the result is contested there as well.
    pub async fn undo(&self, tf_checksum: &Checksum) -> Result<Checksum> {
        let referrers = self.tc().referrers(tf_checksum);
        if referrers > 0 {
            return Err(SeamlessError::StillReferenced {
                checksum: *tf_checksum,
                referrers,
            });
        }
        let undone = self.tc().undo(tf_checksum);
        if let Some(release) = &undone.release {
            self.inner.buffers.decref(release, false);
        }
        let result = match (undone.result, &self.inner.database) {
            (Some(result), _) => Some(result),
            (None, Some(database)) => database.get_transformation_result(tf_checksum).await?,
            (None, None) => None,
        };
        let result = result.ok_or(SeamlessError::UnknownTransformation(*tf_checksum))?;

        if let Some(database) = &self.inner.database {
            let (code, text) = database.contest(tf_checksum, &result).await?;
            if code != 200 {
                return Err(SeamlessError::DatabaseRefused { status: code, text });
            }
        }
        info!(
            service = services::TRANSFORMATION_CACHE,
            operation = operations::UNDO,
            checksum = %tf_checksum.short(),
            result = %result.short(),
            "Transformation result forgotten"
        );
        Ok(result)
    }

    /// Forget a recorded exception; returns whether there was one
    pub async fn clear_exception(&self, tf_checksum: &Checksum) -> Result<bool> {
        let cleared = self.tc().clear_exception(tf_checksum).is_some();
        if let Some(database) = &self.inner.database {
            database.clear_exception(tf_checksum).await?;
        }
        Ok(cleared)
    }

    /// Exception text of a failed transformation
    ///
    /// An exception found only in the database is adopted into the
    /// transformation cache, so later lookups stay local.
    pub async fn exception(&self, tf_checksum: &Checksum) -> Result<Option<String>> {
        let local = self.tc().exception(tf_checksum).map(str::to_string);
        if local.is_some() {
            return Ok(local);
        }
        let Some(database) = &self.inner.database else {
            return Ok(None);
        };
        let stored = database.get_exception(tf_checksum).await?;
        if let Some(message) = &stored {
            debug!(
                service = services::DATABASE,
                operation = operations::GET,
                checksum = %tf_checksum.short(),
                "Adopted stored exception"
            );
            self.tc().set_exception(*tf_checksum, message.clone(), None);
        }
        Ok(stored)
    }

    pub async fn logs(&self, tf_checksum: &Checksum) -> Result<Option<String>> {
        let local = self.tc().logs(tf_checksum).map(str::to_string);
        if local.is_some() {
            return Ok(local);
        }
        match &self.inner.database {
            Some(database) => database.get_logs(tf_checksum).await,
            None => Ok(None),
        }
    }

    /// Stop a running job; its waiters get [`SeamlessError::HardCancelled`]
    pub fn hard_cancel(&self, tf_checksum: &Checksum) -> bool {
        if !self
            .inner
            .jobs
            .cancel(tf_checksum, crate::execution::JobOutcome::HardCancelled)
        {
            return false;
        }
        let mut tc = self.tc();
        tc.job_finished(tf_checksum);
        tc.set_exception(
            *tf_checksum,
            SeamlessError::HardCancelled(*tf_checksum).to_string(),
            None,
        );
        warn!(
            service = services::TRANSFORMATION_CACHE,
            checksum = %tf_checksum.short(),
            "Transformation hard-cancelled"
        );
        true
    }

    /// Where a transformation stands
    pub async fn status(&self, tf_checksum: &Checksum) -> Result<TransformationStatus> {
        let (result, progress) = {
            let tc = self.tc();
            (tc.result(tf_checksum), tc.progress(tf_checksum))
        };
        if let Some((result, false)) = result {
            return Ok(TransformationStatus::Done(result));
        }
        if self.inner.jobs.is_running(tf_checksum) {
            return Ok(TransformationStatus::Running {
                progress,
                preliminary: result.map(|(checksum, _)| checksum),
            });
        }
        if let Some(exception) = self.exception(tf_checksum).await? {
            return Ok(TransformationStatus::Error(exception));
        }
        if let Some((result, false)) = self.transformation_result(tf_checksum).await? {
            return Ok(TransformationStatus::Done(result));
        }
        let Some(transformation) = self.get_transformation(tf_checksum).await? else {
            return Ok(TransformationStatus::Unknown);
        };
        if transformation.is_deep() {
            return Ok(TransformationStatus::NotRunnable);
        }
        if self.inner.settings.strategy != ExecutionStrategy::Remote
            && !crate::runner::bridge::needs_bridge(&transformation)
            && self.inner.runners.get(&transformation.language).is_err()
        {
            return Ok(TransformationStatus::NotRunnable);
        }
        for (_, pin) in transformation.pins.iter() {
            let Some(checksum) = pin.checksum else {
                return Ok(TransformationStatus::InputsUnavailable);
            };
            let candidates = self
                .syntactic_candidates(&checksum, pin.celltype, pin.subcelltype.as_deref())
                .await?;
            let mut available = false;
            for candidate in candidates {
                if self.inner.buffers.has_buffer(&candidate, true).await {
                    available = true;
                    break;
                }
            }
            if !available {
                return Ok(TransformationStatus::InputsUnavailable);
            }
        }
        Ok(TransformationStatus::Runnable)
    }
}

/// Source text of a code buffer
pub(crate) fn text_of(buffer: &[u8], celltype: Celltype) -> Result<String> {
    String::from_utf8(buffer.to_vec()).map_err(|e| SeamlessError::codec(celltype.as_str(), e))
}
