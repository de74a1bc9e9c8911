//! Driving a single job: input resolution, running, and recording the outcome

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Map, Value as Json};
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{debug, info, warn};

use super::{delegation, wait_outcome, JobOutcome, JobSlot, RunOptions, IN_PROCESS_EXECUTOR};
use crate::checksum::{calculate_checksum, Checksum};
use crate::codec::{serialize, Celltype, Value};
use crate::config::ExecutionStrategy;
use crate::error::{Result, SeamlessError};
use crate::logging::{operations, services, status};
use crate::runner::bridge::{needs_bridge, unbashify};
use crate::runner::{Delegate, JobEvent, LanguageRunner, RunContext, RunInput, RunJob};
use crate::service::{CacheService, Lineage};
use crate::transformation::{tf_get_buffer, Pin, Transformation, TransformationDraft, CODE_PIN};

/// Value (or error) produced by a runner, with the logs it wrote
pub(crate) struct RunnerOutput {
    pub(crate) value: Result<Value>,
    pub(crate) logs: String,
}

struct JobRun {
    result: Result<Checksum>,
    logs: String,
}

/// Nested work of in-process jobs, run on the service's own runtime
struct DirectDelegate {
    service: CacheService,
    handle: Handle,
    lineage: Lineage,
}

impl Delegate for DirectDelegate {
    fn run_draft(&self, draft: TransformationDraft, fingertip: bool, scratch: bool) -> Result<Checksum> {
        let options = RunOptions { fingertip, scratch };
        self.handle
            .block_on(self.service.run_draft_in(draft, options, Arc::clone(&self.lineage)))
    }

    fn resolve(&self, checksum: &Checksum, celltype: Celltype) -> Result<Value> {
        let value = self
            .handle
            .block_on(self.service.get_value_async(*checksum, celltype))?;
        Ok((*value).clone())
    }
}

pub(crate) fn extend_lineage(lineage: &Lineage, tf_checksum: Checksum) -> Lineage {
    let mut extended = Vec::with_capacity(lineage.len() + 1);
    extended.extend_from_slice(lineage);
    extended.push(tf_checksum);
    Arc::new(extended)
}

impl CacheService {
    /// Run a transformation, or join the job that is already running it
    pub(crate) async fn execute(
        &self,
        tf_checksum: Checksum,
        transformation: Transformation,
        options: RunOptions,
        lineage: Lineage,
    ) -> Result<Checksum> {
        let (sender, receiver, cancelled) = match self.inner.jobs.join_or_lead(tf_checksum) {
            JobSlot::Join(receiver) => {
                debug!(
                    service = services::TRANSFORMATION_CACHE,
                    checksum = %tf_checksum.short(),
                    "Joining running job"
                );
                return wait_outcome(receiver).await.into_result(tf_checksum);
            }
            JobSlot::Lead {
                sender,
                receiver,
                cancelled,
            } => (sender, receiver, cancelled),
        };

        // A job that finished between the caller's cache lookup and now left its outcome behind
        if let Some(outcome) = self.settled_outcome(&tf_checksum, options) {
            debug!(
                service = services::TRANSFORMATION_CACHE,
                checksum = %tf_checksum.short(),
                "Job already settled"
            );
            self.inner.jobs.finish(&tf_checksum, &sender, outcome.clone());
            return outcome.into_result(tf_checksum);
        }

        let service = self.clone();
        let job_sender = Arc::clone(&sender);
        let task = tokio::spawn(async move {
            let outcome = service
                .drive_job(tf_checksum, transformation, options, lineage, cancelled)
                .await;
            service.inner.jobs.finish(&tf_checksum, &job_sender, outcome);
        });
        self.inner
            .jobs
            .set_abort(&tf_checksum, &sender, task.abort_handle());
        wait_outcome(receiver).await.into_result(tf_checksum)
    }

    fn settled_outcome(&self, tf_checksum: &Checksum, options: RunOptions) -> Option<JobOutcome> {
        let tc = self.tc();
        if let Some(message) = tc.exception(tf_checksum) {
            return Some(JobOutcome::Failed(message.to_string()));
        }
        match tc.result(tf_checksum) {
            Some((result, false)) if !options.fingertip => Some(JobOutcome::Done(result)),
            _ => None,
        }
    }

    async fn drive_job(
        &self,
        tf_checksum: Checksum,
        transformation: Transformation,
        options: RunOptions,
        lineage: Lineage,
        cancelled: Arc<AtomicBool>,
    ) -> JobOutcome {
        let started = Instant::now();
        self.tc().job_started(tf_checksum, started);
        let strategy = self.inner.settings.strategy;
        info!(
            service = services::TRANSFORMATION_CACHE,
            operation = operations::EXECUTE,
            checksum = %tf_checksum.short(),
            language = %transformation.language,
            strategy = ?strategy,
            "Job started"
        );

        let mut metadata = Map::new();
        let run = match strategy {
            ExecutionStrategy::Remote => self.run_remote(tf_checksum, &transformation, options).await,
            _ => {
                let lineage = extend_lineage(&lineage, tf_checksum);
                self.run_here(tf_checksum, &transformation, options, lineage, cancelled, &mut metadata)
                    .await
            }
        };
        self.tc().job_finished(&tf_checksum);

        let elapsed = started.elapsed().as_secs_f64();
        metadata.insert("Executor".into(), json!(IN_PROCESS_EXECUTOR));
        metadata.insert("Time".into(), json!(chrono::Local::now().to_rfc3339()));
        metadata.insert("Execution time (seconds)".into(), json!(elapsed));
        let recorded_here = strategy != ExecutionStrategy::Remote;

        if recorded_here && !run.logs.is_empty() {
            self.tc().set_logs(tf_checksum, run.logs.clone());
            if let Some(database) = &self.inner.database {
                if let Err(e) = database.set_logs(&tf_checksum, &run.logs).await {
                    warn!(service = services::DATABASE, error = %e, "Cannot store logs");
                }
            }
        }

        let outcome = match run.result {
            Ok(result) => {
                self.set_transformation_result(tf_checksum, result, false, recorded_here && !options.fingertip)
                    .await;
                metadata.insert("Success".into(), json!(true));
                info!(
                    service = services::TRANSFORMATION_CACHE,
                    operation = operations::EXECUTE,
                    status = status::SUCCESS,
                    checksum = %tf_checksum.short(),
                    result = %result.short(),
                    elapsed_secs = elapsed,
                    "Job finished"
                );
                JobOutcome::Done(result)
            }
            Err(SeamlessError::CacheMiss(missing)) => {
                warn!(
                    service = services::TRANSFORMATION_CACHE,
                    checksum = %tf_checksum.short(),
                    missing = %missing.short(),
                    "Job input unavailable"
                );
                return JobOutcome::Missing(missing);
            }
            Err(SeamlessError::Connection { service }) => {
                warn!(
                    service = services::TRANSFORMATION_CACHE,
                    checksum = %tf_checksum.short(),
                    unreachable = %service,
                    "Job could not reach a service"
                );
                return JobOutcome::Disconnected(service);
            }
            Err(e) => {
                let message = match e {
                    SeamlessError::Transformation { message, .. } => message,
                    other => other.to_string(),
                };
                warn!(
                    service = services::TRANSFORMATION_CACHE,
                    operation = operations::EXECUTE,
                    status = status::ERROR,
                    checksum = %tf_checksum.short(),
                    error = %message,
                    "Job failed"
                );
                if recorded_here {
                    self.tc()
                        .set_exception(tf_checksum, message.clone(), Some(run.logs.clone()));
                    if let Some(database) = &self.inner.database {
                        if let Err(e) = database.set_exception(&tf_checksum, &message, &run.logs).await {
                            warn!(service = services::DATABASE, error = %e, "Cannot store exception");
                        }
                    }
                }
                metadata.insert("Success".into(), json!(false));
                metadata.insert("Exception".into(), json!(message));
                let progress = self.tc().progress(&tf_checksum);
                if let Some(progress) = progress {
                    metadata.insert("Progress".into(), json!(progress));
                }
                JobOutcome::Failed(message)
            }
        };

        if let (true, Some(database)) = (recorded_here, &self.inner.database) {
            if let Err(e) = database.set_metadata(&tf_checksum, &Json::Object(metadata)).await {
                warn!(service = services::DATABASE, error = %e, "Cannot store execution metadata");
            }
        }
        outcome
    }

    async fn run_remote(&self, tf_checksum: Checksum, transformation: &Transformation, options: RunOptions) -> JobRun {
        let result = match &self.inner.remote_compute {
            Some(compute) => match self.upload_for_remote(tf_checksum, transformation).await {
                Ok(()) => {
                    compute
                        .run(
                            &tf_checksum,
                            &transformation.dunder.to_json(),
                            options.fingertip,
                            options.scratch,
                        )
                        .await
                }
                Err(e) => Err(e),
            },
            None => Err(SeamlessError::Connection {
                service: services::REMOTE_COMPUTE.to_string(),
            }),
        };
        JobRun {
            result,
            logs: String::new(),
        }
    }

    /// Make a transformation resolvable by the compute service
    ///
    /// The transformation buffer and every locally held pin buffer go to the
    /// buffer write server; semantic-to-syntactic pairs of the pins go to the
    /// database. Upload failures only leave the remote side to report a miss.
    async fn upload_for_remote(&self, tf_checksum: Checksum, transformation: &Transformation) -> Result<()> {
        let buffers = &self.inner.buffers;
        let writable = buffers.remote().can_write();
        if writable {
            let tf_buffer = match buffers.get_buffer(&tf_checksum, false).await {
                Some(buffer) => buffer,
                None => tf_get_buffer(transformation),
            };
            self.upload_buffer(&tf_checksum, &tf_buffer).await;
        }

        for pin in transformation.pins.values() {
            let Some(checksum) = pin.checksum else {
                continue;
            };
            let candidates = self
                .syntactic_candidates(&checksum, pin.celltype, pin.subcelltype.as_deref())
                .await?;
            let syntactic: Vec<Checksum> = candidates.iter().copied().filter(|c| *c != checksum).collect();
            if let (false, Some(database)) = (syntactic.is_empty(), &self.inner.database) {
                if let Err(e) = database
                    .set_sem2syn(&checksum, pin.celltype.as_str(), pin.subcelltype.as_deref(), &syntactic)
                    .await
                {
                    warn!(service = services::DATABASE, error = %e, "Cannot store semantic checksum");
                }
            }
            if !writable {
                continue;
            }
            for candidate in candidates {
                if let Some(buffer) = buffers.get_buffer(&candidate, false).await {
                    self.upload_buffer(&candidate, &buffer).await;
                }
            }
        }
        Ok(())
    }

    async fn upload_buffer(&self, checksum: &Checksum, buffer: &[u8]) {
        if let Err(e) = self.inner.buffers.remote().write_buffer(checksum, buffer).await {
            warn!(
                service = services::BUFFER_SERVER,
                operation = operations::PUT,
                status = status::ERROR,
                checksum = %checksum.short(),
                error = %e,
                "Buffer upload failed"
            );
        }
    }

    /// Run in this process, on the blocking pool or in a worker thread
    async fn run_here(
        &self,
        tf_checksum: Checksum,
        transformation: &Transformation,
        options: RunOptions,
        lineage: Lineage,
        cancelled: Arc<AtomicBool>,
        metadata: &mut Map<String, Json>,
    ) -> JobRun {
        let prepared = match self.prepare_job(tf_checksum, transformation, metadata).await {
            Ok(prepared) => prepared,
            Err(e) => {
                return JobRun {
                    result: Err(e),
                    logs: String::new(),
                }
            }
        };
        let (job, runner) = prepared;
        let celltype = job.output.celltype;

        let (events, receiver) = mpsc::unbounded_channel();
        let consumer = tokio::spawn(self.clone().consume_events(tf_checksum, celltype, receiver));
        let ctx = RunContext::new(tf_checksum, cancelled).with_events(events);

        let output = match self.inner.settings.strategy {
            ExecutionStrategy::Local => delegation::run_in_worker(self, job, runner, ctx, lineage).await,
            _ => self.run_in_process(job, runner, ctx, lineage).await,
        };
        let _ = consumer.await;

        let result = match output.value {
            Ok(value) => self.store_output(&value, celltype, options.scratch).await,
            Err(e) => Err(e),
        };
        JobRun {
            result,
            logs: output.logs,
        }
    }

    async fn run_in_process(
        &self,
        job: RunJob,
        runner: Arc<dyn LanguageRunner>,
        ctx: RunContext,
        lineage: Lineage,
    ) -> RunnerOutput {
        let delegate = Arc::new(DirectDelegate {
            service: self.clone(),
            handle: Handle::current(),
            lineage,
        });
        let ctx = ctx.with_delegate(delegate);
        let task = tokio::task::spawn_blocking(move || {
            let value = runner.run(&job, &ctx);
            RunnerOutput {
                value,
                logs: ctx.take_logs(),
            }
        });
        match task.await {
            Ok(output) => output,
            Err(e) => RunnerOutput {
                value: Err(anyhow::anyhow!("runner panicked: {e}").into()),
                logs: String::new(),
            },
        }
    }

    /// Bridge, resolve code and inputs, and pick the runner
    async fn prepare_job(
        &self,
        tf_checksum: Checksum,
        transformation: &Transformation,
        metadata: &mut Map<String, Json>,
    ) -> Result<(RunJob, Arc<dyn LanguageRunner>)> {
        if transformation.is_deep() {
            return Err(SeamlessError::InvalidTransformation(
                "deep-structure outputs are not supported".into(),
            ));
        }
        let env = match transformation.dunder.env {
            Some(env) => Some(self.get_value_async(env, Celltype::Plain).await?.to_json()),
            None => None,
        };

        let bridged;
        let transformation = if needs_bridge(transformation) {
            let bridge = unbashify(transformation, env.as_ref())?;
            for (checksum, buffer) in &bridge.buffers {
                self.inner.buffers.cache_buffer(*checksum, buffer.clone()).await;
            }
            metadata.insert("Language bridge".into(), bridge.metadata.clone());
            bridged = bridge.transformation;
            &bridged
        } else {
            transformation
        };
        let runner = self.inner.runners.get(&transformation.language)?;

        let code_pin = transformation
            .code()
            .ok_or_else(|| SeamlessError::InvalidTransformation("transformation without code".into()))?;
        let code = self.resolve_input(CODE_PIN, code_pin).await?;
        let code = code
            .value
            .as_text()
            .map(str::to_string)
            .ok_or_else(|| SeamlessError::codec(code.celltype.as_str(), "code is not text"))?;

        let mut inputs = BTreeMap::new();
        for (name, pin) in transformation.input_pins() {
            let input = self.resolve_input(name, pin).await?;
            inputs.insert(transformation.exposed_name(name).to_string(), input);
        }

        let job = RunJob {
            tf_checksum,
            language: transformation.language.clone(),
            code,
            inputs,
            output: transformation.output.clone(),
            env,
            meta: transformation.dunder.meta.clone(),
        };
        Ok((job, runner))
    }

    /// Buffer and value of a pin, preferring a syntactic buffer for semantic checksums
    async fn resolve_input(&self, name: &str, pin: &Pin) -> Result<RunInput> {
        let checksum = pin
            .checksum
            .ok_or_else(|| SeamlessError::InvalidTransformation(format!("pin '{name}' has no checksum")))?;
        let candidates = self
            .syntactic_candidates(&checksum, pin.celltype, pin.subcelltype.as_deref())
            .await?;
        let mut found = None;
        for candidate in candidates {
            if let Some(buffer) = self.inner.buffers.get_buffer(&candidate, true).await {
                found = Some((candidate, buffer));
                break;
            }
        }
        let (checksum, buffer) = match found {
            Some(found) => found,
            None => (checksum, self.get_buffer(&checksum).await?),
        };
        let value = self
            .inner
            .values
            .deserialize(&buffer, &checksum, pin.celltype, false)?;
        Ok(RunInput {
            celltype: pin.celltype,
            subcelltype: pin.subcelltype.clone(),
            checksum,
            buffer,
            value,
        })
    }

    /// Serialize and cache a result; unless `scratch`, also write it out
    async fn store_output(&self, value: &Value, celltype: Celltype, scratch: bool) -> Result<Checksum> {
        let buffer = serialize(value, celltype)?;
        let checksum = calculate_checksum(&buffer);
        let buffers = &self.inner.buffers;
        buffers.cache_buffer(checksum, buffer).await;
        if !scratch {
            buffers.incref(checksum, true).await;
            buffers.decref(&checksum, true);
        }
        Ok(checksum)
    }

    async fn consume_events(self, tf_checksum: Checksum, celltype: Celltype, mut events: UnboundedReceiver<JobEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                JobEvent::Progress(progress) => {
                    self.tc().set_progress(tf_checksum, progress);
                }
                JobEvent::Preliminary(value) => {
                    let buffer = match serialize(&value, celltype) {
                        Ok(buffer) => buffer,
                        Err(e) => {
                            warn!(
                                checksum = %tf_checksum.short(),
                                error = %e,
                                "Cannot serialize preliminary result"
                            );
                            continue;
                        }
                    };
                    let checksum = calculate_checksum(&buffer);
                    self.inner.buffers.cache_buffer(checksum, buffer).await;
                    self.set_transformation_result(tf_checksum, checksum, true, false)
                        .await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::TransformationStatus;
    use crate::runner::RunnerRegistry;
    use crate::transformation::OutputPin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn service_with(runners: RunnerRegistry) -> CacheService {
        CacheService::builder().runners(runners).build().unwrap()
    }

    fn native_draft(function: &str, a: i64) -> TransformationDraft {
        TransformationDraft::new("native", OutputPin::new("result", Celltype::Int))
            .code(Celltype::Text, function)
            .value("a", Celltype::Int, json!(a))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_result_is_stored_and_logs_kept() {
        let runners = RunnerRegistry::default();
        runners.native().register("double", |job: &RunJob, ctx: &RunContext| {
            ctx.log("doubling");
            Ok(Value::Json(json!(job.i64("a")? * 2)))
        });
        let service = service_with(runners);

        let result = service
            .run_draft_async(native_draft("double", 21), RunOptions::default())
            .await
            .unwrap();
        assert_eq!(result, calculate_checksum(b"42\n"));
        let prepared = service.prepare(&native_draft("double", 21)).await.unwrap();
        assert_eq!(
            service.status(&prepared.checksum).await.unwrap(),
            TransformationStatus::Done(result)
        );
        assert_eq!(
            service.logs(&prepared.checksum).await.unwrap().as_deref(),
            Some("doubling\n")
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failure_is_recorded_until_cleared() {
        let runners = RunnerRegistry::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        runners.native().register("fail", move |_: &RunJob, _: &RunContext| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(anyhow::anyhow!("boom").into())
        });
        let service = service_with(runners);
        let draft = native_draft("fail", 1);

        let err = service
            .run_draft_async(draft.clone(), RunOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SeamlessError::Transformation { .. }));
        assert!(err.to_string().contains("boom"));

        // the recorded exception is returned without running again
        assert!(service
            .run_draft_async(draft.clone(), RunOptions::default())
            .await
            .is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let tf = service.prepare(&draft).await.unwrap().checksum;
        assert!(matches!(
            service.status(&tf).await.unwrap(),
            TransformationStatus::Error(_)
        ));
        assert!(service.clear_exception(&tf).await.unwrap());
        assert!(service.run_draft_async(draft, RunOptions::default()).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_late_request_takes_the_finished_result() {
        let runners = RunnerRegistry::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        runners.native().register("square", move |job: &RunJob, _: &RunContext| {
            counter.fetch_add(1, Ordering::SeqCst);
            let a = job.i64("a")?;
            Ok(Value::Json(json!(a * a)))
        });
        let service = service_with(runners);
        let prepared = service.prepare(&native_draft("square", 9)).await.unwrap();

        // This request checked the cache before the first job completed
        let first = service
            .run_transformation_async(prepared.checksum, None, RunOptions::default())
            .await
            .unwrap();
        let late = service
            .execute(
                prepared.checksum,
                prepared.transformation.clone(),
                RunOptions::default(),
                Arc::new(Vec::new()),
            )
            .await
            .unwrap();
        assert_eq!(late, first);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!service.inner.jobs.is_running(&prepared.checksum));

        // A fingertip request still reruns
        service
            .execute(
                prepared.checksum,
                prepared.transformation,
                RunOptions::fingertip(),
                Arc::new(Vec::new()),
            )
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_remote_job_uploads_inputs_before_running() {
        use crate::cache::{BufferCache, BufferLifetimes};
        use crate::remote::BufferRemote;
        use crate::testing::serve;
        use axum::extract::Path;
        use axum::http::StatusCode;
        use axum::routing::{get, put};
        use axum::Router;
        use std::sync::Mutex;

        let requests: Arc<Mutex<Vec<String>>> = Arc::default();
        let result = calculate_checksum(b"42\n");
        let app = {
            let uploads = Arc::clone(&requests);
            let runs = Arc::clone(&requests);
            let hex = result.to_hex();
            Router::new()
                .route("/buffers/has", get(|| async { axum::Json(vec![false]) }))
                .route(
                    "/buffers/{checksum}",
                    put(move |Path(checksum): Path<String>| async move {
                        uploads.lock().unwrap().push(checksum);
                        StatusCode::OK
                    }),
                )
                .route(
                    "/run",
                    put(move || async move {
                        runs.lock().unwrap().push("run".to_string());
                        hex
                    }),
                )
        };
        let url = serve(app).await;
        let remote = BufferRemote::new(Vec::new(), Vec::new(), Some(format!("{url}/buffers")), Duration::from_secs(5))
            .unwrap();
        let service = CacheService::builder()
            .buffer_cache(BufferCache::new(Arc::new(remote), None, None, BufferLifetimes::default()))
            .strategy(ExecutionStrategy::Remote)
            .remote_compute(url)
            .build()
            .unwrap();

        let draft = TransformationDraft::new("python", OutputPin::new("result", Celltype::Int))
            .code(Celltype::Python, "a * 2")
            .value("a", Celltype::Int, json!(21));
        let prepared = service.prepare(&draft).await.unwrap();
        let answer = service
            .run_transformation_async(prepared.checksum, None, RunOptions::default())
            .await
            .unwrap();
        assert_eq!(answer, result);

        let requests = requests.lock().unwrap().clone();
        let run_at = requests.iter().position(|r| r == "run").unwrap();
        let uploaded = &requests[..run_at];
        assert!(uploaded.contains(&prepared.checksum.to_hex()));
        for pin in prepared.transformation.pins.values() {
            let checksum = pin.checksum.unwrap();
            let candidates = service
                .syntactic_candidates(&checksum, pin.celltype, pin.subcelltype.as_deref())
                .await
                .unwrap();
            let held: Vec<Checksum> = candidates.into_iter().filter(|c| *c != checksum).collect();
            if held.is_empty() {
                assert!(uploaded.contains(&checksum.to_hex()), "pin {checksum} not uploaded");
            }
            for syntactic in held {
                assert!(uploaded.contains(&syntactic.to_hex()), "buffer {syntactic} not uploaded");
            }
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_missing_input_is_not_recorded() {
        let service = service_with(RunnerRegistry::default());
        let absent = calculate_checksum(b"never cached\n");
        let draft = TransformationDraft::new("native", OutputPin::new("result", Celltype::Int))
            .code(Celltype::Text, "double")
            .pin("a", Celltype::Int, crate::transformation::PinValue::Checksum(absent));

        let err = service
            .run_draft_async(draft.clone(), RunOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_cache_miss());
        let tf = service.prepare(&draft).await.unwrap().checksum;
        assert_eq!(service.exception(&tf).await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_nested_transformation_runs_through_delegate() {
        let runners = RunnerRegistry::default();
        runners.native().register("inc", |job: &RunJob, _: &RunContext| {
            Ok(Value::Json(json!(job.i64("a")? + 1)))
        });
        runners.native().register("inc_twice", |job: &RunJob, ctx: &RunContext| {
            let draft = TransformationDraft::new("native", OutputPin::new("result", Celltype::Int))
                .code(Celltype::Text, "inc")
                .value("a", Celltype::Int, json!(job.i64("a")?));
            let inner = ctx.run_transformation(draft)?;
            let value = ctx.resolve(&inner, Celltype::Int)?;
            Ok(Value::Json(json!(value.to_json().as_i64().unwrap_or_default() + 1)))
        });
        let service = service_with(runners);

        let result = service
            .run_draft_async(native_draft("inc_twice", 5), RunOptions::default())
            .await
            .unwrap();
        let value = service.get_value_async(result, Celltype::Int).await.unwrap();
        assert_eq!(value.to_json(), json!(7));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_self_submission_is_recursion() {
        let runners = RunnerRegistry::default();
        runners.native().register("again", |job: &RunJob, ctx: &RunContext| {
            let draft = TransformationDraft::new("native", OutputPin::new("result", Celltype::Int))
                .code(Celltype::Text, "again")
                .value("a", Celltype::Int, json!(job.i64("a")?));
            ctx.run_transformation(draft)?;
            Ok(Value::Json(json!(0)))
        });
        let service = service_with(runners);
        let err = service
            .run_draft_async(native_draft("again", 1), RunOptions::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ecursi"), "{err}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_progress_and_preliminary_result() {
        let runners = RunnerRegistry::default();
        runners.native().register("slow", |_: &RunJob, ctx: &RunContext| {
            ctx.set_progress(50.0);
            ctx.set_preliminary(Value::Json(json!(1)));
            std::thread::sleep(Duration::from_millis(300));
            Ok(Value::Json(json!(2)))
        });
        let service = service_with(runners);
        let prepared = service.prepare(&native_draft("slow", 0)).await.unwrap();
        let tf = prepared.checksum;

        let runner = service.clone();
        let job = tokio::spawn(async move {
            runner
                .run_transformation_async(tf, None, RunOptions::default())
                .await
        });
        tokio::time::sleep(Duration::from_millis(150)).await;
        match service.status(&tf).await.unwrap() {
            TransformationStatus::Running { progress, preliminary } => {
                assert_eq!(progress, Some(50.0));
                assert_eq!(preliminary, Some(calculate_checksum(b"1\n")));
            }
            other => panic!("unexpected status {other:?}"),
        }
        let result = job.await.unwrap().unwrap();
        assert_eq!(result, calculate_checksum(b"2\n"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_hard_cancel_reaches_waiters() {
        let runners = RunnerRegistry::default();
        runners.native().register("forever", |_: &RunJob, ctx: &RunContext| {
            while !ctx.is_cancelled() {
                std::thread::sleep(Duration::from_millis(10));
            }
            Ok(Value::Json(json!(0)))
        });
        let service = service_with(runners);
        let tf = service.prepare(&native_draft("forever", 0)).await.unwrap().checksum;

        let runner = service.clone();
        let job = tokio::spawn(async move {
            runner
                .run_transformation_async(tf, None, RunOptions::default())
                .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(service.hard_cancel(&tf));
        let err = job.await.unwrap().unwrap_err();
        assert!(matches!(err, SeamlessError::HardCancelled(_)));
        assert!(matches!(
            service.status(&tf).await.unwrap(),
            TransformationStatus::Error(_)
        ));
    }
}
