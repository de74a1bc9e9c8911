//! Worker threads for the local strategy
//!
//! A worker runs one job on its own OS thread. It talks to the service
//! through a message channel: nested transformations and value lookups are
//! submitted to the service, which runs them on its runtime and answers on a
//! per-request reply channel. The service lock is held on the worker's
//! behalf while it runs and handed back for the duration of every request,
//! so nested jobs can take it.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::job::RunnerOutput;
use super::RunOptions;
use crate::checksum::Checksum;
use crate::codec::{Celltype, Value};
use crate::error::{Result, SeamlessError};
use crate::logging::services;
use crate::runner::{Delegate, LanguageRunner, RunContext, RunJob};
use crate::service::{CacheService, Lineage};
use crate::transformation::TransformationDraft;

pub(crate) struct DelegatedJob {
    draft: TransformationDraft,
    options: RunOptions,
    reply: Sender<Result<Checksum>>,
}

pub(crate) enum WorkerMessage {
    ReleaseLock,
    /// Take the lock back; acknowledged once it is held again
    AcquireLock(Sender<()>),
    Submit(DelegatedJob),
    Resolve {
        checksum: Checksum,
        celltype: Celltype,
        reply: Sender<Result<Value>>,
    },
}

/// The worker's end of the channel
struct ParentLink {
    messages: mpsc::UnboundedSender<WorkerMessage>,
    timeout: Duration,
    tf_checksum: Checksum,
}

/// Lock handed to the service; taken back on drop
struct LockReleased<'a> {
    messages: &'a mpsc::UnboundedSender<WorkerMessage>,
}

impl<'a> LockReleased<'a> {
    fn new(messages: &'a mpsc::UnboundedSender<WorkerMessage>) -> Self {
        let _ = messages.send(WorkerMessage::ReleaseLock);
        Self { messages }
    }
}

impl Drop for LockReleased<'_> {
    fn drop(&mut self) {
        let (ack, acquired) = bounded(1);
        if self.messages.send(WorkerMessage::AcquireLock(ack)).is_ok() {
            let _ = acquired.recv();
        }
    }
}

impl ParentLink {
    fn wait<T>(&self, response: Receiver<Result<T>>) -> Result<T> {
        match response.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(SeamlessError::DelegationTimeout {
                checksum: self.tf_checksum,
                timeout: self.timeout,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(SeamlessError::Shutdown),
        }
    }
}

impl Delegate for ParentLink {
    fn run_draft(&self, draft: TransformationDraft, fingertip: bool, scratch: bool) -> Result<Checksum> {
        let (reply, response) = bounded(1);
        let _released = LockReleased::new(&self.messages);
        self.messages
            .send(WorkerMessage::Submit(DelegatedJob {
                draft,
                options: RunOptions { fingertip, scratch },
                reply,
            }))
            .map_err(|_| SeamlessError::Shutdown)?;
        self.wait(response)
    }

    fn resolve(&self, checksum: &Checksum, celltype: Celltype) -> Result<Value> {
        let (reply, response) = bounded(1);
        let _released = LockReleased::new(&self.messages);
        self.messages
            .send(WorkerMessage::Resolve {
                checksum: *checksum,
                celltype,
                reply,
            })
            .map_err(|_| SeamlessError::Shutdown)?;
        self.wait(response)
    }
}

/// Run a job on a worker thread and serve its requests until it finishes
pub(crate) async fn run_in_worker(
    service: &CacheService,
    job: RunJob,
    runner: Arc<dyn LanguageRunner>,
    ctx: RunContext,
    lineage: Lineage,
) -> RunnerOutput {
    let lock = Arc::clone(&service.inner.lock);
    let mut permit = match Arc::clone(&lock).acquire_owned().await {
        Ok(permit) => Some(permit),
        Err(_) => {
            return RunnerOutput {
                value: Err(SeamlessError::Shutdown),
                logs: String::new(),
            }
        }
    };

    let tf_checksum = job.tf_checksum;
    let (messages, mut requests) = mpsc::unbounded_channel();
    let (done, mut finished) = oneshot::channel();
    let link = Arc::new(ParentLink {
        messages,
        timeout: service.inner.settings.delegation_timeout,
        tf_checksum,
    });
    let ctx = ctx.with_delegate(link);
    let spawned = std::thread::Builder::new()
        .name(format!("seamless-worker-{}", tf_checksum.short()))
        .spawn(move || {
            let value = runner.run(&job, &ctx);
            let logs = ctx.take_logs();
            let _ = done.send(RunnerOutput { value, logs });
        });
    if let Err(e) = spawned {
        return RunnerOutput {
            value: Err(e.into()),
            logs: String::new(),
        };
    }
    debug!(
        service = services::DELEGATION,
        checksum = %tf_checksum.short(),
        "Worker started"
    );

    loop {
        tokio::select! {
            output = &mut finished => {
                drop(permit);
                return output.unwrap_or_else(|_| RunnerOutput {
                    value: Err(anyhow::anyhow!("worker for {} exited without a result", tf_checksum.short()).into()),
                    logs: String::new(),
                });
            }
            Some(message) = requests.recv() => match message {
                WorkerMessage::ReleaseLock => {
                    permit = None;
                }
                WorkerMessage::AcquireLock(ack) => {
                    match Arc::clone(&lock).acquire_owned().await {
                        Ok(acquired) => permit = Some(acquired),
                        Err(_) => warn!(service = services::DELEGATION, "Service lock closed"),
                    }
                    let _ = ack.send(());
                }
                WorkerMessage::Submit(delegated) => {
                    debug!(
                        service = services::DELEGATION,
                        checksum = %tf_checksum.short(),
                        "Worker submitted a transformation"
                    );
                    let service = service.clone();
                    let lineage = Arc::clone(&lineage);
                    tokio::spawn(async move {
                        let result = service
                            .run_draft_in(delegated.draft, delegated.options, lineage)
                            .await;
                        let _ = delegated.reply.send(result);
                    });
                }
                WorkerMessage::Resolve { checksum, celltype, reply } => {
                    let service = service.clone();
                    tokio::spawn(async move {
                        let value = service
                            .get_value_async(checksum, celltype)
                            .await
                            .map(|value| (*value).clone());
                        let _ = reply.send(value);
                    });
                }
            },
        }
    }
}
