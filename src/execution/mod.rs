//! Transformation execution
//!
//! Jobs are keyed by transformation checksum. The first request for a
//! checksum starts a job; concurrent requests for the same checksum join it
//! and receive the same outcome. Where the job runs is decided by the
//! [`ExecutionStrategy`]: on the blocking pool of the current runtime, in a
//! worker thread that delegates nested work back to the service, or on a
//! remote compute service.

pub mod delegation;
pub mod job;
pub mod prepare;
pub mod remote;

pub use prepare::{prepare_draft, PreparedTransformation, SemanticPair};
pub use remote::RemoteCompute;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::cache::KeepAlive;
use crate::checksum::Checksum;
use crate::config::{parse_duration, ExecutionConfig, ExecutionStrategy};
use crate::error::{Result, SeamlessError};

/// Executor name recorded in the metadata of jobs run by this process
pub const IN_PROCESS_EXECUTOR: &str = "seamless-in-process";

/// Execution options of a [`crate::CacheService`]
#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    pub strategy: ExecutionStrategy,
    pub delegation_timeout: Duration,
    pub poll_interval: Duration,
    pub keep_alive: KeepAlive,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            strategy: ExecutionStrategy::InProcess,
            delegation_timeout: Duration::from_secs(3600),
            poll_interval: Duration::from_secs(2),
            keep_alive: KeepAlive::default(),
        }
    }
}

impl ExecutionSettings {
    pub fn from_config(config: &ExecutionConfig) -> Result<Self> {
        Ok(Self {
            strategy: config.strategy,
            delegation_timeout: parse_duration(&config.delegation_timeout)?,
            poll_interval: parse_duration(&config.poll_interval)?,
            keep_alive: KeepAlive {
                min: parse_duration(&config.keep_alive_min)?,
                max: parse_duration(&config.keep_alive_max)?,
                threshold: parse_duration(&config.alive_threshold)?,
            },
        })
    }
}

/// Options of a single run request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Execute even when a result is known, to regenerate its buffer
    pub fingertip: bool,
    /// Keep the result buffer in memory only
    pub scratch: bool,
}

impl RunOptions {
    pub fn fingertip() -> Self {
        Self {
            fingertip: true,
            scratch: true,
        }
    }
}

/// Status of a transformation, with the numeric codes used on the wire
#[derive(Debug, Clone, PartialEq)]
pub enum TransformationStatus {
    /// 3: a final result is known
    Done(Checksum),
    /// 2: a job is running
    Running {
        progress: Option<f64>,
        preliminary: Option<Checksum>,
    },
    /// 0: the last run failed
    Error(String),
    /// -3: the transformation is not known
    Unknown,
    /// -1: this engine cannot compute it
    NotRunnable,
    /// -2: some input buffer cannot be obtained
    InputsUnavailable,
    /// 1: ready to run
    Runnable,
}

impl TransformationStatus {
    pub fn code(&self) -> i32 {
        match self {
            TransformationStatus::Done(_) => 3,
            TransformationStatus::Running { .. } => 2,
            TransformationStatus::Error(_) => 0,
            TransformationStatus::Unknown => -3,
            TransformationStatus::NotRunnable => -1,
            TransformationStatus::InputsUnavailable => -2,
            TransformationStatus::Runnable => 1,
        }
    }
}

/// How a job ended, as seen by every waiter
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Done(Checksum),
    Failed(String),
    HardCancelled,
    /// The job went away without an outcome (shutdown)
    Cancelled,
    /// An input buffer could not be obtained; nothing is recorded
    Missing(Checksum),
    /// A remote service was unreachable; nothing is recorded
    Disconnected(String),
}

impl JobOutcome {
    pub fn into_result(self, tf_checksum: Checksum) -> Result<Checksum> {
        match self {
            JobOutcome::Done(result) => Ok(result),
            JobOutcome::Failed(message) => Err(SeamlessError::Transformation {
                checksum: tf_checksum,
                message,
            }),
            JobOutcome::HardCancelled => Err(SeamlessError::HardCancelled(tf_checksum)),
            JobOutcome::Cancelled => Err(SeamlessError::Shutdown),
            JobOutcome::Missing(checksum) => Err(SeamlessError::CacheMiss(checksum)),
            JobOutcome::Disconnected(service) => Err(SeamlessError::Connection { service }),
        }
    }
}

pub(crate) type OutcomeSender = Arc<watch::Sender<Option<JobOutcome>>>;
pub(crate) type OutcomeReceiver = watch::Receiver<Option<JobOutcome>>;

struct JobEntry {
    sender: OutcomeSender,
    cancelled: Arc<AtomicBool>,
    abort: Option<AbortHandle>,
}

/// Result of asking the job table for a checksum
pub(crate) enum JobSlot {
    /// A job is already in flight; wait for its outcome
    Join(OutcomeReceiver),
    /// The caller must start the job and publish through `sender`
    Lead {
        sender: OutcomeSender,
        receiver: OutcomeReceiver,
        cancelled: Arc<AtomicBool>,
    },
}

/// In-flight jobs by transformation checksum
#[derive(Default)]
pub(crate) struct JobTable {
    jobs: Mutex<HashMap<Checksum, JobEntry>>,
}

impl JobTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<Checksum, JobEntry>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn join_or_lead(&self, tf_checksum: Checksum) -> JobSlot {
        let mut jobs = self.lock();
        if let Some(entry) = jobs.get(&tf_checksum) {
            return JobSlot::Join(entry.sender.subscribe());
        }
        let (sender, receiver) = watch::channel(None);
        let sender = Arc::new(sender);
        let cancelled = Arc::new(AtomicBool::new(false));
        jobs.insert(
            tf_checksum,
            JobEntry {
                sender: Arc::clone(&sender),
                cancelled: Arc::clone(&cancelled),
                abort: None,
            },
        );
        JobSlot::Lead {
            sender,
            receiver,
            cancelled,
        }
    }

    pub(crate) fn set_abort(&self, tf_checksum: &Checksum, sender: &OutcomeSender, abort: AbortHandle) {
        if let Some(entry) = self
            .lock()
            .get_mut(tf_checksum)
            .filter(|entry| Arc::ptr_eq(&entry.sender, sender))
        {
            entry.abort = Some(abort);
        }
    }

    /// Publish the outcome of the job behind `sender` and remove it
    ///
    /// An entry that was cancelled and replaced by a newer job is left alone.
    pub(crate) fn finish(&self, tf_checksum: &Checksum, sender: &OutcomeSender, outcome: JobOutcome) {
        let mut jobs = self.lock();
        if jobs
            .get(tf_checksum)
            .is_some_and(|entry| Arc::ptr_eq(&entry.sender, sender))
        {
            jobs.remove(tf_checksum);
        }
        drop(jobs);
        sender.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(outcome);
            true
        });
    }

    /// Stop a job; waiters receive `outcome`. Returns false if nothing was running.
    pub(crate) fn cancel(&self, tf_checksum: &Checksum, outcome: JobOutcome) -> bool {
        let Some(entry) = self.lock().remove(tf_checksum) else {
            return false;
        };
        if let Some(abort) = &entry.abort {
            abort.abort();
        }
        entry.cancelled.store(true, Ordering::SeqCst);
        entry.sender.send_replace(Some(outcome));
        true
    }

    pub(crate) fn cancel_all(&self) -> usize {
        let jobs: Vec<Checksum> = self.lock().keys().copied().collect();
        jobs.iter()
            .filter(|tf| self.cancel(tf, JobOutcome::Cancelled))
            .count()
    }

    pub(crate) fn is_running(&self, tf_checksum: &Checksum) -> bool {
        self.lock().contains_key(tf_checksum)
    }
}

/// Wait until a job publishes its outcome
pub(crate) async fn wait_outcome(mut receiver: OutcomeReceiver) -> JobOutcome {
    match receiver.wait_for(Option::is_some).await {
        Ok(outcome) => outcome.clone().unwrap_or(JobOutcome::Cancelled),
        Err(_) => JobOutcome::Cancelled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::calculate_checksum;

    #[tokio::test]
    async fn test_second_request_joins_the_first() {
        let table = JobTable::default();
        let tf = calculate_checksum(b"tf");
        let JobSlot::Lead { sender, receiver, .. } = table.join_or_lead(tf) else {
            panic!("first request must lead");
        };
        let JobSlot::Join(joined) = table.join_or_lead(tf) else {
            panic!("second request must join");
        };
        assert!(table.is_running(&tf));

        let result = calculate_checksum(b"result");
        table.finish(&tf, &sender, JobOutcome::Done(result));
        assert_eq!(wait_outcome(receiver).await, JobOutcome::Done(result));
        assert_eq!(wait_outcome(joined).await, JobOutcome::Done(result));
        assert!(!table.is_running(&tf));
    }

    #[tokio::test]
    async fn test_cancel_sets_flag_and_notifies() {
        let table = JobTable::default();
        let tf = calculate_checksum(b"tf");
        let JobSlot::Lead {
            sender,
            receiver,
            cancelled,
        } = table.join_or_lead(tf)
        else {
            panic!("first request must lead");
        };
        assert!(table.cancel(&tf, JobOutcome::HardCancelled));
        assert!(cancelled.load(Ordering::SeqCst));
        assert!(!table.cancel(&tf, JobOutcome::HardCancelled));

        // a late finish of the cancelled job changes nothing
        let JobSlot::Lead { .. } = table.join_or_lead(tf) else {
            panic!("a cancelled job must not be joined");
        };
        table.finish(&tf, &sender, JobOutcome::Done(calculate_checksum(b"late")));
        assert!(table.is_running(&tf));
        assert_eq!(wait_outcome(receiver).await, JobOutcome::HardCancelled);
    }

    #[test]
    fn test_status_codes() {
        let cs = calculate_checksum(b"x");
        assert_eq!(TransformationStatus::Done(cs).code(), 3);
        assert_eq!(
            TransformationStatus::Running {
                progress: None,
                preliminary: None
            }
            .code(),
            2
        );
        assert_eq!(TransformationStatus::Error("x".into()).code(), 0);
        assert_eq!(TransformationStatus::Unknown.code(), -3);
        assert_eq!(TransformationStatus::NotRunnable.code(), -1);
        assert_eq!(TransformationStatus::InputsUnavailable.code(), -2);
        assert_eq!(TransformationStatus::Runnable.code(), 1);
    }

    #[test]
    fn test_settings_from_config() {
        let settings = ExecutionSettings::from_config(&ExecutionConfig::default()).unwrap();
        assert_eq!(settings.strategy, ExecutionStrategy::InProcess);
        assert_eq!(settings.keep_alive.min, Duration::from_secs(1));
    }
}
