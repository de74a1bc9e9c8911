//! Language runners
//!
//! A runner executes the code of one language against deserialized inputs
//! and returns the output value. Runners also own the "canonicalize source"
//! hook that turns code into its semantic form.

pub mod bash;
pub mod bridge;
pub mod native;
pub mod python;

pub use native::{NativeFn, NativeRunner};
pub use python::{canonicalize_python, PythonRunner};

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value as Json;
use tokio::sync::mpsc::UnboundedSender;

use crate::checksum::{Buffer, Checksum};
use crate::codec::{Celltype, Value};
use crate::error::{Result, SeamlessError};
use crate::transformation::{OutputPin, TransformationDraft};

/// One resolved input of a job
#[derive(Debug, Clone)]
pub struct RunInput {
    pub celltype: Celltype,
    pub subcelltype: Option<String>,
    /// Syntactic checksum of `buffer`
    pub checksum: Checksum,
    pub buffer: Buffer,
    pub value: Arc<Value>,
}

/// Everything a runner needs to execute a transformation
#[derive(Debug, Clone)]
pub struct RunJob {
    pub tf_checksum: Checksum,
    pub language: String,
    /// Source code, as its syntactic text
    pub code: String,
    /// Inputs by the name the code sees them under
    pub inputs: BTreeMap<String, RunInput>,
    pub output: OutputPin,
    pub env: Option<Json>,
    pub meta: Option<Json>,
}

impl RunJob {
    pub fn input(&self, name: &str) -> Result<&Value> {
        self.inputs
            .get(name)
            .map(|input| input.value.as_ref())
            .ok_or_else(|| SeamlessError::InvalidTransformation(format!("missing input '{name}'")))
    }

    pub fn json(&self, name: &str) -> Result<Json> {
        Ok(self.input(name)?.to_json())
    }

    pub fn i64(&self, name: &str) -> Result<i64> {
        self.json(name)?
            .as_i64()
            .ok_or_else(|| SeamlessError::codec("int", format!("input '{name}' is not an integer")))
    }

    pub fn f64(&self, name: &str) -> Result<f64> {
        self.json(name)?
            .as_f64()
            .ok_or_else(|| SeamlessError::codec("float", format!("input '{name}' is not a number")))
    }

    pub fn text(&self, name: &str) -> Result<String> {
        match self.input(name)? {
            Value::Bytes(bytes) => String::from_utf8(bytes.to_vec())
                .map_err(|e| SeamlessError::codec("text", format!("input '{name}': {e}"))),
            value => value
                .as_text()
                .map(str::to_string)
                .ok_or_else(|| SeamlessError::codec("text", format!("input '{name}' is not text"))),
        }
    }

    /// Input names as the code sees them, sorted
    pub fn input_names(&self) -> Vec<String> {
        self.inputs.keys().cloned().collect()
    }
}

/// Notification from a running job to the engine
#[derive(Debug, Clone)]
pub enum JobEvent {
    Progress(f64),
    Preliminary(Value),
}

/// Runs nested transformations on behalf of running code
pub trait Delegate: Send + Sync {
    /// Run a transformation to completion and return its result checksum
    fn run_draft(&self, draft: TransformationDraft, fingertip: bool, scratch: bool) -> Result<Checksum>;

    /// Fetch (or reconstruct) a buffer and deserialize it
    fn resolve(&self, checksum: &Checksum, celltype: Celltype) -> Result<Value>;
}

/// Handle passed to running code
pub struct RunContext {
    tf_checksum: Checksum,
    events: Option<UnboundedSender<JobEvent>>,
    cancelled: Arc<AtomicBool>,
    logs: Mutex<String>,
    delegate: Option<Arc<dyn Delegate>>,
}

impl RunContext {
    pub fn new(tf_checksum: Checksum, cancelled: Arc<AtomicBool>) -> Self {
        Self {
            tf_checksum,
            events: None,
            cancelled,
            logs: Mutex::new(String::new()),
            delegate: None,
        }
    }

    pub fn with_events(mut self, events: UnboundedSender<JobEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_delegate(mut self, delegate: Arc<dyn Delegate>) -> Self {
        self.delegate = Some(delegate);
        self
    }

    pub fn tf_checksum(&self) -> &Checksum {
        &self.tf_checksum
    }

    /// Report progress, as a percentage
    pub fn set_progress(&self, progress: f64) {
        if let Some(events) = &self.events {
            let _ = events.send(JobEvent::Progress(progress));
        }
    }

    /// Report a preliminary result; it is cached but never stored in the database
    pub fn set_preliminary(&self, value: Value) {
        if let Some(events) = &self.events {
            let _ = events.send(JobEvent::Preliminary(value));
        }
    }

    /// Set by a hard cancel; long-running code should poll it
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn log(&self, text: &str) {
        let mut logs = self.logs.lock().unwrap_or_else(|e| e.into_inner());
        logs.push_str(text);
        if !text.ends_with('\n') {
            logs.push('\n');
        }
    }

    pub fn take_logs(&self) -> String {
        std::mem::take(&mut *self.logs.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Run another transformation from inside this one
    pub fn run_transformation(&self, draft: TransformationDraft) -> Result<Checksum> {
        self.delegate()?.run_draft(draft, false, false)
    }

    pub fn resolve(&self, checksum: &Checksum, celltype: Celltype) -> Result<Value> {
        self.delegate()?.resolve(checksum, celltype)
    }

    fn delegate(&self) -> Result<&Arc<dyn Delegate>> {
        self.delegate.as_ref().ok_or_else(|| {
            SeamlessError::Other(anyhow::anyhow!("nested transformations are not available here"))
        })
    }
}

/// Executes code of one language
pub trait LanguageRunner: Send + Sync {
    fn language(&self) -> &'static str;

    /// Semantic form of a source text; the identity unless the language defines one
    fn canonicalize(&self, source: &str) -> Result<String> {
        Ok(source.to_string())
    }

    fn run(&self, job: &RunJob, ctx: &RunContext) -> Result<Value>;
}

/// Runners by language name
#[derive(Clone)]
pub struct RunnerRegistry {
    runners: HashMap<String, Arc<dyn LanguageRunner>>,
    native: Arc<NativeRunner>,
}

impl Default for RunnerRegistry {
    fn default() -> Self {
        let native = Arc::new(NativeRunner::new());
        bridge::register_executors(&native);
        let mut registry = Self {
            runners: HashMap::new(),
            native: Arc::clone(&native),
        };
        registry.register(native);
        registry.register(Arc::new(PythonRunner::default()));
        registry
    }
}

impl RunnerRegistry {
    pub fn register(&mut self, runner: Arc<dyn LanguageRunner>) {
        self.runners.insert(runner.language().to_string(), runner);
    }

    pub fn get(&self, language: &str) -> Result<Arc<dyn LanguageRunner>> {
        self.runners
            .get(language)
            .cloned()
            .ok_or_else(|| SeamlessError::UnknownLanguage(language.to_string()))
    }

    pub fn native(&self) -> &Arc<NativeRunner> {
        &self.native
    }

    pub fn languages(&self) -> Vec<String> {
        let mut languages: Vec<String> = self.runners.keys().cloned().collect();
        languages.sort();
        languages
    }

    /// Canonical form of code of the given celltype, or `None` when its bytes are already semantic
    pub fn canonicalize(&self, celltype: Celltype, source: &str) -> Result<Option<String>> {
        match celltype {
            Celltype::Python => Ok(Some(self.get("python")?.canonicalize(source)?)),
            Celltype::Cson | Celltype::Yaml => Err(SeamlessError::codec(
                celltype.as_str(),
                "semantic conversion is not supported",
            )),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::calculate_checksum;

    #[test]
    fn test_default_registry() {
        let registry = RunnerRegistry::default();
        assert_eq!(registry.languages(), vec!["native".to_string(), "python".to_string()]);
        assert!(matches!(
            registry.get("fortran"),
            Err(SeamlessError::UnknownLanguage(_))
        ));
        assert!(registry.native().contains(bridge::BASH_EXECUTOR));
    }

    #[test]
    fn test_canonicalize_by_celltype() {
        let registry = RunnerRegistry::default();
        assert_eq!(registry.canonicalize(Celltype::Text, "x").unwrap(), None);
        assert!(registry
            .canonicalize(Celltype::Python, "a = 1\n")
            .unwrap()
            .is_some());
        assert!(registry.canonicalize(Celltype::Yaml, "a: 1").is_err());
    }

    #[test]
    fn test_context_logs_and_events() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let ctx = RunContext::new(calculate_checksum(b"tf"), Arc::new(AtomicBool::new(false)))
            .with_events(tx);
        ctx.log("one");
        ctx.log("two\n");
        ctx.set_progress(50.0);
        assert_eq!(ctx.take_logs(), "one\ntwo\n");
        assert!(matches!(rx.try_recv(), Ok(JobEvent::Progress(p)) if p == 50.0));
        assert!(!ctx.is_cancelled());
        assert!(ctx.run_transformation(TransformationDraft::new(
            "native",
            OutputPin::new("result", Celltype::Int)
        ))
        .is_err());
    }
}
