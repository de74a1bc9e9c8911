use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use super::{LanguageRunner, RunContext, RunJob};
use crate::codec::Value;
use crate::error::{Result, SeamlessError};

/// A registered Rust function
pub type NativeFn = Arc<dyn Fn(&RunJob, &RunContext) -> Result<Value> + Send + Sync>;

/// Runs functions registered by name; the code of a native transformation is that name
#[derive(Default)]
pub struct NativeRunner {
    functions: RwLock<HashMap<String, NativeFn>>,
}

impl NativeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, name: impl Into<String>, function: F)
    where
        F: Fn(&RunJob, &RunContext) -> Result<Value> + Send + Sync + 'static,
    {
        let name = name.into();
        debug!(function = %name, "Registered native function");
        self.functions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name, Arc::new(function));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }

    fn lookup(&self, name: &str) -> Option<NativeFn> {
        self.functions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }
}

impl LanguageRunner for NativeRunner {
    fn language(&self) -> &'static str {
        "native"
    }

    fn run(&self, job: &RunJob, ctx: &RunContext) -> Result<Value> {
        let name = job.code.trim();
        let function = self.lookup(name).ok_or_else(|| SeamlessError::Transformation {
            checksum: job.tf_checksum,
            message: format!("no native function named '{name}'"),
        })?;
        function(job, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::calculate_checksum;
    use crate::codec::Celltype;
    use crate::runner::RunInput;
    use crate::transformation::OutputPin;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicBool;

    fn job(code: &str, a: i64) -> RunJob {
        let mut inputs = BTreeMap::new();
        inputs.insert(
            "a".to_string(),
            RunInput {
                celltype: Celltype::Int,
                subcelltype: None,
                checksum: calculate_checksum(b"a"),
                buffer: bytes::Bytes::from_static(b"a"),
                value: Arc::new(Value::Json(json!(a))),
            },
        );
        RunJob {
            tf_checksum: calculate_checksum(b"tf"),
            language: "native".to_string(),
            code: code.to_string(),
            inputs,
            output: OutputPin::new("result", Celltype::Int),
            env: None,
            meta: None,
        }
    }

    #[test]
    fn test_registered_function_runs() {
        let runner = NativeRunner::new();
        runner.register("double", |job: &RunJob, _ctx: &RunContext| {
            Ok(Value::Json(json!(job.i64("a")? * 2)))
        });
        let ctx = RunContext::new(calculate_checksum(b"tf"), Arc::new(AtomicBool::new(false)));
        let value = runner.run(&job("double\n", 21), &ctx).unwrap();
        assert_eq!(value, Value::Json(json!(42)));
    }

    #[test]
    fn test_unknown_function_fails() {
        let runner = NativeRunner::new();
        let ctx = RunContext::new(calculate_checksum(b"tf"), Arc::new(AtomicBool::new(false)));
        let err = runner.run(&job("missing", 1), &ctx).unwrap_err();
        assert!(err.to_string().contains("missing"));
    }
}
