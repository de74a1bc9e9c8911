// Common test utilities shared across integration tests
//
// Every test builds its own CacheService and, for CLI tests, its own cache
// directory. Nothing is shared between tests.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use assert_cmd::Command;
use seamless::runner::{RunContext, RunJob, RunnerRegistry};
use seamless::transformation::OutputPin;
use seamless::{calculate_checksum, CacheService, Celltype, Checksum, TransformationDraft, Value};
use serde_json::json;
use tempfile::TempDir;

/// Runner registry with an `add` native function that counts its calls
#[allow(dead_code)]
pub fn counting_add() -> (RunnerRegistry, Arc<AtomicUsize>) {
    let runners = RunnerRegistry::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    runners.native().register("add", move |job: &RunJob, _: &RunContext| {
        counter.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(std::time::Duration::from_millis(50));
        Ok(Value::Json(json!(job.i64("a")? + job.i64("b")?)))
    });
    (runners, calls)
}

#[allow(dead_code)]
pub fn service(runners: RunnerRegistry) -> CacheService {
    CacheService::builder()
        .runners(runners)
        .build()
        .expect("Failed to build cache service")
}

#[allow(dead_code)]
pub fn add_draft(a: i64, b: i64) -> TransformationDraft {
    TransformationDraft::new("native", OutputPin::new("result", Celltype::Int))
        .code(Celltype::Text, "add")
        .value("a", Celltype::Int, json!(a))
        .value("b", Celltype::Int, json!(b))
}

/// Isolated workspace for running the `seamless` binary
#[allow(dead_code)]
pub struct TestWorkspace {
    temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestWorkspace {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        std::fs::create_dir_all(temp_dir.path().join("buffers")).unwrap();
        Self { temp_dir }
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.path().join("cache")
    }

    /// Read-only buffer folder passed to every command
    pub fn buffer_folder(&self) -> PathBuf {
        self.path().join("buffers")
    }

    /// Place a buffer in the buffer folder and return its checksum
    pub fn add_buffer(&self, buffer: &[u8]) -> Checksum {
        let checksum = calculate_checksum(buffer);
        std::fs::write(self.buffer_folder().join(checksum.to_hex()), buffer).unwrap();
        checksum
    }

    pub fn write_file(&self, name: &str, content: &str) -> PathBuf {
        let path = self.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    pub fn seamless(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_seamless"));
        cmd.current_dir(self.path())
            .env_remove("SEAMLESS_CONFIG")
            .env_remove("SEAMLESS_DATABASE")
            .env_remove("SEAMLESS_BUFFER_SERVER")
            .env("XDG_CONFIG_HOME", self.path().join("config"))
            .env("SEAMLESS_CACHE_DIR", self.cache_dir())
            .env("SEAMLESS_BUFFER_FOLDER", self.buffer_folder())
            .env("RUST_LOG", "warn");
        cmd
    }
}
