//! Shell execution for bash transformations
//!
//! Every pin is written as a file named after the pin in a fresh working
//! directory. The result is the `RESULT` file if the script creates one,
//! and its stdout otherwise.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use anyhow::Context;
use serde_json::Value as Json;
use tracing::debug;

use super::{RunContext, RunInput};
use crate::checksum::Checksum;
use crate::codec::{Celltype, Value};
use crate::error::{Result, SeamlessError};

const RESULT_FILE: &str = "RESULT";

/// Mount point of the working directory inside a container
const CONTAINER_WORKDIR: &str = "/seamless";

/// Container image and extra `docker run` arguments
#[derive(Debug, Clone, PartialEq)]
pub struct DockerSpec {
    pub image: String,
    pub args: Vec<String>,
}

impl DockerSpec {
    /// Read `{"name": ..., "options": {"args": [...]}}` as found in an environment
    pub fn from_env(docker: &Json) -> Result<Self> {
        let image = docker
            .get("name")
            .and_then(Json::as_str)
            .ok_or_else(|| SeamlessError::InvalidTransformation("docker environment without image name".into()))?
            .to_string();
        let args = docker
            .get("options")
            .map(docker_args)
            .unwrap_or_default();
        Ok(Self { image, args })
    }
}

pub(crate) fn docker_args(options: &Json) -> Vec<String> {
    options
        .get("args")
        .and_then(Json::as_array)
        .map(|args| args.iter().filter_map(Json::as_str).map(str::to_string).collect())
        .unwrap_or_default()
}

/// File content of a pin
fn pin_content(input: &RunInput) -> Vec<u8> {
    match (input.celltype, input.value.as_ref()) {
        (Celltype::Str, Value::Json(Json::String(s))) => s.as_bytes().to_vec(),
        _ => input.buffer.to_vec(),
    }
}

fn write_pins(dir: &Path, pins: &BTreeMap<String, RunInput>) -> Result<()> {
    for (name, input) in pins {
        if name.contains('/') || name.starts_with('.') {
            return Err(SeamlessError::InvalidTransformation(format!(
                "pin name '{name}' cannot be used as a file name"
            )));
        }
        std::fs::write(dir.join(name), pin_content(input))
            .with_context(|| format!("Failed to write pin file '{name}'"))?;
    }
    Ok(())
}

fn collect_result(tf_checksum: &Checksum, dir: &Path, output: Output, ctx: &RunContext) -> Result<Vec<u8>> {
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    if !stderr.is_empty() {
        ctx.log(&stderr);
    }
    if !output.status.success() {
        let code = output.status.code().unwrap_or(-1);
        return Err(SeamlessError::Transformation {
            checksum: *tf_checksum,
            message: format!("bash transformer exited with code {code}\n{stderr}"),
        });
    }
    let result_path = dir.join(RESULT_FILE);
    if result_path.is_file() {
        ctx.log(&String::from_utf8_lossy(&output.stdout));
        return Ok(std::fs::read(&result_path)?);
    }
    if result_path.exists() {
        return Err(SeamlessError::Transformation {
            checksum: *tf_checksum,
            message: "RESULT must be a file".to_string(),
        });
    }
    Ok(output.stdout)
}

fn bash_path() -> PathBuf {
    which::which("bash").unwrap_or_else(|_| PathBuf::from("/bin/bash"))
}

/// Run a bash script against the given pins
pub fn run_bash(
    tf_checksum: &Checksum,
    script: &str,
    pins: &BTreeMap<String, RunInput>,
    ctx: &RunContext,
) -> Result<Vec<u8>> {
    let workdir = tempfile::tempdir()?;
    write_pins(workdir.path(), pins)?;

    debug!(checksum = %tf_checksum.short(), pins = pins.len(), "Running bash transformer");
    let output = Command::new(bash_path())
        .arg("-c")
        .arg(script)
        .current_dir(workdir.path())
        .stdin(Stdio::null())
        .output()
        .context("Failed to spawn bash")?;
    collect_result(tf_checksum, workdir.path(), output, ctx)
}

/// Run a bash script inside a container, with the pins mounted as the working directory
pub fn run_bash_docker(
    tf_checksum: &Checksum,
    docker: &DockerSpec,
    script: &str,
    pins: &BTreeMap<String, RunInput>,
    ctx: &RunContext,
) -> Result<Vec<u8>> {
    let workdir = tempfile::tempdir()?;
    write_pins(workdir.path(), pins)?;

    let docker_bin = which::which("docker").map_err(|e| SeamlessError::Transformation {
        checksum: *tf_checksum,
        message: format!("docker is not available: {e}"),
    })?;
    let mount = format!("{}:{}", workdir.path().display(), CONTAINER_WORKDIR);

    debug!(checksum = %tf_checksum.short(), image = %docker.image, "Running bash transformer in container");
    let output = Command::new(docker_bin)
        .args(["run", "--rm", "-v", &mount, "-w", CONTAINER_WORKDIR])
        .args(&docker.args)
        .arg(&docker.image)
        .args(["bash", "-c", script])
        .stdin(Stdio::null())
        .output()
        .context("Failed to spawn docker")?;
    collect_result(tf_checksum, workdir.path(), output, ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::calculate_checksum;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn input(celltype: Celltype, buffer: &'static [u8], value: Value) -> RunInput {
        RunInput {
            celltype,
            subcelltype: None,
            checksum: calculate_checksum(buffer),
            buffer: bytes::Bytes::from_static(buffer),
            value: Arc::new(value),
        }
    }

    fn ctx() -> RunContext {
        RunContext::new(calculate_checksum(b"tf"), Arc::new(AtomicBool::new(false)))
    }

    #[test]
    fn test_stdout_is_the_result() {
        let mut pins = BTreeMap::new();
        pins.insert("a".to_string(), input(Celltype::Int, b"2\n", Value::Json(json!(2))));
        pins.insert(
            "name".to_string(),
            input(Celltype::Str, b"\"world\"\n", Value::Json(json!("world"))),
        );
        let out = run_bash(&calculate_checksum(b"tf"), "echo $(cat a) $(cat name)", &pins, &ctx()).unwrap();
        assert_eq!(out, b"2 world\n");
    }

    #[test]
    fn test_result_file_wins_over_stdout() {
        let pins = BTreeMap::new();
        let context = ctx();
        let out = run_bash(
            &calculate_checksum(b"tf"),
            "echo noise; printf done > RESULT",
            &pins,
            &context,
        )
        .unwrap();
        assert_eq!(out, b"done");
        assert_eq!(context.take_logs(), "noise\n");
    }

    #[test]
    fn test_failure_reports_exit_code() {
        let err = run_bash(&calculate_checksum(b"tf"), "echo bad >&2; exit 3", &BTreeMap::new(), &ctx())
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("code 3"));
        assert!(message.contains("bad"));
    }

    #[test]
    fn test_docker_spec_from_env() {
        let spec = DockerSpec::from_env(&json!({"name": "ubuntu", "options": {"args": ["--network", "none"]}}))
            .unwrap();
        assert_eq!(spec.image, "ubuntu");
        assert_eq!(spec.args, vec!["--network", "none"]);
        assert!(DockerSpec::from_env(&json!({})).is_err());
    }
}
