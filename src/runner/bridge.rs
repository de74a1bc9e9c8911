//! Language bridges
//!
//! Bash transformations are not run by a runner of their own. They are
//! rewritten into native transformations whose code names an executor
//! function, with the original script moved into an input pin. When the
//! environment asks for a container, the docker executor is used instead.

use std::collections::BTreeMap;

use serde_json::{json, Value as Json};

use super::bash::{docker_args, run_bash, run_bash_docker, DockerSpec};
use super::{NativeRunner, RunContext, RunInput, RunJob};
use crate::checksum::{calculate_checksum, Buffer, Checksum};
use crate::codec::{deserialize, serialize, Celltype, Value};
use crate::error::{Result, SeamlessError};
use crate::transformation::{OutputPin, Pin, Transformation, CODE_PIN};

pub const BASH_EXECUTOR: &str = "bash_transformer";
pub const BASHDOCKER_EXECUTOR: &str = "bashdocker_transformer";

const PINS_PIN: &str = "pins_";
const BASHCODE_PIN: &str = "bashcode";
const DOCKER_COMMAND_PIN: &str = "docker_command";
const DOCKER_IMAGE_PIN: &str = "docker_image_";
const DOCKER_OPTIONS_PIN: &str = "docker_options";

/// A rewritten transformation plus the buffers its new pins refer to
#[derive(Debug, Clone)]
pub struct Bridged {
    pub transformation: Transformation,
    pub buffers: Vec<(Checksum, Buffer)>,
    /// Recorded as "Language bridge" in the execution metadata
    pub metadata: Json,
}

struct Rewriter {
    transformation: Transformation,
    buffers: Vec<(Checksum, Buffer)>,
}

impl Rewriter {
    fn add_value(&mut self, name: &str, value: Value, celltype: Celltype) -> Result<Checksum> {
        let buffer = serialize(&value, celltype)?;
        let checksum = calculate_checksum(&buffer);
        self.buffers.push((checksum, buffer));
        self.transformation
            .pins
            .insert(name.to_string(), Pin::new(celltype, checksum));
        Ok(checksum)
    }
}

/// Whether a transformation must go through a bridge before it can run
pub fn needs_bridge(transformation: &Transformation) -> bool {
    transformation.language == "bash"
}

/// Rewrite a bash transformation into a native one
///
/// `env` is the deserialized `__env__` of the transformation, if any.
pub fn unbashify(transformation: &Transformation, env: Option<&Json>) -> Result<Bridged> {
    let code = transformation
        .code()
        .cloned()
        .ok_or_else(|| SeamlessError::InvalidTransformation("bash transformation without code".into()))?;

    let mut tf = transformation.clone();
    tf.language = "native".to_string();
    tf.output = OutputPin {
        name: "result".to_string(),
        ..transformation.output.clone()
    };
    tf.code_checksum = None;
    let pin_names: Vec<Json> = transformation
        .input_pins()
        .map(|(name, _)| Json::String(name.clone()))
        .collect();
    tf.pins.remove(CODE_PIN);

    let mut rewriter = Rewriter {
        transformation: tf,
        buffers: Vec::new(),
    };
    rewriter.add_value(PINS_PIN, Value::Json(Json::Array(pin_names)), Celltype::Plain)?;

    let docker = env.and_then(|env| env.get("docker")).filter(|d| !d.is_null()).cloned();
    let executor = match (&docker, env) {
        (Some(docker), Some(env)) => {
            let spec = DockerSpec::from_env(docker)?;
            let mut env = env.clone();
            if let Some(map) = env.as_object_mut() {
                map.remove("docker");
                let powers = map.entry("powers").or_insert_with(|| json!([]));
                if let Some(list) = powers.as_array_mut() {
                    list.push(json!("docker"));
                }
            }
            let env_buffer = serialize(&Value::Json(env), Celltype::Plain)?;
            let env_checksum = calculate_checksum(&env_buffer);
            rewriter.buffers.push((env_checksum, env_buffer));
            rewriter.transformation.dunder.env = Some(env_checksum);

            rewriter.add_value(DOCKER_IMAGE_PIN, Value::Json(json!(spec.image)), Celltype::Str)?;
            let options = docker.get("options").cloned().unwrap_or_else(|| json!({}));
            rewriter.add_value(DOCKER_OPTIONS_PIN, Value::Json(options), Celltype::Plain)?;
            rewriter
                .transformation
                .pins
                .insert(DOCKER_COMMAND_PIN.to_string(), code);
            BASHDOCKER_EXECUTOR
        }
        _ => {
            rewriter.transformation.pins.insert(BASHCODE_PIN.to_string(), code);
            BASH_EXECUTOR
        }
    };

    let executor_checksum =
        rewriter.add_value(CODE_PIN, Value::Text(executor.to_string()), Celltype::Text)?;

    Ok(Bridged {
        transformation: rewriter.transformation,
        buffers: rewriter.buffers,
        metadata: json!({
            "Source language": "bash",
            "Executor language": "native",
            "Executor": executor,
            "Executor checksum": executor_checksum.to_hex(),
        }),
    })
}

/// Pins listed in `pins_`, as the script sees them
fn script_pins(job: &RunJob) -> Result<BTreeMap<String, RunInput>> {
    let names = job.json(PINS_PIN)?;
    let names = names
        .as_array()
        .ok_or_else(|| SeamlessError::InvalidTransformation("pins_ must be a list".into()))?;
    let mut pins = BTreeMap::new();
    for name in names.iter().filter_map(Json::as_str) {
        if let Some(input) = job.inputs.get(name) {
            pins.insert(name.to_string(), input.clone());
        }
    }
    Ok(pins)
}

/// Shell output as a value of the output celltype
fn shell_output(raw: Vec<u8>, celltype: Celltype) -> Result<Value> {
    if celltype.is_text() {
        return Ok(Value::Text(String::from_utf8_lossy(&raw).into_owned()));
    }
    match celltype {
        Celltype::Bytes | Celltype::Binary => Ok(Value::Bytes(raw.into())),
        _ => deserialize(&raw, None, celltype),
    }
}

fn bash_executor(job: &RunJob, ctx: &RunContext) -> Result<Value> {
    let script = job.text(BASHCODE_PIN)?;
    let pins = script_pins(job)?;
    let raw = run_bash(&job.tf_checksum, &script, &pins, ctx)?;
    shell_output(raw, job.output.celltype)
}

fn bashdocker_executor(job: &RunJob, ctx: &RunContext) -> Result<Value> {
    let script = job.text(DOCKER_COMMAND_PIN)?;
    let pins = script_pins(job)?;
    let docker = DockerSpec {
        image: job.text(DOCKER_IMAGE_PIN)?,
        args: docker_args(&job.json(DOCKER_OPTIONS_PIN)?),
    };
    let raw = run_bash_docker(&job.tf_checksum, &docker, &script, &pins, ctx)?;
    shell_output(raw, job.output.celltype)
}

/// Make the bridge executors available to native transformations
pub fn register_executors(native: &NativeRunner) {
    native.register(BASH_EXECUTOR, bash_executor);
    native.register(BASHDOCKER_EXECUTOR, bashdocker_executor);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bash_tf() -> Transformation {
        let code = calculate_checksum(b"echo $(cat a)\n");
        Transformation::new("bash", OutputPin::new("out", Celltype::Text))
            .with_pin(CODE_PIN, Pin::new(Celltype::Text, code))
            .with_pin("a", Pin::new(Celltype::Int, calculate_checksum(b"2\n")))
    }

    #[test]
    fn test_unbashify_rewrites_to_native() {
        let original = bash_tf();
        let bridged = unbashify(&original, None).unwrap();
        let tf = &bridged.transformation;
        assert_eq!(tf.language, "native");
        assert_eq!(tf.output.name, "result");
        assert_eq!(tf.pins[BASHCODE_PIN], original.pins[CODE_PIN]);
        assert!(tf.pins.contains_key(PINS_PIN));
        assert_eq!(tf.pins["a"], original.pins["a"]);
        assert_eq!(bridged.metadata["Executor"], BASH_EXECUTOR);

        let code_buffer = bridged
            .buffers
            .iter()
            .find(|(cs, _)| Some(*cs) == tf.pins[CODE_PIN].checksum)
            .map(|(_, b)| b.clone())
            .unwrap();
        assert_eq!(&code_buffer[..], b"bash_transformer\n");
    }

    #[test]
    fn test_unbashify_with_docker_environment() {
        let env = json!({"docker": {"name": "ubuntu:22.04"}, "powers": ["ipython"]});
        let bridged = unbashify(&bash_tf(), Some(&env)).unwrap();
        let tf = &bridged.transformation;
        assert!(tf.pins.contains_key(DOCKER_COMMAND_PIN));
        assert!(tf.pins.contains_key(DOCKER_IMAGE_PIN));
        assert!(!tf.pins.contains_key(BASHCODE_PIN));
        assert_eq!(bridged.metadata["Executor"], BASHDOCKER_EXECUTOR);

        let env_checksum = tf.dunder.env.unwrap();
        let (_, env_buffer) = bridged.buffers.iter().find(|(cs, _)| *cs == env_checksum).unwrap();
        let new_env: Json = serde_json::from_slice(env_buffer).unwrap();
        assert_eq!(new_env["powers"], json!(["ipython", "docker"]));
        assert!(new_env.get("docker").is_none());
    }

    #[test]
    fn test_shell_output_conversion() {
        assert_eq!(shell_output(b"5\n".to_vec(), Celltype::Int).unwrap(), Value::Json(json!(5)));
        assert_eq!(
            shell_output(b"hi\n".to_vec(), Celltype::Text).unwrap(),
            Value::Text("hi\n".to_string())
        );
        assert!(shell_output(b"x".to_vec(), Celltype::Int).is_err());
    }

    #[test]
    fn test_needs_bridge() {
        assert!(needs_bridge(&bash_tf()));
        let mut tf = bash_tf();
        tf.language = "python".to_string();
        assert!(!needs_bridge(&tf));
    }
}
