//! Python transformations, run by an external interpreter
//!
//! The semantic form of Python code drops comments, blank lines and
//! insignificant whitespace, and renders indentation as one tab per block
//! level. String literals are kept byte for byte.

use std::path::PathBuf;
use std::process::{Command, Stdio};

use anyhow::Context;
use serde_json::{json, Value as Json};
use tracing::debug;

use super::{LanguageRunner, RunContext, RunJob};
use crate::codec::{Celltype, Value};
use crate::error::{Result, SeamlessError};

const WRAPPER: &str = r#"
import ast, json, sys
with open(sys.argv[1]) as f:
    _args = json.load(f)
_inputs = _args["inputs"]
_output = _args["output"]
_tree = ast.parse(_args["code"], filename="transformer")
_ns = {"__name__": "transformer"}
_ns.update(_inputs)
exec(compile(_tree, "transformer", "exec"), _ns)
if _output in _ns and _output not in _inputs:
    _result = _ns[_output]
else:
    _funcs = [n.name for n in _tree.body if isinstance(n, ast.FunctionDef)]
    if len(_funcs) != 1:
        raise RuntimeError("Output variable name '%s' undefined" % _output)
    _result = _ns[_funcs[0]](**_inputs)
if _result is None:
    raise RuntimeError("Result is empty")
with open(sys.argv[2], "w") as f:
    json.dump(_result, f)
"#;

/// Runs Python code with `python3`
pub struct PythonRunner {
    interpreter: String,
}

impl Default for PythonRunner {
    fn default() -> Self {
        Self {
            interpreter: std::env::var("SEAMLESS_PYTHON").unwrap_or_else(|_| "python3".to_string()),
        }
    }
}

impl PythonRunner {
    pub fn new(interpreter: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
        }
    }

    fn interpreter_path(&self) -> PathBuf {
        which::which(&self.interpreter).unwrap_or_else(|_| PathBuf::from(&self.interpreter))
    }
}

impl LanguageRunner for PythonRunner {
    fn language(&self) -> &'static str {
        "python"
    }

    fn canonicalize(&self, source: &str) -> Result<String> {
        canonicalize_python(source)
    }

    fn run(&self, job: &RunJob, ctx: &RunContext) -> Result<Value> {
        let workdir = tempfile::tempdir()?;
        let args_path = workdir.path().join("args.json");
        let result_path = workdir.path().join("result.json");

        let inputs: serde_json::Map<String, Json> = job
            .inputs
            .iter()
            .map(|(name, input)| (name.clone(), input.value.to_json()))
            .collect();
        let args = json!({
            "inputs": inputs,
            "output": job.output.name,
            "code": job.code,
        });
        std::fs::write(&args_path, serde_json::to_vec(&args)?)?;

        let interpreter = self.interpreter_path();
        debug!(interpreter = %interpreter.display(), checksum = %job.tf_checksum.short(), "Running Python transformer");
        let output = Command::new(&interpreter)
            .arg("-c")
            .arg(WRAPPER)
            .arg(&args_path)
            .arg(&result_path)
            .current_dir(workdir.path())
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("Failed to spawn {}", interpreter.display()))?;

        ctx.log(&String::from_utf8_lossy(&output.stdout));
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            ctx.log(&stderr);
        }

        if !output.status.success() {
            return Err(SeamlessError::Transformation {
                checksum: job.tf_checksum,
                message: last_lines(&stderr, 20),
            });
        }

        let result: Json = serde_json::from_slice(&std::fs::read(&result_path)?)?;
        Ok(output_value(result, job.output.celltype))
    }
}

/// Shape a JSON result the way the output celltype expects it
pub(crate) fn output_value(result: Json, celltype: Celltype) -> Value {
    match (result, celltype) {
        (Json::String(s), c) if c.is_text() => Value::Text(s),
        (Json::String(s), Celltype::Bytes | Celltype::Binary) => Value::Bytes(s.into_bytes().into()),
        (other, _) => Value::Json(other),
    }
}

fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}

fn is_word(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '"' || c == '\'' || !c.is_ascii()
}

struct Canonicalizer {
    out: String,
    line: String,
    level: usize,
    pending_space: bool,
}

impl Canonicalizer {
    fn emit(&mut self, c: char) {
        if self.pending_space {
            if let Some(last) = self.line.chars().last() {
                if is_word(last) && is_word(c) {
                    self.line.push(' ');
                }
            }
        }
        self.line.push(c);
        self.pending_space = false;
    }

    fn flush(&mut self) {
        if !self.line.is_empty() {
            for _ in 0..self.level {
                self.out.push('\t');
            }
            self.out.push_str(&self.line);
            self.out.push('\n');
            self.line.clear();
        }
        self.pending_space = false;
    }
}

/// Semantic form of Python source
pub fn canonicalize_python(source: &str) -> Result<String> {
    let err = |reason: &str| SeamlessError::codec("python", reason);
    let chars: Vec<char> = source.chars().collect();
    let len = chars.len();
    let mut state = Canonicalizer {
        out: String::new(),
        line: String::new(),
        level: 0,
        pending_space: false,
    };
    let mut indents: Vec<usize> = vec![0];
    let mut depth = 0usize;
    let mut at_line_start = true;
    let mut i = 0;

    while i < len {
        if at_line_start {
            let mut width = 0;
            let mut j = i;
            while j < len && matches!(chars[j], ' ' | '\t' | '\x0c') {
                width = match chars[j] {
                    '\t' => (width / 8 + 1) * 8,
                    ' ' => width + 1,
                    _ => 0,
                };
                j += 1;
            }
            if j >= len || matches!(chars[j], '\n' | '\r' | '#') {
                while j < len && chars[j] != '\n' {
                    j += 1;
                }
                i = j + 1;
                continue;
            }
            let top = indents.last().copied().unwrap_or(0);
            if width > top {
                indents.push(width);
            } else {
                while width < indents.last().copied().unwrap_or(0) {
                    indents.pop();
                }
                if width != indents.last().copied().unwrap_or(0) {
                    return Err(err("unindent does not match any outer indentation level"));
                }
            }
            state.level = indents.len() - 1;
            at_line_start = false;
            i = j;
            continue;
        }

        let c = chars[i];
        match c {
            '#' => {
                while i < len && chars[i] != '\n' {
                    i += 1;
                }
            }
            '\\' if i + 1 < len && (chars[i + 1] == '\n' || (chars[i + 1] == '\r' && chars.get(i + 2) == Some(&'\n'))) => {
                state.pending_space = true;
                i += if chars[i + 1] == '\r' { 3 } else { 2 };
            }
            '\n' => {
                if depth > 0 {
                    state.pending_space = true;
                } else {
                    state.flush();
                    at_line_start = true;
                }
                i += 1;
            }
            ' ' | '\t' | '\r' | '\x0c' => {
                state.pending_space = true;
                i += 1;
            }
            '"' | '\'' => {
                let triple = chars.get(i + 1) == Some(&c) && chars.get(i + 2) == Some(&c);
                state.emit(c);
                if triple {
                    state.line.push(c);
                    state.line.push(c);
                    i += 3;
                } else {
                    i += 1;
                }
                loop {
                    if i >= len {
                        return Err(err("unterminated string literal"));
                    }
                    let s = chars[i];
                    if s == '\\' && i + 1 < len {
                        state.line.push(s);
                        state.line.push(chars[i + 1]);
                        i += 2;
                        continue;
                    }
                    if triple {
                        if s == c && chars.get(i + 1) == Some(&c) && chars.get(i + 2) == Some(&c) {
                            state.line.push_str(&c.to_string().repeat(3));
                            i += 3;
                            break;
                        }
                    } else if s == c {
                        state.line.push(s);
                        i += 1;
                        break;
                    } else if s == '\n' {
                        return Err(err("unterminated string literal"));
                    }
                    state.line.push(s);
                    i += 1;
                }
            }
            '(' | '[' | '{' => {
                depth += 1;
                state.emit(c);
                i += 1;
            }
            ')' | ']' | '}' => {
                depth = depth.checked_sub(1).ok_or_else(|| err("unmatched closing bracket"))?;
                state.emit(c);
                i += 1;
            }
            _ => {
                state.emit(c);
                i += 1;
            }
        }
    }

    if depth > 0 {
        return Err(err("unclosed bracket"));
    }
    state.flush();
    Ok(state.out)
}
