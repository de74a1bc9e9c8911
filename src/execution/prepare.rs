//! Turning a [`TransformationDraft`] into a submittable transformation
//!
//! Inline values are serialized with their pin celltype. Code whose celltype
//! has a semantic form is keyed by the checksum of that form; the syntactic
//! buffer is kept so the engine can hand the original text to the runner.

use crate::checksum::{calculate_checksum, Buffer, Checksum};
use crate::codec::{serialize, Celltype, Value};
use crate::error::{Result, SeamlessError};
use crate::runner::RunnerRegistry;
use crate::transformation::{
    transformation_checksum, Pin, PinValue, Transformation, TransformationDraft, CODE_PIN,
};

/// A syntactic checksum and the semantic checksum it maps to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SemanticPair {
    pub syntactic: Checksum,
    pub semantic: Checksum,
    pub celltype: Celltype,
    pub subcelltype: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PreparedTransformation {
    pub checksum: Checksum,
    pub transformation: Transformation,
    /// Buffers of inline values, both syntactic and semantic forms
    pub buffers: Vec<(Checksum, Buffer)>,
    pub semantic_pairs: Vec<SemanticPair>,
}

/// Buffer of an inline value and, when it differs, the buffer of its semantic form
pub fn semantic_buffers(
    value: &Value,
    celltype: Celltype,
    runners: &RunnerRegistry,
) -> Result<(Buffer, Option<Buffer>)> {
    let buffer = serialize(value, celltype)?;
    if celltype.syntactic_is_semantic() {
        return Ok((buffer, None));
    }
    let source = std::str::from_utf8(&buffer).map_err(|e| SeamlessError::codec(celltype.as_str(), e))?;
    let Some(canonical) = runners.canonicalize(celltype, source)? else {
        return Ok((buffer, None));
    };
    let semantic = serialize(&Value::Text(canonical), celltype)?;
    if semantic == buffer {
        return Ok((buffer, None));
    }
    Ok((buffer, Some(semantic)))
}

/// Resolve every inline value of a draft to a checksum
///
/// Pins that refer to other drafts must have been computed already; the
/// service replaces them with result checksums before calling this.
pub fn prepare_draft(draft: &TransformationDraft, runners: &RunnerRegistry) -> Result<PreparedTransformation> {
    let mut transformation = Transformation::new(draft.language.clone(), draft.output.clone());
    transformation.dunder = draft.dunder.clone();
    let mut buffers = Vec::new();
    let mut semantic_pairs = Vec::new();

    for (name, (celltype, subcelltype, value)) in &draft.pins {
        let checksum = match value {
            PinValue::Checksum(checksum) => *checksum,
            PinValue::Value(value) => {
                let (buffer, semantic) = semantic_buffers(value, *celltype, runners)?;
                let syntactic = calculate_checksum(&buffer);
                buffers.push((syntactic, buffer));
                match semantic {
                    Some(semantic_buffer) => {
                        let semantic = calculate_checksum(&semantic_buffer);
                        buffers.push((semantic, semantic_buffer));
                        semantic_pairs.push(SemanticPair {
                            syntactic,
                            semantic,
                            celltype: *celltype,
                            subcelltype: subcelltype.clone(),
                        });
                        if name == CODE_PIN {
                            transformation.code_checksum = Some(syntactic);
                        }
                        semantic
                    }
                    None => syntactic,
                }
            }
            PinValue::Transformation(_) => {
                return Err(SeamlessError::InvalidTransformation(format!(
                    "pin '{name}' still refers to an unevaluated transformation"
                )))
            }
        };
        let mut pin = Pin::new(*celltype, checksum);
        pin.subcelltype = subcelltype.clone();
        transformation.pins.insert(name.clone(), pin);
    }

    Ok(PreparedTransformation {
        checksum: transformation_checksum(&transformation),
        transformation,
        buffers,
        semantic_pairs,
    })
}
