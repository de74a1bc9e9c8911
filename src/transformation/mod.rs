//! Transformation dicts
//!
//! A transformation maps argument names to `[celltype, subcelltype, checksum]`
//! pins. Keys starting with `__` carry the output declaration, the language
//! and metadata. Only some of those keys contribute to the transformation
//! checksum; see [`canonical`].

pub mod canonical;
pub mod semantic;

pub use canonical::{register_transformation_dict, tf_get_buffer, transformation_checksum};
pub use semantic::{SemanticKey, SemanticRegistry};

use std::collections::BTreeMap;

use serde_json::{Map, Value as Json};

use crate::checksum::Checksum;
use crate::codec::{Celltype, Value};
use crate::error::{Result, SeamlessError};

pub const LANGUAGE: &str = "__language__";
pub const OUTPUT: &str = "__output__";
pub const AS: &str = "__as__";
pub const FORMAT: &str = "__format__";
pub const META: &str = "__meta__";
pub const ENV: &str = "__env__";
pub const COMPILERS: &str = "__compilers__";
pub const LANGUAGES: &str = "__languages__";
pub const CODE_CHECKSUM: &str = "__code_checksum__";
pub const HASH_PATTERN: &str = "__hash_pattern__";
const SPECIAL_PREFIX: &str = "SPECIAL__";

/// Name of the pin that holds the transformer code
pub const CODE_PIN: &str = "code";

/// One input argument: celltype, subcelltype and semantic checksum
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pin {
    pub celltype: Celltype,
    pub subcelltype: Option<String>,
    pub checksum: Option<Checksum>,
}

impl Pin {
    pub fn new(celltype: Celltype, checksum: Checksum) -> Self {
        Self {
            celltype,
            subcelltype: None,
            checksum: Some(checksum),
        }
    }

    pub fn with_subcelltype(mut self, subcelltype: impl Into<String>) -> Self {
        self.subcelltype = Some(subcelltype.into());
        self
    }

    /// Whether the pin checksum may differ from the byte checksum of its buffer
    pub fn is_semantic(&self) -> bool {
        !self.celltype.syntactic_is_semantic()
    }

    fn to_json(&self) -> Json {
        Json::Array(vec![
            Json::String(self.celltype.to_string()),
            self.subcelltype.clone().map(Json::String).unwrap_or(Json::Null),
            self.checksum.map(|c| Json::String(c.to_hex())).unwrap_or(Json::Null),
        ])
    }

    fn from_json(name: &str, value: &Json) -> Result<Self> {
        let items = value
            .as_array()
            .filter(|items| items.len() == 3)
            .ok_or_else(|| invalid(format!("pin '{name}' must be [celltype, subcelltype, checksum]")))?;
        let celltype = items[0]
            .as_str()
            .ok_or_else(|| invalid(format!("pin '{name}' has no celltype")))?
            .parse()?;
        let subcelltype = match &items[1] {
            Json::Null => None,
            Json::String(s) => Some(s.clone()),
            _ => return Err(invalid(format!("pin '{name}' has a malformed subcelltype"))),
        };
        let checksum = Checksum::parse_optional(items[2].as_str())?;
        Ok(Self {
            celltype,
            subcelltype,
            checksum,
        })
    }
}

/// The `__output__` declaration: `(name, celltype, subcelltype[, hash_pattern])`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPin {
    pub name: String,
    pub celltype: Celltype,
    pub subcelltype: Option<String>,
    pub hash_pattern: Option<Json>,
}

impl OutputPin {
    pub fn new(name: impl Into<String>, celltype: Celltype) -> Self {
        Self {
            name: name.into(),
            celltype,
            subcelltype: None,
            hash_pattern: None,
        }
    }

    fn to_json(&self) -> Json {
        let mut items = vec![
            Json::String(self.name.clone()),
            Json::String(self.celltype.to_string()),
            self.subcelltype.clone().map(Json::String).unwrap_or(Json::Null),
        ];
        if let Some(hash_pattern) = &self.hash_pattern {
            items.push(hash_pattern.clone());
        }
        Json::Array(items)
    }

    fn from_json(value: &Json) -> Result<Self> {
        let items = value
            .as_array()
            .filter(|items| items.len() == 3 || items.len() == 4)
            .ok_or_else(|| invalid("__output__ must have 3 or 4 items"))?;
        let name = items[0]
            .as_str()
            .ok_or_else(|| invalid("__output__ name must be a string"))?
            .to_string();
        let celltype = items[1]
            .as_str()
            .ok_or_else(|| invalid("__output__ celltype must be a string"))?
            .parse()?;
        let subcelltype = items[2].as_str().map(str::to_string);
        let hash_pattern = items.get(3).filter(|h| !h.is_null()).cloned();
        Ok(Self {
            name,
            celltype,
            subcelltype,
            hash_pattern,
        })
    }
}

/// Fields that travel with a transformation but do not change its checksum
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransformationDunder {
    pub meta: Option<Json>,
    pub env: Option<Checksum>,
    pub compilers: Option<Json>,
    pub languages: Option<Json>,
}

impl TransformationDunder {
    pub fn is_empty(&self) -> bool {
        self.meta.is_none() && self.env.is_none() && self.compilers.is_none() && self.languages.is_none()
    }

    pub fn to_json(&self) -> Json {
        let mut map = Map::new();
        if let Some(meta) = &self.meta {
            map.insert(META.to_string(), meta.clone());
        }
        if let Some(env) = &self.env {
            map.insert(ENV.to_string(), Json::String(env.to_hex()));
        }
        if let Some(compilers) = &self.compilers {
            map.insert(COMPILERS.to_string(), compilers.clone());
        }
        if let Some(languages) = &self.languages {
            map.insert(LANGUAGES.to_string(), languages.clone());
        }
        Json::Object(map)
    }

    pub fn from_json(value: &Json) -> Result<Self> {
        let map = match value {
            Json::Null => return Ok(Self::default()),
            Json::Object(map) => map,
            _ => return Err(invalid("dunder must be an object")),
        };
        Ok(Self {
            meta: map.get(META).cloned(),
            env: Checksum::parse_optional(map.get(ENV).and_then(Json::as_str))?,
            compilers: map.get(COMPILERS).cloned(),
            languages: map.get(LANGUAGES).cloned(),
        })
    }

    /// Value of a `__meta__` entry
    pub fn meta_flag(&self, key: &str) -> Option<&Json> {
        self.meta.as_ref().and_then(|m| m.get(key))
    }
}

/// A transformation dict with all arguments resolved to checksums
#[derive(Debug, Clone, PartialEq)]
pub struct Transformation {
    pub language: String,
    pub output: OutputPin,
    pub pins: BTreeMap<String, Pin>,
    pub as_: Option<Json>,
    pub format: Option<Json>,
    pub dunder: TransformationDunder,
    /// Syntactic checksum of the code pin, when it differs from the semantic one
    pub code_checksum: Option<Checksum>,
    /// `SPECIAL__*` entries; carried along but never hashed
    pub special: BTreeMap<String, Json>,
}

impl Transformation {
    pub fn new(language: impl Into<String>, output: OutputPin) -> Self {
        Self {
            language: language.into(),
            output,
            pins: BTreeMap::new(),
            as_: None,
            format: None,
            dunder: TransformationDunder::default(),
            code_checksum: None,
            special: BTreeMap::new(),
        }
    }

    pub fn with_pin(mut self, name: impl Into<String>, pin: Pin) -> Self {
        self.pins.insert(name.into(), pin);
        self
    }

    pub fn code(&self) -> Option<&Pin> {
        self.pins.get(CODE_PIN)
    }

    /// Parse a transformation dict, such as the JSON buffer of a transformation
    pub fn from_json(value: &Json) -> Result<Self> {
        let map = value
            .as_object()
            .ok_or_else(|| invalid("transformation must be a JSON object"))?;

        let language = map
            .get(LANGUAGE)
            .and_then(Json::as_str)
            .unwrap_or("python")
            .to_string();
        let output = OutputPin::from_json(map.get(OUTPUT).ok_or_else(|| invalid("missing __output__"))?)?;

        let mut transformation = Transformation::new(language, output);
        transformation.dunder = TransformationDunder::from_json(value)?;
        transformation.as_ = map.get(AS).cloned();
        transformation.format = map.get(FORMAT).cloned();
        transformation.code_checksum = Checksum::parse_optional(map.get(CODE_CHECKSUM).and_then(Json::as_str))?;

        for (key, value) in map {
            if key.starts_with(SPECIAL_PREFIX) {
                transformation.special.insert(key.clone(), value.clone());
                continue;
            }
            if key.starts_with("__") {
                if key == HASH_PATTERN {
                    transformation.special.insert(key.clone(), value.clone());
                }
                continue;
            }
            transformation.pins.insert(key.clone(), Pin::from_json(key, value)?);
        }
        Ok(transformation)
    }

    /// Full dict, including fields that do not contribute to the checksum
    pub fn to_json(&self) -> Json {
        let mut map = match self.dunder.to_json() {
            Json::Object(map) => map,
            _ => Map::new(),
        };
        if let Some(code_checksum) = &self.code_checksum {
            map.insert(CODE_CHECKSUM.to_string(), Json::String(code_checksum.to_hex()));
        }
        for (key, value) in &self.special {
            map.insert(key.clone(), value.clone());
        }
        if let Json::Object(hashed) = canonical::canonical_json(self) {
            map.extend(hashed);
        }
        Json::Object(map)
    }

    /// Overlay dunder fields; only the fields that are set replace existing ones
    pub fn apply_dunder(&mut self, dunder: &TransformationDunder) {
        if dunder.meta.is_some() {
            self.dunder.meta = dunder.meta.clone();
        }
        if dunder.env.is_some() {
            self.dunder.env = dunder.env;
        }
        if dunder.compilers.is_some() {
            self.dunder.compilers = dunder.compilers.clone();
        }
        if dunder.languages.is_some() {
            self.dunder.languages = dunder.languages.clone();
        }
    }

    /// Deep-structure outputs cannot be computed by this engine
    pub fn is_deep(&self) -> bool {
        self.output.hash_pattern.is_some() || self.special.contains_key(HASH_PATTERN)
    }

    /// Name under which a pin is exposed to the code (`__as__` renames)
    pub fn exposed_name<'a>(&'a self, pin: &'a str) -> &'a str {
        self.as_
            .as_ref()
            .and_then(|a| a.get(pin))
            .and_then(Json::as_str)
            .unwrap_or(pin)
    }

    /// Pins in a stable order, excluding the code
    pub fn input_pins(&self) -> impl Iterator<Item = (&String, &Pin)> {
        self.pins.iter().filter(|(name, _)| name.as_str() != CODE_PIN)
    }
}

/// What a pin of a [`TransformationDraft`] refers to before submission
#[derive(Debug, Clone)]
pub enum PinValue {
    Checksum(Checksum),
    /// Inline value, serialized with the pin celltype on preparation
    Value(Value),
    /// The result of another transformation, computed first
    Transformation(Box<TransformationDraft>),
}

/// A transformation whose arguments may still be values or other transformations
#[derive(Debug, Clone)]
pub struct TransformationDraft {
    pub language: String,
    pub output: OutputPin,
    pub pins: BTreeMap<String, (Celltype, Option<String>, PinValue)>,
    pub dunder: TransformationDunder,
}

impl TransformationDraft {
    pub fn new(language: impl Into<String>, output: OutputPin) -> Self {
        Self {
            language: language.into(),
            output,
            pins: BTreeMap::new(),
            dunder: TransformationDunder::default(),
        }
    }

    /// Code pin; python code gets the "transformer" subcelltype
    pub fn code(mut self, celltype: Celltype, source: impl Into<String>) -> Self {
        let subcelltype = (celltype == Celltype::Python).then(|| "transformer".to_string());
        self.pins.insert(
            CODE_PIN.to_string(),
            (celltype, subcelltype, PinValue::Value(Value::Text(source.into()))),
        );
        self
    }

    pub fn pin(mut self, name: impl Into<String>, celltype: Celltype, value: PinValue) -> Self {
        self.pins.insert(name.into(), (celltype, None, value));
        self
    }

    pub fn value(self, name: impl Into<String>, celltype: Celltype, value: impl Into<Value>) -> Self {
        self.pin(name, celltype, PinValue::Value(value.into()))
    }

    pub fn meta(mut self, meta: Json) -> Self {
        self.dunder.meta = Some(meta);
        self
    }
}

fn invalid(message: impl Into<String>) -> SeamlessError {
    SeamlessError::InvalidTransformation(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Json {
        json!({
            "__language__": "python",
            "__output__": ["result", "int", null],
            "__meta__": {"duration": "short"},
            "code": ["python", "transformer", "a".repeat(64)],
            "a": ["int", null, "b".repeat(64)],
            "SPECIAL__debug": true,
        })
    }

    #[test]
    fn test_parse_and_render() {
        let tf = Transformation::from_json(&sample()).unwrap();
        assert_eq!(tf.language, "python");
        assert_eq!(tf.output.name, "result");
        assert_eq!(tf.output.celltype, Celltype::Int);
        assert_eq!(tf.pins.len(), 2);
        assert_eq!(tf.code().unwrap().subcelltype.as_deref(), Some("transformer"));
        assert!(tf.special.contains_key("SPECIAL__debug"));
        assert_eq!(tf.dunder.meta, Some(json!({"duration": "short"})));

        let back = Transformation::from_json(&tf.to_json()).unwrap();
        assert_eq!(back, tf);
    }

    #[test]
    fn test_malformed_pin_is_rejected() {
        let bad = json!({"__output__": ["result", "int", null], "a": ["int", null]});
        assert!(matches!(
            Transformation::from_json(&bad),
            Err(SeamlessError::InvalidTransformation(_))
        ));
        let bad_checksum = json!({"__output__": ["result", "int", null], "a": ["int", null, "xyz"]});
        assert!(matches!(
            Transformation::from_json(&bad_checksum),
            Err(SeamlessError::InvalidChecksum(_))
        ));
    }

    #[test]
    fn test_apply_dunder_overlays_set_fields() {
        let mut tf = Transformation::from_json(&sample()).unwrap();
        let dunder = TransformationDunder {
            languages: Some(json!({"rust": {}})),
            ..Default::default()
        };
        tf.apply_dunder(&dunder);
        assert!(tf.dunder.meta.is_some());
        assert!(tf.dunder.languages.is_some());
    }

    #[test]
    fn test_exposed_name_follows_as() {
        let mut tf = Transformation::from_json(&sample()).unwrap();
        tf.as_ = Some(json!({"a": "alpha"}));
        assert_eq!(tf.exposed_name("a"), "alpha");
        assert_eq!(tf.exposed_name("code"), "code");
    }
}
