//! Celltype-aware conversion between values and buffers
//!
//! A celltype decides how a buffer turns into a value. JSON-like celltypes
//! are stored as sorted, indented JSON followed by a newline; text celltypes
//! are stored as UTF-8 with exactly one trailing newline; byte celltypes are
//! stored raw.
//!
//! Deserialization yields one canonical variant per celltype: JSON-like
//! celltypes give [`Value::Json`] (a string under `str`, `plain` or `mixed`
//! is `Value::Json(Json::String)`, never `Value::Text`), text celltypes give
//! [`Value::Text`] and byte celltypes give [`Value::Bytes`]. A value therefore
//! comes back from a round trip in its canonical variant, and text comes back
//! with its single trailing newline. Serializing a deserialized canonical
//! buffer reproduces it byte for byte.

mod cache;
mod json;

pub use cache::DeserializeCache;
pub use json::{json_buffer, json_dumps};

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde_json::Value as Json;

use crate::checksum::{calculate_checksum, Buffer, Checksum};
use crate::error::{Result, SeamlessError};

/// Tag describing how a buffer deserializes into a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Celltype {
    Plain,
    Mixed,
    Binary,
    Bytes,
    Str,
    Int,
    Float,
    Bool,
    Checksum,
    Text,
    Python,
    IPython,
    Cson,
    Yaml,
}

impl Celltype {
    pub fn as_str(&self) -> &'static str {
        match self {
            Celltype::Plain => "plain",
            Celltype::Mixed => "mixed",
            Celltype::Binary => "binary",
            Celltype::Bytes => "bytes",
            Celltype::Str => "str",
            Celltype::Int => "int",
            Celltype::Float => "float",
            Celltype::Bool => "bool",
            Celltype::Checksum => "checksum",
            Celltype::Text => "text",
            Celltype::Python => "python",
            Celltype::IPython => "ipython",
            Celltype::Cson => "cson",
            Celltype::Yaml => "yaml",
        }
    }

    /// Source-like celltypes, stored as text with one trailing newline
    pub fn is_text(&self) -> bool {
        matches!(
            self,
            Celltype::Text | Celltype::Python | Celltype::IPython | Celltype::Cson | Celltype::Yaml
        )
    }

    /// Celltypes whose buffers are verified against their checksum on deserialization
    pub fn is_validated(&self) -> bool {
        !matches!(self, Celltype::Bytes | Celltype::Binary | Celltype::Mixed)
    }

    /// Whether the byte checksum of a value of this celltype is also its semantic checksum
    pub fn syntactic_is_semantic(&self) -> bool {
        !matches!(self, Celltype::Cson | Celltype::Yaml | Celltype::Python)
    }
}

impl fmt::Display for Celltype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Celltype {
    type Err = SeamlessError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "plain" => Celltype::Plain,
            "mixed" | "silk" => Celltype::Mixed,
            "binary" => Celltype::Binary,
            "bytes" => Celltype::Bytes,
            "str" => Celltype::Str,
            "int" => Celltype::Int,
            "float" => Celltype::Float,
            "bool" => Celltype::Bool,
            "checksum" => Celltype::Checksum,
            "text" => Celltype::Text,
            "python" => Celltype::Python,
            "ipython" => Celltype::IPython,
            "cson" => Celltype::Cson,
            "yaml" => Celltype::Yaml,
            other => return Err(SeamlessError::codec(other, "unknown celltype")),
        })
    }
}

/// A deserialized cell value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Json(Json),
    Text(String),
    Bytes(Bytes),
}

impl Value {
    pub fn as_json(&self) -> Option<&Json> {
        match self {
            Value::Json(json) => Some(json),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(text) => Some(text),
            Value::Json(Json::String(text)) => Some(text),
            _ => None,
        }
    }

    /// JSON rendering used when a value crosses into a runner
    pub fn to_json(&self) -> Json {
        match self {
            Value::Json(json) => json.clone(),
            Value::Text(text) => Json::String(text.clone()),
            Value::Bytes(bytes) => match std::str::from_utf8(bytes) {
                Ok(text) => Json::String(text.to_string()),
                Err(_) => Json::Array(bytes.iter().map(|b| Json::from(*b)).collect()),
            },
        }
    }
}

impl From<Json> for Value {
    fn from(json: Json) -> Self {
        Value::Json(json)
    }
}

/// Convert a value into its buffer for the given celltype
pub fn serialize(value: &Value, celltype: Celltype) -> Result<Buffer> {
    let buffer = match celltype {
        Celltype::Str => {
            let text = match value {
                Value::Json(Json::Bool(b)) => Json::Bool(*b),
                Value::Json(Json::String(s)) => Json::String(s.clone()),
                Value::Json(other) => Json::String(other.to_string()),
                Value::Text(s) => Json::String(s.clone()),
                Value::Bytes(b) => Json::String(utf8(b, celltype)?.to_string()),
            };
            json_buffer(&text)
        }
        Celltype::Int => json_buffer(&Json::from(to_int(value)?)),
        Celltype::Float => {
            let number = to_float(value)?;
            let json = serde_json::Number::from_f64(number)
                .map(Json::Number)
                .ok_or_else(|| SeamlessError::codec(celltype.as_str(), "non-finite float"))?;
            json_buffer(&json)
        }
        Celltype::Bool => json_buffer(&Json::Bool(to_bool(value)?)),
        Celltype::Text | Celltype::Python | Celltype::IPython | Celltype::Cson | Celltype::Yaml => {
            let text = match value {
                Value::Text(s) | Value::Json(Json::String(s)) => s.clone(),
                Value::Json(other) => json_dumps(other),
                Value::Bytes(b) => utf8(b, celltype)?.to_string(),
            };
            let mut text = text.trim_end_matches('\n').to_string();
            text.push('\n');
            text.into_bytes()
        }
        Celltype::Plain => match value {
            Value::Json(json) => json_buffer(json),
            Value::Text(s) => json_buffer(&Json::String(s.clone())),
            Value::Bytes(_) => {
                return Err(SeamlessError::codec(
                    celltype.as_str(),
                    "raw bytes are not JSON-serializable",
                ))
            }
        },
        Celltype::Checksum => {
            let json = value.to_json();
            validate_checksum_value(&json)?;
            json_buffer(&json)
        }
        Celltype::Mixed => match value {
            Value::Json(json) => json_buffer(json),
            Value::Text(s) => json_buffer(&Json::String(s.clone())),
            Value::Bytes(b) => b.to_vec(),
        },
        Celltype::Binary => match value {
            Value::Bytes(b) => b.to_vec(),
            _ => {
                return Err(SeamlessError::codec(
                    celltype.as_str(),
                    "binary cells hold raw bytes only",
                ))
            }
        },
        Celltype::Bytes => match value {
            Value::Bytes(b) => b.to_vec(),
            Value::Text(s) | Value::Json(Json::String(s)) => {
                s.trim_end_matches('\n').as_bytes().to_vec()
            }
            Value::Json(other) => other.to_string().into_bytes(),
        },
    };
    Ok(Bytes::from(buffer))
}

/// Convert a buffer back into a value
///
/// When `checksum` is given and the celltype is validated, the buffer must hash to it.
pub fn deserialize(buffer: &[u8], checksum: Option<&Checksum>, celltype: Celltype) -> Result<Value> {
    if let Some(expected) = checksum {
        if celltype.is_validated() {
            let actual = calculate_checksum(buffer);
            if actual != *expected {
                return Err(SeamlessError::ChecksumMismatch {
                    expected: *expected,
                    actual,
                });
            }
        }
    }

    let value = match celltype {
        Celltype::Str => match parse_json(buffer, celltype)? {
            json @ (Json::String(_) | Json::Bool(_)) => Value::Json(json),
            other => return Err(SeamlessError::codec(celltype.as_str(), format!("not a string: {other}"))),
        },
        Celltype::Int => {
            let json = parse_json(buffer, celltype)?;
            if !(json.is_i64() || json.is_u64()) {
                return Err(SeamlessError::codec(celltype.as_str(), format!("not an integer: {json}")));
            }
            Value::Json(json)
        }
        Celltype::Float => {
            let json = parse_json(buffer, celltype)?;
            let number = json
                .as_f64()
                .ok_or_else(|| SeamlessError::codec(celltype.as_str(), format!("not a number: {json}")))?;
            let number = serde_json::Number::from_f64(number)
                .ok_or_else(|| SeamlessError::codec(celltype.as_str(), "non-finite float"))?;
            Value::Json(Json::Number(number))
        }
        Celltype::Bool => match parse_json(buffer, celltype)? {
            Json::Bool(b) => Value::Json(Json::Bool(b)),
            other => return Err(SeamlessError::codec(celltype.as_str(), format!("not a boolean: {other}"))),
        },
        Celltype::Text | Celltype::Python | Celltype::IPython | Celltype::Cson | Celltype::Yaml => {
            Value::Text(utf8(buffer, celltype)?.to_string())
        }
        Celltype::Plain => Value::Json(parse_json(buffer, celltype)?),
        Celltype::Checksum => {
            let json = parse_json(buffer, celltype)?;
            validate_checksum_value(&json)?;
            Value::Json(json)
        }
        Celltype::Mixed => match serde_json::from_slice::<Json>(buffer) {
            Ok(json) => Value::Json(json),
            Err(_) => Value::Bytes(Bytes::copy_from_slice(buffer)),
        },
        Celltype::Binary | Celltype::Bytes => Value::Bytes(Bytes::copy_from_slice(buffer)),
    };
    Ok(value)
}

fn parse_json(buffer: &[u8], celltype: Celltype) -> Result<Json> {
    serde_json::from_slice(buffer).map_err(|e| SeamlessError::codec(celltype.as_str(), e))
}

fn utf8(buffer: &[u8], celltype: Celltype) -> Result<&str> {
    std::str::from_utf8(buffer).map_err(|e| SeamlessError::codec(celltype.as_str(), e))
}

fn to_int(value: &Value) -> Result<i64> {
    let err = |reason: String| SeamlessError::codec("int", reason);
    match value {
        Value::Json(Json::Number(n)) => {
            if let Some(i) = n.as_i64() {
                Ok(i)
            } else {
                match n.as_f64() {
                    Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Ok(f as i64),
                    _ => Err(err(format!("{n} is not an integer"))),
                }
            }
        }
        Value::Json(Json::Bool(b)) => Ok(i64::from(*b)),
        Value::Text(s) | Value::Json(Json::String(s)) => {
            s.trim().parse().map_err(|_| err(format!("'{s}' is not an integer")))
        }
        other => Err(err(format!("cannot convert {other:?}"))),
    }
}

fn to_float(value: &Value) -> Result<f64> {
    let err = |reason: String| SeamlessError::codec("float", reason);
    match value {
        Value::Json(Json::Number(n)) => n.as_f64().ok_or_else(|| err(n.to_string())),
        Value::Json(Json::Bool(b)) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::Text(s) | Value::Json(Json::String(s)) => {
            s.trim().parse().map_err(|_| err(format!("'{s}' is not a number")))
        }
        other => Err(err(format!("cannot convert {other:?}"))),
    }
}

fn to_bool(value: &Value) -> Result<bool> {
    match value {
        Value::Json(Json::Bool(b)) => Ok(*b),
        Value::Json(Json::Number(n)) => Ok(n.as_f64().map(|f| f != 0.0).unwrap_or(false)),
        Value::Json(Json::Null) => Ok(false),
        Value::Text(s) | Value::Json(Json::String(s)) => Ok(!s.is_empty()),
        Value::Json(Json::Array(items)) => Ok(!items.is_empty()),
        Value::Json(Json::Object(map)) => Ok(!map.is_empty()),
        Value::Bytes(b) => Ok(!b.is_empty()),
    }
}

/// Checksum cells hold a hex checksum, or a list/dict of them
fn validate_checksum_value(json: &Json) -> Result<()> {
    match json {
        Json::String(s) => Checksum::from_hex(s).map(|_| ()),
        Json::Null => Ok(()),
        Json::Array(items) => items.iter().try_for_each(validate_checksum_value),
        Json::Object(map) => map.values().try_for_each(validate_checksum_value),
        other => Err(SeamlessError::codec(
            "checksum",
            format!("not a checksum value: {other}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn round_trip(value: Value, celltype: Celltype) {
        let buffer = serialize(&value, celltype).unwrap();
        let checksum = calculate_checksum(&buffer);
        let back = deserialize(&buffer, Some(&checksum), celltype).unwrap();
        assert_eq!(back, value, "round trip failed for {celltype}");
    }

    /// Store `value`, read it back, and check the buffer is a fixed point
    fn stored(value: Value, celltype: Celltype) -> (Buffer, Value) {
        let buffer = serialize(&value, celltype).unwrap();
        let back = deserialize(&buffer, Some(&calculate_checksum(&buffer)), celltype).unwrap();
        let again = serialize(&back, celltype).unwrap();
        assert_eq!(again, buffer, "{celltype} buffer is not canonical");
        (buffer, back)
    }

    #[test]
    fn test_every_celltype_reaches_a_canonical_buffer() {
        let cases = [
            (Value::Json(json!({"z": 1, "a": [true, null]})), Celltype::Plain),
            (Value::Text("loose text".into()), Celltype::Plain),
            (Value::Text("no newline".into()), Celltype::Str),
            (Value::Json(json!(false)), Celltype::Str),
            (Value::Json(json!(12.5)), Celltype::Str),
            (Value::Text(" 17 ".into()), Celltype::Int),
            (Value::Json(json!(3.0)), Celltype::Float),
            (Value::Json(json!(0)), Celltype::Bool),
            (Value::Text("no newline".into()), Celltype::Text),
            (Value::Text("two\n\n".into()), Celltype::Text),
            (Value::Text("".into()), Celltype::Text),
            (Value::Json(json!({"k": "v"})), Celltype::Yaml),
            (Value::Text("a = 1".into()), Celltype::Python),
            (Value::Text("x: 1".into()), Celltype::Cson),
            (Value::Text("%time f()".into()), Celltype::IPython),
            (Value::Text("under mixed".into()), Celltype::Mixed),
            (Value::Bytes(Bytes::from_static(b"\xffraw")), Celltype::Mixed),
            (Value::Bytes(Bytes::from_static(b"\x00")), Celltype::Binary),
            (Value::Text("line\n".into()), Celltype::Bytes),
            (Value::Json(json!(calculate_checksum(b"x").to_hex())), Celltype::Checksum),
        ];
        for (value, celltype) in cases {
            stored(value, celltype);
        }
    }

    #[test]
    fn test_text_gains_exactly_one_newline() {
        let (buffer, back) = stored(Value::Text("no newline".into()), Celltype::Text);
        assert_eq!(buffer.as_ref(), b"no newline\n");
        assert_eq!(back, Value::Text("no newline\n".into()));

        // A buffer stored elsewhere without the newline reads as-is and canonicalizes on write
        let loose = deserialize(b"no newline", None, Celltype::Text).unwrap();
        assert_eq!(loose, Value::Text("no newline".into()));
        assert_eq!(serialize(&loose, Celltype::Text).unwrap(), buffer);
    }

    #[test]
    fn test_text_values_come_back_as_json_strings() {
        for celltype in [Celltype::Str, Celltype::Plain, Celltype::Mixed] {
            let (_, back) = stored(Value::Text("abc".into()), celltype);
            assert_eq!(back, Value::Json(json!("abc")), "{celltype}");
            assert_eq!(back.as_text(), Some("abc"));
        }
        let (buffer, back) = stored(Value::Json(json!(true)), Celltype::Str);
        assert_eq!(buffer.as_ref(), b"true\n");
        assert_eq!(back, Value::Json(json!(true)));
    }

    #[test]
    fn test_round_trips() {
        round_trip(Value::Json(json!({"b": [1, 2.5, null], "a": "x"})), Celltype::Plain);
        round_trip(Value::Json(json!(42)), Celltype::Int);
        round_trip(Value::Json(json!(2.5)), Celltype::Float);
        round_trip(Value::Json(json!(true)), Celltype::Bool);
        round_trip(Value::Json(json!("hello")), Celltype::Str);
        round_trip(Value::Text("def f():\n    return 1\n".into()), Celltype::Python);
        round_trip(Value::Bytes(Bytes::from_static(b"\x00\x01raw")), Celltype::Bytes);
        round_trip(Value::Json(json!([1, 2, 3])), Celltype::Mixed);
        round_trip(Value::Bytes(Bytes::from_static(b"\x93NUMPY\x01")), Celltype::Mixed);
    }

    #[test]
    fn test_serialization_formats() {
        assert_eq!(serialize(&json!(3).into(), Celltype::Int).unwrap().as_ref(), b"3\n");
        assert_eq!(serialize(&json!("a").into(), Celltype::Str).unwrap().as_ref(), b"\"a\"\n");
        assert_eq!(serialize(&json!(5).into(), Celltype::Str).unwrap().as_ref(), b"\"5\"\n");
        assert_eq!(
            serialize(&Value::Text("x = 1\n\n\n".into()), Celltype::Python).unwrap().as_ref(),
            b"x = 1\n"
        );
        assert_eq!(
            serialize(&Value::Text("payload\n".into()), Celltype::Bytes).unwrap().as_ref(),
            b"payload"
        );
    }

    #[test]
    fn test_checksum_mismatch_is_an_error() {
        let buffer = serialize(&json!(1).into(), Celltype::Int).unwrap();
        let wrong = calculate_checksum(b"something else");
        let err = deserialize(&buffer, Some(&wrong), Celltype::Int).unwrap_err();
        assert!(matches!(err, SeamlessError::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_unvalidated_celltypes_skip_checksum() {
        let wrong = calculate_checksum(b"something else");
        let value = deserialize(b"raw", Some(&wrong), Celltype::Bytes).unwrap();
        assert_eq!(value, Value::Bytes(Bytes::from_static(b"raw")));
    }

    #[test]
    fn test_type_errors() {
        assert!(deserialize(b"2.5\n", None, Celltype::Int).is_err());
        assert!(deserialize(b"\"x\"\n", None, Celltype::Bool).is_err());
        assert!(deserialize(b"\xff\xfe", None, Celltype::Text).is_err());
        assert!(serialize(&Value::Bytes(Bytes::new()), Celltype::Plain).is_err());
        assert!(serialize(&json!("abc").into(), Celltype::Checksum).is_err());
    }

    #[test]
    fn test_celltype_aliases() {
        assert_eq!("silk".parse::<Celltype>().unwrap(), Celltype::Mixed);
        assert_eq!("python".parse::<Celltype>().unwrap(), Celltype::Python);
        assert!("folder".parse::<Celltype>().is_err());
    }

    #[test]
    fn test_syntactic_is_semantic() {
        assert!(Celltype::Plain.syntactic_is_semantic());
        assert!(Celltype::Text.syntactic_is_semantic());
        assert!(!Celltype::Python.syntactic_is_semantic());
        assert!(!Celltype::Yaml.syntactic_is_semantic());
    }
}
