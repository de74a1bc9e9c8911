//! Transformation buffer and checksum
//!
//! The buffer keeps `__language__`, `__output__`, `__as__`, `__format__` and
//! the pins. `__meta__`, `__env__`, `__compilers__`, `__languages__`,
//! `__code_checksum__` and `SPECIAL__*` entries are dropped, so two
//! transformations that differ only there share a cache entry.

use serde_json::{Map, Value as Json};

use super::{Transformation, AS, FORMAT, LANGUAGE, OUTPUT};
use crate::checksum::{calculate_checksum, Buffer, Checksum};
use crate::codec::json_buffer;
use crate::error::Result;

pub(crate) fn canonical_json(transformation: &Transformation) -> Json {
    let mut map = Map::new();
    map.insert(LANGUAGE.to_string(), Json::String(transformation.language.clone()));
    map.insert(OUTPUT.to_string(), transformation.output.to_json());
    if let Some(as_) = &transformation.as_ {
        map.insert(AS.to_string(), as_.clone());
    }
    if let Some(format) = &transformation.format {
        map.insert(FORMAT.to_string(), format.clone());
    }
    for (name, pin) in &transformation.pins {
        map.insert(name.clone(), pin.to_json());
    }
    Json::Object(map)
}

/// Canonical buffer of a transformation: sorted JSON plus a trailing newline
pub fn tf_get_buffer(transformation: &Transformation) -> Buffer {
    Buffer::from(json_buffer(&canonical_json(transformation)))
}

pub fn transformation_checksum(transformation: &Transformation) -> Checksum {
    calculate_checksum(&tf_get_buffer(transformation))
}

/// Canonical buffer and checksum of a raw transformation dict
pub fn register_transformation_dict(dict: &Json) -> Result<(Checksum, Buffer, Transformation)> {
    let transformation = Transformation::from_json(dict)?;
    let buffer = tf_get_buffer(&transformation);
    Ok((calculate_checksum(&buffer), buffer, transformation))
}
