//! Binary message framing for peer-to-peer delegation
//!
//! ```text
//! "SEAMLESS" | mode u8 | id u32 | extra_len u32 | extra JSON | kind u8 | payload
//! ```
//!
//! Integers are little-endian. `mode` is 0 for requests and 1 for responses.
//! The extra JSON object carries every field besides mode, id and content,
//! and is absent (length 0) when there are none.

use serde_json::{Map, Value as Json};

use crate::error::{Result, SeamlessError};

const MAGIC: &[u8; 8] = b"SEAMLESS";
const HEADER_LEN: usize = MAGIC.len() + 1 + 4 + 4;

const KIND_NONE: u8 = 0;
const KIND_BOOL: u8 = 1;
const KIND_BYTES: u8 = 2;
const KIND_TEXT: u8 = 3;
const KIND_JSON: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Request,
    Response,
}

/// Message payload
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    None,
    Bool(bool),
    Bytes(Vec<u8>),
    Text(String),
    /// Numbers and sequences, carried as JSON
    Json(Json),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub mode: Mode,
    pub id: u32,
    pub content: Content,
    /// Additional fields, such as the request `type`
    pub extra: Map<String, Json>,
}

impl Message {
    pub fn request(id: u32, content: Content) -> Self {
        Self {
            mode: Mode::Request,
            id,
            content,
            extra: Map::new(),
        }
    }

    pub fn response(id: u32, content: Content) -> Self {
        Self {
            mode: Mode::Response,
            id,
            content,
            extra: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Json) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

fn malformed(reason: impl std::fmt::Display) -> SeamlessError {
    SeamlessError::codec("communion", reason)
}

/// Encode a message; the result is checked to decode back to the same message
pub fn encode(message: &Message) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(HEADER_LEN + 16);
    out.extend_from_slice(MAGIC);
    out.push(match message.mode {
        Mode::Request => 0,
        Mode::Response => 1,
    });
    out.extend_from_slice(&message.id.to_le_bytes());

    if message.extra.is_empty() {
        out.extend_from_slice(&0u32.to_le_bytes());
    } else {
        let extra = serde_json::to_vec(&message.extra)?;
        let len = u32::try_from(extra.len()).map_err(|_| malformed("extra fields too large"))?;
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&extra);
    }

    match &message.content {
        Content::None => out.push(KIND_NONE),
        Content::Bool(b) => {
            out.push(KIND_BOOL);
            out.push(u8::from(*b));
        }
        Content::Bytes(bytes) => {
            out.push(KIND_BYTES);
            out.extend_from_slice(bytes);
        }
        Content::Text(text) => {
            out.push(KIND_TEXT);
            out.extend_from_slice(text.as_bytes());
        }
        Content::Json(json) => {
            out.push(KIND_JSON);
            out.extend_from_slice(&serde_json::to_vec(json)?);
        }
    }

    let decoded = decode(&out)?;
    if &decoded != message {
        return Err(malformed("message does not survive encoding"));
    }
    Ok(out)
}

pub fn decode(data: &[u8]) -> Result<Message> {
    if data.len() < HEADER_LEN + 1 {
        return Err(malformed(format!("message too short ({} bytes)", data.len())));
    }
    if &data[..MAGIC.len()] != MAGIC {
        return Err(malformed("missing SEAMLESS header"));
    }
    let mut rest = &data[MAGIC.len()..];
    let mode = match rest[0] {
        0 => Mode::Request,
        1 => Mode::Response,
        other => return Err(malformed(format!("unknown mode byte {other}"))),
    };
    let id = read_u32(&rest[1..5]);
    let extra_len = read_u32(&rest[5..9]) as usize;
    rest = &rest[9..];

    let extra = if extra_len == 0 {
        Map::new()
    } else {
        if rest.len() < extra_len + 1 {
            return Err(malformed("truncated extra fields"));
        }
        let extra = match serde_json::from_slice(&rest[..extra_len])? {
            Json::Object(map) => map,
            _ => return Err(malformed("extra fields must be a JSON object")),
        };
        rest = &rest[extra_len..];
        extra
    };

    let (kind, payload) = rest
        .split_first()
        .ok_or_else(|| malformed("missing content kind"))?;
    let content = match *kind {
        KIND_NONE => Content::None,
        KIND_BOOL => Content::Bool(payload == [1]),
        KIND_BYTES => Content::Bytes(payload.to_vec()),
        KIND_TEXT => Content::Text(
            String::from_utf8(payload.to_vec()).map_err(|e| malformed(format!("content is not UTF-8: {e}")))?,
        ),
        KIND_JSON => Content::Json(serde_json::from_slice(payload)?),
        other => return Err(malformed(format!("unknown content kind {other}"))),
    };

    Ok(Message {
        mode,
        id,
        content,
        extra,
    })
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(bytes);
    u32::from_le_bytes(word)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_with_tuple_content() {
        let message = Message::request(7, Content::Json(json!([1, 2, 3])));
        let encoded = encode(&message).unwrap();
        assert_eq!(&encoded[..8], b"SEAMLESS");
        assert_eq!(encoded[8], 0);
        assert_eq!(&encoded[9..13], &7u32.to_le_bytes());
        assert_eq!(&encoded[13..17], &[0, 0, 0, 0]);
        assert_eq!(encoded[17], 4);
        assert_eq!(decode(&encoded).unwrap(), message);
    }

    #[test]
    fn test_extra_fields_and_content_kinds() {
        let contents = [
            Content::None,
            Content::Bool(true),
            Content::Bool(false),
            Content::Bytes(vec![0, 255, 7]),
            Content::Text("héllo".into()),
            Content::Json(json!(2.5)),
        ];
        for content in contents {
            let message = Message::response(1000, content).with_field("type", json!("buffer_check"));
            let decoded = decode(&encode(&message).unwrap()).unwrap();
            assert_eq!(decoded, message);
            assert_eq!(decoded.extra["type"], "buffer_check");
        }
    }

    #[test]
    fn test_malformed_messages_are_rejected() {
        assert!(decode(b"SEAMLES").is_err());
        assert!(decode(b"NOTSEAML\x00\x01\x00\x00\x00\x00\x00\x00\x00\x00").is_err());

        let mut bad_mode = encode(&Message::request(1, Content::None)).unwrap();
        bad_mode[8] = 9;
        assert!(decode(&bad_mode).is_err());

        let mut bad_kind = encode(&Message::request(1, Content::None)).unwrap();
        bad_kind[17] = 5;
        assert!(decode(&bad_kind).is_err());
    }
}
