//! Checksum and buffer identity
//!
//! Every buffer is identified by its SHA3-256 digest. The textual form is
//! 64 lowercase hex characters, which is also what goes over the wire.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Sha3_256};

use crate::error::{Result, SeamlessError};

/// Immutable byte sequence
pub type Buffer = Bytes;

pub const CHECKSUM_LENGTH: usize = 32;

/// SHA3-256 digest of a buffer
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Checksum([u8; CHECKSUM_LENGTH]);

impl Checksum {
    pub fn from_bytes(bytes: [u8; CHECKSUM_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Parse a raw 32-byte digest
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let digest: [u8; CHECKSUM_LENGTH] = bytes.try_into().map_err(|_| {
            SeamlessError::InvalidChecksum(format!(
                "expected {} bytes, got {}",
                CHECKSUM_LENGTH,
                bytes.len()
            ))
        })?;
        Ok(Self(digest))
    }

    /// Parse the 64-character hex form
    pub fn from_hex(text: &str) -> Result<Self> {
        if text.len() != CHECKSUM_LENGTH * 2 {
            return Err(SeamlessError::InvalidChecksum(format!(
                "expected {} hex characters, got {}",
                CHECKSUM_LENGTH * 2,
                text.len()
            )));
        }
        let mut digest = [0u8; CHECKSUM_LENGTH];
        hex::decode_to_slice(text, &mut digest)
            .map_err(|e| SeamlessError::InvalidChecksum(format!("{text}: {e}")))?;
        Ok(Self(digest))
    }

    /// Parse an optional hex checksum; empty strings and JSON null mean "no checksum"
    pub fn parse_optional(text: Option<&str>) -> Result<Option<Self>> {
        match text {
            None | Some("") => Ok(None),
            Some(text) => Self::from_hex(text).map(Some),
        }
    }

    pub fn as_bytes(&self) -> &[u8; CHECKSUM_LENGTH] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 8 hex characters, for log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({self})")
    }
}

impl FromStr for Checksum {
    type Err = SeamlessError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s.trim())
    }
}

impl Serialize for Checksum {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Checksum {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::from_hex(&text).map_err(serde::de::Error::custom)
    }
}

/// Compute the checksum of a buffer
pub fn calculate_checksum(buffer: &[u8]) -> Checksum {
    let mut hasher = Sha3_256::new();
    hasher.update(buffer);
    Checksum(hasher.finalize().into())
}

pub const EMPTY_DICT_BUFFER: &[u8] = b"{}\n";
pub const EMPTY_LIST_BUFFER: &[u8] = b"[]\n";

pub fn empty_dict_checksum() -> Checksum {
    calculate_checksum(EMPTY_DICT_BUFFER)
}

pub fn empty_list_checksum() -> Checksum {
    calculate_checksum(EMPTY_LIST_BUFFER)
}

/// Buffers that every tier can always produce
pub fn builtin_buffer(checksum: &Checksum) -> Option<Buffer> {
    if *checksum == empty_dict_checksum() {
        Some(Bytes::from_static(EMPTY_DICT_BUFFER))
    } else if *checksum == empty_list_checksum() {
        Some(Bytes::from_static(EMPTY_LIST_BUFFER))
    } else {
        None
    }
}
