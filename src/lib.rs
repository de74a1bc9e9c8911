//! Seamless: a content-addressed transformation cache and execution engine
//!
//! Values are stored as buffers keyed by their SHA3-256 checksum. A
//! transformation (code plus input checksums) has a checksum of its own and
//! maps to the checksum of its result, so a computation runs once and is
//! looked up afterwards. [`CacheService`] ties the caches, the optional
//! result database and the language runners together.

pub mod cache;
pub mod checksum;
pub mod codec;
pub mod communion;
pub mod config;
pub mod error;
pub mod execution;
pub mod fingertip;
pub mod logging;
pub mod remote;
pub mod runner;
pub mod service;
pub mod storage;
pub mod transformation;

#[cfg(test)]
mod testing;

pub use checksum::{calculate_checksum, Buffer, Checksum};
pub use codec::{Celltype, Value};
pub use config::SeamlessConfig;
pub use error::{Result, SeamlessError};
pub use execution::{RunOptions, TransformationStatus};
pub use service::{CacheService, CacheServiceBuilder};
pub use transformation::{Transformation, TransformationDraft};
