pub mod buffer_cache;
pub mod eviction;
pub mod transformation_cache;

pub use buffer_cache::{BufferCache, BufferCacheStats, BufferLifetimes, RefEntry};
pub use eviction::{spawn_eviction, Evictable, EvictionHandle, EvictionReport};
pub use transformation_cache::{
    Destroyed, KeepAlive, ResultUpdate, TransformationCache, TransformationCacheStats, TransformerId, Undone,
};
