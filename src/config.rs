//! Explicit configuration, constructed by the caller and handed to
//! `start()`. No environment variables, no service locator.

/// The default chunk size: 64 requests per BEGIN/COMMIT cycle. Exposed
/// as a constant, not just a default, because the `IN (?,…,?)` statement
/// family in `statements.rs` is generated per distinct list length seen,
/// and this is the size most chunks actually run at.
pub const CHUNK_SIZE: usize = 64;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Capacity of the bounded MPSC request queue. Producers experience
    /// backpressure once this many requests are in flight and
    /// unconsumed.
    pub queue_capacity: usize,
    /// Maximum requests per BEGIN/COMMIT cycle. Exposed as a config
    /// field, not hardwired to `CHUNK_SIZE`, so tests can exercise
    /// multi-chunk behavior with a small number without constructing
    /// hundreds of entries.
    pub chunk_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            queue_capacity: CHUNK_SIZE * 4,
            chunk_size: CHUNK_SIZE,
        }
    }
}
