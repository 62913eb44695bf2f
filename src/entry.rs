//! The in-memory representation of a `CacheElement` row.

/// A row of the `CacheElement` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: String,
    pub type_name: Option<String>,
    pub value: Vec<u8>,
    /// Tick at which this entry becomes invisible to reads.
    pub expiration: i64,
    /// Tick at which this entry was inserted.
    pub created_at: i64,
}

impl Entry {
    pub fn new(key: impl Into<String>, value: Vec<u8>, expiration: i64, created_at: i64) -> Self {
        Self {
            key: key.into(),
            type_name: None,
            value,
            expiration,
            created_at,
        }
    }

    pub fn with_type_name(mut self, type_name: impl Into<String>) -> Self {
        self.type_name = Some(type_name.into());
        self
    }
}
