//! ent-cache
//!
//! Durable storage for the cached expiration marker.
//!
//! The system key-value store is an external collaborator; this crate only
//! defines its boundary ([`KeyValueStore`]) plus two adapters:
//! - [`FileStore`]: JSON object on disk, survives process restarts
//! - [`MemoryStore`]: in-process map for tests and ephemeral runs
//!
//! [`ExpirationCache`] is the typed view the reconciler uses: a single
//! optional timestamp under [`CACHED_EXPIRATION_KEY`].

mod store;

pub use store::{FileStore, KeyValueStore, MemoryStore};

use chrono::{DateTime, Utc};

/// Fixed logical key of the cached expiration marker.
pub const CACHED_EXPIRATION_KEY: &str = "cachedExpirationDateKey";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Reading or writing the backing file failed.
    Io { path: String, message: String },
    /// The backing file exists but is not a JSON object of strings.
    CorruptStore { path: String, message: String },
    /// A stored value could not be decoded as a timestamp.
    CorruptValue { key: String, raw: String },
    /// A lock guarding the in-memory map was poisoned by a panicking writer.
    Poisoned,
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, message } => write!(f, "cache io error at {path}: {message}"),
            Self::CorruptStore { path, message } => {
                write!(f, "cache store {path} is corrupt: {message}")
            }
            Self::CorruptValue { key, raw } => {
                write!(f, "cache key '{key}' holds undecodable value '{raw}'")
            }
            Self::Poisoned => write!(f, "cache lock poisoned"),
        }
    }
}

impl std::error::Error for CacheError {}

// ---------------------------------------------------------------------------
// ExpirationCache
// ---------------------------------------------------------------------------

/// Typed accessor for the cached expiration marker.
///
/// Absent key means "no prior entitlement". Writing `None` (a non-expiring
/// entitlement) removes the key.
pub struct ExpirationCache<S> {
    store: S,
}

impl<S: KeyValueStore> ExpirationCache<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn read(&self) -> Result<Option<DateTime<Utc>>, CacheError> {
        let Some(raw) = self.store.get(CACHED_EXPIRATION_KEY)? else {
            return Ok(None);
        };
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|_| CacheError::CorruptValue {
                key: CACHED_EXPIRATION_KEY.to_string(),
                raw,
            })
    }

    pub fn write(&self, expires_at: Option<DateTime<Utc>>) -> Result<(), CacheError> {
        match expires_at {
            Some(ts) => self.store.set(CACHED_EXPIRATION_KEY, &ts.to_rfc3339()),
            None => self.store.remove(CACHED_EXPIRATION_KEY),
        }
    }

    pub fn clear(&self) -> Result<(), CacheError> {
        self.store.remove(CACHED_EXPIRATION_KEY)
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S: KeyValueStore> std::fmt::Debug for ExpirationCache<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpirationCache")
            .field("key", &CACHED_EXPIRATION_KEY)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn absent_key_reads_as_none() {
        let cache = ExpirationCache::new(MemoryStore::new());
        assert_eq!(cache.read(), Ok(None));
    }

    #[test]
    fn write_then_read_returns_timestamp() {
        let cache = ExpirationCache::new(MemoryStore::new());
        let ts = Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap();
        cache.write(Some(ts)).unwrap();
        assert_eq!(cache.read(), Ok(Some(ts)));
    }

    #[test]
    fn writing_none_removes_marker() {
        let cache = ExpirationCache::new(MemoryStore::new());
        let ts = Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap();
        cache.write(Some(ts)).unwrap();
        cache.write(None).unwrap();
        assert_eq!(cache.read(), Ok(None));
        assert_eq!(cache.store().get(CACHED_EXPIRATION_KEY), Ok(None));
    }

    #[test]
    fn garbage_value_is_corrupt() {
        let store = MemoryStore::new();
        store.set(CACHED_EXPIRATION_KEY, "not-a-date").unwrap();
        let cache = ExpirationCache::new(store);
        assert!(matches!(cache.read(), Err(CacheError::CorruptValue { .. })));
    }
}
