//! Schema cache shared across threads.
//!
//! Parsing a schema out of the database is expensive, so the coordinator
//! caches the parsed form together with the transaction-version range it is
//! valid for. Writers widen the range monotonically; readers take an `Arc`
//! snapshot.

use std::sync::{Arc, Mutex};

use crate::core::ClientVersion;

/// A parsed schema. The object model itself is outside this crate; what
/// the coordinator caches is opaque apart from its version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Schema {
    pub schema_version: u64,
    pub classes: Vec<String>,
}

#[derive(Clone, Debug)]
struct CachedSchema {
    schema: Arc<Schema>,
    valid_from: ClientVersion,
    valid_to: ClientVersion,
}

#[derive(Default)]
pub struct SchemaCache {
    inner: Mutex<Option<CachedSchema>>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caches `schema` as valid for `[valid_from, valid_to]`. An existing
    /// entry for the same schema only ever widens its range.
    pub fn cache_schema(
        &self,
        schema: Arc<Schema>,
        valid_from: ClientVersion,
        valid_to: ClientVersion,
    ) {
        let mut inner = self.inner.lock().expect("schema cache poisoned");
        match inner.as_mut() {
            Some(cached) if cached.schema == schema => {
                cached.valid_from = cached.valid_from.min(valid_from);
                cached.valid_to = cached.valid_to.max(valid_to);
            }
            _ => {
                *inner = Some(CachedSchema {
                    schema,
                    valid_from,
                    valid_to,
                });
            }
        }
    }

    /// A read transaction advanced from `previous` to `next` without a
    /// schema change: the validity range extends to cover `next`.
    pub fn advance_schema_cache(&self, previous: ClientVersion, next: ClientVersion) {
        let mut inner = self.inner.lock().expect("schema cache poisoned");
        if let Some(cached) = inner.as_mut() {
            if previous >= cached.valid_from && previous <= cached.valid_to {
                cached.valid_to = cached.valid_to.max(next);
            }
        }
    }

    /// The cached schema if `version` falls inside the valid range.
    pub fn get_cached_schema(&self, version: ClientVersion) -> Option<Arc<Schema>> {
        let inner = self.inner.lock().expect("schema cache poisoned");
        inner.as_ref().and_then(|cached| {
            if version >= cached.valid_from && version <= cached.valid_to {
                Some(Arc::clone(&cached.schema))
            } else {
                None
            }
        })
    }

    pub fn clear(&self) {
        *self.inner.lock().expect("schema cache poisoned") = None;
    }
}
