//! The narrow slice of the observation store facade (C4) that stateful
//! decoders need: per-station cached counters for rain-gauge accumulation
//! and battery hysteresis. Decoders depend only on this trait, not on the
//! concrete store, so `meteo-decoders` never depends on `meteo-db`.

use chrono::{DateTime, Utc};
use meteo_core::StationId;

#[async_trait::async_trait]
pub trait CounterCache: Send + Sync {
    async fn get_cached_int(&self, station: StationId, key: &str) -> Option<(DateTime<Utc>, i64)>;
    async fn cache_int(&self, station: StationId, key: &str, updated_at: DateTime<Utc>, value: i64) -> bool;
}

/// A cached counter older than this is ignored; rainfall/deltas are
/// reported absent rather than computed against a stale reference.
pub const CACHE_MAX_AGE_HOURS: i64 = 24;

pub fn cache_is_fresh(updated_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    updated_at > now - chrono::Duration::hours(CACHE_MAX_AGE_HOURS)
}

/// Test-only in-memory cache, standing in for the observation store.
#[cfg(any(test, feature = "test-util"))]
pub mod test_util {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MemoryCache {
        entries: Mutex<HashMap<(StationId, String), (DateTime<Utc>, i64)>>,
    }

    impl MemoryCache {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn seed(&self, station: StationId, key: &str, updated_at: DateTime<Utc>, value: i64) {
            self.entries
                .lock()
                .unwrap()
                .insert((station, key.to_string()), (updated_at, value));
        }
    }

    #[async_trait::async_trait]
    impl CounterCache for MemoryCache {
        async fn get_cached_int(&self, station: StationId, key: &str) -> Option<(DateTime<Utc>, i64)> {
            self.entries.lock().unwrap().get(&(station, key.to_string())).copied()
        }

        async fn cache_int(&self, station: StationId, key: &str, updated_at: DateTime<Utc>, value: i64) -> bool {
            self.entries
                .lock()
                .unwrap()
                .insert((station, key.to_string()), (updated_at, value));
            true
        }
    }
}
