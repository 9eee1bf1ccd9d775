//! Implements the decoders' narrow [`meteo_decoders::CounterCache`] seam
//! against the real `cached_counters` table, so decoders never need to
//! know they're talking to Postgres.

use chrono::{DateTime, Utc};
use meteo_core::StationId;
use meteo_decoders::CounterCache;
use tracing::instrument;

use crate::DbClient;

#[async_trait::async_trait]
impl CounterCache for DbClient {
    #[instrument(skip(self))]
    async fn get_cached_int(&self, station: StationId, key: &str) -> Option<(DateTime<Utc>, i64)> {
        let row = sqlx::query_as::<_, (DateTime<Utc>, i64)>(
            "SELECT updated_at, value FROM cached_counters WHERE station = $1 AND key = $2",
        )
        .bind(station)
        .bind(key)
        .fetch_optional(self.pool())
        .await
        .ok()
        .flatten();
        row
    }

    #[instrument(skip(self))]
    async fn cache_int(&self, station: StationId, key: &str, updated_at: DateTime<Utc>, value: i64) -> bool {
        sqlx::query(
            r#"
            INSERT INTO cached_counters (station, key, updated_at, value)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (station, key) DO UPDATE SET updated_at = EXCLUDED.updated_at, value = EXCLUDED.value
            "#,
        )
        .bind(station)
        .bind(key)
        .bind(updated_at)
        .bind(value)
        .execute(self.pool())
        .await
        .is_ok()
    }
}
