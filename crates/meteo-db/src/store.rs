//! The observation store facade (C4): every other component that needs
//! to read or write weather data goes through here instead of issuing
//! SQL directly.

use chrono::{DateTime, Utc};
use meteo_core::{Observation, StationId, StationMetadata};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::schema::{
    LiveobjectsStationRow, MqttStationRow, NbiotStationRow, StationAuthRow, StationConfigurationRow, StationRow,
    VirtualStationRow, Vp2StationRow,
};
use crate::{DbClient, DbError, DbResult};

#[derive(Clone)]
pub struct ObservationStore {
    client: DbClient,
}

impl ObservationStore {
    pub fn new(client: DbClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &DbClient {
        &self.client
    }

    /// Insert one observation. `fields` is stored as a JSONB document so
    /// adding a new sensor field never requires a schema migration.
    #[instrument(skip(self, observation))]
    pub async fn insert_point(&self, observation: &Observation) -> DbResult<()> {
        let fields = serde_json::to_value(observation.values()).map_err(|e| DbError::ConstraintViolation(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO observations (station, day, time, fields)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (station, time) DO UPDATE SET fields = observations.fields || EXCLUDED.fields
            "#,
        )
        .bind(observation.station)
        .bind(observation.day)
        .bind(observation.time)
        .bind(fields)
        .execute(self.client.pool())
        .await?;

        debug!(station = %observation.station, time = %observation.time, "inserted observation");
        Ok(())
    }

    /// Batch variant of [`Self::insert_point`], used by archive
    /// downloaders that may retrieve hundreds of backlogged records in
    /// one page. Runs inside a single transaction so a page either lands
    /// completely or not at all.
    #[instrument(skip(self, observations))]
    pub async fn insert_points_batch(&self, observations: &[Observation]) -> DbResult<()> {
        let mut tx = self.client.pool().begin().await?;
        for observation in observations {
            let fields = serde_json::to_value(observation.values()).map_err(|e| DbError::ConstraintViolation(e.to_string()))?;
            sqlx::query(
                r#"
                INSERT INTO observations (station, day, time, fields)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (station, time) DO UPDATE SET fields = observations.fields || EXCLUDED.fields
                "#,
            )
            .bind(observation.station)
            .bind(observation.day)
            .bind(observation.time)
            .bind(fields)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        debug!(count = observations.len(), "inserted observation batch");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn delete_points_in_range(&self, station: StationId, begin: DateTime<Utc>, end: DateTime<Utc>) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM observations WHERE station = $1 AND time >= $2 AND time < $3")
            .bind(station)
            .bind(begin)
            .bind(end)
            .execute(self.client.pool())
            .await?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    pub async fn update_last_archive_time(&self, station: StationId, timestamp: DateTime<Utc>) -> DbResult<()> {
        sqlx::query("UPDATE stations SET last_archive = $2 WHERE station = $1")
            .bind(station)
            .bind(timestamp)
            .execute(self.client.pool())
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn get_cached_float(&self, station: StationId, key: &str) -> DbResult<Option<(DateTime<Utc>, f64)>> {
        let row = sqlx::query_as::<_, (DateTime<Utc>, f64)>(
            "SELECT updated_at, value FROM cached_float_counters WHERE station = $1 AND key = $2",
        )
        .bind(station)
        .bind(key)
        .fetch_optional(self.client.pool())
        .await?;
        Ok(row)
    }

    #[instrument(skip(self))]
    pub async fn cache_float(&self, station: StationId, key: &str, updated_at: DateTime<Utc>, value: f64) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO cached_float_counters (station, key, updated_at, value)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (station, key) DO UPDATE SET updated_at = EXCLUDED.updated_at, value = EXCLUDED.value
            "#,
        )
        .bind(station)
        .bind(key)
        .bind(updated_at)
        .bind(value)
        .execute(self.client.pool())
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn get_all_stations(&self) -> DbResult<Vec<StationId>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as("SELECT station FROM stations").fetch_all(self.client.pool()).await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    #[instrument(skip(self))]
    pub async fn get_station_metadata(&self, station: StationId) -> DbResult<StationMetadata> {
        let row: StationRow = sqlx::query_as("SELECT * FROM stations WHERE station = $1")
            .bind(station)
            .fetch_optional(self.client.pool())
            .await?
            .ok_or(DbError::NotFound)?;

        Ok(StationMetadata {
            station: row.station,
            name: row.name,
            polling_period_minutes: row.polling_period_minutes,
            last_archive: row.last_archive,
            timezone: row.timezone,
            latitude: row.latitude,
            longitude: row.longitude,
            elevation: row.elevation,
            may_store_inside_measurements: row.may_store_inside_measurements,
        })
    }

    #[instrument(skip(self))]
    pub async fn get_last_data_before(&self, station: StationId, before: DateTime<Utc>) -> DbResult<Option<Observation>> {
        let row: Option<crate::schema::ObservationRow> = sqlx::query_as(
            "SELECT station, day, time, fields FROM observations WHERE station = $1 AND time < $2 ORDER BY time DESC LIMIT 1",
        )
        .bind(station)
        .bind(before)
        .fetch_optional(self.client.pool())
        .await?;

        Ok(row.map(|r| {
            let values = serde_json::from_value(r.fields).unwrap_or_default();
            Observation::from_parts(r.station, r.time, values)
        }))
    }

    /// The registry of virtual stations, re-read at the start of every
    /// computation cycle rather than cached, so a station added or
    /// reconfigured takes effect on the next tick without a reload signal.
    #[instrument(skip(self))]
    pub async fn get_all_virtual_stations(&self) -> DbResult<Vec<VirtualStationRow>> {
        let rows: Vec<VirtualStationRow> =
            sqlx::query_as("SELECT station, period_minutes, sources FROM virtual_stations").fetch_all(self.client.pool()).await?;
        Ok(rows)
    }

    /// The most recent undelivered downlink queued for `station`, if any.
    #[instrument(skip(self))]
    pub async fn get_pending_configuration(&self, station: StationId) -> DbResult<Option<StationConfigurationRow>> {
        let row: Option<StationConfigurationRow> = sqlx::query_as(
            "SELECT * FROM station_configurations WHERE station = $1 AND applied = false ORDER BY retrieved_at DESC LIMIT 1",
        )
        .bind(station)
        .fetch_optional(self.client.pool())
        .await?;
        Ok(row)
    }

    /// One specific queued downlink by id, regardless of delivery state
    /// (used to serve a repeat `GET .../configuration/<id>`).
    #[instrument(skip(self))]
    pub async fn get_configuration_by_id(&self, station: StationId, id: i64) -> DbResult<Option<StationConfigurationRow>> {
        let row: Option<StationConfigurationRow> =
            sqlx::query_as("SELECT * FROM station_configurations WHERE station = $1 AND id = $2")
                .bind(station)
                .bind(id)
                .fetch_optional(self.client.pool())
                .await?;
        Ok(row)
    }

    #[instrument(skip(self))]
    pub async fn mark_configuration_delivered(&self, id: i64) -> DbResult<()> {
        sqlx::query("UPDATE station_configurations SET applied = true WHERE id = $1").bind(id).execute(self.client.pool()).await?;
        Ok(())
    }

    /// The identity an HTTP push receiver must see in
    /// `X-Authenticated-User` to accept writes for `station`.
    #[instrument(skip(self))]
    pub async fn get_station_authorized_user(&self, station: StationId) -> DbResult<Option<String>> {
        let row: Option<StationAuthRow> =
            sqlx::query_as("SELECT station, authorized_user FROM station_http_auth WHERE station = $1")
                .bind(station)
                .fetch_optional(self.client.pool())
                .await?;
        Ok(row.map(|r| r.authorized_user))
    }

    #[instrument(skip(self))]
    pub async fn get_all_nbiot_stations(&self) -> DbResult<Vec<NbiotStationRow>> {
        let rows: Vec<NbiotStationRow> =
            sqlx::query_as("SELECT station, imei, hmac_key_hex FROM nbiot_stations").fetch_all(self.client.pool()).await?;
        Ok(rows)
    }

    #[instrument(skip(self))]
    pub async fn get_all_mqtt_stations(&self) -> DbResult<Vec<MqttStationRow>> {
        let rows: Vec<MqttStationRow> =
            sqlx::query_as("SELECT station, topic FROM mqtt_stations").fetch_all(self.client.pool()).await?;
        Ok(rows)
    }

    #[instrument(skip(self))]
    pub async fn get_all_liveobjects_stations(&self) -> DbResult<Vec<LiveobjectsStationRow>> {
        let rows: Vec<LiveobjectsStationRow> =
            sqlx::query_as("SELECT station, stream_id FROM liveobjects_stations").fetch_all(self.client.pool()).await?;
        Ok(rows)
    }

    /// The registry of direct-dial Davis VantagePro2 stations, re-read
    /// whenever the scheduler reloads so a station added or re-pointed
    /// at a new address takes effect without restarting the process.
    #[instrument(skip(self))]
    pub async fn get_all_vp2_stations(&self) -> DbResult<Vec<Vp2StationRow>> {
        let rows: Vec<Vp2StationRow> =
            sqlx::query_as("SELECT station, host, port, rain_collector_imperial FROM vp2_stations").fetch_all(self.client.pool()).await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    // Exercising these queries needs a live Timescale instance; covered
    // by the integration suite under tests/, not here.
}
