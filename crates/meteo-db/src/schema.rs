//! Row types mirroring the existing Timescale schema. No migrations
//! live in this crate; these types describe tables assumed already
//! present and shaped this way.

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// One row of `observations`: a station, a timestamp, and every
/// optional field flattened into a JSONB column (`fields`). Timescale's
/// hypertable partitioning key is `(station, time)`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ObservationRow {
    pub station: Uuid,
    pub day: NaiveDate,
    pub time: DateTime<Utc>,
    pub fields: JsonValue,
}

/// One row of `cached_counters`: the last-seen value of a
/// monotonic/wrapping counter a decoder needs across uplinks.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CachedCounterRow {
    pub station: Uuid,
    pub key: String,
    pub updated_at: DateTime<Utc>,
    pub value: i64,
}

/// One row of `stations`: registry metadata used to resolve an
/// incoming payload's station and to drive the download scheduler.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StationRow {
    pub station: Uuid,
    pub name: String,
    pub polling_period_minutes: i32,
    pub last_archive: DateTime<Utc>,
    pub timezone: String,
    pub latitude: f64,
    pub longitude: f64,
    pub elevation: f64,
    pub may_store_inside_measurements: bool,
}

/// One row of `station_configurations`: a downlink payload queued for a
/// station, delivered opportunistically the next time the station is
/// heard from (piggybacked on an HTTP poll response or a UDP reply).
/// `applied` tracks delivery to the device, not acknowledgement by it —
/// there is no channel back from most of these devices to confirm the
/// payload was actually acted on.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StationConfigurationRow {
    pub id: i64,
    pub station: Uuid,
    pub retrieved_at: DateTime<Utc>,
    pub configuration: JsonValue,
    pub applied: bool,
}

/// One row of `station_http_auth`: the bearer identity an HTTP push
/// receiver must see in `X-Authenticated-User` to accept writes for
/// this station.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StationAuthRow {
    pub station: Uuid,
    pub authorized_user: String,
}

/// One row of `nbiot_stations`: an NB-IoT device identified by IMEI
/// rather than by station UUID on the wire, plus the hex-encoded HMAC
/// key used to authenticate its uplinks.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct NbiotStationRow {
    pub station: Uuid,
    pub imei: String,
    pub hmac_key_hex: String,
}

/// One row of `mqtt_stations`: a station reachable over the MQTT
/// ingest path, and the topic its sensor model/tenant publishes on.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MqttStationRow {
    pub station: Uuid,
    pub topic: String,
}

/// One row of `liveobjects_stations`: maps a liveobjects `streamId` urn
/// to a station, for the decode-only HTTP endpoint and the liveobjects
/// MQTT ingest path.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LiveobjectsStationRow {
    pub station: Uuid,
    pub stream_id: String,
}

/// One row of `vp2_stations`: the dial-out address and local calibration
/// for a station reachable as a direct serial-over-IP device.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Vp2StationRow {
    pub station: Uuid,
    pub host: String,
    pub port: i32,
    pub rain_collector_imperial: bool,
}

/// One row of `virtual_stations`: a synthetic station computed by merging
/// other stations' observations. `sources` is a JSONB object mapping each
/// source station's UUID (as a string key) to the list of field names
/// that source contributes.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct VirtualStationRow {
    pub station: Uuid,
    pub period_minutes: i32,
    pub sources: JsonValue,
}
