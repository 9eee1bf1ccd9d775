//! The normalized observation record (C2) and the other small value types
//! shared by every component: station identity, cached per-station
//! counters, station metadata, job requests, and scheduler status.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 128-bit station identifier. `Uuid` already compares and orders as its
/// underlying 16-byte array, which is the ordering this platform relies on.
pub type StationId = uuid::Uuid;

/// A numeric observation value. Kept as two variants (rather than a single
/// `f64`) so integer fields such as humidity percentage or wind direction
/// degrees round-trip exactly.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Float(f64),
    Int(i64),
}

impl FieldValue {
    pub fn as_f64(&self) -> f64 {
        match self {
            FieldValue::Float(v) => *v,
            FieldValue::Int(v) => *v as f64,
        }
    }

    pub fn as_i64(&self) -> i64 {
        match self {
            FieldValue::Float(v) => *v as i64,
            FieldValue::Int(v) => *v,
        }
    }
}

/// Well-known field names used across decoders. Using `&'static str`
/// constants instead of an enum keeps the field set open — new sensor
/// models can introduce fields without touching this crate.
pub mod fields {
    pub const OUTSIDE_TEMP: &str = "outsidetemp";
    pub const MIN_OUTSIDE_TEMP: &str = "min_outside_temperature";
    pub const MAX_OUTSIDE_TEMP: &str = "max_outside_temperature";
    pub const INSIDE_TEMP: &str = "insidetemp";
    pub const OUTSIDE_HUM: &str = "outsidehum";
    pub const INSIDE_HUM: &str = "insidehum";
    pub const WIND_SPEED: &str = "windspeed";
    pub const MIN_WIND_SPEED: &str = "min_windspeed";
    pub const WIND_GUST: &str = "windgust";
    pub const MAX_WIND_GUST: &str = "max_windgust";
    pub const WIND_DIR: &str = "winddir";
    pub const WIND_SPEED_STDEV: &str = "wind_speed_stdev";
    pub const WIND_DIR_STDEV: &str = "wind_dir_stdev";
    pub const RAINFALL: &str = "rainfall";
    pub const RAINRATE: &str = "rainrate";
    pub const MAX_RAINRATE: &str = "max_rainrate";
    pub const PRESSURE: &str = "barometer";
    pub const DEW_POINT: &str = "dewpoint";
    pub const HEAT_INDEX: &str = "heatindex";
    pub const WIND_CHILL: &str = "windchill";
    pub const RADIATION: &str = "radiation";
    pub const MAX_RADIATION: &str = "max_radiation";
    pub const UV_INDEX: &str = "uv_index";
    pub const VOLTAGE_BATTERY: &str = "voltage_battery";
    pub const VOLTAGE_SOLAR: &str = "voltage_solar_panel";
    pub const LEAF_WETNESS: &str = "leaf_wetness";
    pub const SOIL_MOISTURE: &str = "soil_moisture";
    pub const SOIL_TEMP: &str = "soil_temp";
    pub const PROBE_TEMP1: &str = "probe_temperature1";
    pub const PROBE_TEMP2: &str = "probe_temperature2";
    pub const PROBE_TEMP3: &str = "probe_temperature3";
}

/// The normalized in-memory weather record: mandatory station/day/time
/// plus an open set of optional measurement fields, each explicitly
/// `{present, value}` rather than relying on `NaN` to mean absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub station: StationId,
    pub day: NaiveDate,
    pub time: DateTime<Utc>,
    #[serde(flatten)]
    values: HashMap<String, FieldValue>,
}

impl Observation {
    /// `day` is derived from `time`, enforcing the `day == floor_to_day(time)`
    /// invariant at construction so it can never drift from it afterwards.
    pub fn new(station: StationId, time: DateTime<Utc>) -> Self {
        Observation {
            station,
            day: time.date_naive(),
            time,
            values: HashMap::new(),
        }
    }

    /// Set a field to a present value, or clear it to absent (`None`).
    /// A `NaN` float is treated as absent, per the "no NaN-as-absent
    /// conflation" design rule: the field is simply not recorded.
    pub fn set(&mut self, name: &str, value: Option<FieldValue>) {
        match value {
            Some(FieldValue::Float(v)) if v.is_nan() => {
                self.values.remove(name);
            }
            Some(v) => {
                self.values.insert(name.to_string(), v);
            }
            None => {
                self.values.remove(name);
            }
        }
    }

    pub fn set_float(&mut self, name: &str, value: Option<f64>) {
        self.set(name, value.map(FieldValue::Float));
    }

    pub fn set_int(&mut self, name: &str, value: Option<i64>) {
        self.set(name, value.map(FieldValue::Int));
    }

    pub fn is_present(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<FieldValue> {
        self.values.get(name).copied()
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.values.get(name).map(FieldValue::as_f64)
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.values.get(name).map(FieldValue::as_i64)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(|s| s.as_str())
    }

    /// Borrow every present field at once, for storage layers that
    /// persist the whole set as a single document rather than through
    /// this type's field-by-field accessors.
    pub fn values(&self) -> &HashMap<String, FieldValue> {
        &self.values
    }

    /// Rebuild an `Observation` from its parts, for storage layers
    /// reading a previously persisted record back out. `day` is
    /// recomputed from `time` rather than trusted, preserving the same
    /// invariant [`Observation::new`] enforces.
    pub fn from_parts(station: StationId, time: DateTime<Utc>, values: HashMap<String, FieldValue>) -> Self {
        Observation {
            station,
            day: time.date_naive(),
            time,
            values,
        }
    }
}

/// A per-station, per-key `(updated-at, value)` pair, owned by the
/// observation store facade (C4). Read-your-writes within a single
/// process; no cross-process ordering is guaranteed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CachedCounter<T> {
    pub updated_at: DateTime<Utc>,
    pub value: T,
}

/// Per-station metadata, loaded at start/reload and read-only inside the core.
#[derive(Debug, Clone, PartialEq)]
pub struct StationMetadata {
    pub station: StationId,
    pub name: String,
    pub polling_period_minutes: i32,
    pub last_archive: DateTime<Utc>,
    pub timezone: String,
    pub latitude: f64,
    pub longitude: f64,
    pub elevation: f64,
    pub may_store_inside_measurements: bool,
}

/// The kind of downstream job the debounced publisher can enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Minmax,
    AnomalyMonitoring,
    MonthMinmax,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JobRequest {
    pub station: StationId,
    pub range_begin: DateTime<Utc>,
    pub range_end: DateTime<Utc>,
    pub kind: JobKind,
}

/// The short status string a connector reports to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShortStatus {
    Idle,
    Ok,
    Stopped,
}

impl std::fmt::Display for ShortStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ShortStatus::Idle => "IDLE",
            ShortStatus::Ok => "OK",
            ShortStatus::Stopped => "STOPPED",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerStatus {
    pub active_since: Option<DateTime<Utc>>,
    pub last_reload: Option<DateTime<Utc>>,
    pub last_download: Option<DateTime<Utc>>,
    pub downloads_since_reload: u64,
    pub next_download: Option<DateTime<Utc>>,
    pub short_status: ShortStatus,
}

impl Default for SchedulerStatus {
    fn default() -> Self {
        SchedulerStatus {
            active_since: None,
            last_reload: None,
            last_download: None,
            downloads_since_reload: 0,
            next_download: None,
            short_status: ShortStatus::Idle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn day_is_derived_from_time() {
        let t = Utc.with_ymd_and_hms(2022, 4, 29, 13, 37, 0).unwrap();
        let obs = Observation::new(StationId::nil(), t);
        assert_eq!(obs.day, t.date_naive());
    }

    #[test]
    fn nan_is_treated_as_absent() {
        let t = Utc::now();
        let mut obs = Observation::new(StationId::nil(), t);
        obs.set_float(fields::OUTSIDE_TEMP, Some(f64::NAN));
        assert!(!obs.is_present(fields::OUTSIDE_TEMP));
        assert_eq!(obs.get_f64(fields::OUTSIDE_TEMP), None);
    }

    #[test]
    fn present_value_round_trips() {
        let t = Utc::now();
        let mut obs = Observation::new(StationId::nil(), t);
        obs.set_float(fields::OUTSIDE_TEMP, Some(18.4));
        assert!(obs.is_present(fields::OUTSIDE_TEMP));
        assert_eq!(obs.get_f64(fields::OUTSIDE_TEMP), Some(18.4));
    }
}
