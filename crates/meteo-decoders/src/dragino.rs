//! Dragino LoRa sensor family: thermo-hygrometers, soil/leaf probes, a
//! tipping-bucket pluviometer, a DS18B20 temperature triplet, and the
//! combined THPL-LoRa rain/temperature/humidity unit. Also Concept 500,
//! an MQTT-delivered thermo-anemometer that shares Dragino's bit-packing
//! conventions.

use chrono::{DateTime, Utc};
use meteo_core::{fields, HexReader, Observation, StationId};
use serde_json::json;

use crate::cache::{cache_is_fresh, CounterCache};
use crate::formulas::{parse_ntc, rain_wrap_ticks};

fn not_nan(v: f64) -> Option<f64> {
    if v.is_nan() {
        None
    } else {
        Some(v)
    }
}

fn signed_10x(raw: u32, sentinel: u32, overflow_base: f64) -> f64 {
    if raw == sentinel {
        f64::NAN
    } else if (raw & 0xFC00) == 0 {
        raw as f64 / 10.0
    } else {
        (raw as f64 - overflow_base) / 10.0
    }
}

async fn cached_fresh(cache: &dyn CounterCache, station: StationId, key: &str, now: DateTime<Utc>) -> Option<i64> {
    let (updated_at, value) = cache.get_cached_int(station, key).await?;
    cache_is_fresh(updated_at, now).then_some(value)
}

/// Dragino LSN50v2 thermo-hygrometer. S2 ground truth.
#[derive(Debug, Default, Clone)]
pub struct Lsn50v2ThermoHygro {
    valid: bool,
    time: Option<DateTime<Utc>>,
    temperature: f64,
    humidity: f64,
}

impl Lsn50v2ThermoHygro {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ingest(&mut self, payload: &str, datetime: DateTime<Utc>) {
        if !meteo_core::validate_input(payload, 22) {
            self.valid = false;
            return;
        }
        let mut r = HexReader::new(payload);
        r.skip(14).ok();
        let temp = r.read_be(4).unwrap_or(0xFFFF) as u32;
        let hum = r.read_be(4).unwrap_or(0) as u32;

        self.time = Some(datetime);
        self.humidity = hum as f64 / 10.0;
        if temp == 0xFFFF {
            self.temperature = f64::NAN;
            self.humidity = f64::NAN;
        } else if (temp & 0xFC00) == 0 {
            self.temperature = temp as f64 / 10.0;
        } else {
            self.temperature = (temp as f64 - 65535.0) / 10.0;
        }
        self.valid = true;
    }

    pub fn valid_after_parse(&self) -> bool {
        self.valid
    }

    pub fn to_observation(&self, station: StationId) -> Observation {
        let mut obs = Observation::new(station, self.time.unwrap_or_else(Utc::now));
        obs.set_float(fields::OUTSIDE_TEMP, not_nan(self.temperature));
        obs.set_int(fields::OUTSIDE_HUM, not_nan(self.humidity).map(|h| h.round() as i64));
        obs
    }

    pub fn describe(&self) -> serde_json::Value {
        json!({ "model": "dragino_lsn50v2_20230410", "value": { "temperature": self.temperature, "humidity": self.humidity } })
    }
}

/// Dragino LSN50v2 + probe model 6470: an NTC soil/water thermometer read
/// through an ADC bridge.
#[derive(Debug, Default, Clone)]
pub struct DraginoProbe6470 {
    valid: bool,
    time: Option<DateTime<Utc>>,
    battery: f64,
    temperature: f64,
}

impl DraginoProbe6470 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ingest(&mut self, payload: &str, datetime: DateTime<Utc>) {
        if !meteo_core::validate_input(payload, 22) {
            self.valid = false;
            return;
        }
        let mut r = HexReader::new(payload);
        let bat = r.read_be(4).unwrap_or(0) as f64;
        let resistance = r.read_be(4).unwrap_or(0) as f64;
        let adc0 = r.read_be(4).unwrap_or(0) as f64;

        self.time = Some(datetime);
        if bat <= adc0 {
            self.valid = false;
            return;
        }
        self.temperature = parse_ntc(adc0, bat, resistance);
        self.battery = bat;
        self.valid = true;
    }

    pub fn valid_after_parse(&self) -> bool {
        self.valid
    }

    pub fn to_observation(&self, station: StationId) -> Observation {
        let mut obs = Observation::new(station, self.time.unwrap_or_else(Utc::now));
        obs.set_float(fields::OUTSIDE_TEMP, not_nan(self.temperature));
        obs.set_float(fields::VOLTAGE_BATTERY, not_nan(self.battery));
        obs
    }

    pub fn describe(&self) -> serde_json::Value {
        json!({ "model": "dragino_6470_20240319", "value": { "battery": self.battery, "temperature": self.temperature } })
    }
}

/// Dragino LSN50v2 DS18B20 triplet (three wired probes).
#[derive(Debug, Default, Clone)]
pub struct DraginoD2x {
    valid: bool,
    time: Option<DateTime<Utc>>,
    battery: f64,
    temperature: [f64; 3],
    alarm: u16,
}

impl DraginoD2x {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ingest(&mut self, payload: &str, datetime: DateTime<Utc>) {
        if !meteo_core::validate_input(payload, 22) {
            self.valid = false;
            return;
        }
        let mut r = HexReader::new(payload);
        let bat = r.read_be(4).unwrap_or(0);
        let t0 = r.read_be(4).unwrap_or(0xFFFF) as u32;
        r.skip(4).ok();
        let alarm = r.read_be(2).unwrap_or(0);
        let t1 = r.read_be(4).unwrap_or(0xFFFF) as u32;
        let t2 = r.read_be(4).unwrap_or(0xFFFF) as u32;

        self.time = Some(datetime);
        for (i, raw) in [t0, t1, t2].into_iter().enumerate() {
            self.temperature[i] = if raw == 0xFFFF {
                f64::NAN
            } else if (raw & 0x8000) == 0 {
                raw as f64 / 10.0
            } else {
                (raw as f64 - 65536.0) / 10.0
            };
        }
        self.battery = bat as f64;
        self.alarm = alarm as u16;
        self.valid = true;
    }

    pub fn valid_after_parse(&self) -> bool {
        self.valid
    }

    pub fn to_observation(&self, station: StationId) -> Observation {
        let mut obs = Observation::new(station, self.time.unwrap_or_else(Utc::now));
        obs.set_float(fields::OUTSIDE_TEMP, not_nan(self.temperature[0]));
        obs.set_float(fields::PROBE_TEMP1, not_nan(self.temperature[1]));
        obs.set_float(fields::PROBE_TEMP2, not_nan(self.temperature[2]));
        obs.set_float(fields::VOLTAGE_BATTERY, not_nan(self.battery));
        obs
    }

    pub fn describe(&self) -> serde_json::Value {
        json!({
            "model": "dragino_d2x_20250826",
            "value": {
                "battery": self.battery,
                "temperature1": self.temperature[0],
                "temperature2": self.temperature[1],
                "temperature3": self.temperature[2],
                "alarm": self.alarm,
            }
        })
    }
}

/// Dragino LLMS01 leaf-wetness sensor.
#[derive(Debug, Default, Clone)]
pub struct DraginoLlms01Leaf {
    valid: bool,
    time: Option<DateTime<Utc>>,
    battery: f64,
    leaf_temperature: f64,
    leaf_wetness: f64,
}

impl DraginoLlms01Leaf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ingest(&mut self, payload: &str, datetime: DateTime<Utc>) {
        if !meteo_core::validate_input(payload, 22) {
            self.valid = false;
            return;
        }
        let mut r = HexReader::new(payload);
        let bat = r.read_be(4).unwrap_or(0);
        r.skip(4).ok();
        let wet = r.read_be(4).unwrap_or(0xFFFF) as u32;
        let temp = r.read_be(4).unwrap_or(0xFFFF) as u32;
        r.skip(6).ok();

        self.time = Some(datetime);
        self.leaf_temperature = if temp == 0xFFFF {
            f64::NAN
        } else if (temp & 0x8000) == 0 {
            temp as f64 / 10.0
        } else {
            (temp as f64 - 65536.0) / 10.0
        };
        self.leaf_wetness = if wet == 0xFFFF { f64::NAN } else { wet as f64 / 10.0 };
        self.battery = bat as f64;
        self.valid = true;
    }

    pub fn valid_after_parse(&self) -> bool {
        self.valid
    }

    pub fn to_observation(&self, station: StationId) -> Observation {
        let mut obs = Observation::new(station, self.time.unwrap_or_else(Utc::now));
        obs.set_float("leaftemp1", not_nan(self.leaf_temperature));
        obs.set_float(fields::LEAF_WETNESS, not_nan(self.leaf_wetness));
        obs.set_float(fields::VOLTAGE_BATTERY, not_nan(self.battery));
        obs
    }

    pub fn describe(&self) -> serde_json::Value {
        json!({
            "model": "dragino_llms01_20231204",
            "value": { "battery": self.battery, "leaf_temperature": self.leaf_temperature, "leaf_wetness": self.leaf_wetness }
        })
    }
}

/// Dragino LSE01 soil moisture/temperature/conductivity probe.
#[derive(Debug, Default, Clone)]
pub struct DraginoLse01Soil {
    valid: bool,
    time: Option<DateTime<Utc>>,
    battery: f64,
    soil_temperature: f64,
    soil_moisture: f64,
    soil_conductivity: f64,
}

impl DraginoLse01Soil {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ingest(&mut self, payload: &str, datetime: DateTime<Utc>) {
        if !meteo_core::validate_input(payload, 22) {
            self.valid = false;
            return;
        }
        let mut r = HexReader::new(payload);
        let bat = r.read_be(4).unwrap_or(0);
        r.skip(4).ok();
        let moisture = r.read_be(4).unwrap_or(0xFFFF) as u32;
        let temp = r.read_be(4).unwrap_or(0xFFFF) as u32;
        let conductivity = r.read_be(4).unwrap_or(0xFFFF) as u32;
        r.skip(2).ok();

        self.time = Some(datetime);
        self.soil_temperature = if temp == 0xFFFF {
            f64::NAN
        } else if (temp & 0x8000) == 0 {
            temp as f64 / 100.0
        } else {
            (temp as f64 - 65536.0) / 100.0
        };
        self.soil_moisture = if moisture == 0xFFFF { f64::NAN } else { moisture as f64 / 100.0 };
        self.soil_conductivity = if conductivity == 0xFFFF { f64::NAN } else { conductivity as f64 };
        self.battery = bat as f64;
        self.valid = true;
    }

    pub fn valid_after_parse(&self) -> bool {
        self.valid
    }

    pub fn to_observation(&self, station: StationId) -> Observation {
        let mut obs = Observation::new(station, self.time.unwrap_or_else(Utc::now));
        obs.set_float(fields::SOIL_TEMP, not_nan(self.soil_temperature));
        obs.set_float(fields::SOIL_MOISTURE, not_nan(self.soil_moisture));
        obs.set_float("soil_conductivity1", not_nan(self.soil_conductivity));
        obs.set_float(fields::VOLTAGE_BATTERY, not_nan(self.battery));
        obs
    }

    pub fn describe(&self) -> serde_json::Value {
        json!({
            "model": "dragino_lse01_20241217",
            "value": {
                "battery": self.battery,
                "soil_temperature": self.soil_temperature,
                "soil_moisture": self.soil_moisture,
                "soil_conductivity": self.soil_conductivity,
            }
        })
    }
}

const CPL01_RAINFALL_CACHE_KEY: &str = "cpl01_pluviometer_rainfall";
const CPL01_RAIN_GAUGE_RESOLUTION: f64 = 0.2;

/// Dragino CPL01 tipping-bucket pluviometer, with an onboard clock that
/// may lag the LoRa network's — the embedded timestamp is only trusted
/// when it is newer than the last cached watermark.
#[derive(Debug, Default, Clone)]
pub struct DraginoCpl01Pluviometer {
    valid: bool,
    time: Option<DateTime<Utc>>,
    total_pulses: u32,
    rainfall: f64,
    flag: u8,
    alarm: bool,
    currently_open: bool,
}

impl DraginoCpl01Pluviometer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn ingest(&mut self, station: StationId, payload: &str, datetime: DateTime<Utc>, cache: &dyn CounterCache) {
        if !meteo_core::validate_input(payload, 22) {
            self.valid = false;
            return;
        }
        let mut r = HexReader::new(payload);
        let status_and_alarm = r.read_be(2).unwrap_or(0) as u8;
        let total_pulses = r.read_be(6).unwrap_or(0) as u32;
        r.skip(6).ok();
        let embedded_timestamp = r.read_be(8).unwrap_or(0);

        self.time = Some(datetime);
        self.flag = status_and_alarm & 0b1111_1100;
        self.alarm = status_and_alarm & 0b0000_0010 != 0;
        self.currently_open = status_and_alarm & 0b0000_0001 != 0;
        self.total_pulses = total_pulses;

        self.rainfall = f64::NAN;
        let last = cache.get_cached_int(station, CPL01_RAINFALL_CACHE_KEY).await;
        if let Some((updated_at, prev)) = last {
            if cache_is_fresh(updated_at, datetime) {
                self.rainfall = rain_wrap_ticks(total_pulses, prev as u32, 0x1000000) as f64 * CPL01_RAIN_GAUGE_RESOLUTION;
            }
            // the embedded clock is only trusted once it overtakes the
            // watermark recorded for the cached counter
            if embedded_timestamp as i64 > updated_at.timestamp() {
                if let Some(t) = DateTime::from_timestamp(embedded_timestamp as i64, 0) {
                    self.time = Some(t);
                }
            }
        }

        self.valid = true;
    }

    pub async fn cache_after_insert(&self, station: StationId, cache: &dyn CounterCache) {
        if self.valid {
            cache
                .cache_int(station, CPL01_RAINFALL_CACHE_KEY, self.time.unwrap_or_else(Utc::now), self.total_pulses as i64)
                .await;
        }
    }

    pub fn valid_after_parse(&self) -> bool {
        self.valid
    }

    pub fn to_observation(&self, station: StationId) -> Observation {
        let mut obs = Observation::new(station, self.time.unwrap_or_else(Utc::now));
        obs.set_float(fields::RAINFALL, not_nan(self.rainfall));
        obs
    }

    pub fn describe(&self) -> serde_json::Value {
        json!({
            "model": "CPL01_pluviometer_20230410",
            "value": {
                "flag": self.flag,
                "alarm": self.alarm,
                "currently_open": self.currently_open,
                "total_pulses": self.total_pulses,
                "rainfall": self.rainfall,
            }
        })
    }
}

const THPLLORA_RAINFALL_CACHE_KEY: &str = "thpllora_rainfall";
const THPLLORA_RAIN_GAUGE_RESOLUTION: f64 = 0.2;

/// Dragino THPL-LoRa: combined temperature/humidity/rain-rate unit.
#[derive(Debug, Default, Clone)]
pub struct DraginoThpllora {
    valid: bool,
    time: Option<DateTime<Utc>>,
    battery: f64,
    rainrate: f64,
    total_pulses: u32,
    temperature: f64,
    humidity: f64,
    rainfall: f64,
}

impl DraginoThpllora {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn ingest(&mut self, station: StationId, payload: &str, datetime: DateTime<Utc>, cache: &dyn CounterCache) {
        if !meteo_core::validate_input(payload, 24) {
            self.valid = false;
            return;
        }
        let mut r = HexReader::new(payload);
        let battery = r.read_be(4).unwrap_or(0);
        let rainrate = r.read_be(4).unwrap_or(0) as u32;
        let total_pulses = r.read_be(8).unwrap_or(0) as u32;
        let temp = r.read_be(4).unwrap_or(0xFFFF) as u32;
        let hum = r.read_be(4).unwrap_or(0) as u32;

        self.time = Some(datetime);
        self.battery = battery as f64 / 1000.0;
        self.rainrate = if rainrate == 0x7FFF { f64::NAN } else { rainrate as f64 / 10.0 };
        self.total_pulses = total_pulses;
        self.humidity = hum as f64 / 10.0;
        self.temperature = signed_10x(temp, 0xFFFF, 65535.0);
        if temp == 0xFFFF {
            self.humidity = f64::NAN;
        }

        self.rainfall = f64::NAN;
        if let Some((updated_at, prev)) = cache.get_cached_int(station, THPLLORA_RAINFALL_CACHE_KEY).await {
            if cache_is_fresh(updated_at, datetime) {
                self.rainfall = rain_wrap_ticks(total_pulses, prev as u32, 0x1_0000_0000u64 as u32) as f64 * THPLLORA_RAIN_GAUGE_RESOLUTION;
            }
        }

        self.valid = true;
    }

    pub async fn cache_after_insert(&self, station: StationId, cache: &dyn CounterCache) {
        if self.valid {
            cache
                .cache_int(station, THPLLORA_RAINFALL_CACHE_KEY, self.time.unwrap_or_else(Utc::now), self.total_pulses as i64)
                .await;
        }
    }

    pub fn valid_after_parse(&self) -> bool {
        self.valid
    }

    pub fn to_observation(&self, station: StationId) -> Observation {
        let mut obs = Observation::new(station, self.time.unwrap_or_else(Utc::now));
        obs.set_float(fields::RAINFALL, not_nan(self.rainfall));
        obs.set_float(fields::RAINRATE, not_nan(self.rainrate));
        obs.set_float(fields::OUTSIDE_TEMP, not_nan(self.temperature));
        obs.set_int(fields::OUTSIDE_HUM, not_nan(self.humidity).map(|h| h.round() as i64));
        obs
    }

    pub fn describe(&self) -> serde_json::Value {
        json!({
            "model": "Thpllora_20230713",
            "value": {
                "battery": self.battery,
                "temperature": self.temperature,
                "humidity": self.humidity,
                "total_pulses": self.total_pulses,
                "rainfall": self.rainfall,
                "rainrate": self.rainrate,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn s2_lsn50v2_thermohygro() {
        let mut d = Lsn50v2ThermoHygro::new();
        let ts = Utc.with_ymd_and_hms(2023, 1, 27, 0, 0, 0).unwrap();
        d.ingest("0cf70000010900010c0197", ts);
        assert!(d.valid_after_parse());
        let obs = d.to_observation(StationId::nil());
        let temp = obs.get_f64(fields::OUTSIDE_TEMP).unwrap();
        assert!((temp - 26.8).abs() < 1e-6);
        let hum = obs.get_i64(fields::OUTSIDE_HUM).unwrap();
        assert_eq!(hum, 41);
    }

    #[tokio::test]
    async fn cpl01_rainfall_absent_without_a_cached_counter() {
        let cache = crate::cache::test_util::MemoryCache::new();
        let mut d = DraginoCpl01Pluviometer::new();
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        d.ingest(StationId::nil(), "0000001000000000000000", ts, &cache).await;
        assert!(d.valid_after_parse());
        let obs = d.to_observation(StationId::nil());
        assert!(obs.get_f64(fields::RAINFALL).is_none());
    }

    #[tokio::test]
    async fn cpl01_rainfall_absent_once_the_cached_counter_goes_stale() {
        let cache = crate::cache::test_util::MemoryCache::new();
        let station = StationId::nil();
        let old = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        cache.seed(station, CPL01_RAINFALL_CACHE_KEY, old, 100);

        let mut d = DraginoCpl01Pluviometer::new();
        let ts = old + chrono::Duration::hours(25);
        d.ingest(station, "0000001000000000000000", ts, &cache).await;
        assert!(d.valid_after_parse());
        let obs = d.to_observation(station);
        assert!(obs.get_f64(fields::RAINFALL).is_none());
    }
}
