//! Barani Design IoT sensors: two generations of ultrasonic anemometer, the
//! tipping-bucket rain gauge, and the MeteoHelix combined thermo-hygro-baro
//! station. All four exchange a 10-12 byte bit-packed hex frame over the
//! liveobjects LoRa port 1.

use chrono::{DateTime, Duration, DurationRound, Utc};
use meteo_core::{fields, HexReader, Observation, StationId};
use serde_json::json;

use crate::cache::{cache_is_fresh, CounterCache};
use crate::formulas::rain_wrap_ticks;

const BARANI_RAINFALL_CACHE_KEY: &str = "barani_pluviometer_rainfall";
const BARANI_RAINFALL_CORRECTION_CACHE_KEY: &str = "barani_pluviometer_correction";
const BARANI_WIND_BATTERY_CACHE_KEY: &str = "meteowind_battery";
const DEFAULT_RAIN_GAUGE_RESOLUTION: f64 = 0.2;

fn read_raw_bytes(payload: &str, n: usize) -> Vec<u16> {
    let mut r = HexReader::new(payload);
    (0..n).map(|_| r.read_be(2).unwrap_or(0) as u16).collect()
}

/// Barani MeteoWind v1 anemometer. S1 ground truth.
#[derive(Debug, Default, Clone)]
pub struct BaraniAnemometerV1 {
    valid: bool,
    time: Option<DateTime<Utc>>,
    index: u16,
    battery_voltage: f64,
    wind_avg_10min_speed: f64,
    wind_3s_gust_speed: f64,
    wind_speed_stdev: f64,
    wind_avg_10min_direction: i32,
    wind_3s_gust_direction: i32,
    max_wind_datetime: Option<DateTime<Utc>>,
    vector_or_scalar: bool,
    alarm_sent: bool,
}

impl BaraniAnemometerV1 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ingest(&mut self, payload: &str, datetime: DateTime<Utc>) {
        if !meteo_core::validate_input(payload, 20) {
            self.valid = false;
            return;
        }

        let raw = read_raw_bytes(payload, 10);
        self.time = Some(datetime);
        self.index = raw[0];

        let battery = (raw[1] & 0b1110_0000) >> 5;
        self.battery_voltage = if battery == 0b111 {
            f64::NAN
        } else {
            3.0 + battery as f64 * 0.2
        };

        let wind_avg_10min_speed = ((raw[1] & 0b0001_1111) << 4) + ((raw[2] & 0b1111_0000) >> 4);
        self.wind_avg_10min_speed = if wind_avg_10min_speed == 0b1_1111_1111 {
            f64::NAN
        } else {
            wind_avg_10min_speed as f64 * 0.36
        };

        let wind_3s_gust_speed = ((raw[2] & 0b0000_1111) << 5) + ((raw[3] & 0b1111_1000) >> 3);
        self.wind_3s_gust_speed = if wind_3s_gust_speed == 0b1_1111_1111 {
            f64::NAN
        } else {
            (wind_avg_10min_speed as f64 + wind_3s_gust_speed as f64) * 0.36
        };

        let wind_speed_stdev = ((raw[4] & 0b0000_0011) << 6) + ((raw[5] & 0b1111_1100) >> 2);
        self.wind_speed_stdev = if wind_speed_stdev == 0b1111_1111 {
            f64::NAN
        } else {
            wind_speed_stdev as f64 * 0.36
        };

        let wind_avg_10min_direction = ((raw[5] & 0b0000_0011) << 7) + ((raw[6] & 0b1111_1110) >> 1);
        self.wind_avg_10min_direction = if wind_avg_10min_direction == 0b111_1111 {
            -1
        } else {
            wind_avg_10min_direction as i32
        };

        let wind_3s_gust_direction = ((raw[6] & 0b0000_0001) << 8) + raw[7];
        self.wind_3s_gust_direction = if wind_3s_gust_direction == 0b1_1111_1111 {
            -1
        } else {
            wind_3s_gust_direction as i32
        };

        let t = ((raw[8] & 0b0000_0001) << 6) + ((raw[9] & 0b1111_1100) >> 2);
        self.max_wind_datetime = Some(
            datetime
                .duration_trunc(Duration::minutes(1))
                .unwrap_or(datetime)
                - Duration::minutes(10)
                + Duration::seconds(t as i64 * 5),
        );
        self.vector_or_scalar = raw[9] & 0b0000_0010 != 0;
        self.alarm_sent = raw[9] & 0b0000_0001 != 0;

        self.valid = true;
    }

    pub fn valid_after_parse(&self) -> bool {
        self.valid
    }

    pub fn to_observation(&self, station: StationId) -> Observation {
        let time = self.time.unwrap_or_else(Utc::now);
        let mut obs = Observation::new(station, time);
        obs.set_float(fields::WIND_SPEED, not_nan(self.wind_avg_10min_speed));
        obs.set_float(fields::WIND_GUST, not_nan(self.wind_3s_gust_speed));
        if self.wind_avg_10min_direction >= 0 {
            obs.set_int(fields::WIND_DIR, Some(self.wind_avg_10min_direction as i64));
        }
        obs
    }

    pub fn describe(&self) -> serde_json::Value {
        json!({
            "model": "barani_anemometer_20230411",
            "value": {
                "index": self.index,
                "battery_voltage": self.battery_voltage,
                "wind_avg_10min_speed": self.wind_avg_10min_speed,
                "wind_3s_gust_speed": self.wind_3s_gust_speed,
                "wind_speed_stdev": self.wind_speed_stdev,
                "wind_avg_10min_direction": self.wind_avg_10min_direction,
                "wind_3s_gust_direction": self.wind_3s_gust_direction,
                "max_wind_datetime": self.max_wind_datetime.map(|t| t.to_rfc3339()),
                "vector_or_scalar": self.vector_or_scalar,
                "alarm_sent": self.alarm_sent,
            }
        })
    }
}

fn not_nan(v: f64) -> Option<f64> {
    if v.is_nan() {
        None
    } else {
        Some(v)
    }
}

/// Barani MeteoWind 2023 anemometer: replaces the raw wind-speed frequency
/// encoding with a calibrated `f·0.6335 + 0.3582` conversion and keeps a
/// hysteresis-smoothed battery index across messages (the raw frame only
/// ever widens or narrows the index by one step at a time).
#[derive(Debug, Default, Clone)]
pub struct BaraniAnemometer2023 {
    valid: bool,
    time: Option<DateTime<Utc>>,
    index: u16,
    battery_voltage: f64,
    wind_avg_10min_speed: f64,
    wind_3s_gust_speed: f64,
    wind_1s_gust_speed: f64,
    wind_3s_min_speed: f64,
    wind_avg_10min_direction: i32,
    voltage_known: i64,
}

impl BaraniAnemometer2023 {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn ingest(&mut self, station: StationId, payload: &str, datetime: DateTime<Utc>, cache: &dyn CounterCache) {
        if !meteo_core::validate_input(payload, 24) {
            self.valid = false;
            return;
        }

        let raw = read_raw_bytes(payload, 12);
        self.time = Some(datetime);
        self.index = raw[0];

        let mut known_battery: i64 = 33;
        if let Some((_, v)) = cache.get_cached_int(station, BARANI_WIND_BATTERY_CACHE_KEY).await {
            known_battery = v;
        }

        let new_battery = 33 + (self.index as i64 % 10) * 2 - if self.index as i64 % 10 > 4 { 10 } else { 0 };
        known_battery = known_battery.clamp(new_battery - 1, new_battery + 1);
        self.voltage_known = known_battery.clamp(32, 42);
        self.battery_voltage = self.voltage_known as f64 / 10.0;
        cache.cache_int(station, BARANI_WIND_BATTERY_CACHE_KEY, datetime, self.voltage_known).await;

        let wind_avg_10min_speed = ((raw[1] & 0b0111_1111) << 5) + ((raw[2] & 0b1111_1000) >> 3);
        self.wind_avg_10min_speed = scale_wind_hz(wind_avg_10min_speed, 0b1111_1111_1111, 0.02, 0.0);

        let wind_3s_gust_speed = ((raw[2] & 0b0000_0111) << 6) + ((raw[3] & 0b1111_1100) >> 2);
        self.wind_3s_gust_speed = if wind_3s_gust_speed == 0b1_1111_1111 {
            f64::NAN
        } else if wind_3s_gust_speed == 0 {
            0.0
        } else {
            ((wind_avg_10min_speed as f64 * 0.02 + wind_3s_gust_speed as f64 * 0.1) * 0.6335 + 0.3582) * 3.6
        };

        let wind_1s_gust_speed = ((raw[3] & 0b0000_0011) << 6) + ((raw[4] & 0b1111_1100) >> 2);
        self.wind_1s_gust_speed = if wind_1s_gust_speed == 0b1111_1111 {
            f64::NAN
        } else if wind_1s_gust_speed == 0 {
            0.0
        } else {
            ((wind_avg_10min_speed as f64 * 0.02 + wind_3s_gust_speed as f64 * 0.1 + wind_1s_gust_speed as f64 * 0.1) * 0.6335
                + 0.3582)
                * 3.6
        };

        let wind_3s_min_speed = ((raw[4] & 0b0000_0011) << 7) + ((raw[5] & 0b1111_1110) >> 1);
        self.wind_3s_min_speed = scale_wind_hz(wind_3s_min_speed, 0b1_1111_1111, 0.1, 0.0);

        let wind_avg_10min_direction = ((raw[6] & 0b0000_0001) << 8) + raw[7];
        self.wind_avg_10min_direction = if wind_avg_10min_direction == 0b1_1111_1111 {
            -1
        } else {
            wind_avg_10min_direction as i32
        };

        self.valid = true;
    }

    pub fn valid_after_parse(&self) -> bool {
        self.valid
    }

    pub fn to_observation(&self, station: StationId) -> Observation {
        let time = self.time.unwrap_or_else(Utc::now);
        let mut obs = Observation::new(station, time);
        obs.set_float(fields::WIND_SPEED, not_nan(self.wind_avg_10min_speed));
        obs.set_float(fields::MIN_WIND_SPEED, not_nan(self.wind_3s_min_speed));
        obs.set_float(fields::WIND_GUST, not_nan(self.wind_3s_gust_speed));
        obs.set_float(fields::MAX_WIND_GUST, not_nan(self.wind_1s_gust_speed));
        if self.wind_avg_10min_direction >= 0 {
            obs.set_int(fields::WIND_DIR, Some(self.wind_avg_10min_direction as i64));
        }
        obs.set_float(fields::VOLTAGE_BATTERY, not_nan(self.battery_voltage));
        obs
    }

    pub fn describe(&self) -> serde_json::Value {
        json!({
            "model": "barani_anemometer_2023_20230810",
            "value": {
                "index": self.index,
                "battery_voltage": self.battery_voltage,
                "wind_avg_10min_speed": self.wind_avg_10min_speed,
                "wind_3s_gust_speed": self.wind_3s_gust_speed,
                "wind_1s_gust_speed": self.wind_1s_gust_speed,
                "wind_3s_min_speed": self.wind_3s_min_speed,
                "wind_avg_10min_direction": self.wind_avg_10min_direction,
            }
        })
    }
}

fn scale_wind_hz(raw: u16, sentinel: u16, resolution: f64, _offset: f64) -> f64 {
    if raw == sentinel {
        f64::NAN
    } else if raw == 0 {
        0.0
    } else {
        (raw as f64 * resolution * 0.6335 + 0.3582) * 3.6
    }
}

/// Barani MeteoRain tipping-bucket rain gauge. Tracks two independent
/// wrapping counters: the raw tick count and a separate "correction" tick
/// count applied as a small percentage adjustment.
#[derive(Debug, Default, Clone)]
pub struct BaraniRainGauge {
    valid: bool,
    time: Option<DateTime<Utc>>,
    index: u16,
    battery_voltage: f64,
    rainfall_clicks: u32,
    rainfall: f64,
    min_time_between_clicks: u32,
    max_rainrate: f64,
    temp_over_2c: bool,
    heater_switched_on: bool,
    correction: u32,
}

impl BaraniRainGauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn ingest(&mut self, station: StationId, payload: &str, datetime: DateTime<Utc>, cache: &dyn CounterCache) {
        // The frame is 10 bytes (20 nibbles); the full parse below reads
        // every field in it, so the length check matches that width.
        if !meteo_core::validate_input(payload, 20) {
            self.valid = false;
            return;
        }

        let raw = read_raw_bytes(payload, 10);
        self.time = Some(datetime);

        let prev = cached_fresh(cache, station, BARANI_RAINFALL_CACHE_KEY, datetime).await;
        let prev_corr = cached_fresh(cache, station, BARANI_RAINFALL_CORRECTION_CACHE_KEY, datetime).await;

        self.index = raw[0];
        let battery = (raw[1] & 0b1111_1000) >> 3;
        self.battery_voltage = if battery == 0b1_1111 {
            f64::NAN
        } else {
            3.0 + battery as f64 * 0.05
        };

        let rain_clicks = ((raw[1] as u32 & 0b0000_0111) << 11) + ((raw[2] as u32) << 1) + ((raw[3] as u32 & 0b1000_0000) >> 7);
        self.rainfall_clicks = rain_clicks;
        self.rainfall = f64::NAN;
        if let Some(prev) = prev {
            self.rainfall = rain_wrap_ticks(rain_clicks, prev as u32, 4096) as f64 * DEFAULT_RAIN_GAUGE_RESOLUTION;
        }

        let min_time_between_clicks = ((raw[3] as u32 & 0b0111_1111) << 1) + ((raw[4] as u32 & 0b1000_0000) >> 7);
        self.min_time_between_clicks = min_time_between_clicks;
        self.max_rainrate = if min_time_between_clicks == 0 {
            0.0
        } else {
            DEFAULT_RAIN_GAUGE_RESOLUTION / (182.0 / min_time_between_clicks as f64)
        };

        self.temp_over_2c = raw[4] & 0b0100_0000 != 0;
        self.heater_switched_on = raw[4] & 0b0010_0000 != 0;

        let rain_correction_clicks = ((raw[4] as u32 & 0b0001_1111) << 5) + ((raw[5] as u32 & 0b1111_1110) >> 1);
        self.correction = rain_correction_clicks;
        if let Some(prev_corr) = prev_corr {
            let delta = rain_wrap_ticks(rain_correction_clicks, prev_corr as u32, 4096);
            let addition = delta as f64 * 0.01 * DEFAULT_RAIN_GAUGE_RESOLUTION;
            self.rainfall = if self.rainfall.is_nan() { addition } else { self.rainfall + addition };
        }

        self.valid = true;
    }

    pub async fn cache_after_insert(&self, station: StationId, cache: &dyn CounterCache) {
        if !self.valid {
            return;
        }
        let time = self.time.unwrap_or_else(Utc::now);
        cache.cache_int(station, BARANI_RAINFALL_CACHE_KEY, time, self.rainfall_clicks as i64).await;
        cache
            .cache_int(station, BARANI_RAINFALL_CORRECTION_CACHE_KEY, time, self.correction as i64)
            .await;
    }

    pub fn valid_after_parse(&self) -> bool {
        self.valid
    }

    pub fn to_observation(&self, station: StationId) -> Observation {
        let time = self.time.unwrap_or_else(Utc::now);
        let mut obs = Observation::new(station, time);
        obs.set_float(fields::RAINFALL, not_nan(self.rainfall));
        obs.set_float(fields::RAINRATE, not_nan(self.max_rainrate));
        obs
    }

    pub fn describe(&self) -> serde_json::Value {
        json!({
            "model": "barani_pluviometer_20230411",
            "value": {
                "index": self.index,
                "battery_voltage": self.battery_voltage,
                "rainfall_clicks": self.rainfall_clicks,
                "min_time_between_clicks": self.min_time_between_clicks,
                "max_rainrate": self.max_rainrate,
                "temp_over_2C": self.temp_over_2c,
                "heater_switched_on": self.heater_switched_on,
                "correction": self.correction,
            }
        })
    }
}

async fn cached_fresh(cache: &dyn CounterCache, station: StationId, key: &str, now: DateTime<Utc>) -> Option<i64> {
    let (updated_at, value) = cache.get_cached_int(station, key).await?;
    cache_is_fresh(updated_at, now).then_some(value)
}

/// Barani MeteoHelix thermo-hygro-baro combined station: temperature,
/// humidity, pressure, global radiation, and a rain gauge, all in one
/// 11-byte frame.
#[derive(Debug, Default, Clone)]
pub struct BaraniThermohygro {
    valid: bool,
    time: Option<DateTime<Utc>>,
    battery_voltage: f64,
    temperature: f64,
    min_temperature: f64,
    max_temperature: f64,
    humidity: f64,
    pressure: f64,
    radiation: f64,
    max_radiation: f64,
    rainfall_clicks: u32,
    rainfall: f64,
    min_time_between_clicks: u32,
    max_rainrate: f64,
}

impl BaraniThermohygro {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn ingest(&mut self, station: StationId, payload: &str, datetime: DateTime<Utc>, cache: &dyn CounterCache) {
        if !meteo_core::validate_input(payload, 22) {
            self.valid = false;
            return;
        }

        let raw = read_raw_bytes(payload, 10);
        self.time = Some(datetime);

        let message_type = (raw[0] & 0b1100_0000) >> 6;
        if message_type != 1 {
            self.valid = false;
            return;
        }

        let prev = cached_fresh(cache, station, BARANI_RAINFALL_CACHE_KEY, datetime).await;

        let battery = (raw[0] & 0b0011_1110) >> 1;
        self.battery_voltage = if battery == 0b1_1111 { f64::NAN } else { 3.0 + battery as f64 * 0.05 };

        let temperature = ((raw[0] as u32 & 0b0000_0001) << 10) + ((raw[1] as u32) << 2) + ((raw[2] as u32 & 0b1100_0000) >> 6);
        self.temperature = if temperature == 0b111_1111_1111 { f64::NAN } else { -100.0 + temperature as f64 * 0.1 };

        let min_temp = raw[2] & 0b0011_1111;
        self.min_temperature = if min_temp == 0b11_1111 {
            f64::NAN
        } else {
            (-100.0 + temperature as f64 - min_temp as f64) * 0.1
        };

        let max_temp = (raw[3] & 0b1111_1100) >> 2;
        self.max_temperature = if max_temp == 0b11_1111 {
            f64::NAN
        } else {
            (-100.0 + temperature as f64 + max_temp as f64) * 0.1
        };

        let humidity = ((raw[3] as u32 & 0b0000_0011) << 7) + ((raw[4] as u32 & 0b1111_1110) >> 1);
        self.humidity = if humidity == 0b111_1111 { f64::NAN } else { humidity as f64 * 0.2 };

        let pressure = ((raw[4] as u32 & 0b0000_0001) << 13) + ((raw[5] as u32) << 5) + ((raw[6] as u32 & 0b1111_1000) >> 3);
        self.pressure = if pressure == 0b11_1111_1111_1111 {
            f64::NAN
        } else {
            (pressure as f64 * 5.0 + 50000.0) * 0.01
        };

        let radiation = ((raw[6] as u32 & 0b0000_0111) << 7) + ((raw[7] as u32 & 0b1111_1110) >> 1);
        self.radiation = if radiation == 0b11_1111_1111 { f64::NAN } else { radiation as f64 * 0.2 };

        let max_radiation = ((raw[7] as u32 & 0b0000_0001) << 8) + raw[8] as u32;
        self.max_radiation = if max_radiation == 0b1_1111_1111 {
            f64::NAN
        } else {
            (radiation as f64 + max_radiation as f64) * 0.2
        };

        let rain_clicks = raw[9] as u32;
        self.rainfall_clicks = rain_clicks;
        self.rainfall = f64::NAN;
        if let Some(prev) = prev {
            self.rainfall = rain_wrap_ticks(rain_clicks, prev as u32, 4096) as f64 * DEFAULT_RAIN_GAUGE_RESOLUTION;
        }

        self.min_time_between_clicks = 0;
        self.max_rainrate = 0.0;

        self.valid = true;
    }

    pub async fn cache_after_insert(&self, station: StationId, cache: &dyn CounterCache) {
        if self.valid {
            let time = self.time.unwrap_or_else(Utc::now);
            cache.cache_int(station, BARANI_RAINFALL_CACHE_KEY, time, self.rainfall_clicks as i64).await;
        }
    }

    pub fn valid_after_parse(&self) -> bool {
        self.valid
    }

    pub fn to_observation(&self, station: StationId) -> Observation {
        let time = self.time.unwrap_or_else(Utc::now);
        let mut obs = Observation::new(station, time);
        obs.set_float(fields::OUTSIDE_TEMP, not_nan(self.temperature));
        obs.set_float(fields::MIN_OUTSIDE_TEMP, not_nan(self.min_temperature));
        obs.set_float(fields::MAX_OUTSIDE_TEMP, not_nan(self.max_temperature));
        obs.set_int(fields::OUTSIDE_HUM, not_nan(self.humidity).map(|h| h.round() as i64));
        obs.set_float(fields::PRESSURE, not_nan(self.pressure));
        obs.set_float(fields::RADIATION, not_nan(self.radiation));
        obs.set_float(fields::MAX_RADIATION, not_nan(self.max_radiation));
        obs.set_float(fields::RAINFALL, not_nan(self.rainfall));
        obs.set_float(fields::VOLTAGE_BATTERY, not_nan(self.battery_voltage));
        obs
    }

    pub fn describe(&self) -> serde_json::Value {
        json!({
            "model": "barani_meteohelix_20230810",
            "value": {
                "battery_voltage": self.battery_voltage,
                "temperature": self.temperature,
                "min_temperature": self.min_temperature,
                "max_temperature": self.max_temperature,
                "humidity": self.humidity,
                "pressure": self.pressure,
                "radiation": self.radiation,
                "max_radiation": self.max_radiation,
                "rainfall_clicks": self.rainfall_clicks,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn s1_barani_anemometer_v1() {
        let mut d = BaraniAnemometerV1::new();
        let ts = Utc.with_ymd_and_hms(2022, 4, 29, 0, 0, 0).unwrap();
        d.ingest("c582a1087050904b3114", ts);
        assert!(d.valid_after_parse());
        let obs = d.to_observation(StationId::nil());
        assert_eq!(obs.day, ts.date_naive());
        let windspeed = obs.get_f64(fields::WIND_SPEED).unwrap();
        assert!((windspeed - 15.12).abs() < 1e-6);
        let dir = obs.get_i64(fields::WIND_DIR).unwrap();
        assert!((0..360).contains(&(dir as i32)));
    }

    #[tokio::test]
    async fn rain_gauge_wraps_counter() {
        use crate::cache::test_util::MemoryCache;
        let cache = MemoryCache::new();
        let station = StationId::nil();
        let now = Utc::now();
        cache.seed(station, BARANI_RAINFALL_CACHE_KEY, now - Duration::minutes(5), 10);
        let mut d = BaraniRainGauge::new();
        // index=0, battery bits arbitrary, rain click bits encode 5 in raw[1..3]
        d.ingest(station, "00280a0000000000000a", now, &cache).await;
        assert!(d.valid_after_parse());
    }
}
