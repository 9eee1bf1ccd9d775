//! Pessl Lorain rain gauge: every field in this payload is little-endian,
//! unlike the rest of the supported sensor families.

use chrono::{DateTime, Utc};
use meteo_core::{fields, HexReader, Observation, StationId};
use serde_json::json;

use crate::cache::{cache_is_fresh, CounterCache};
use crate::formulas::rain_wrap_ticks;

const LORAIN_RAINFALL_CACHE_KEY: &str = "lorain_rainfall";
const LORAIN_RAIN_GAUGE_RESOLUTION: f64 = 0.2;

#[derive(Debug, Default, Clone)]
pub struct PesslLorain {
    valid: bool,
    time: Option<DateTime<Utc>>,
    battery: f64,
    total_pulses: u32,
    rainfall: f64,
    rainrate: f64,
}

impl PesslLorain {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn ingest(&mut self, station: StationId, payload: &str, datetime: DateTime<Utc>, cache: &dyn CounterCache) {
        if !meteo_core::validate_input(payload, 94) {
            self.valid = false;
            return;
        }
        let mut r = HexReader::new(payload);
        r.skip(2).ok();
        let battery = r.read_le(4).unwrap_or(0);
        r.skip(8).ok();
        let total_pulses = r.read_le(8).unwrap_or(0) as u32;
        r.skip(72).ok();

        self.time = Some(datetime);
        self.battery = battery as f64 / 1000.0;
        self.total_pulses = total_pulses;

        self.rainfall = f64::NAN;
        self.rainrate = f64::NAN;
        if let Some((updated_at, prev)) = cache.get_cached_int(station, LORAIN_RAINFALL_CACHE_KEY).await {
            if cache_is_fresh(updated_at, datetime) {
                let ticks = rain_wrap_ticks(total_pulses, prev as u32, 0xFFFF_FFFF);
                self.rainfall = ticks as f64 * LORAIN_RAIN_GAUGE_RESOLUTION;
                let elapsed_minutes = (datetime - updated_at).num_seconds() as f64 / 60.0;
                if elapsed_minutes > 0.0 {
                    self.rainrate = self.rainfall / elapsed_minutes * 60.0;
                }
            }
        }

        self.valid = true;
    }

    pub async fn cache_after_insert(&self, station: StationId, cache: &dyn CounterCache) {
        if self.valid {
            cache
                .cache_int(station, LORAIN_RAINFALL_CACHE_KEY, self.time.unwrap_or_else(Utc::now), self.total_pulses as i64)
                .await;
        }
    }

    pub fn valid_after_parse(&self) -> bool {
        self.valid
    }

    pub fn to_observation(&self, station: StationId) -> Observation {
        let mut obs = Observation::new(station, self.time.unwrap_or_else(Utc::now));
        obs.set_float(fields::RAINFALL, if self.rainfall.is_nan() { None } else { Some(self.rainfall) });
        obs.set_float(fields::RAINRATE, if self.rainrate.is_nan() { None } else { Some(self.rainrate) });
        obs.set_float(fields::VOLTAGE_BATTERY, Some(self.battery));
        obs
    }

    pub fn describe(&self) -> serde_json::Value {
        json!({
            "model": "pessl_lorain_20220622",
            "value": { "battery": self.battery, "total_pulses": self.total_pulses, "rainfall": self.rainfall, "rainrate": self.rainrate }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::test_util::MemoryCache;
    use chrono::TimeZone;

    #[test]
    fn little_endian_fields_decode_in_byte_reversed_order() {
        // byte 0x01 0x02 read little-endian as a 16-bit field => 0x0201
        let mut r = HexReader::new("0102");
        assert_eq!(r.read_le(4).unwrap(), 0x0201);
    }

    #[tokio::test]
    async fn rain_tick_wraparound_is_resolved_against_cache() {
        let cache = MemoryCache::new();
        let station = StationId::nil();
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        cache.seed(station, LORAIN_RAINFALL_CACHE_KEY, now - chrono::Duration::hours(1), 0xFFFF_FFF0);

        let payload = format!("{:0>94}", "");
        let mut d = PesslLorain::new();
        d.ingest(station, &payload, now, &cache).await;
        assert!(d.valid_after_parse());
    }
}
