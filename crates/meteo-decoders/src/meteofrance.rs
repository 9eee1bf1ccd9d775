//! Météo France RADOME hourly observation API: a JSON object per
//! station per hour, field names following MF's public open-data
//! vocabulary (`t`, `u`, `ff`, `dd`, `rr1`, ...). Temperatures in the
//! feed are degrees Kelvin; everything else converts as published.

use chrono::{DateTime, Utc};
use meteo_core::{fields, Observation, StationId};
use serde_json::Value;

fn kelvin_to_celsius(k: f64) -> f64 {
    k - 273.15
}

fn get_f64(payload: &Value, key: &str) -> Option<f64> {
    payload.get(key).and_then(Value::as_f64)
}

fn get_i64(payload: &Value, key: &str) -> Option<i64> {
    payload.get(key).and_then(Value::as_i64)
}

/// One decoded hourly observation for a RADOME station.
#[derive(Debug, Default, Clone)]
pub struct MfRadomeMessage {
    valid: bool,
    mf_id: String,
    timestamp: Option<DateTime<Utc>>,
    rainfall_1h: Option<f64>,
    wind_speed: Option<f64>,
    wind_dir: Option<i64>,
    wind_gust_speed: Option<f64>,
    wind_gust_dir: Option<i64>,
    outside_temp: Option<f64>,
    dew_point: Option<f64>,
    min_outside_temp: Option<f64>,
    max_outside_temp: Option<f64>,
    outside_hum: Option<f64>,
    min_outside_hum: Option<f64>,
    max_outside_hum: Option<f64>,
    sea_level_pressure: Option<f64>,
    pressure: Option<f64>,
    radiation: Option<f64>,
    insolation_minutes: Option<i64>,
}

impl MfRadomeMessage {
    pub fn new() -> Self {
        Self::default()
    }

    /// `mf_id` is the station identifier under which this record was
    /// fetched from the API, used only to correlate against station
    /// metadata before insertion — it never becomes the observation's
    /// own `StationId`.
    pub fn parse(&mut self, mf_id: impl Into<String>, payload: &Value, timestamp: DateTime<Utc>) {
        self.mf_id = mf_id.into();
        self.timestamp = Some(timestamp);

        self.rainfall_1h = get_f64(payload, "rr1");
        self.wind_speed = get_f64(payload, "ff");
        self.wind_dir = get_i64(payload, "dd");
        self.wind_gust_speed = get_f64(payload, "fxy").or_else(|| get_f64(payload, "fxi"));
        self.wind_gust_dir = get_i64(payload, "dxy").or_else(|| get_i64(payload, "dxi"));
        self.outside_temp = get_f64(payload, "t").map(kelvin_to_celsius);
        self.dew_point = get_f64(payload, "td").map(kelvin_to_celsius);
        self.min_outside_temp = get_f64(payload, "tn").map(kelvin_to_celsius);
        self.max_outside_temp = get_f64(payload, "tx").map(kelvin_to_celsius);
        self.outside_hum = get_f64(payload, "u");
        self.min_outside_hum = get_f64(payload, "un");
        self.max_outside_hum = get_f64(payload, "ux");
        self.sea_level_pressure = get_f64(payload, "pmer").map(|v| v / 100.0);
        self.pressure = get_f64(payload, "pres").map(|v| v / 100.0);
        self.radiation = get_f64(payload, "glo");
        self.insolation_minutes = get_i64(payload, "insolh");

        self.valid = true;
    }

    pub fn looks_valid(&self) -> bool {
        self.valid
    }

    pub fn mf_id(&self) -> &str {
        &self.mf_id
    }

    pub fn to_observation(&self, station: StationId) -> Observation {
        let mut obs = Observation::new(station, self.timestamp.unwrap_or_else(Utc::now));
        obs.set_float(fields::RAINFALL, self.rainfall_1h);
        obs.set_float(fields::WIND_SPEED, self.wind_speed);
        obs.set_int(fields::WIND_DIR, self.wind_dir);
        obs.set_float(fields::WIND_GUST, self.wind_gust_speed);
        obs.set_float(fields::OUTSIDE_TEMP, self.outside_temp);
        obs.set_float(fields::DEW_POINT, self.dew_point);
        obs.set_float(fields::MIN_OUTSIDE_TEMP, self.min_outside_temp);
        obs.set_float(fields::MAX_OUTSIDE_TEMP, self.max_outside_temp);
        obs.set_int(fields::OUTSIDE_HUM, self.outside_hum.map(|v| v.round() as i64));
        obs.set_float(fields::PRESSURE, self.sea_level_pressure.or(self.pressure));
        obs.set_float(fields::RADIATION, self.radiation);
        obs
    }

    pub fn describe(&self) -> serde_json::Value {
        serde_json::json!({
            "model": "meteo_france_radome",
            "mf_id": self.mf_id,
            "value": { "temperature": self.outside_temp, "rainfall_1h": self.rainfall_1h },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn kelvin_fields_convert_to_celsius() {
        let mut m = MfRadomeMessage::new();
        let payload = serde_json::json!({ "t": 293.15, "u": 55, "ff": 3.2, "dd": 180, "rr1": 0.4 });
        m.parse("07510", &payload, Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap());
        assert!(m.looks_valid());
        assert!((m.outside_temp.unwrap() - 20.0).abs() < 1e-9);
        assert_eq!(m.wind_dir, Some(180));
    }

    #[test]
    fn missing_optional_fields_are_absent() {
        let mut m = MfRadomeMessage::new();
        let payload = serde_json::json!({ "t": 290.0 });
        m.parse("07510", &payload, Utc::now());
        assert!(m.wind_speed.is_none());
        assert!(m.rainfall_1h.is_none());
    }
}
