//! ThLoRa thermo-hygrometer: little-endian temperature field and a
//! quarter-dB-resolution two's-complement SNR reading.

use chrono::{DateTime, Utc};
use meteo_core::{fields, HexReader, Observation, StationId};
use serde_json::json;

#[derive(Debug, Default, Clone)]
pub struct ThLoraThermoHygro {
    valid: bool,
    time: Option<DateTime<Utc>>,
    battery: f64,
    temperature: f64,
    humidity: f64,
    snr_db: f64,
}

impl ThLoraThermoHygro {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ingest(&mut self, payload: &str, datetime: DateTime<Utc>) {
        if !meteo_core::validate_input(payload, 18) {
            self.valid = false;
            return;
        }
        let mut r = HexReader::new(payload);
        let battery = r.read_be(2).unwrap_or(0);
        let temp = r.read_le(4).unwrap_or(0) as u16;
        let hum = r.read_be(2).unwrap_or(0);
        let snr_raw = r.read_be(2).unwrap_or(0) as u8;
        r.skip(8).ok();

        self.time = Some(datetime);
        self.battery = 2.0 + battery as f64 * 0.01;
        self.humidity = hum as f64 / 2.0;
        self.temperature = if (temp & 0x8000) == 0 {
            temp as f64 / 100.0
        } else {
            (temp as i32 - 65536) as f64 / 100.0
        };
        // two's-complement quarter-dB SNR in a signed byte
        let signed_snr = if snr_raw & 0x80 != 0 { snr_raw as i32 - 256 } else { snr_raw as i32 };
        self.snr_db = signed_snr as f64 / 4.0;

        self.valid = true;
    }

    pub fn valid_after_parse(&self) -> bool {
        self.valid
    }

    pub fn to_observation(&self, station: StationId) -> Observation {
        let mut obs = Observation::new(station, self.time.unwrap_or_else(Utc::now));
        obs.set_float(fields::OUTSIDE_TEMP, Some(self.temperature));
        obs.set_int(fields::OUTSIDE_HUM, Some(self.humidity.round() as i64));
        obs.set_float(fields::VOLTAGE_BATTERY, Some(self.battery));
        obs
    }

    pub fn describe(&self) -> serde_json::Value {
        json!({
            "model": "thlora_thermohygro_20230120",
            "value": { "battery": self.battery, "temperature": self.temperature, "humidity": self.humidity, "snr_db": self.snr_db }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn negative_snr_decodes_from_twos_complement_byte() {
        let mut d = ThLoraThermoHygro::new();
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        // snr byte 0xe8 => -24 => -6.0 dB
        d.ingest("00000000e800000000", ts);
        assert!(d.valid_after_parse());
        assert!((d.snr_db - (-6.0)).abs() < 1e-9);
    }
}
