//! Talkpool OY1110 thermo-hygrometer. The device can batch several
//! 6-byte records behind a single 1-byte header in one uplink; each
//! record is decoded independently and the most recent one wins.
//!
//! The reference length check divides `(length - 1)` by the per-record
//! width, which undercounts the 2-hex-digit header by one digit and
//! accepts frames one nibble short. Validation here divides `(length -
//! 2)` instead so a truncated final record is rejected rather than
//! silently parsed against leftover header bytes.

use chrono::{DateTime, Utc};
use meteo_core::{fields, HexReader, Observation, StationId};
use serde_json::json;

const RECORD_NIBBLES: usize = 12;
const HEADER_NIBBLES: usize = 2;

fn validate_oy1110(payload: &str) -> bool {
    let digits: Vec<char> = payload.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.len() < HEADER_NIBBLES + RECORD_NIBBLES {
        return false;
    }
    if !digits.iter().all(|c| c.is_ascii_hexdigit()) {
        return false;
    }
    (digits.len() - HEADER_NIBBLES) % RECORD_NIBBLES == 0
}

#[derive(Debug, Clone, Copy, Default)]
struct Record {
    temperature: f64,
    humidity: f64,
    battery: f64,
}

#[derive(Debug, Default, Clone)]
pub struct TalkpoolOy1110 {
    valid: bool,
    time: Option<DateTime<Utc>>,
    records_decoded: usize,
    latest: Record,
}

impl TalkpoolOy1110 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ingest(&mut self, payload: &str, datetime: DateTime<Utc>) {
        if !validate_oy1110(payload) {
            self.valid = false;
            return;
        }
        let digits: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
        let mut r = HexReader::new(&digits);
        r.skip(HEADER_NIBBLES).ok();

        let record_count = (digits.chars().count() - HEADER_NIBBLES) / RECORD_NIBBLES;
        let mut latest = Record::default();
        for _ in 0..record_count {
            let battery = r.read_be(2).unwrap_or(0);
            let temp = r.read_be(4).unwrap_or(0) as u32;
            let hum = r.read_be(4).unwrap_or(0) as u32;
            r.skip(2).ok();

            latest.battery = 2.0 + battery as f64 * 0.01;
            latest.humidity = hum as f64 / 10.0;
            latest.temperature = if (temp & 0x8000) == 0 {
                temp as f64 / 10.0
            } else {
                (temp as f64 - 65536.0) / 10.0
            };
        }

        self.time = Some(datetime);
        self.records_decoded = record_count;
        self.latest = latest;
        self.valid = true;
    }

    pub fn valid_after_parse(&self) -> bool {
        self.valid
    }

    pub fn to_observation(&self, station: StationId) -> Observation {
        let mut obs = Observation::new(station, self.time.unwrap_or_else(Utc::now));
        obs.set_float(fields::OUTSIDE_TEMP, Some(self.latest.temperature));
        obs.set_int(fields::OUTSIDE_HUM, Some(self.latest.humidity.round() as i64));
        obs.set_float(fields::VOLTAGE_BATTERY, Some(self.latest.battery));
        obs
    }

    pub fn describe(&self) -> serde_json::Value {
        json!({
            "model": "talkpool_oy1110_20220905",
            "value": {
                "records_decoded": self.records_decoded,
                "temperature": self.latest.temperature,
                "humidity": self.latest.humidity,
                "battery": self.latest.battery,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn rejects_frame_one_nibble_short() {
        // header + one full record (12) + one dangling nibble
        assert!(!validate_oy1110("0a000000000000000000a"));
    }

    #[test]
    fn s3_multi_record_uplink_keeps_the_last_record() {
        let mut d = TalkpoolOy1110::new();
        let ts = Utc.with_ymd_and_hms(2024, 3, 3, 9, 0, 0).unwrap();
        // header "01", record 1: bat 0a, temp 00c8 (20.0), hum 01f4 (50.0), pad 00
        // record 2: bat 14, temp 00fa (25.0), hum 0258 (60.0), pad 00
        d.ingest("010a00c801f4001400fa025800", ts);
        assert!(d.valid_after_parse());
        assert_eq!(d.records_decoded, 2);
        assert!((d.latest.temperature - 25.0).abs() < 1e-9);
        assert_eq!(d.latest.humidity.round() as i64, 60);
    }
}
