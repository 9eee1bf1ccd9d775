//! Selects a [`Decoder`] for a liveobjects MQTT/HTTP uplink from its
//! `extra.sensors` tag and `metadata.network.lora.port`, mirroring the
//! sensor/port table `LiveobjectsMessage::parseMessage` used to pick a
//! concrete message type.

use chrono::{DateTime, Utc};
use meteo_core::CoreError;
use serde_json::Value;

use crate::barani::{BaraniAnemometer2023, BaraniAnemometerV1, BaraniRainGauge, BaraniThermohygro};
use crate::decoder::Decoder;
use crate::dragino::{DraginoCpl01Pluviometer, DraginoThpllora, Lsn50v2ThermoHygro};
use crate::pessl::PesslLorain;
use crate::talkpool::TalkpoolOy1110;
use crate::thlora::ThLoraThermoHygro;

/// The fields of a liveobjects envelope this dispatcher reads: the
/// sensor tag, LoRa port, raw hex payload, and uplink timestamp. The
/// full envelope carries many more fields (signal quality, device EUI,
/// ...) that decoders don't need and this type ignores.
#[derive(Debug, Clone)]
pub struct LiveobjectsEnvelope {
    pub sensor: String,
    pub port: Option<i32>,
    pub payload: String,
    pub timestamp: DateTime<Utc>,
}

impl LiveobjectsEnvelope {
    /// Extract the handful of fields this dispatcher needs from the raw
    /// liveobjects JSON document.
    pub fn from_json(json: &Value) -> Result<Self, CoreError> {
        let sensor = json
            .pointer("/extra/sensors")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let payload = json
            .pointer("/value/payload")
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::ProtocolFraming("liveobjects envelope is missing value.payload".into()))?
            .to_string();
        let port = json.pointer("/metadata/network/lora/port").and_then(Value::as_i64).map(|p| p as i32);
        let timestamp_str = json
            .get("timestamp")
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::ProtocolFraming("liveobjects envelope is missing timestamp".into()))?;
        let timestamp = DateTime::parse_from_rfc3339(timestamp_str)
            .map_err(|e| CoreError::ProtocolFraming(format!("unparseable liveobjects timestamp: {e}")))?
            .with_timezone(&Utc);

        Ok(LiveobjectsEnvelope { sensor, port, payload, timestamp })
    }
}

/// Pick the decoder for a liveobjects uplink, or `None` for an
/// unrecognized sensor/port combination (a misconfigured sensor on the
/// platform side, logged and dropped by the caller).
pub fn select_decoder(sensor: &str, port: Option<i32>) -> Option<Decoder> {
    match (sensor, port) {
        ("dragino-cpl01-pluviometer", Some(2)) => Some(Decoder::DraginoCpl01Pluviometer(DraginoCpl01Pluviometer::new())),
        ("dragino-lsn50v2" | "dragino_lsn50v2", Some(2)) => {
            Some(Decoder::DraginoLsn50v2ThermoHygro(Lsn50v2ThermoHygro::new()))
        }
        ("dragino-thpllora", Some(2)) => Some(Decoder::DraginoThpllora(DraginoThpllora::new())),
        ("barani-meteowind", Some(1)) => Some(Decoder::BaraniAnemometerV1(BaraniAnemometerV1::new())),
        ("barani-meteowind-v2023", Some(1)) => Some(Decoder::BaraniAnemometer2023(BaraniAnemometer2023::new())),
        ("barani-meteorain", Some(1)) => Some(Decoder::BaraniRainGauge(BaraniRainGauge::new())),
        ("barani-meteohelix", Some(1)) => Some(Decoder::BaraniThermohygro(BaraniThermohygro::new())),
        ("lorain-pluviometer", _) => Some(Decoder::PesslLorain(PesslLorain::new())),
        ("thlora-thermohygrometer", _) => Some(Decoder::ThLoraThermoHygro(ThLoraThermoHygro::new())),
        ("talkpool-oy1110", _) => Some(Decoder::TalkpoolOy1110(TalkpoolOy1110::new())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_sensor_yields_no_decoder() {
        assert!(select_decoder("acme-widget", Some(1)).is_none());
    }

    #[test]
    fn wrong_port_for_a_known_sensor_yields_no_decoder() {
        assert!(select_decoder("barani-meteowind", Some(2)).is_none());
    }

    #[test]
    fn port_agnostic_sensors_dispatch_regardless_of_port() {
        assert!(select_decoder("lorain-pluviometer", None).is_some());
        assert!(select_decoder("talkpool-oy1110", Some(99)).is_some());
    }

    #[test]
    fn parses_envelope_from_raw_liveobjects_json() {
        let json = serde_json::json!({
            "extra": { "sensors": "barani-meteowind" },
            "value": { "payload": "c582a1087050904b3114" },
            "metadata": { "network": { "lora": { "port": 1 } } },
            "timestamp": "2022-04-29T00:00:00Z",
        });
        let envelope = LiveobjectsEnvelope::from_json(&json).unwrap();
        assert_eq!(envelope.sensor, "barani-meteowind");
        assert_eq!(envelope.port, Some(1));
        assert_eq!(envelope.payload, "c582a1087050904b3114");
    }
}
