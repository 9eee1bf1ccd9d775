//! Per-virtual-station configuration: the target station, its tick
//! period, and the map of source stations to the variables each one
//! contributes.

use std::collections::{HashMap, HashSet};

use meteo_core::StationId;
use meteo_db::VirtualStationRow;

use crate::VirtualError;

#[derive(Debug, Clone)]
pub struct VirtualStationConfig {
    pub station: StationId,
    pub period_minutes: i64,
    pub sources: HashMap<StationId, HashSet<String>>,
}

impl VirtualStationConfig {
    /// Parses the `sources` JSONB column: an object keyed by source
    /// station UUID, each value the list of field names that source is
    /// allowed to contribute to the merge.
    pub fn from_row(row: &VirtualStationRow) -> Result<Self, VirtualError> {
        let raw: HashMap<String, Vec<String>> =
            serde_json::from_value(row.sources.clone()).map_err(|e| VirtualError::BadSourceMap(e.to_string()))?;

        let mut sources = HashMap::with_capacity(raw.len());
        for (key, vars) in raw {
            let source = key.parse::<StationId>().map_err(|e| VirtualError::BadSourceMap(e.to_string()))?;
            sources.insert(source, vars.into_iter().collect());
        }

        Ok(VirtualStationConfig {
            station: row.station,
            period_minutes: row.period_minutes as i64,
            sources,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_source_map_keyed_by_station_uuid() {
        let source = StationId::from_u128(7);
        let row = VirtualStationRow {
            station: StationId::from_u128(1),
            period_minutes: 10,
            sources: serde_json::json!({
                source.to_string(): ["outsidetemp", "outsidehum"],
            }),
        };

        let config = VirtualStationConfig::from_row(&row).unwrap();
        assert_eq!(config.period_minutes, 10);
        let vars = config.sources.get(&source).unwrap();
        assert!(vars.contains("outsidetemp"));
        assert!(vars.contains("outsidehum"));
    }

    #[test]
    fn rejects_a_source_map_with_an_invalid_station_key() {
        let row = VirtualStationRow {
            station: StationId::from_u128(1),
            period_minutes: 10,
            sources: serde_json::json!({ "not-a-uuid": ["outsidetemp"] }),
        };

        assert!(VirtualStationConfig::from_row(&row).is_err());
    }
}
