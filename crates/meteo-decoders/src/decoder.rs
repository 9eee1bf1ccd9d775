//! A closed sum type over every supported sensor decoder, dispatched by
//! the liveobjects sensor/port table (see [`crate::dispatch`]). A closed
//! enum plus an exhaustive match is preferred here over a `dyn Trait`
//! object family: the set of sensor protocols is fixed at compile time
//! and known in full, so there is no open extension point to abstract
//! over.

use chrono::{DateTime, Utc};
use meteo_core::{Observation, StationId};

use crate::barani::{BaraniAnemometer2023, BaraniAnemometerV1, BaraniRainGauge, BaraniThermohygro};
use crate::cache::CounterCache;
use crate::dragino::{DraginoCpl01Pluviometer, DraginoThpllora, Lsn50v2ThermoHygro};
use crate::pessl::PesslLorain;
use crate::talkpool::TalkpoolOy1110;
use crate::thlora::ThLoraThermoHygro;

/// One decoder instance, already selected for a specific uplink.
pub enum Decoder {
    BaraniAnemometerV1(BaraniAnemometerV1),
    BaraniAnemometer2023(BaraniAnemometer2023),
    BaraniRainGauge(BaraniRainGauge),
    BaraniThermohygro(BaraniThermohygro),
    DraginoCpl01Pluviometer(DraginoCpl01Pluviometer),
    DraginoLsn50v2ThermoHygro(Lsn50v2ThermoHygro),
    DraginoThpllora(DraginoThpllora),
    PesslLorain(PesslLorain),
    ThLoraThermoHygro(ThLoraThermoHygro),
    TalkpoolOy1110(TalkpoolOy1110),
}

impl Decoder {
    /// Feed the raw hex payload through the selected decoder. Decoders
    /// that don't need the counter cache simply ignore it.
    pub async fn ingest(&mut self, station: StationId, payload: &str, datetime: DateTime<Utc>, cache: &dyn CounterCache) {
        match self {
            Decoder::BaraniAnemometerV1(d) => d.ingest(payload, datetime),
            Decoder::BaraniAnemometer2023(d) => d.ingest(station, payload, datetime, cache).await,
            Decoder::BaraniRainGauge(d) => d.ingest(station, payload, datetime, cache).await,
            Decoder::BaraniThermohygro(d) => d.ingest(station, payload, datetime, cache).await,
            Decoder::DraginoCpl01Pluviometer(d) => d.ingest(station, payload, datetime, cache).await,
            Decoder::DraginoLsn50v2ThermoHygro(d) => d.ingest(payload, datetime),
            Decoder::DraginoThpllora(d) => d.ingest(station, payload, datetime, cache).await,
            Decoder::PesslLorain(d) => d.ingest(station, payload, datetime, cache).await,
            Decoder::ThLoraThermoHygro(d) => d.ingest(payload, datetime),
            Decoder::TalkpoolOy1110(d) => d.ingest(payload, datetime),
        }
    }

    /// Some decoders need to persist a counter after the observation
    /// has been durably stored, so the cache watermark only advances
    /// once the reading it's paired with cannot be lost.
    pub async fn cache_after_insert(&self, station: StationId, cache: &dyn CounterCache) {
        match self {
            Decoder::BaraniRainGauge(d) => d.cache_after_insert(station, cache).await,
            Decoder::BaraniThermohygro(d) => d.cache_after_insert(station, cache).await,
            Decoder::DraginoCpl01Pluviometer(d) => d.cache_after_insert(station, cache).await,
            Decoder::DraginoThpllora(d) => d.cache_after_insert(station, cache).await,
            Decoder::PesslLorain(d) => d.cache_after_insert(station, cache).await,
            Decoder::BaraniAnemometerV1(_)
            | Decoder::BaraniAnemometer2023(_)
            | Decoder::DraginoLsn50v2ThermoHygro(_)
            | Decoder::ThLoraThermoHygro(_)
            | Decoder::TalkpoolOy1110(_) => {}
        }
    }

    pub fn valid_after_parse(&self) -> bool {
        match self {
            Decoder::BaraniAnemometerV1(d) => d.valid_after_parse(),
            Decoder::BaraniAnemometer2023(d) => d.valid_after_parse(),
            Decoder::BaraniRainGauge(d) => d.valid_after_parse(),
            Decoder::BaraniThermohygro(d) => d.valid_after_parse(),
            Decoder::DraginoCpl01Pluviometer(d) => d.valid_after_parse(),
            Decoder::DraginoLsn50v2ThermoHygro(d) => d.valid_after_parse(),
            Decoder::DraginoThpllora(d) => d.valid_after_parse(),
            Decoder::PesslLorain(d) => d.valid_after_parse(),
            Decoder::ThLoraThermoHygro(d) => d.valid_after_parse(),
            Decoder::TalkpoolOy1110(d) => d.valid_after_parse(),
        }
    }

    pub fn to_observation(&self, station: StationId) -> Observation {
        match self {
            Decoder::BaraniAnemometerV1(d) => d.to_observation(station),
            Decoder::BaraniAnemometer2023(d) => d.to_observation(station),
            Decoder::BaraniRainGauge(d) => d.to_observation(station),
            Decoder::BaraniThermohygro(d) => d.to_observation(station),
            Decoder::DraginoCpl01Pluviometer(d) => d.to_observation(station),
            Decoder::DraginoLsn50v2ThermoHygro(d) => d.to_observation(station),
            Decoder::DraginoThpllora(d) => d.to_observation(station),
            Decoder::PesslLorain(d) => d.to_observation(station),
            Decoder::ThLoraThermoHygro(d) => d.to_observation(station),
            Decoder::TalkpoolOy1110(d) => d.to_observation(station),
        }
    }

    pub fn describe(&self) -> serde_json::Value {
        match self {
            Decoder::BaraniAnemometerV1(d) => d.describe(),
            Decoder::BaraniAnemometer2023(d) => d.describe(),
            Decoder::BaraniRainGauge(d) => d.describe(),
            Decoder::BaraniThermohygro(d) => d.describe(),
            Decoder::DraginoCpl01Pluviometer(d) => d.describe(),
            Decoder::DraginoLsn50v2ThermoHygro(d) => d.describe(),
            Decoder::DraginoThpllora(d) => d.describe(),
            Decoder::PesslLorain(d) => d.describe(),
            Decoder::ThLoraThermoHygro(d) => d.describe(),
            Decoder::TalkpoolOy1110(d) => d.describe(),
        }
    }
}
