//! Sensor payload decoders: one module per manufacturer/protocol family,
//! a closed [`decoder::Decoder`] enum unifying them, and the liveobjects
//! sensor/port [`dispatch`] table that selects one for an uplink.
//!
//! Every decoder follows the same shape: `ingest` parses a raw frame
//! into fields, `valid_after_parse` reports whether the frame was well
//! formed, `to_observation` projects the parsed fields onto the shared
//! [`meteo_core::Observation`] record, and `describe` renders a
//! human-readable summary for logging. Decoders that need to track a
//! wrapping counter across uplinks (rain gauges, battery hysteresis)
//! also expose an async `cache_after_insert`, called only once the
//! observation carrying that counter's value has been durably stored.

pub mod barani;
pub mod cache;
pub mod concept500;
pub mod davis;
pub mod decoder;
pub mod dispatch;
pub mod dragino;
pub mod formulas;
pub mod meteofrance;
pub mod pessl;
pub mod talkpool;
pub mod thlora;

pub use cache::CounterCache;
pub use decoder::Decoder;
