//! Computes observations for one virtual station by merging its
//! sources' data, tick by tick, since the last computed point.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use meteo_core::Observation;
use meteo_db::{DbResult, ObservationStore};
use meteo_jobs::{JobPublisher, JobsFacade};
use tracing::{debug, instrument, warn};

use crate::config::VirtualStationConfig;

fn stale_source_cutoff() -> ChronoDuration {
    ChronoDuration::hours(4)
}

fn stale_observation_cutoff() -> ChronoDuration {
    ChronoDuration::minutes(10)
}

/// Floors `instant` to the nearest period boundary since the Unix epoch,
/// at or before it.
fn floor_to_period(instant: DateTime<Utc>, period: ChronoDuration) -> DateTime<Utc> {
    let period_s = period.num_seconds().max(1);
    let offset = instant.timestamp().rem_euclid(period_s);
    instant - ChronoDuration::seconds(offset)
}

/// Resolves the watermark `L` the tick loop should advance toward: the
/// minimum of every source's last-archive time, except a source that has
/// had no data for more than four hours is skipped rather than letting it
/// freeze the virtual station indefinitely.
fn resolve_source_watermark(
    target_last_archive: DateTime<Utc>,
    now: DateTime<Utc>,
    source_last_archives: impl IntoIterator<Item = DateTime<Utc>>,
) -> DateTime<Utc> {
    let mut watermark = target_last_archive;
    let stale_cutoff = now - stale_source_cutoff();

    for last_available in source_last_archives {
        if last_available < target_last_archive || last_available < stale_cutoff {
            continue;
        }
        if watermark == target_last_archive || last_available < watermark {
            watermark = last_available;
        }
    }

    watermark
}

/// One virtual station: owns its tick cursor (`last_archive`) and merges
/// its configured sources into new observation points each cycle.
pub struct VirtualObsComputer<F> {
    config: VirtualStationConfig,
    store: ObservationStore,
    publisher: Option<Arc<JobPublisher<F>>>,
    last_archive: DateTime<Utc>,
}

impl<F: JobsFacade + 'static> VirtualObsComputer<F> {
    pub fn new(
        config: VirtualStationConfig,
        store: ObservationStore,
        last_archive: DateTime<Utc>,
        publisher: Option<Arc<JobPublisher<F>>>,
    ) -> Self {
        VirtualObsComputer { config, store, publisher, last_archive }
    }

    pub fn station(&self) -> meteo_core::StationId {
        self.config.station
    }

    #[instrument(skip(self), fields(station = %self.config.station))]
    async fn last_datetime_available(&self) -> DbResult<DateTime<Utc>> {
        let now = Utc::now();
        let mut last_archives = Vec::with_capacity(self.config.sources.len());
        for &source in self.config.sources.keys() {
            let metadata = self.store.get_station_metadata(source).await?;
            if metadata.last_archive < self.last_archive || metadata.last_archive < now - stale_source_cutoff() {
                warn!(%source, "no data in the last 4h for source station, advancing anyway");
            }
            last_archives.push(metadata.last_archive);
        }
        Ok(resolve_source_watermark(self.last_archive, now, last_archives))
    }

    /// One computation cycle: extend the merged series up to whatever
    /// data is newly available from the sources.
    #[instrument(skip(self), fields(station = %self.config.station))]
    pub async fn compute(&mut self) -> DbResult<()> {
        let last_available = self.last_datetime_available().await?;
        if last_available <= self.last_archive {
            debug!("no new data available for any source, bailing off");
            return Ok(());
        }

        let begin = self.last_archive;
        let end = Utc::now();
        self.do_compute(begin, end).await
    }

    async fn do_compute(&mut self, begin: DateTime<Utc>, end: DateTime<Utc>) -> DbResult<()> {
        let period = ChronoDuration::minutes(self.config.period_minutes.max(1));
        let mut target = floor_to_period(begin, period);
        let mut oldest = begin;
        let mut newest = end;
        let mut any_inserted = false;

        while target <= end {
            let mut merged = Observation::new(self.config.station, target);

            for (&source, vars) in &self.config.sources {
                let Some(obs) = self.store.get_last_data_before(source, target).await? else {
                    continue;
                };
                if obs.time < target - stale_observation_cutoff() {
                    continue;
                }
                for var in vars {
                    if let Some(value) = obs.get(var) {
                        merged.set(var, Some(value));
                    }
                }
            }

            self.store.insert_point(&merged).await?;
            self.store.update_last_archive_time(self.config.station, target).await?;
            self.last_archive = target;
            any_inserted = true;

            if target < oldest {
                oldest = target;
            }
            if target > newest {
                newest = target;
            }

            target += period;
        }

        if any_inserted {
            debug!(station = %self.config.station, "archive data stored for virtual station");
            if let Some(publisher) = &self.publisher {
                publisher.notify(self.config.station, oldest, newest).await;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, 0).unwrap()
    }

    #[test]
    fn floor_to_period_rounds_down_to_the_grid() {
        let period = ChronoDuration::minutes(10);
        assert_eq!(floor_to_period(t(10, 7), period), t(10, 0));
        assert_eq!(floor_to_period(t(10, 0), period), t(10, 0));
    }

    #[test]
    fn watermark_is_the_min_of_fresh_sources() {
        let watermark = resolve_source_watermark(t(9, 0), t(12, 0), vec![t(11, 30), t(11, 0)]);
        assert_eq!(watermark, t(11, 0));
    }

    #[test]
    fn a_source_stale_for_more_than_four_hours_is_skipped() {
        // now = 12:00, cutoff = 08:00; the 07:00 source is stale and must
        // not hold the watermark back to the target's own last archive.
        let watermark = resolve_source_watermark(t(9, 0), t(12, 0), vec![t(7, 0), t(11, 0)]);
        assert_eq!(watermark, t(11, 0));
    }

    #[test]
    fn watermark_stays_at_last_archive_when_every_source_is_stale() {
        let watermark = resolve_source_watermark(t(9, 0), t(12, 0), vec![t(7, 0), t(7, 30)]);
        assert_eq!(watermark, t(9, 0));
    }
}
