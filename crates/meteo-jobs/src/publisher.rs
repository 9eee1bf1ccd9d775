//! Debounced job publisher (C5): coalesces bursty "data was backfilled
//! for station S over [a,b]" notifications into at most one enqueue
//! per station per quiet period.
//!
//! Each station keeps a `(begin, end, generation)` entry behind a single
//! mutex. `notify` widens the range and bumps the generation, then arms
//! a fresh timer task carrying that generation number. When a timer
//! fires it checks its own generation against the map's current one
//! before publishing, so a timer superseded by a later `notify` call is
//! a no-op rather than racing the newer one and double-publishing. Both
//! the map mutation and the generation check are protected by the same
//! `tokio::sync::Mutex`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use meteo_core::StationId;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::{JobsFacade, JobsResult};

const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(60);

struct DebounceEntry {
    begin: DateTime<Utc>,
    end: DateTime<Utc>,
    generation: u64,
}

pub struct JobPublisher<F> {
    facade: Arc<F>,
    debounce: Duration,
    entries: Mutex<HashMap<StationId, DebounceEntry>>,
}

impl<F: JobsFacade + 'static> JobPublisher<F> {
    pub fn new(facade: Arc<F>) -> Arc<Self> {
        Self::with_debounce(facade, DEFAULT_DEBOUNCE)
    }

    pub fn with_debounce(facade: Arc<F>, debounce: Duration) -> Arc<Self> {
        Arc::new(Self {
            facade,
            debounce,
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Record that data was backfilled for `station` over `[begin, end]`.
    /// Widens any in-flight range for the station and restarts its
    /// quiet-period timer.
    #[instrument(skip(self))]
    pub async fn notify(self: &Arc<Self>, station: StationId, begin: DateTime<Utc>, end: DateTime<Utc>) {
        let generation = {
            let mut entries = self.entries.lock().await;
            match entries.get_mut(&station) {
                Some(entry) => {
                    if begin < entry.begin {
                        entry.begin = begin;
                    }
                    if end > entry.end {
                        entry.end = end;
                    }
                    entry.generation += 1;
                    entry.generation
                }
                None => {
                    entries.insert(station, DebounceEntry { begin, end, generation: 0 });
                    0
                }
            }
        };
        debug!(%station, generation, "armed debounce timer");
        self.arm_timer(station, generation);
    }

    fn arm_timer(self: &Arc<Self>, station: StationId, generation: u64) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(this.debounce).await;
            this.fire(station, generation).await;
        });
    }

    async fn fire(self: &Arc<Self>, station: StationId, generation: u64) {
        let range = {
            let entries = self.entries.lock().await;
            match entries.get(&station) {
                // A later `notify` bumped the generation after this timer
                // was armed; that later timer owns the publish now.
                Some(entry) if entry.generation == generation => Some((entry.begin, entry.end)),
                _ => None,
            }
        };
        let Some((begin, end)) = range else {
            return;
        };

        match self.do_publish(station, begin, end).await {
            Ok(()) => {
                let mut entries = self.entries.lock().await;
                if matches!(entries.get(&station), Some(entry) if entry.generation == generation) {
                    entries.remove(&station);
                }
            }
            Err(err) => {
                warn!(%station, %err, "failed to enqueue jobs, retrying after the next quiet period");
                self.arm_timer(station, generation);
            }
        }
    }

    async fn do_publish(&self, station: StationId, begin: DateTime<Utc>, end: DateTime<Utc>) -> JobsResult<()> {
        let b = begin.timestamp();
        let e = end.timestamp();
        self.facade.enqueue_minmax(station, b, e).await?;
        self.facade.enqueue_anomaly_monitoring(station, b, e).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facade::test_util::MemoryJobsFacade;
    use chrono::TimeZone;

    fn t(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, s).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_coalesces_into_one_enqueue_with_widened_range() {
        let facade = Arc::new(MemoryJobsFacade::new());
        let publisher = JobPublisher::with_debounce(Arc::clone(&facade), Duration::from_secs(60));
        let station = StationId::from_u128(1);

        publisher.notify(station, t(10, 0, 0), t(10, 30, 0)).await;
        tokio::time::sleep(Duration::from_secs(20)).await;
        publisher.notify(station, t(9, 50, 0), t(10, 35, 0)).await;
        // Past Delta since the second notify, but not since the first.
        tokio::time::sleep(Duration::from_secs(50)).await;
        tokio::task::yield_now().await;

        let calls = facade.minmax_calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], (station, t(9, 50, 0).timestamp(), t(10, 35, 0).timestamp()));
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_failure_retains_the_range_and_retries() {
        let facade = Arc::new(MemoryJobsFacade::new());
        facade.fail_next_n(1);
        let publisher = JobPublisher::with_debounce(Arc::clone(&facade), Duration::from_secs(60));
        let station = StationId::from_u128(2);

        publisher.notify(station, t(8, 0, 0), t(8, 10, 0)).await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        tokio::task::yield_now().await;
        assert_eq!(facade.minmax_calls.lock().unwrap().len(), 0);

        tokio::time::sleep(Duration::from_secs(60)).await;
        tokio::task::yield_now().await;
        let calls = facade.minmax_calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], (station, t(8, 0, 0).timestamp(), t(8, 10, 0).timestamp()));
    }
}
