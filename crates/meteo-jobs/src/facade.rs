//! The narrow seam the rest of the platform uses to hand work to the
//! (separately deployed) climatology and anomaly-monitoring workers.
//! Implementations persist requests in a queue table; this crate never
//! computes a minmax or an anomaly itself.

use chrono::{DateTime, Utc};
use meteo_core::{JobKind, StationId};

use crate::JobsResult;

pub type JobId = i64;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub station: StationId,
    pub range_begin: DateTime<Utc>,
    pub range_end: DateTime<Utc>,
    pub kind: JobKind,
}

#[async_trait::async_trait]
pub trait JobsFacade: Send + Sync {
    async fn enqueue_minmax(&self, station: StationId, range_begin_epoch_s: i64, range_end_epoch_s: i64) -> JobsResult<()>;

    async fn enqueue_anomaly_monitoring(&self, station: StationId, range_begin_epoch_s: i64, range_end_epoch_s: i64) -> JobsResult<()>;

    async fn enqueue_month_minmax(&self, station: StationId, range_begin_epoch_s: i64, range_end_epoch_s: i64) -> JobsResult<()>;

    async fn dequeue_next_minmax_job(&self) -> JobsResult<Option<Job>>;

    async fn mark_job_finished(&self, id: JobId, finished_at_epoch_s: i64, exit_code: i32) -> JobsResult<()>;
}

#[cfg(test)]
pub mod test_util {
    use super::*;
    use std::sync::Mutex;

    /// An in-memory [`JobsFacade`] for exercising [`crate::JobPublisher`]
    /// without a database. `fail_next` lets a test force one or more
    /// enqueue failures to exercise the publisher's retry path.
    #[derive(Default)]
    pub struct MemoryJobsFacade {
        pub minmax_calls: Mutex<Vec<(StationId, i64, i64)>>,
        pub anomaly_calls: Mutex<Vec<(StationId, i64, i64)>>,
        pub fail_next: Mutex<u32>,
    }

    impl MemoryJobsFacade {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn fail_next_n(&self, n: u32) {
            *self.fail_next.lock().unwrap() = n;
        }

        fn maybe_fail(&self) -> JobsResult<()> {
            let mut remaining = self.fail_next.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(crate::JobsError::Backend("simulated failure".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl JobsFacade for MemoryJobsFacade {
        async fn enqueue_minmax(&self, station: StationId, range_begin_epoch_s: i64, range_end_epoch_s: i64) -> JobsResult<()> {
            self.maybe_fail()?;
            self.minmax_calls.lock().unwrap().push((station, range_begin_epoch_s, range_end_epoch_s));
            Ok(())
        }

        async fn enqueue_anomaly_monitoring(&self, station: StationId, range_begin_epoch_s: i64, range_end_epoch_s: i64) -> JobsResult<()> {
            self.anomaly_calls.lock().unwrap().push((station, range_begin_epoch_s, range_end_epoch_s));
            Ok(())
        }

        async fn enqueue_month_minmax(&self, _station: StationId, _range_begin_epoch_s: i64, _range_end_epoch_s: i64) -> JobsResult<()> {
            Ok(())
        }

        async fn dequeue_next_minmax_job(&self) -> JobsResult<Option<Job>> {
            Ok(None)
        }

        async fn mark_job_finished(&self, _id: JobId, _finished_at_epoch_s: i64, _exit_code: i32) -> JobsResult<()> {
            Ok(())
        }
    }
}
