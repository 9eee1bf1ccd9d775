//! [`meteo_jobs::JobsFacade`] backed by a `job_queue` table, the
//! production counterpart to that crate's in-memory test double. Lives
//! here rather than in `meteo-jobs` so that crate stays free of a
//! direct `sqlx`/Postgres dependency.

use chrono::{TimeZone, Utc};
use meteo_core::JobKind;
use meteo_jobs::{Job, JobId, JobsError, JobsFacade, JobsResult};
use tracing::instrument;

use crate::DbClient;

fn job_kind_str(kind: JobKind) -> &'static str {
    match kind {
        JobKind::Minmax => "minmax",
        JobKind::AnomalyMonitoring => "anomaly_monitoring",
        JobKind::MonthMinmax => "month_minmax",
    }
}

fn job_kind_from_str(s: &str) -> Option<JobKind> {
    match s {
        "minmax" => Some(JobKind::Minmax),
        "anomaly_monitoring" => Some(JobKind::AnomalyMonitoring),
        "month_minmax" => Some(JobKind::MonthMinmax),
        _ => None,
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: i64,
    station: uuid::Uuid,
    range_begin: i64,
    range_end: i64,
    kind: String,
}

pub struct DbJobsFacade {
    client: DbClient,
}

impl DbJobsFacade {
    pub fn new(client: DbClient) -> Self {
        DbJobsFacade { client }
    }

    async fn enqueue(&self, station: meteo_core::StationId, kind: JobKind, begin: i64, end: i64) -> JobsResult<()> {
        sqlx::query("INSERT INTO job_queue (station, range_begin, range_end, kind) VALUES ($1, $2, $3, $4)")
            .bind(station)
            .bind(begin)
            .bind(end)
            .bind(job_kind_str(kind))
            .execute(self.client.pool())
            .await
            .map_err(|e| JobsError::Backend(e.to_string()))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl JobsFacade for DbJobsFacade {
    #[instrument(skip(self))]
    async fn enqueue_minmax(&self, station: meteo_core::StationId, range_begin_epoch_s: i64, range_end_epoch_s: i64) -> JobsResult<()> {
        self.enqueue(station, JobKind::Minmax, range_begin_epoch_s, range_end_epoch_s).await
    }

    #[instrument(skip(self))]
    async fn enqueue_anomaly_monitoring(
        &self,
        station: meteo_core::StationId,
        range_begin_epoch_s: i64,
        range_end_epoch_s: i64,
    ) -> JobsResult<()> {
        self.enqueue(station, JobKind::AnomalyMonitoring, range_begin_epoch_s, range_end_epoch_s).await
    }

    #[instrument(skip(self))]
    async fn enqueue_month_minmax(&self, station: meteo_core::StationId, range_begin_epoch_s: i64, range_end_epoch_s: i64) -> JobsResult<()> {
        self.enqueue(station, JobKind::MonthMinmax, range_begin_epoch_s, range_end_epoch_s).await
    }

    #[instrument(skip(self))]
    async fn dequeue_next_minmax_job(&self) -> JobsResult<Option<Job>> {
        let row: Option<JobRow> = sqlx::query_as(
            r#"
            DELETE FROM job_queue
            WHERE id = (SELECT id FROM job_queue WHERE kind = 'minmax' ORDER BY id ASC LIMIT 1 FOR UPDATE SKIP LOCKED)
            RETURNING id, station, range_begin, range_end, kind
            "#,
        )
        .fetch_optional(self.client.pool())
        .await
        .map_err(|e| JobsError::Backend(e.to_string()))?;

        Ok(row.and_then(|r| {
            job_kind_from_str(&r.kind).map(|kind| Job {
                id: r.id,
                station: r.station,
                range_begin: Utc.timestamp_opt(r.range_begin, 0).single().unwrap_or_else(Utc::now),
                range_end: Utc.timestamp_opt(r.range_end, 0).single().unwrap_or_else(Utc::now),
                kind,
            })
        }))
    }

    #[instrument(skip(self))]
    async fn mark_job_finished(&self, id: JobId, finished_at_epoch_s: i64, exit_code: i32) -> JobsResult<()> {
        sqlx::query("INSERT INTO job_completions (job_id, finished_at, exit_code) VALUES ($1, $2, $3)")
            .bind(id)
            .bind(finished_at_epoch_s)
            .bind(exit_code)
            .execute(self.client.pool())
            .await
            .map_err(|e| JobsError::Backend(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_kind_round_trips_through_its_string_form() {
        for kind in [JobKind::Minmax, JobKind::AnomalyMonitoring, JobKind::MonthMinmax] {
            assert_eq!(job_kind_from_str(job_kind_str(kind)), Some(kind));
        }
    }
}
