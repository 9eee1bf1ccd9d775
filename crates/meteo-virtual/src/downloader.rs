//! The [`PeriodicDownload`] hook that drives every virtual station on a
//! single, fixed five-minute tick, so it can sit inside a
//! [`meteo_core::ConnectorGroup`] next to the vendor pollers.

use std::sync::Arc;
use std::time::Duration;

use meteo_db::ObservationStore;
use meteo_jobs::{JobPublisher, JobsFacade};
use meteo_schedule::PeriodicDownload;
use tokio::sync::Mutex;
use tracing::{error, instrument};

use crate::computer::VirtualObsComputer;
use crate::config::VirtualStationConfig;

const POLLING_PERIOD: Duration = Duration::from_secs(5 * 60);

pub struct VirtualComputationDownloader<F> {
    store: ObservationStore,
    publisher: Option<Arc<JobPublisher<F>>>,
    computers: Mutex<Vec<VirtualObsComputer<F>>>,
}

impl<F: JobsFacade + 'static> VirtualComputationDownloader<F> {
    pub fn new(store: ObservationStore, publisher: Option<Arc<JobPublisher<F>>>) -> Self {
        VirtualComputationDownloader {
            store,
            publisher,
            computers: Mutex::new(Vec::new()),
        }
    }

    /// Re-reads the virtual station registry and rebuilds one computer
    /// per station, carrying over nothing from the previous generation:
    /// each computer re-derives its cursor from the station's own
    /// persisted `last_archive` on construction.
    async fn reload_computers(&self) -> meteo_db::DbResult<Vec<VirtualObsComputer<F>>> {
        let rows = self.store.get_all_virtual_stations().await?;
        let mut computers = Vec::with_capacity(rows.len());

        for row in rows {
            let config = match VirtualStationConfig::from_row(&row) {
                Ok(config) => config,
                Err(err) => {
                    error!(station = %row.station, %err, "skipping virtual station with a malformed source map");
                    continue;
                }
            };

            let metadata = self.store.get_station_metadata(config.station).await?;
            computers.push(VirtualObsComputer::new(
                config,
                self.store.clone(),
                metadata.last_archive,
                self.publisher.clone(),
            ));
        }

        Ok(computers)
    }
}

#[async_trait::async_trait]
impl<F: JobsFacade + 'static> PeriodicDownload for VirtualComputationDownloader<F> {
    fn period(&self) -> Duration {
        POLLING_PERIOD
    }

    fn phase_offset(&self) -> Duration {
        Duration::from_secs(0)
    }

    #[instrument(skip(self))]
    async fn download(&self) -> anyhow::Result<()> {
        let mut computers = self.reload_computers().await?;

        for computer in &mut computers {
            if let Err(err) = computer.compute().await {
                error!(station = %computer.station(), %err, "virtual station computation failed, moving on");
            }
        }

        *self.computers.lock().await = computers;
        Ok(())
    }
}
