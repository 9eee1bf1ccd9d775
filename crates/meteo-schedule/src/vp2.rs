//! Davis VantagePro2 direct-device state machine: the one exemplar
//! spelled out in full. A long-lived TCP (serial-over-IP) connection is
//! driven through an explicit state sequence, retrying on bad ACK/CRC
//! or timeout up to a per-step budget before giving up on the whole
//! session.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use meteo_core::{Observation, StationId};
use meteo_db::ObservationStore;
use meteo_decoders::davis::{DavisVp2ArchiveRecord, RainCollectorSize, VP2_ARCHIVE_RECORD_LEN};
use meteo_jobs::{JobPublisher, JobsFacade};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, instrument, warn};

use crate::poller::PeriodicDownload;

const ACK: u8 = 0x06;
const MAX_TRANSMISSION_ERRORS: u32 = 5;
const MAX_TIMEOUTS: u32 = 5;
const WAKEUP_TIMEOUT: Duration = Duration::from_secs(2);
const STEP_TIMEOUT: Duration = Duration::from_secs(6);
const RETRY_WAIT: Duration = Duration::from_secs(10);
const RECORDS_PER_PAGE: usize = 5;
const PAGE_LEN: usize = RECORDS_PER_PAGE * VP2_ARCHIVE_RECORD_LEN + 2;

/// The full state sequence from the connection's point of view. Not
/// every state is visited on every call to [`Vp2StateMachine::run_once`]:
/// the settime branch is only taken once an hour, when the external
/// clock-sync timer has set the flag checked after the archive branch
/// completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vp2State {
    Starting,
    SendingWakeup,
    WaitingEchoStation,
    SendingReqStation,
    WaitingAckStation,
    WaitingDataStation,
    SendingReqMainMode,
    WaitingAckMainMode,
    SendingReqTimezone,
    WaitingAckTimezone,
    WaitingDataTimezone,
    SendingWakeupArchive,
    WaitingEchoArchive,
    SendingReqArchive,
    WaitingAckArchive,
    SendingArchiveParams,
    WaitingAckArchiveParams,
    WaitingArchiveNbPages,
    SendingAckArchiveDownload,
    WaitingArchivePage,
    SendingArchivePageAnswer,
    SendingWakeupSettime,
    WaitingEchoSettime,
    SendingSettime,
    WaitingAckSettime,
    SendingSettimeParams,
    WaitingAckTimeSet,
    WaitingNextMeasureTick,
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum Vp2Error {
    #[error("transmission errors exceeded budget")]
    TooManyTransmissionErrors,
    #[error("timeouts exceeded budget")]
    TooManyTimeouts,
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
    #[error("archive page failed CRC or was malformed")]
    BadPage,
}

/// Everything [`Vp2StateMachine`] needs to persist a page and let C5
/// know that past data arrived. Kept as a narrow trait (rather than a
/// direct [`ObservationStore`] field) so the state machine is testable
/// without a database.
#[async_trait::async_trait]
pub trait ArchiveSink: Send + Sync {
    async fn insert_points_batch(&self, observations: &[Observation]) -> anyhow::Result<()>;
    async fn delete_points_in_range(&self, station: StationId, begin: DateTime<Utc>, end: DateTime<Utc>) -> anyhow::Result<()>;
    async fn update_last_archive_time(&self, station: StationId, timestamp: DateTime<Utc>) -> anyhow::Result<()>;
    async fn notify_debounced_jobs(&self, station: StationId, begin: DateTime<Utc>, end: DateTime<Utc>);
}

/// The production [`ArchiveSink`], wiring the observation store facade
/// (C4) together with the debounced job publisher (C5). `publisher` is
/// `None` in setups that run without a job queue, in which case newly
/// archived ranges are stored but never trigger a climatology job.
pub struct Vp2Sink<F> {
    pub store: ObservationStore,
    pub publisher: Option<Arc<JobPublisher<F>>>,
}

#[async_trait::async_trait]
impl<F: JobsFacade + 'static> ArchiveSink for Vp2Sink<F> {
    async fn insert_points_batch(&self, observations: &[Observation]) -> anyhow::Result<()> {
        self.store.insert_points_batch(observations).await.map_err(Into::into)
    }

    async fn delete_points_in_range(&self, station: StationId, begin: DateTime<Utc>, end: DateTime<Utc>) -> anyhow::Result<()> {
        self.store.delete_points_in_range(station, begin, end).await.map(|_| ()).map_err(Into::into)
    }

    async fn update_last_archive_time(&self, station: StationId, timestamp: DateTime<Utc>) -> anyhow::Result<()> {
        self.store.update_last_archive_time(station, timestamp).await.map_err(Into::into)
    }

    async fn notify_debounced_jobs(&self, station: StationId, begin: DateTime<Utc>, end: DateTime<Utc>) {
        if let Some(publisher) = &self.publisher {
            publisher.notify(station, begin, end).await;
        }
    }
}

pub struct Vp2StateMachine<T> {
    transport: T,
    station: StationId,
    local_tz: chrono_tz::Tz,
    rain_collector: RainCollectorSize,
    sink: Arc<dyn ArchiveSink>,
    state: Vp2State,
    last_archive: DateTime<Utc>,
    set_time_requested: bool,
}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Vp2StateMachine<T> {
    pub fn new(
        transport: T,
        station: StationId,
        local_tz: chrono_tz::Tz,
        rain_collector: RainCollectorSize,
        sink: Arc<dyn ArchiveSink>,
        last_archive: DateTime<Utc>,
    ) -> Self {
        Vp2StateMachine {
            transport,
            station,
            local_tz,
            rain_collector,
            sink,
            state: Vp2State::Starting,
            last_archive,
            set_time_requested: false,
        }
    }

    pub fn state(&self) -> Vp2State {
        self.state
    }

    /// Marks the state machine as due for a clock resync. Checked once
    /// the archive branch has run to completion.
    pub fn request_settime(&mut self) {
        self.set_time_requested = true;
    }

    /// Runs one full cycle: wake the station, negotiate, download any
    /// outstanding archive pages since `last_archive`, resync the clock
    /// if due, then settle in `WaitingNextMeasureTick`.
    #[instrument(skip(self), fields(station = %self.station))]
    pub async fn run_once(&mut self) -> Result<(), Vp2Error> {
        self.state = Vp2State::SendingWakeup;
        self.wakeup(Vp2State::WaitingEchoStation).await?;

        self.negotiate(Vp2State::SendingReqStation, Vp2State::WaitingAckStation, b"RXCHECK\n").await?;
        self.state = Vp2State::WaitingDataStation;
        let mut discard = [0u8; 6];
        self.read_with_retry(&mut discard, Vp2State::SendingReqStation, b"RXCHECK\n").await?;

        self.negotiate(Vp2State::SendingReqMainMode, Vp2State::WaitingAckMainMode, b"LOOP 0\n").await?;
        self.negotiate(Vp2State::SendingReqTimezone, Vp2State::WaitingAckTimezone, b"GETTIME\n").await?;
        self.state = Vp2State::WaitingDataTimezone;
        let mut time_data = [0u8; 8];
        self.read_with_retry(&mut time_data, Vp2State::SendingReqTimezone, b"GETTIME\n").await?;

        self.state = Vp2State::SendingWakeupArchive;
        self.download_archive().await?;

        if self.set_time_requested {
            self.state = Vp2State::SendingWakeupSettime;
            self.wakeup(Vp2State::WaitingEchoSettime).await?;
            self.negotiate(Vp2State::SendingSettime, Vp2State::WaitingAckSettime, b"SETTIME\n").await?;
            self.negotiate(Vp2State::SendingSettimeParams, Vp2State::WaitingAckTimeSet, &[0u8; 8]).await?;
            self.set_time_requested = false;
        }

        self.state = Vp2State::WaitingNextMeasureTick;
        Ok(())
    }

    async fn download_archive(&mut self) -> Result<(), Vp2Error> {
        self.wakeup(Vp2State::WaitingEchoArchive).await?;
        self.negotiate(Vp2State::SendingReqArchive, Vp2State::WaitingAckArchive, b"DMPAFT\n").await?;
        self.negotiate(Vp2State::SendingArchiveParams, Vp2State::WaitingAckArchiveParams, &[0u8; 6]).await?;

        self.state = Vp2State::WaitingArchiveNbPages;
        let mut header = [0u8; 6];
        self.read_with_retry(&mut header, Vp2State::SendingArchiveParams, &[0u8; 6]).await?;
        let nb_pages = u16::from_le_bytes([header[0], header[1]]) as usize;

        self.state = Vp2State::SendingAckArchiveDownload;
        self.transport.write_all(&[ACK]).await?;

        let mut oldest: Option<DateTime<Utc>> = None;
        let mut newest: Option<DateTime<Utc>> = None;
        let mut batch = Vec::new();

        for _ in 0..nb_pages {
            self.state = Vp2State::WaitingArchivePage;
            let mut page = vec![0u8; PAGE_LEN];
            self.transport.read_exact(&mut page).await.map_err(Vp2Error::Io)?;

            if !meteo_decoders::davis::page_crc_is_valid(&page) {
                warn!("archive page failed CRC, aborting download");
                return Err(Vp2Error::BadPage);
            }

            for record_idx in 0..RECORDS_PER_PAGE {
                let offset = record_idx * VP2_ARCHIVE_RECORD_LEN;
                let record = &page[offset..offset + VP2_ARCHIVE_RECORD_LEN];
                let parsed = match DavisVp2ArchiveRecord::parse(record, &self.local_tz, self.rain_collector) {
                    Ok(r) => r,
                    Err(_) => continue,
                };
                if !parsed.looks_valid(Utc::now()) || parsed.timestamp <= self.last_archive {
                    continue;
                }
                oldest = Some(oldest.map_or(parsed.timestamp, |o: DateTime<Utc>| o.min(parsed.timestamp)));
                newest = Some(newest.map_or(parsed.timestamp, |n: DateTime<Utc>| n.max(parsed.timestamp)));
                batch.push(parsed.to_observation(self.station));
            }

            self.state = Vp2State::SendingArchivePageAnswer;
            self.transport.write_all(&[ACK]).await?;
        }

        if let (Some(oldest), Some(newest)) = (oldest, newest) {
            // Archive replaces any lower-fidelity real-time rows already
            // present for the window being backfilled.
            self.sink.delete_points_in_range(self.station, oldest, newest).await.ok();
            self.sink
                .insert_points_batch(&batch)
                .await
                .map_err(|e| Vp2Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;
            self.sink.update_last_archive_time(self.station, newest).await.ok();
            self.last_archive = newest;

            if oldest.date_naive() < Utc::now().date_naive() {
                self.sink.notify_debounced_jobs(self.station, oldest, newest).await;
            }
        }

        debug!(pages = nb_pages, records = batch.len(), "archive download complete");
        Ok(())
    }

    /// Sends the wakeup byte and waits for the echo, retrying on
    /// timeout up to the budget (2 s per attempt for the initial
    /// wakeup, distinct from the 6 s step timeout used everywhere else).
    async fn wakeup(&mut self, next_state: Vp2State) -> Result<(), Vp2Error> {
        let mut timeouts = 0;
        loop {
            self.transport.write_all(b"\n").await?;
            let mut echo = [0u8; 2];
            match tokio::time::timeout(WAKEUP_TIMEOUT, self.transport.read_exact(&mut echo)).await {
                Ok(Ok(())) if &echo == b"\n\r" => {
                    self.state = next_state;
                    return Ok(());
                }
                _ => {
                    timeouts += 1;
                    if timeouts >= MAX_TIMEOUTS {
                        return Err(Vp2Error::TooManyTimeouts);
                    }
                }
            }
        }
    }

    /// Sends `request`, waits for `ACK`, retrying on wrong ACK or
    /// timeout. On success, advances through `sending` to `waiting_ack`.
    async fn negotiate(&mut self, sending: Vp2State, waiting_ack: Vp2State, request: &[u8]) -> Result<(), Vp2Error> {
        self.state = sending;
        let mut transmission_errors = 0;
        let mut timeouts = 0;
        loop {
            self.transport.write_all(request).await?;
            self.state = waiting_ack;
            let mut ack = [0u8; 1];
            match tokio::time::timeout(STEP_TIMEOUT, self.transport.read_exact(&mut ack)).await {
                Ok(Ok(())) if ack[0] == ACK => return Ok(()),
                Ok(Ok(())) => {
                    transmission_errors += 1;
                    if transmission_errors >= MAX_TRANSMISSION_ERRORS {
                        return Err(Vp2Error::TooManyTransmissionErrors);
                    }
                    tokio::time::sleep(RETRY_WAIT).await;
                    self.state = sending;
                }
                _ => {
                    timeouts += 1;
                    if timeouts >= MAX_TIMEOUTS {
                        return Err(Vp2Error::TooManyTimeouts);
                    }
                    self.state = sending;
                }
            }
        }
    }

    async fn read_with_retry(&mut self, buf: &mut [u8], sending: Vp2State, request: &[u8]) -> Result<(), Vp2Error> {
        let mut timeouts = 0;
        loop {
            match tokio::time::timeout(STEP_TIMEOUT, self.transport.read_exact(buf)).await {
                Ok(Ok(())) => return Ok(()),
                _ => {
                    timeouts += 1;
                    if timeouts >= MAX_TIMEOUTS {
                        return Err(Vp2Error::TooManyTimeouts);
                    }
                    self.state = sending;
                    self.transport.write_all(request).await?;
                }
            }
        }
    }
}

/// Drives every registered direct-dial VantagePro2 station through one
/// [`Vp2StateMachine::run_once`] cycle per tick. Implements
/// [`PeriodicDownload`] so it sits in the same [`meteo_core::ConnectorGroup`]
/// as the push receivers and the virtual-station computer: the top-level
/// event loop owns one instance of it, not one connection per station
/// kept open indefinitely, since a VP2 only needs to be dialed long
/// enough to hand over its backlog.
pub struct Vp2Downloader<F> {
    store: ObservationStore,
    publisher: Option<Arc<JobPublisher<F>>>,
}

impl<F: JobsFacade + 'static> Vp2Downloader<F> {
    pub fn new(store: ObservationStore, publisher: Option<Arc<JobPublisher<F>>>) -> Self {
        Vp2Downloader { store, publisher }
    }

    #[instrument(skip(self, row), fields(station = %row.station))]
    async fn run_station(&self, row: meteo_db::Vp2StationRow) -> anyhow::Result<()> {
        let metadata = self.store.get_station_metadata(row.station).await?;
        let local_tz: chrono_tz::Tz = metadata
            .timezone
            .parse()
            .map_err(|_| anyhow::anyhow!("station {} has an unparseable timezone {:?}", row.station, metadata.timezone))?;
        let rain_collector =
            if row.rain_collector_imperial { RainCollectorSize::Imperial0_01in } else { RainCollectorSize::Metric0_2mm };

        let transport = tokio::net::TcpStream::connect((row.host.as_str(), row.port as u16)).await?;
        let sink: Arc<dyn ArchiveSink> = Arc::new(Vp2Sink { store: self.store.clone(), publisher: self.publisher.clone() });
        let mut machine = Vp2StateMachine::new(transport, row.station, local_tz, rain_collector, sink, metadata.last_archive);
        machine.run_once().await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl<F: JobsFacade + 'static> PeriodicDownload for Vp2Downloader<F> {
    fn period(&self) -> Duration {
        Duration::from_secs(5 * 60)
    }

    async fn download(&self) -> anyhow::Result<()> {
        let stations = self.store.get_all_vp2_stations().await?;
        for row in stations {
            let station = row.station;
            if let Err(err) = self.run_station(row).await {
                warn!(%station, %err, "vp2 archive cycle failed, will retry next tick");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meteo_core::fields;
    use std::sync::Mutex as StdMutex;
    use tokio::io::duplex;

    #[derive(Default)]
    struct RecordingSink {
        batches: StdMutex<Vec<Vec<Observation>>>,
        notified: StdMutex<Vec<(DateTime<Utc>, DateTime<Utc>)>>,
        last_archive: StdMutex<Option<DateTime<Utc>>>,
    }

    #[async_trait::async_trait]
    impl ArchiveSink for RecordingSink {
        async fn insert_points_batch(&self, observations: &[Observation]) -> anyhow::Result<()> {
            self.batches.lock().unwrap().push(observations.to_vec());
            Ok(())
        }
        async fn delete_points_in_range(&self, _station: StationId, _begin: DateTime<Utc>, _end: DateTime<Utc>) -> anyhow::Result<()> {
            Ok(())
        }
        async fn update_last_archive_time(&self, _station: StationId, timestamp: DateTime<Utc>) -> anyhow::Result<()> {
            *self.last_archive.lock().unwrap() = Some(timestamp);
            Ok(())
        }
        async fn notify_debounced_jobs(&self, _station: StationId, begin: DateTime<Utc>, end: DateTime<Utc>) {
            self.notified.lock().unwrap().push((begin, end));
        }
    }

    fn archive_record(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> Vec<u8> {
        let mut r = vec![0u8; VP2_ARCHIVE_RECORD_LEN];
        let date_stamp: u16 = (day as u16) | ((month as u16) << 5) | (((year - 2000) as u16) << 9);
        r[0..2].copy_from_slice(&date_stamp.to_le_bytes());
        let time_stamp: u16 = (hour * 100 + minute) as u16;
        r[2..4].copy_from_slice(&time_stamp.to_le_bytes());
        // Outside/inside temperature sentinels so the record decodes cleanly.
        r[4..6].copy_from_slice(&32767i16.to_le_bytes());
        r[6..8].copy_from_slice(&32767i16.to_le_bytes());
        r[8..10].copy_from_slice(&32767i16.to_le_bytes());
        r[20..22].copy_from_slice(&32767i16.to_le_bytes());
        r[22] = 255;
        r[23] = 255;
        r[29] = 255;
        r
    }

    fn page_from_records(records: &[Vec<u8>]) -> Vec<u8> {
        let mut page = Vec::new();
        for r in records {
            page.extend_from_slice(r);
        }
        while page.len() < RECORDS_PER_PAGE * VP2_ARCHIVE_RECORD_LEN {
            page.extend(std::iter::repeat(0u8).take(VP2_ARCHIVE_RECORD_LEN));
        }
        let crc = meteo_decoders::davis::crc16_ccitt(&page);
        page.extend_from_slice(&crc.to_be_bytes());
        page
    }

    #[tokio::test]
    async fn archive_download_inserts_new_records_and_advances_watermark() {
        let (mut station_side, device_side) = duplex(4096);
        let sink = Arc::new(RecordingSink::default());
        let last_archive = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let driver = tokio::spawn(async move {
            // Wakeup
            let mut buf = [0u8; 1];
            station_side.read_exact(&mut buf).await.unwrap();
            station_side.write_all(b"\n\r").await.unwrap();

            // RXCHECK
            let mut req = [0u8; 8];
            station_side.read_exact(&mut req).await.unwrap();
            station_side.write_all(&[ACK]).await.unwrap();
            station_side.write_all(&[0u8; 6]).await.unwrap();

            // LOOP 0
            let mut req = [0u8; 7];
            station_side.read_exact(&mut req).await.unwrap();
            station_side.write_all(&[ACK]).await.unwrap();

            // GETTIME
            let mut req = [0u8; 8];
            station_side.read_exact(&mut req).await.unwrap();
            station_side.write_all(&[ACK]).await.unwrap();
            station_side.write_all(&[0u8; 8]).await.unwrap();

            // Archive wakeup
            let mut buf = [0u8; 1];
            station_side.read_exact(&mut buf).await.unwrap();
            station_side.write_all(b"\n\r").await.unwrap();

            // DMPAFT
            let mut req = [0u8; 7];
            station_side.read_exact(&mut req).await.unwrap();
            station_side.write_all(&[ACK]).await.unwrap();

            // archive params
            let mut req = [0u8; 6];
            station_side.read_exact(&mut req).await.unwrap();
            station_side.write_all(&[ACK]).await.unwrap();

            // nb pages header: 1 page
            station_side.write_all(&[1u8, 0, 0, 0, 0, 0]).await.unwrap();
            let mut ack = [0u8; 1];
            station_side.read_exact(&mut ack).await.unwrap();
            assert_eq!(ack[0], ACK);

            let record = archive_record(2024, 1, 2, 10, 0);
            let page = page_from_records(&[record]);
            station_side.write_all(&page).await.unwrap();
            let mut ack = [0u8; 1];
            station_side.read_exact(&mut ack).await.unwrap();
            assert_eq!(ack[0], ACK);
        });

        let mut machine = Vp2StateMachine::new(
            device_side,
            StationId::from_u128(42),
            chrono_tz::UTC,
            RainCollectorSize::Metric0_2mm,
            sink.clone(),
            last_archive,
        );

        machine.run_once().await.unwrap();
        driver.await.unwrap();

        assert_eq!(machine.state(), Vp2State::WaitingNextMeasureTick);
        let batches = sink.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 1);
        assert!(batches[0][0].is_present(fields::RAINFALL));
        assert_eq!(*sink.last_archive.lock().unwrap(), Some(Utc.with_ymd_and_hms(2024, 1, 2, 10, 0, 0).unwrap()));
    }
}
