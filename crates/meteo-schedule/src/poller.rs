//! Generic periodic-download scheduler (C7): one outstanding timer,
//! aligned to a tick grid, driving a vendor-specific `download()` hook.
//! Errors from the hook are logged and swallowed so one bad cycle never
//! stops the next tick from being armed.

use std::sync::Arc;
use std::time::Duration;

use meteo_core::{Connector, ConnectorStatus, ShortStatus};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument};

use crate::tick::next_tick;

#[async_trait::async_trait]
pub trait PeriodicDownload: Send + Sync + 'static {
    /// How often the downloader should be invoked.
    fn period(&self) -> Duration;

    /// How long after a period boundary to wait before firing, so the
    /// upstream source has finished publishing for that boundary.
    fn phase_offset(&self) -> Duration {
        Duration::from_secs(120)
    }

    /// One download cycle. Per-station failures inside this hook must
    /// be handled internally (localised per station); only a total
    /// failure of the cycle should return `Err` here.
    async fn download(&self) -> anyhow::Result<()>;
}

/// Drives a single [`PeriodicDownload`] hook on its tick grid. Implements
/// [`Connector`] so it can sit inside a [`meteo_core::ConnectorGroup`]
/// alongside push receivers.
pub struct PeriodicDownloadScheduler<D> {
    downloader: Arc<D>,
    status: Arc<ConnectorStatus>,
    cancel: Arc<Notify>,
    handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<D: PeriodicDownload> PeriodicDownloadScheduler<D> {
    pub fn new(downloader: D) -> Self {
        PeriodicDownloadScheduler {
            downloader: Arc::new(downloader),
            status: Arc::new(ConnectorStatus::new()),
            cancel: Arc::new(Notify::new()),
            handle: tokio::sync::Mutex::new(None),
        }
    }

    pub fn status_handle(&self) -> Arc<ConnectorStatus> {
        Arc::clone(&self.status)
    }

    async fn run_loop(downloader: Arc<D>, status: Arc<ConnectorStatus>, cancel: Arc<Notify>) {
        status.update(|s| s.active_since = Some(chrono::Utc::now()));
        status.set_short_status(ShortStatus::Ok);

        let mut next = next_tick(chrono::Utc::now(), downloader.period(), downloader.phase_offset());
        loop {
            status.update(|s| s.next_download = Some(next));
            let now = chrono::Utc::now();
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.notified() => break,
            }

            // A spurious early wake (clock adjustment, etc.) re-arms
            // without advancing or firing download().
            if chrono::Utc::now() < next {
                continue;
            }

            if let Err(err) = downloader.download().await {
                error!(%err, "download cycle failed, will retry next tick");
            } else {
                status.update(|s| {
                    s.last_download = Some(chrono::Utc::now());
                    s.downloads_since_reload += 1;
                });
            }

            next += chrono::Duration::from_std(downloader.period()).unwrap_or(chrono::Duration::seconds(1));
        }
    }
}

#[async_trait::async_trait]
impl<D: PeriodicDownload> Connector for PeriodicDownloadScheduler<D> {
    #[instrument(skip(self))]
    async fn start(&self) -> anyhow::Result<()> {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            return Ok(());
        }
        let downloader = Arc::clone(&self.downloader);
        let status = Arc::clone(&self.status);
        let cancel = Arc::clone(&self.cancel);
        *handle = Some(tokio::spawn(Self::run_loop(downloader, status, cancel)));
        info!("periodic download scheduler started");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn stop(&self) -> anyhow::Result<()> {
        self.status.set_short_status(ShortStatus::Stopped);
        self.cancel.notify_waiters();
        let mut handle = self.handle.lock().await;
        if let Some(h) = handle.take() {
            let _ = h.await;
        }
        Ok(())
    }

    async fn reload(&self) -> anyhow::Result<()> {
        // The downloader hook re-reads the station registry itself the
        // next time `download()` runs; nothing to do here beyond
        // leaving any in-flight cycle alone.
        Ok(())
    }

    async fn status(&self) -> String {
        self.status.describe("periodic-download-scheduler")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingDownloader {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl PeriodicDownload for CountingDownloader {
        fn period(&self) -> Duration {
            Duration::from_secs(5)
        }
        fn phase_offset(&self) -> Duration {
            Duration::from_secs(0)
        }
        async fn download(&self) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_on_every_tick_until_stopped() {
        let calls = Arc::new(AtomicUsize::new(0));
        let scheduler = PeriodicDownloadScheduler::new(CountingDownloader { calls: Arc::clone(&calls) });
        scheduler.start().await.unwrap();

        tokio::time::sleep(Duration::from_secs(11)).await;
        tokio::task::yield_now().await;
        assert!(calls.load(Ordering::SeqCst) >= 2);

        scheduler.stop().await.unwrap();
        let after_stop = calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), after_stop);
    }
}
