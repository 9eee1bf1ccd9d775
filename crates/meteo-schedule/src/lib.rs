//! Periodic-download scheduling (C7): tick-grid alignment shared by
//! every vendor poller, plus the Davis VantagePro2 direct-device state
//! machine as the one exemplar implemented in full.

pub mod poller;
pub mod tick;
pub mod vp2;

pub use poller::{PeriodicDownload, PeriodicDownloadScheduler};
pub use tick::next_tick;
pub use vp2::{ArchiveSink, Vp2Downloader, Vp2Error, Vp2Sink, Vp2State, Vp2StateMachine};
