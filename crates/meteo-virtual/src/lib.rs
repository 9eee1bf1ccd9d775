//! Virtual-station computer (C9): a station with no device or vendor API
//! of its own, whose observations are synthesized by merging other
//! stations' data on a fixed schedule.

pub mod computer;
pub mod config;
pub mod downloader;

pub use computer::VirtualObsComputer;
pub use config::VirtualStationConfig;
pub use downloader::VirtualComputationDownloader;

#[derive(Debug, thiserror::Error)]
pub enum VirtualError {
    #[error("malformed virtual station source map: {0}")]
    BadSourceMap(String),
}
