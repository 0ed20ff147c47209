//! Boundary between job bookkeeping and whatever actually downloads media.

use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::quality::Quality;

/// Metadata gathered before the download starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaProbe {
    pub title: String,
}

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub quality: Quality,
    /// Directory owned by the job; the fetcher writes exactly one file here.
    pub output_dir: PathBuf,
    pub file_stem: String,
}

/// One progress report from the downloader. Byte counts are per stream, so a
/// video+audio download reports two runs from zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProgressEvent {
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    pub total_bytes_estimate: Option<u64>,
    pub finished: bool,
}

impl ProgressEvent {
    /// Whole percent for this event, or `None` when the size is unknown.
    pub fn percent(&self) -> Option<u8> {
        if self.finished {
            return Some(100);
        }
        let total = self
            .total_bytes
            .or(self.total_bytes_estimate)
            .filter(|total| *total > 0)?;
        let percent = (u128::from(self.downloaded_bytes) * 100 / u128::from(total)).min(100);
        Some(percent as u8)
    }
}

#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn probe(&self, url: &str) -> Result<MediaProbe>;

    /// Downloads the media and returns the path of the finished file.
    async fn download(
        &self,
        request: &DownloadRequest,
        progress: mpsc::Sender<ProgressEvent>,
    ) -> Result<PathBuf>;
}
