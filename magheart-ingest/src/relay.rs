//! Forwards a stream of bpm values to the ingestion endpoint.

use tokio::sync::mpsc;

use crate::uploader::HeartRateUploader;

/// Totals for one relay run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub uploaded: u64,
    pub failed: u64,
}

/// Upload every value received on `readings` until the sender side closes.
///
/// Failed uploads are logged and counted; the relay keeps going.
pub async fn run_relay(uploader: &HeartRateUploader, mut readings: mpsc::Receiver<u32>) -> RelayStats {
    let mut stats = RelayStats::default();

    while let Some(bpm) = readings.recv().await {
        let reading = uploader.reading(bpm);
        match uploader.post_heart_rate(&reading).await {
            Ok(()) => stats.uploaded += 1,
            Err(e) => {
                stats.failed += 1;
                log::warn!("Heart rate upload failed ({bpm} bpm): {e}");
            }
        }
    }

    log::info!(
        "Relay finished: {} uploaded, {} failed",
        stats.uploaded,
        stats.failed
    );
    stats
}
