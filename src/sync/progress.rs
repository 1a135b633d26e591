use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    Scanning,
    Uploading,
    Downloading,
    Complete,
}

/// Progress event payload for sync operations
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    pub phase: SyncPhase,
    pub current_item: Option<String>,
    pub processed: usize,
    pub total: usize,
    pub bytes_transferred: u64,
    pub bytes_total: u64,
    pub percentage: f64,
}

/// Fire-and-forget progress sink; a dropped receiver is ignored
#[derive(Debug, Clone, Default)]
pub struct ProgressReporter {
    tx: Option<UnboundedSender<SyncProgress>>,
}

impl ProgressReporter {
    pub fn new(tx: Option<UnboundedSender<SyncProgress>>) -> Self {
        Self { tx }
    }

    pub fn report(
        &self,
        phase: SyncPhase,
        current_item: Option<&str>,
        processed: usize,
        total: usize,
        bytes: (u64, u64),
    ) {
        let Some(tx) = &self.tx else {
            return;
        };
        let percentage = if total == 0 {
            100.0
        } else {
            (processed as f64 / total as f64 * 100.0).min(100.0)
        };
        let _ = tx.send(SyncProgress {
            phase,
            current_item: current_item.map(|s| s.to_string()),
            processed,
            total,
            bytes_transferred: bytes.0,
            bytes_total: bytes.1,
            percentage,
        });
    }
}
