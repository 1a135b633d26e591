use std::path::{Path, PathBuf};

use super::manager::SyncError;
use super::models::{CloudSummaryFile, ConversationSummary};

const SIDECAR_SUFFIX: &str = ".summary.json";
const CLOUD_DIR: &str = "cloud";

/// Local sidecar storage: one JSON `CloudSummaryFile` per conversation.
///
/// Sidecars live next to the transcript (`<dir>/<sessionId>.summary.json`).
/// Summaries that exist only remotely go under `{data_dir}/cloud/`.
#[derive(Debug, Clone)]
pub struct SummaryStore {
    data_dir: PathBuf,
}

impl SummaryStore {
    pub fn new(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }

    pub fn cloud_dir(&self) -> PathBuf {
        self.data_dir.join(CLOUD_DIR)
    }

    /// Sidecar next to a local transcript
    pub fn local_sidecar_path(summary: &ConversationSummary) -> PathBuf {
        let transcript = Path::new(&summary.file_path);
        let dir = transcript.parent().unwrap_or_else(|| Path::new("."));
        dir.join(format!("{}{}", summary.session_id, SIDECAR_SUFFIX))
    }

    /// Sidecar for a summary with no local transcript
    pub fn cloud_sidecar_path(&self, session_id: &str) -> PathBuf {
        self.cloud_dir()
            .join(format!("{}{}", session_id, SIDECAR_SUFFIX))
    }

    /// Read a sidecar. Missing files are `None`; unreadable or invalid ones
    /// are logged and also `None`, so the conversation gets re-synced.
    pub fn read(&self, path: &Path) -> Option<CloudSummaryFile> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                log::warn!("Sync: could not read sidecar {}: {}", path.display(), e);
                return None;
            }
        };
        match CloudSummaryFile::from_slice(&data) {
            Ok(file) => Some(file),
            Err(e) => {
                log::warn!("Sync: ignoring invalid sidecar {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Write a sidecar via a temp file in the same directory, then rename
    pub fn write(&self, path: &Path, file: &CloudSummaryFile) -> Result<(), SyncError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(file)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, path)?;
        log::debug!("Sync: wrote sidecar {}", path.display());
        Ok(())
    }

    /// All summaries materialized from the remote
    pub fn list_cloud(&self) -> Vec<CloudSummaryFile> {
        let dir = self.cloud_dir();
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return Vec::new();
        };
        let mut files: Vec<CloudSummaryFile> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.ends_with(SIDECAR_SUFFIX))
                    .unwrap_or(false)
            })
            .filter_map(|p| self.read(&p))
            .collect();
        files.sort_by(|a, b| a.session_id().cmp(b.session_id()));
        files
    }
}
