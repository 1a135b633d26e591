use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Schema tag written into every `CloudSummaryFile`
pub const CLOUD_SUMMARY_VERSION: &str = "1.0";

/// Provider name recorded in `lastSyncProvider` and used for credential lookup
pub const WEBDAV_PROVIDER: &str = "webdav";

/// Derived, read-only view of one conversation transcript
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    /// Stable identifier shared by every device
    pub session_id: String,
    pub project_path: String,
    pub project_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub message_count: usize,
    /// Duration in milliseconds
    pub duration: u64,
    /// Absolute path to the source transcript
    pub file_path: String,
    pub first_message: String,
    pub last_message: String,
    /// Set on summaries materialized from the remote without a local transcript
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_from_cloud: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_sync_metadata: Option<CloudSyncMetadata>,
}

/// Sync state of one summary
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    #[default]
    Pending,
    Synced,
    Conflict,
    Error,
}

/// Sync bookkeeping attached to one summary
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CloudSyncMetadata {
    /// Always equal to the summary's session id
    pub sync_id: String,
    pub last_sync_provider: String,
    pub last_sync_time: DateTime<Utc>,
    /// Remote path relative to the configured base path
    pub cloud_path: String,
    /// Reserved for server-side versioning
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_version: Option<String>,
    /// Hex SHA-256 of the transcript bytes at last sync
    pub local_hash: String,
    pub sync_state: SyncState,
    pub encrypted: bool,
    pub compressed: bool,
}

/// JSON document exchanged with the remote and kept locally as a sidecar
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CloudSummaryFile {
    pub version: String,
    pub device_id: String,
    pub project_id: String,
    pub summary: ConversationSummary,
    pub cloud_sync: CloudSyncMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CloudSummaryFile {
    /// Parse and check the `syncId == sessionId` invariant
    pub fn from_slice(data: &[u8]) -> Result<Self, CloudFileError> {
        let file: Self = serde_json::from_slice(data)?;
        file.validate()?;
        Ok(file)
    }

    pub fn validate(&self) -> Result<(), CloudFileError> {
        if self.cloud_sync.sync_id != self.summary.session_id {
            return Err(CloudFileError::SyncIdMismatch {
                sync_id: self.cloud_sync.sync_id.clone(),
                session_id: self.summary.session_id.clone(),
            });
        }
        Ok(())
    }

    pub fn session_id(&self) -> &str {
        &self.summary.session_id
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CloudFileError {
    #[error("malformed summary document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("syncId {sync_id} does not match sessionId {session_id}")]
    SyncIdMismatch { sync_id: String, session_id: String },
}

/// Result of a remote existence check. Lives for one sync pass only.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteFileInfo {
    pub exists: bool,
    pub etag: Option<String>,
    /// Raw `getlastmodified` value (usually an RFC 2822 HTTP date)
    pub last_modified: Option<String>,
    pub size: Option<u64>,
}

impl RemoteFileInfo {
    pub fn missing() -> Self {
        Self::default()
    }
}

/// Logical kind of remote object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloudKind {
    Summary,
    Conversation,
}
