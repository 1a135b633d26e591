use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::config::SyncOperation;
use super::models::{
    CloudKind, CloudSummaryFile, CloudSyncMetadata, ConversationSummary, RemoteFileInfo,
    SyncState, CLOUD_SUMMARY_VERSION, WEBDAV_PROVIDER,
};
use crate::codec::Transforms;

const HASH_CHUNK_SIZE: usize = 64 * 1024;
const DEVICE_ID_FILE: &str = "device_id";

/// Hex SHA-256 of a file, read in 64 KiB chunks
pub fn calculate_file_hash(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hex SHA-256 of a byte slice
pub fn calculate_data_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Remote path of a conversation's payload, relative to the base path
pub fn build_cloud_path(session_id: &str, kind: CloudKind) -> String {
    match kind {
        CloudKind::Summary => format!("summaries/{}.summary.json", session_id),
        CloudKind::Conversation => format!("conversations/{}.jsonl", session_id),
    }
}

/// Session id named by a remote summary path such as
/// `summaries/{id}.summary.json`. Ids that could escape a directory when
/// joined onto a local path are rejected.
pub fn session_id_from_summary_path(path: &str) -> Option<&str> {
    let file_name = path.rsplit('/').next()?;
    let session_id = file_name.strip_suffix(".summary.json")?;
    if session_id.is_empty()
        || session_id == "."
        || session_id.contains(['/', '\\'])
        || session_id.contains("..")
    {
        return None;
    }
    Some(session_id)
}

/// `{sanitized project name}-{first 8 chars of the session id}`
pub fn project_id(project_name: &str, session_id: &str) -> String {
    let mut name = String::with_capacity(project_name.len());
    for c in project_name.chars() {
        if c.is_ascii_alphanumeric() {
            name.push(c.to_ascii_lowercase());
        } else if !name.ends_with('-') {
            name.push('-');
        }
    }
    let name = name.trim_matches('-');
    let name = if name.is_empty() { "unknown" } else { name };
    let short: String = session_id.chars().take(8).collect();
    format!("{}-{}", name, short)
}

/// Hash of the local transcript as observed at sync time
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptHash {
    Current(String),
    /// Hashing failed; change detection fails open
    Failed(String),
    /// No local transcript, e.g. a summary materialized from the remote
    Absent,
}

impl TranscriptHash {
    pub fn of_file(path: &Path) -> Self {
        if !path.exists() {
            return TranscriptHash::Absent;
        }
        match calculate_file_hash(path) {
            Ok(hash) => TranscriptHash::Current(hash),
            Err(e) => TranscriptHash::Failed(format!("{}: {}", path.display(), e)),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            TranscriptHash::Current(h) => Some(h),
            _ => None,
        }
    }
}

/// What is known locally about one conversation
#[derive(Debug, Clone)]
pub struct LocalState {
    pub sidecar: Option<CloudSummaryFile>,
    pub hash: TranscriptHash,
}

/// Parse a `getlastmodified` value (RFC 2822 HTTP date) or an RFC 3339 stamp
pub fn parse_remote_time(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    DateTime::parse_from_rfc2822(value)
        .or_else(|_| DateTime::parse_from_rfc3339(value))
        .map(|t| t.with_timezone(&Utc))
        .ok()
}

/// Whether a conversation has to be transferred in `direction`.
///
/// `remote` is `None` when no existence check was made.
pub fn needs_sync(
    local: &LocalState,
    direction: SyncOperation,
    remote: Option<&RemoteFileInfo>,
) -> bool {
    let Some(sidecar) = &local.sidecar else {
        return true;
    };
    if sidecar.cloud_sync.sync_state != SyncState::Synced {
        return true;
    }
    match &local.hash {
        TranscriptHash::Failed(e) => {
            log::warn!(
                "Sync: could not hash transcript for {}, assuming changed: {}",
                sidecar.session_id(),
                e
            );
            return true;
        }
        TranscriptHash::Current(hash) if *hash != sidecar.cloud_sync.local_hash => return true,
        _ => {}
    }

    match direction {
        SyncOperation::Upload => remote.map(|r| !r.exists).unwrap_or(true),
        SyncOperation::Download => {
            let Some(remote) = remote else {
                return true;
            };
            if !remote.exists {
                return false;
            }
            match remote.last_modified.as_deref().and_then(parse_remote_time) {
                Some(modified) => modified > sidecar.cloud_sync.last_sync_time,
                None => true,
            }
        }
    }
}

/// Which side changed since the last sync
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSide {
    None,
    Local,
    Remote,
    Both,
}

fn local_changed(local: &CloudSummaryFile, current_hash: Option<&str>) -> bool {
    let hash_changed = current_hash
        .map(|h| h != local.cloud_sync.local_hash)
        .unwrap_or(false);
    hash_changed || local.updated_at > local.cloud_sync.last_sync_time
}

pub fn classify_change(
    local: &CloudSummaryFile,
    current_hash: Option<&str>,
    remote: &CloudSummaryFile,
) -> ChangeSide {
    let local_side = local_changed(local, current_hash);
    let remote_side = remote.cloud_sync.last_sync_time > local.cloud_sync.last_sync_time;
    match (local_side, remote_side) {
        (false, false) => ChangeSide::None,
        (true, false) => ChangeSide::Local,
        (false, true) => ChangeSide::Remote,
        (true, true) => ChangeSide::Both,
    }
}

/// True only when both sides changed and the remote carries different content
pub fn detect_conflict(
    local: &CloudSummaryFile,
    current_hash: Option<&str>,
    remote: &CloudSummaryFile,
) -> bool {
    if classify_change(local, current_hash, remote) != ChangeSide::Both {
        return false;
    }
    let ours = current_hash.unwrap_or(local.cloud_sync.local_hash.as_str());
    remote.cloud_sync.local_hash != ours
}

/// Envelope for an upload, stamped synced as of now
pub fn build_cloud_summary_file(
    summary: &ConversationSummary,
    device_id: &str,
    local_hash: &str,
    transforms: Transforms,
    existing: Option<&CloudSummaryFile>,
) -> CloudSummaryFile {
    let now = Utc::now();
    let mut summary = summary.clone();
    summary.cloud_sync_metadata = None;

    CloudSummaryFile {
        version: CLOUD_SUMMARY_VERSION.to_string(),
        device_id: device_id.to_string(),
        project_id: project_id(&summary.project_name, &summary.session_id),
        cloud_sync: CloudSyncMetadata {
            sync_id: summary.session_id.clone(),
            last_sync_provider: WEBDAV_PROVIDER.to_string(),
            last_sync_time: now,
            cloud_path: build_cloud_path(&summary.session_id, CloudKind::Summary),
            cloud_version: None,
            local_hash: local_hash.to_string(),
            sync_state: SyncState::Synced,
            encrypted: transforms.encrypted,
            compressed: transforms.compressed,
        },
        summary,
        created_at: existing.map(|e| e.created_at).unwrap_or(now),
        updated_at: now,
    }
}

/// Load this device's id from `{data_dir}/device_id`, creating it on first use
pub fn load_or_create_device_id(data_dir: &Path) -> io::Result<String> {
    let path = data_dir.join(DEVICE_ID_FILE);
    if let Ok(existing) = std::fs::read_to_string(&path) {
        let existing = existing.trim();
        if !existing.is_empty() {
            return Ok(existing.to_string());
        }
    }

    let id = generate_device_id();
    std::fs::create_dir_all(data_dir)?;
    std::fs::write(&path, &id)?;
    log::info!("Sync: created device id {}", id);
    Ok(id)
}

fn generate_device_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let random = Uuid::new_v4().simple().to_string();
    format!("{}-{}", host, &random[..12])
}
