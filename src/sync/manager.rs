use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{Duration, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Semaphore;
use zeroize::Zeroizing;

use crate::codec::{Argon2Params, CodecError, PayloadCodec};

use super::config::{
    SyncDirection, SyncMode, SyncOperation, SyncOptions, SyncReport, SyncResult, SyncSettings,
};
use super::conflict::{resolve_conflict, Conflict, ConflictChoice, ConflictResolver, SkipResolver};
use super::credentials::CredentialProvider;
use super::metadata::{
    build_cloud_path, build_cloud_summary_file, classify_change, detect_conflict,
    load_or_create_device_id, needs_sync, parse_remote_time, session_id_from_summary_path,
    ChangeSide, LocalState, TranscriptHash,
};
use super::models::{
    CloudFileError, CloudKind, CloudSummaryFile, ConversationSummary, RemoteFileInfo, SyncState,
    WEBDAV_PROVIDER,
};
use super::progress::{ProgressReporter, SyncPhase, SyncProgress};
use super::source::ConversationSource;
use super::store::SummaryStore;
use super::webdav::{ResourceInfo, RetryPolicy, WebDAVClient, WebDAVConfig, WebDAVError};

const SUMMARIES_DIR: &str = "summaries";
const SUMMARY_SUFFIX: &str = ".summary.json";

pub const ALREADY_IN_PROGRESS: &str = "Sync already in progress";
pub const CANCELLED: &str = "Sync cancelled";

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("WebDAV error: {0}")]
    WebDAV(#[from] WebDAVError),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Config write error: {0}")]
    TomlWrite(#[from] toml::ser::Error),
    #[error("Invalid configuration: {0}")]
    Configuration(String),
    #[error("Credentials not found")]
    CredentialsNotFound,
    #[error("Keyring error: {0}")]
    Keyring(String),
    #[error("Invalid sync options: {0}")]
    InvalidOptions(String),
    #[error("{}", ALREADY_IN_PROGRESS)]
    AlreadyInProgress,
    #[error("{}", CANCELLED)]
    Cancelled,
    #[error("Parse error: {0}")]
    Parse(String),
}

impl From<CloudFileError> for SyncError {
    fn from(e: CloudFileError) -> Self {
        SyncError::Parse(e.to_string())
    }
}

/// Local sync status, computed without touching the network
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusReport {
    pub local_conversations: usize,
    pub never_synced: usize,
    pub synced: usize,
    /// Synced once, transcript changed since
    pub stale: usize,
    /// Sidecar in `error` or `conflict` state
    pub needs_attention: usize,
    /// Summaries downloaded without a local transcript
    pub cloud_only: usize,
}

/// Everything one sync pass needs from the outside world
struct SyncContext {
    client: WebDAVClient,
    codec: PayloadCodec,
    device_id: String,
}

struct UploadItem {
    summary: ConversationSummary,
    sidecar_path: PathBuf,
    local: LocalState,
    remote_path: String,
    size: u64,
}

enum UploadOutcome {
    Uploaded { conflict_resolved: bool },
    KeptRemote,
    Skipped { conflict_resolved: bool },
}

enum DownloadOutcome {
    Written { conflict_resolved: bool },
    Skipped { conflict_resolved: bool },
    /// Outside the selected projects
    Filtered,
}

/// Shared counters for progress events
struct Tally {
    processed: AtomicUsize,
    bytes: AtomicU64,
    total: usize,
    bytes_total: u64,
}

impl Tally {
    fn new(total: usize, bytes_total: u64) -> Self {
        Self {
            processed: AtomicUsize::new(0),
            bytes: AtomicU64::new(0),
            total,
            bytes_total,
        }
    }

    fn complete(&self, bytes: u64) -> (usize, u64) {
        let processed = self.processed.fetch_add(1, Ordering::SeqCst) + 1;
        let transferred = self.bytes.fetch_add(bytes, Ordering::SeqCst) + bytes;
        (processed, transferred)
    }
}

/// Clears the in-progress flag when a pass ends, however it ends
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Manager for sync operations
pub struct SyncManager {
    settings: SyncSettings,
    source: Arc<dyn ConversationSource>,
    credentials: Arc<dyn CredentialProvider>,
    resolver: Arc<dyn ConflictResolver>,
    store: SummaryStore,
    encryption_password: Option<Zeroizing<String>>,
    progress: ProgressReporter,
    retry: RetryPolicy,
    kdf_params: Argon2Params,
    in_progress: AtomicBool,
}

impl SyncManager {
    pub fn new(
        settings: SyncSettings,
        source: Arc<dyn ConversationSource>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        let store = SummaryStore::new(settings.data_dir());
        Self {
            settings,
            source,
            credentials,
            resolver: Arc::new(SkipResolver),
            store,
            encryption_password: None,
            progress: ProgressReporter::default(),
            retry: RetryPolicy::default(),
            kdf_params: Argon2Params::default(),
            in_progress: AtomicBool::new(false),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Password for encrypting uploads and decrypting downloads
    pub fn with_encryption_password(mut self, password: Option<String>) -> Self {
        self.encryption_password = password.filter(|p| !p.is_empty()).map(Zeroizing::new);
        self
    }

    pub fn with_progress(mut self, tx: UnboundedSender<SyncProgress>) -> Self {
        self.progress = ProgressReporter::new(Some(tx));
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_kdf_params(mut self, params: Argon2Params) -> Self {
        self.kdf_params = params;
        self
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn is_syncing(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    // ===== Setup =====

    fn get_client(&self) -> Result<WebDAVClient, SyncError> {
        let credentials = self
            .credentials
            .get_credentials(WEBDAV_PROVIDER)?
            .ok_or(SyncError::CredentialsNotFound)?;
        let client = WebDAVClient::connect(WebDAVConfig::from(&credentials))?
            .with_retry_policy(self.retry.clone());
        Ok(client)
    }

    async fn build_codec(&self) -> Result<PayloadCodec, SyncError> {
        let compress = self.settings.sync.compress;
        let encrypt = self.settings.sync.encrypt;
        let password = self.encryption_password.clone();
        let params = self.kdf_params.clone();
        // Argon2 is CPU-bound
        let codec = tokio::task::spawn_blocking(move || {
            PayloadCodec::with_params(compress, encrypt, password.as_ref().map(|p| p.as_str()), &params)
        })
        .await
        .map_err(|e| SyncError::Configuration(format!("key derivation task failed: {}", e)))??;
        Ok(codec)
    }

    async fn prepare(&self) -> Result<SyncContext, SyncError> {
        let client = self.get_client()?;
        let codec = self.build_codec().await?;
        let device_id = load_or_create_device_id(&self.settings.data_dir())?;
        Ok(SyncContext {
            client,
            codec,
            device_id,
        })
    }

    /// Test WebDAV connection with the stored credentials
    pub async fn test_connection(&self) -> Result<bool, SyncError> {
        let client = self.get_client()?;
        match client.test_connection().await {
            Ok(result) => {
                log::info!("Sync: connection test succeeded (base path exists={})", result);
                Ok(result)
            }
            Err(e) => {
                log::error!("Sync: connection test failed: {:?}", e);
                Err(e.into())
            }
        }
    }

    // ===== Entry points =====

    pub async fn upload(&self, options: SyncOptions) -> Vec<SyncResult> {
        self.sync(SyncOptions {
            direction: SyncDirection::Upload,
            ..options
        })
        .await
    }

    pub async fn download(&self, options: SyncOptions) -> Vec<SyncResult> {
        self.sync(SyncOptions {
            direction: SyncDirection::Download,
            ..options
        })
        .await
    }

    /// Run one sync pass in `options.direction`.
    ///
    /// Never fails as a whole: setup errors come back as a single failed
    /// result, per-conversation errors as that conversation's result.
    pub async fn sync(&self, options: SyncOptions) -> Vec<SyncResult> {
        let aggregate_op = match options.direction {
            SyncDirection::Download => SyncOperation::Download,
            _ => SyncOperation::Upload,
        };

        if let Err(e) = self.validate(&options) {
            return vec![SyncResult::failure(aggregate_op, "", "", e.to_string())];
        }

        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            log::warn!("Sync: pass requested while another is running");
            return vec![SyncResult::failure(aggregate_op, "", "", ALREADY_IN_PROGRESS)];
        }
        let _guard = PassGuard(&self.in_progress);

        log::info!(
            "Sync: starting {:?} pass (mode={:?}, force={}, projects={:?})",
            options.direction,
            options.mode,
            options.force_sync,
            options.selected_projects
        );

        let ctx = match self.prepare().await {
            Ok(ctx) => ctx,
            Err(e) => {
                log::error!("Sync: setup failed: {}", e);
                return vec![SyncResult::failure(aggregate_op, "", "", e.to_string())];
            }
        };

        let outcome = match options.direction {
            SyncDirection::Upload => self.upload_all(&ctx, &options).await,
            SyncDirection::Download => self.download_all(&ctx, &options).await,
            // A failed download scan ends the pass before any upload
            SyncDirection::Bidirectional => match self.download_all(&ctx, &options).await {
                Ok(mut results) => {
                    match self.upload_all(&ctx, &options).await {
                        Ok(uploaded) => results.extend(uploaded),
                        Err(fatal) => results.push(fatal),
                    }
                    Ok(results)
                }
                Err(fatal) => Err(fatal),
            },
        };
        let results = match outcome {
            Ok(results) => results,
            Err(fatal) => vec![fatal],
        };

        let report = SyncReport::from_results(&results);
        log::info!("Sync: {:?} pass finished: {}", options.direction, report);
        self.progress
            .report(SyncPhase::Complete, None, report.total, report.total, (0, 0));
        results
    }

    fn validate(&self, options: &SyncOptions) -> Result<(), SyncError> {
        options.validate()?;
        if self.settings.sync.max_concurrent_uploads == 0 {
            return Err(SyncError::InvalidOptions(
                "max_concurrent_uploads must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    fn ships_transcript(&self, mode: SyncMode, summary: &ConversationSummary) -> bool {
        match mode {
            SyncMode::SummaryOnly => false,
            SyncMode::Full => true,
            SyncMode::Smart => {
                let recent = Utc::now() - Duration::days(self.settings.sync.smart_recent_days);
                summary.end_time >= recent
                    || summary.message_count >= self.settings.sync.smart_min_messages
            }
        }
    }

    async fn local_conversations(
        &self,
        options: &SyncOptions,
    ) -> Result<Vec<ConversationSummary>, SyncError> {
        let all = self.source.get_available_conversations().await?;
        Ok(all
            .into_iter()
            .filter(|c| options.includes_project(&c.project_name))
            .collect())
    }

    // ===== Upload =====

    /// Upload pass. `Err` carries the single result of a failed scan.
    async fn upload_all(
        &self,
        ctx: &SyncContext,
        options: &SyncOptions,
    ) -> Result<Vec<SyncResult>, SyncResult> {
        self.progress.report(SyncPhase::Scanning, None, 0, 0, (0, 0));
        let conversations = match self.local_conversations(options).await {
            Ok(c) => c,
            Err(e) => {
                log::error!("Sync: could not enumerate conversations: {}", e);
                return Err(SyncResult::failure(SyncOperation::Upload, "", "", e.to_string()));
            }
        };
        if conversations.is_empty() {
            log::info!("Sync: nothing to upload");
            return Ok(Vec::new());
        }

        let items: Vec<UploadItem> = conversations
            .into_iter()
            .map(|summary| {
                let sidecar_path = SummaryStore::local_sidecar_path(&summary);
                let transcript = Path::new(&summary.file_path);
                let local = LocalState {
                    sidecar: self.store.read(&sidecar_path),
                    hash: TranscriptHash::of_file(transcript),
                };
                let size = std::fs::metadata(transcript).map(|m| m.len()).unwrap_or(0);
                let remote_path = build_cloud_path(&summary.session_id, CloudKind::Summary);
                UploadItem {
                    summary,
                    sidecar_path,
                    local,
                    remote_path,
                    size,
                }
            })
            .collect();

        let remote = if options.force_sync {
            HashMap::new()
        } else {
            let paths: Vec<String> = items.iter().map(|i| i.remote_path.clone()).collect();
            ctx.client.check_remote_files(&paths).await
        };

        let planned: Vec<bool> = items
            .iter()
            .map(|item| {
                options.force_sync
                    || needs_sync(&item.local, SyncOperation::Upload, remote.get(&item.remote_path))
            })
            .collect();
        let planned_count = planned.iter().filter(|p| **p).count();
        let bytes_total = items
            .iter()
            .zip(&planned)
            .filter(|(_, p)| **p)
            .map(|(i, _)| i.size)
            .sum();
        log::info!(
            "Sync: {} of {} conversations need upload",
            planned_count,
            items.len()
        );

        let semaphore = Semaphore::new(self.settings.sync.max_concurrent_uploads);
        // Up-to-date conversations complete as no-ops and still count
        let tally = Tally::new(items.len(), bytes_total);

        let tasks = items.iter().zip(planned).map(|(item, planned)| {
            let semaphore = &semaphore;
            let tally = &tally;
            let remote_info = remote.get(&item.remote_path);
            async move {
                let session_id = item.summary.session_id.as_str();
                let result = if planned {
                    self.upload_planned(ctx, item, remote_info, options, semaphore)
                        .await
                } else {
                    SyncResult::skipped(
                        SyncOperation::Upload,
                        session_id,
                        &item.summary.project_name,
                    )
                };
                let size = if planned && result.success { item.size } else { 0 };
                let (processed, bytes) = tally.complete(size);
                self.progress.report(
                    SyncPhase::Uploading,
                    Some(session_id),
                    processed,
                    tally.total,
                    (bytes, tally.bytes_total),
                );
                result
            }
        });

        Ok(join_all(tasks).await)
    }

    async fn upload_planned(
        &self,
        ctx: &SyncContext,
        item: &UploadItem,
        remote: Option<&RemoteFileInfo>,
        options: &SyncOptions,
        semaphore: &Semaphore,
    ) -> SyncResult {
        let session_id = item.summary.session_id.as_str();
        let project = item.summary.project_name.as_str();
        if options.is_cancelled() {
            return SyncResult::failure(SyncOperation::Upload, session_id, project, CANCELLED);
        }
        let Ok(_permit) = semaphore.acquire().await else {
            return SyncResult::failure(SyncOperation::Upload, session_id, project, CANCELLED);
        };
        if options.is_cancelled() {
            return SyncResult::failure(SyncOperation::Upload, session_id, project, CANCELLED);
        }
        self.upload_one(ctx, item, remote, options).await
    }

    async fn upload_one(
        &self,
        ctx: &SyncContext,
        item: &UploadItem,
        remote: Option<&RemoteFileInfo>,
        options: &SyncOptions,
    ) -> SyncResult {
        let session_id = item.summary.session_id.as_str();
        let project = item.summary.project_name.as_str();

        match self.try_upload(ctx, item, remote, options).await {
            Ok(UploadOutcome::Uploaded { conflict_resolved }) => {
                log::debug!("Sync: uploaded {}", session_id);
                let result = SyncResult::success(SyncOperation::Upload, session_id, project);
                if conflict_resolved {
                    result.with_conflict_resolved()
                } else {
                    result
                }
            }
            Ok(UploadOutcome::KeptRemote) => {
                SyncResult::success(SyncOperation::Upload, session_id, project)
                    .with_conflict_resolved()
            }
            Ok(UploadOutcome::Skipped { conflict_resolved }) => {
                let result = SyncResult::skipped(SyncOperation::Upload, session_id, project);
                if conflict_resolved {
                    result.with_conflict_resolved()
                } else {
                    result
                }
            }
            Err(e) => {
                log::error!("Sync: upload of {} failed: {}", session_id, e);
                if let Some(mut sidecar) = item.local.sidecar.clone() {
                    sidecar.cloud_sync.sync_state = SyncState::Error;
                    if let Err(write_err) = self.store.write(&item.sidecar_path, &sidecar) {
                        log::warn!(
                            "Sync: could not mark {} as failed: {}",
                            session_id,
                            write_err
                        );
                    }
                }
                SyncResult::failure(SyncOperation::Upload, session_id, project, e.to_string())
            }
        }
    }

    async fn try_upload(
        &self,
        ctx: &SyncContext,
        item: &UploadItem,
        remote: Option<&RemoteFileInfo>,
        options: &SyncOptions,
    ) -> Result<UploadOutcome, SyncError> {
        let hash = match &item.local.hash {
            TranscriptHash::Current(h) => h.clone(),
            TranscriptHash::Failed(e) => {
                return Err(SyncError::IO(std::io::Error::other(e.clone())));
            }
            TranscriptHash::Absent => {
                return Err(SyncError::IO(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("transcript {} not found", item.summary.file_path),
                )));
            }
        };

        let mut conflict_resolved = false;
        if !options.force_sync {
            if let Some(choice) = self.check_upload_conflict(ctx, item, &hash, remote).await? {
                conflict_resolved = true;
                match choice {
                    ConflictChoice::UseLocal => {}
                    ConflictChoice::UseRemote => return Ok(UploadOutcome::KeptRemote),
                    ConflictChoice::Skip => {
                        return Ok(UploadOutcome::Skipped {
                            conflict_resolved: false,
                        })
                    }
                }
            }
        }

        if self.ships_transcript(options.mode, &item.summary) {
            let transcript = self.source.load_conversation(&item.summary.file_path).await?;
            let payload = ctx.codec.encode(&transcript)?;
            let path = build_cloud_path(&item.summary.session_id, CloudKind::Conversation);
            ctx.client.put(&path, &payload).await?;
        }

        let envelope = build_cloud_summary_file(
            &item.summary,
            &ctx.device_id,
            &hash,
            ctx.codec.transforms(),
            item.local.sidecar.as_ref(),
        );
        let payload = ctx.codec.encode(&serde_json::to_vec(&envelope)?)?;
        ctx.client.put(&item.remote_path, &payload).await?;

        self.store.write(&item.sidecar_path, &envelope)?;
        Ok(UploadOutcome::Uploaded { conflict_resolved })
    }

    /// Upload-side conflict check: only when the transcript changed locally
    /// and the remote copy was modified after our last sync. Returns the
    /// chosen resolution if there is a real conflict.
    async fn check_upload_conflict(
        &self,
        ctx: &SyncContext,
        item: &UploadItem,
        hash: &str,
        remote: Option<&RemoteFileInfo>,
    ) -> Result<Option<ConflictChoice>, SyncError> {
        let (Some(sidecar), Some(remote)) = (&item.local.sidecar, remote) else {
            return Ok(None);
        };
        if !remote.exists || hash == sidecar.cloud_sync.local_hash {
            return Ok(None);
        }
        let remote_newer = remote
            .last_modified
            .as_deref()
            .and_then(parse_remote_time)
            .map(|t| t > sidecar.cloud_sync.last_sync_time)
            .unwrap_or(false);
        if !remote_newer {
            return Ok(None);
        }

        let remote_file = self.fetch_summary(ctx, &item.remote_path).await?;
        if !detect_conflict(sidecar, Some(hash), &remote_file) {
            return Ok(None);
        }

        let conflict = Conflict {
            operation: SyncOperation::Upload,
            local: sidecar,
            remote: &remote_file,
        };
        let choice =
            resolve_conflict(self.settings.sync.conflict_policy, self.resolver.as_ref(), &conflict)
                .await;
        if choice == ConflictChoice::UseRemote {
            self.adopt_remote(remote_file, Some(&item.summary), &item.sidecar_path)?;
        }
        Ok(Some(choice))
    }

    // ===== Download =====

    /// Download pass. `Err` carries the single result of a failed scan.
    async fn download_all(
        &self,
        ctx: &SyncContext,
        options: &SyncOptions,
    ) -> Result<Vec<SyncResult>, SyncResult> {
        self.progress.report(SyncPhase::Scanning, None, 0, 0, (0, 0));
        let listing = match ctx.client.list_files(SUMMARIES_DIR).await {
            Ok(files) => files,
            Err(WebDAVError::NotFound(_)) => {
                log::info!("Sync: no remote summaries yet");
                Vec::new()
            }
            Err(e) => {
                log::error!("Sync: could not list remote summaries: {}", e);
                return Err(SyncResult::failure(SyncOperation::Download, "", "", e.to_string()));
            }
        };

        // Session ids come from the href, never from a server display name
        let mut entries: Vec<(String, ResourceInfo)> = Vec::new();
        let mut rejected = Vec::new();
        for entry in listing {
            if !entry.path.ends_with(SUMMARY_SUFFIX) {
                continue;
            }
            let session_id = session_id_from_summary_path(&entry.path).map(str::to_string);
            match session_id {
                Some(session_id) => entries.push((session_id, entry)),
                None => {
                    log::warn!("Sync: ignoring remote summary {} (unusable session id)", entry.path);
                    let error = format!("invalid session id in {}", entry.path);
                    rejected.push(SyncResult::failure(
                        SyncOperation::Download,
                        &entry.path,
                        "",
                        error,
                    ));
                }
            }
        }
        if entries.is_empty() {
            return Ok(rejected);
        }

        let local = match self.source.get_available_conversations().await {
            Ok(all) => all,
            Err(e) => {
                log::error!("Sync: could not enumerate conversations: {}", e);
                return Err(SyncResult::failure(SyncOperation::Download, "", "", e.to_string()));
            }
        };
        let local: HashMap<String, ConversationSummary> = local
            .into_iter()
            .map(|c| (c.session_id.clone(), c))
            .collect();

        let bytes_total = entries.iter().map(|(_, e)| e.size).sum();
        let semaphore = Semaphore::new(self.settings.sync.max_concurrent_uploads);
        let tally = Tally::new(entries.len(), bytes_total);

        let tasks = entries.iter().map(|(session_id, entry)| {
            let semaphore = &semaphore;
            let tally = &tally;
            let local = &local;
            async move {
                let session_id = session_id.as_str();
                let local_summary = local.get(session_id);
                let outcome = self
                    .download_planned(ctx, entry, session_id, local_summary, options, semaphore)
                    .await;
                let size = if outcome.is_ok() { entry.size } else { 0 };
                let (processed, bytes) = tally.complete(size);
                self.progress.report(
                    SyncPhase::Downloading,
                    Some(session_id),
                    processed,
                    tally.total,
                    (bytes, tally.bytes_total),
                );

                match outcome {
                    Ok((DownloadOutcome::Filtered, _)) => None,
                    Ok((DownloadOutcome::Written { conflict_resolved }, project)) => {
                        let r = SyncResult::success(SyncOperation::Download, session_id, &project);
                        Some(if conflict_resolved { r.with_conflict_resolved() } else { r })
                    }
                    Ok((DownloadOutcome::Skipped { conflict_resolved }, project)) => {
                        let r = SyncResult::skipped(SyncOperation::Download, session_id, &project);
                        Some(if conflict_resolved { r.with_conflict_resolved() } else { r })
                    }
                    Err(e) => {
                        if !matches!(e, SyncError::Cancelled) {
                            log::error!("Sync: download of {} failed: {}", session_id, e);
                        }
                        let project = local_summary
                            .map(|s| s.project_name.as_str())
                            .unwrap_or_default();
                        Some(SyncResult::failure(
                            SyncOperation::Download,
                            session_id,
                            project,
                            e.to_string(),
                        ))
                    }
                }
            }
        });

        rejected.extend(join_all(tasks).await.into_iter().flatten());
        Ok(rejected)
    }

    async fn download_planned(
        &self,
        ctx: &SyncContext,
        entry: &ResourceInfo,
        session_id: &str,
        local_summary: Option<&ConversationSummary>,
        options: &SyncOptions,
        semaphore: &Semaphore,
    ) -> Result<(DownloadOutcome, String), SyncError> {
        if options.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let Ok(_permit) = semaphore.acquire().await else {
            return Err(SyncError::Cancelled);
        };
        if options.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        self.try_download(ctx, entry, session_id, local_summary, options)
            .await
    }

    /// Returns the outcome and the project name to report
    async fn try_download(
        &self,
        ctx: &SyncContext,
        entry: &ResourceInfo,
        session_id: &str,
        local_summary: Option<&ConversationSummary>,
        options: &SyncOptions,
    ) -> Result<(DownloadOutcome, String), SyncError> {
        let sidecar_path = match local_summary {
            Some(summary) => SummaryStore::local_sidecar_path(summary),
            None => self.store.cloud_sidecar_path(session_id),
        };
        let hash = match local_summary {
            Some(summary) => TranscriptHash::of_file(Path::new(&summary.file_path)),
            None => TranscriptHash::Absent,
        };
        let local = LocalState {
            sidecar: self.store.read(&sidecar_path),
            hash,
        };
        let known_project = local
            .sidecar
            .as_ref()
            .map(|s| s.summary.project_name.clone())
            .or_else(|| local_summary.map(|s| s.project_name.clone()))
            .unwrap_or_default();

        let remote_info = RemoteFileInfo {
            exists: true,
            etag: entry.etag.clone(),
            last_modified: entry.last_modified.clone(),
            size: Some(entry.size),
        };
        if !options.force_sync && !needs_sync(&local, SyncOperation::Download, Some(&remote_info)) {
            if !known_project.is_empty() && !options.includes_project(&known_project) {
                return Ok((DownloadOutcome::Filtered, known_project));
            }
            log::debug!("Sync: {} is up to date", session_id);
            return Ok((
                DownloadOutcome::Skipped {
                    conflict_resolved: false,
                },
                known_project,
            ));
        }

        let remote_file = self.fetch_summary(ctx, &entry.path).await?;
        if remote_file.session_id() != session_id {
            return Err(SyncError::Parse(format!(
                "{} holds summary for session {}",
                entry.path,
                remote_file.session_id()
            )));
        }
        let project = remote_file.summary.project_name.clone();
        if !options.includes_project(&project) {
            return Ok((DownloadOutcome::Filtered, project));
        }

        let Some(sidecar) = &local.sidecar else {
            self.adopt_remote(remote_file, local_summary, &sidecar_path)?;
            return Ok((
                DownloadOutcome::Written {
                    conflict_resolved: false,
                },
                project,
            ));
        };

        let current_hash = local.hash.as_str();
        let outcome = match classify_change(sidecar, current_hash, &remote_file) {
            ChangeSide::None if !options.force_sync => DownloadOutcome::Skipped {
                conflict_resolved: false,
            },
            ChangeSide::Local => {
                log::debug!("Sync: {} changed locally only, keeping local", session_id);
                DownloadOutcome::Skipped {
                    conflict_resolved: false,
                }
            }
            ChangeSide::Both if detect_conflict(sidecar, current_hash, &remote_file) => {
                let conflict = Conflict {
                    operation: SyncOperation::Download,
                    local: sidecar,
                    remote: &remote_file,
                };
                match resolve_conflict(
                    self.settings.sync.conflict_policy,
                    self.resolver.as_ref(),
                    &conflict,
                )
                .await
                {
                    ConflictChoice::UseRemote => {
                        self.adopt_remote(remote_file, local_summary, &sidecar_path)?;
                        DownloadOutcome::Written {
                            conflict_resolved: true,
                        }
                    }
                    // The next upload pushes the local copy
                    ConflictChoice::UseLocal => DownloadOutcome::Skipped {
                        conflict_resolved: true,
                    },
                    ConflictChoice::Skip => DownloadOutcome::Skipped {
                        conflict_resolved: false,
                    },
                }
            }
            _ => {
                self.adopt_remote(remote_file, local_summary, &sidecar_path)?;
                DownloadOutcome::Written {
                    conflict_resolved: false,
                }
            }
        };
        Ok((outcome, project))
    }

    async fn fetch_summary(
        &self,
        ctx: &SyncContext,
        remote_path: &str,
    ) -> Result<CloudSummaryFile, SyncError> {
        let bytes = ctx.client.get(remote_path).await?;
        let (plain, transforms) = ctx.codec.decode_auto(&bytes)?;
        log::debug!(
            "Sync: fetched {} ({} bytes, compressed={}, encrypted={})",
            remote_path,
            bytes.len(),
            transforms.compressed,
            transforms.encrypted
        );
        Ok(CloudSummaryFile::from_slice(&plain)?)
    }

    /// Store a remote envelope as the local sidecar, stamped synced as of now
    fn adopt_remote(
        &self,
        mut file: CloudSummaryFile,
        local_summary: Option<&ConversationSummary>,
        sidecar_path: &Path,
    ) -> Result<(), SyncError> {
        file.cloud_sync.sync_state = SyncState::Synced;
        file.cloud_sync.last_sync_time = Utc::now();
        match local_summary {
            Some(local) => {
                file.summary.file_path = local.file_path.clone();
                file.summary.is_from_cloud = None;
            }
            None => file.summary.is_from_cloud = Some(true),
        }
        self.store.write(sidecar_path, &file)
    }

    // ===== Extras =====

    /// Download a full transcript uploaded in full or smart mode and write it
    /// to `dest`. Returns the number of bytes written.
    pub async fn fetch_conversation(&self, session_id: &str, dest: &Path) -> Result<u64, SyncError> {
        let client = self.get_client()?;
        let codec = self.build_codec().await?;
        let path = build_cloud_path(session_id, CloudKind::Conversation);
        let bytes = client.get(&path).await?;
        let (plain, _) = codec.decode_auto(&bytes)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, &plain).await?;
        log::info!("Sync: fetched transcript {} to {}", session_id, dest.display());
        Ok(plain.len() as u64)
    }

    /// Count local conversations by sync state
    pub async fn status(&self) -> Result<SyncStatusReport, SyncError> {
        let conversations = self.source.get_available_conversations().await?;
        let mut report = SyncStatusReport {
            local_conversations: conversations.len(),
            cloud_only: self.store.list_cloud().len(),
            ..Default::default()
        };
        for summary in &conversations {
            let Some(sidecar) = self.store.read(&SummaryStore::local_sidecar_path(summary)) else {
                report.never_synced += 1;
                continue;
            };
            match sidecar.cloud_sync.sync_state {
                SyncState::Error | SyncState::Conflict => report.needs_attention += 1,
                SyncState::Pending => report.never_synced += 1,
                SyncState::Synced => {
                    match TranscriptHash::of_file(Path::new(&summary.file_path)) {
                        TranscriptHash::Current(h) if h == sidecar.cloud_sync.local_hash => {
                            report.synced += 1
                        }
                        _ => report.stale += 1,
                    }
                }
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decompress, is_gzip};
    use crate::sync::config::{ConflictPolicy, SyncCredentials};
    use crate::sync::credentials::StaticCredentialProvider;
    use crate::sync::metadata::calculate_file_hash;
    use crate::sync::source::testing::write_transcript;
    use crate::sync::source::{summarize_transcript, ClaudeProjectsSource};
    use crate::sync::webdav::mock::MockServer;
    use async_trait::async_trait;
    use std::io::Write;
    use tempfile::TempDir;
    use tokio::sync::Notify;

    struct Device {
        _dir: TempDir,
        projects: PathBuf,
        data: PathBuf,
    }

    impl Device {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let projects = dir.path().join("projects");
            let data = dir.path().join("data");
            std::fs::create_dir_all(&projects).unwrap();
            Self {
                _dir: dir,
                projects,
                data,
            }
        }

        fn settings(&self) -> SyncSettings {
            let mut settings = SyncSettings::default();
            settings.sync.projects_dir = Some(self.projects.clone());
            settings.sync.data_dir = Some(self.data.clone());
            settings
        }

        fn transcript(&self, session_id: &str, project: &str) -> PathBuf {
            write_transcript(
                &self.projects,
                &format!("-home-dev-{}", project),
                session_id,
                &format!("/home/dev/{}", project),
                4,
            )
        }
    }

    fn credentials(server: &MockServer) -> SyncCredentials {
        SyncCredentials {
            server_url: server.url(),
            username: "me".to_string(),
            password: "pw".to_string(),
            base_path: "sync".to_string(),
            accept_invalid_certs: false,
        }
    }

    fn fast_kdf() -> Argon2Params {
        Argon2Params {
            memory_cost: 1024,
            time_cost: 1,
            parallelism: 1,
        }
    }

    fn manager_with(
        server: &MockServer,
        settings: SyncSettings,
        source: Arc<dyn ConversationSource>,
    ) -> SyncManager {
        SyncManager::new(
            settings,
            source,
            Arc::new(StaticCredentialProvider::new(credentials(server))),
        )
        .with_retry_policy(RetryPolicy::none())
        .with_kdf_params(fast_kdf())
    }

    fn manager(server: &MockServer, device: &Device, settings: SyncSettings) -> SyncManager {
        let source = Arc::new(ClaudeProjectsSource::new(device.projects.clone()));
        manager_with(server, settings, source)
    }

    fn append(path: &Path, line: &str) {
        let mut f = std::fs::OpenOptions::new().append(true).open(path).unwrap();
        writeln!(f).unwrap();
        write!(f, "{}", line).unwrap();
    }

    fn read_sidecar(path: &Path) -> CloudSummaryFile {
        CloudSummaryFile::from_slice(&std::fs::read(path).unwrap()).unwrap()
    }

    fn sidecar_of(transcript: &Path) -> PathBuf {
        transcript.with_file_name(format!(
            "{}.summary.json",
            transcript.file_stem().unwrap().to_str().unwrap()
        ))
    }

    fn later() -> chrono::DateTime<Utc> {
        Utc::now() + Duration::minutes(5)
    }

    /// Fixed summaries, transcripts read from disk
    struct FixtureSource {
        summaries: Vec<ConversationSummary>,
    }

    #[async_trait]
    impl ConversationSource for FixtureSource {
        async fn get_available_conversations(&self) -> Result<Vec<ConversationSummary>, SyncError> {
            Ok(self.summaries.clone())
        }

        async fn load_conversation(&self, file_path: &str) -> Result<Vec<u8>, SyncError> {
            Ok(tokio::fs::read(file_path).await?)
        }
    }

    /// Blocks enumeration until released
    struct BlockingSource {
        started: Notify,
        release: Notify,
    }

    #[async_trait]
    impl ConversationSource for BlockingSource {
        async fn get_available_conversations(&self) -> Result<Vec<ConversationSummary>, SyncError> {
            self.started.notify_one();
            self.release.notified().await;
            Ok(Vec::new())
        }

        async fn load_conversation(&self, _file_path: &str) -> Result<Vec<u8>, SyncError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_upload_writes_sidecar_then_skips_unchanged() {
        let server = MockServer::start().await;
        let device = Device::new();
        let t1 = device.transcript("abc123", "api");
        device.transcript("def456", "web");
        let manager = manager(&server, &device, device.settings());

        let results = manager.upload(SyncOptions::default()).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.success && !r.skipped), "{:?}", results);

        let sidecar = read_sidecar(&sidecar_of(&t1));
        assert_eq!(sidecar.cloud_sync.sync_state, SyncState::Synced);
        assert_eq!(sidecar.cloud_sync.local_hash, calculate_file_hash(&t1).unwrap());
        assert!(sidecar.cloud_sync.compressed);
        assert!(!sidecar.cloud_sync.encrypted);

        let remote = server.file("/sync/summaries/abc123.summary.json").unwrap();
        assert!(is_gzip(&remote));
        let remote = CloudSummaryFile::from_slice(&decompress(&remote).unwrap()).unwrap();
        assert_eq!(remote.cloud_sync.local_hash, sidecar.cloud_sync.local_hash);
        assert_eq!(remote.project_id, "api-abc123");
        // Summary-only mode ships no transcripts
        assert!(server.file("/sync/conversations/abc123.jsonl").is_none());

        let puts = server.count("PUT");
        let second = manager.upload(SyncOptions::default()).await;
        assert_eq!(second.len(), 2);
        assert!(second.iter().all(|r| r.success && r.skipped), "{:?}", second);
        assert_eq!(server.count("PUT"), puts);
        assert!(!manager.is_syncing());
    }

    #[tokio::test]
    async fn test_force_sync_reuploads_everything() {
        let server = MockServer::start().await;
        let device = Device::new();
        device.transcript("abc123", "api");
        let manager = manager(&server, &device, device.settings());

        manager.upload(SyncOptions::default()).await;
        let puts = server.count("PUT");
        let summary = "/sync/summaries/abc123.summary.json";
        let checks = server.count_path("PROPFIND", summary);

        let forced = manager
            .upload(SyncOptions {
                force_sync: true,
                ..Default::default()
            })
            .await;
        assert!(forced[0].success && !forced[0].skipped);
        assert_eq!(server.count("PUT"), puts + 1);
        // No existence check when forced
        assert_eq!(server.count_path("PROPFIND", summary), checks);
    }

    #[tokio::test]
    async fn test_failed_preparation_is_isolated() {
        let server = MockServer::start().await;
        let device = Device::new();
        let mut summaries: Vec<ConversationSummary> = (0..5)
            .map(|i| {
                let path = device.transcript(&format!("s{}", i), "api");
                summarize_transcript(&path).unwrap().unwrap()
            })
            .collect();
        summaries[2].file_path = device.projects.join("gone").join("s2.jsonl").to_string_lossy().to_string();

        let manager = manager_with(
            &server,
            device.settings(),
            Arc::new(FixtureSource { summaries }),
        );
        let results = manager.upload(SyncOptions::default()).await;

        assert_eq!(results.len(), 5);
        assert!(!results[2].success);
        assert_eq!(results[2].session_id, "s2");
        assert!(results[2].error.as_deref().unwrap().contains("not found"));
        for i in [0, 1, 3, 4] {
            assert!(results[i].success, "{:?}", results[i]);
        }
        let report = SyncReport::from_results(&results);
        assert_eq!((report.succeeded, report.failed), (4, 1));
    }

    #[tokio::test]
    async fn test_concurrent_pass_is_rejected() {
        let server = MockServer::start().await;
        let device = Device::new();
        let source = Arc::new(BlockingSource {
            started: Notify::new(),
            release: Notify::new(),
        });
        let manager = manager_with(&server, device.settings(), source.clone());

        let first = manager.upload(SyncOptions::default());
        let second = async {
            source.started.notified().await;
            assert!(manager.is_syncing());
            let rejected = manager.upload(SyncOptions::default()).await;
            source.release.notify_one();
            rejected
        };
        let (first, rejected) = tokio::join!(first, second);

        assert!(first.is_empty());
        assert_eq!(rejected.len(), 1);
        assert!(!rejected[0].success);
        assert_eq!(rejected[0].error.as_deref(), Some(ALREADY_IN_PROGRESS));
        assert!(!manager.is_syncing());
    }

    #[tokio::test]
    async fn test_missing_credentials_is_single_failure() {
        let device = Device::new();
        device.transcript("abc123", "api");
        let manager = SyncManager::new(
            device.settings(),
            Arc::new(ClaudeProjectsSource::new(device.projects.clone())),
            Arc::new(StaticCredentialProvider::empty()),
        );
        let results = manager.sync(SyncOptions::default()).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].error.as_deref(), Some("Credentials not found"));
    }

    #[tokio::test]
    async fn test_invalid_options_rejected_up_front() {
        let server = MockServer::start().await;
        let device = Device::new();
        let manager = manager(&server, &device, device.settings());
        let results = manager
            .sync(SyncOptions {
                selected_projects: vec![String::new()],
                ..Default::default()
            })
            .await;
        assert_eq!(results.len(), 1);
        assert!(!results[0].success);
        assert!(server.requests().is_empty());
    }

    #[tokio::test]
    async fn test_project_filter() {
        let server = MockServer::start().await;
        let device = Device::new();
        device.transcript("abc123", "api");
        device.transcript("def456", "web");
        let manager = manager(&server, &device, device.settings());

        let results = manager
            .upload(SyncOptions {
                selected_projects: vec!["web".to_string()],
                ..Default::default()
            })
            .await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].session_id, "def456");
        assert!(server.file("/sync/summaries/abc123.summary.json").is_none());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let server = MockServer::start().await;
        let device = Device::new();
        device.transcript("abc123", "api");
        device.transcript("def456", "web");
        let manager = manager(&server, &device, device.settings());

        let token = tokio_util::sync::CancellationToken::new();
        token.cancel();
        let results = manager
            .upload(SyncOptions {
                cancel: Some(token),
                ..Default::default()
            })
            .await;
        assert_eq!(results.len(), 2);
        assert!(results
            .iter()
            .all(|r| !r.success && r.error.as_deref() == Some(CANCELLED)));
        assert_eq!(server.count("PUT"), 0);
    }

    #[tokio::test]
    async fn test_smart_mode_ships_recent_or_long_transcripts() {
        let server = MockServer::start().await;
        let device = Device::new();
        let mut summaries = Vec::new();
        for (id, days_ago, messages) in [("recent", 0, 2), ("long", 30, 80), ("old", 30, 2)] {
            let path = device.transcript(id, "api");
            let mut summary = summarize_transcript(&path).unwrap().unwrap();
            summary.end_time = Utc::now() - Duration::days(days_ago);
            summary.message_count = messages;
            summaries.push(summary);
        }
        let manager = manager_with(
            &server,
            device.settings(),
            Arc::new(FixtureSource { summaries }),
        );

        let results = manager
            .upload(SyncOptions {
                mode: SyncMode::Smart,
                ..Default::default()
            })
            .await;
        assert!(results.iter().all(|r| r.success));
        assert!(server.file("/sync/conversations/recent.jsonl").is_some());
        assert!(server.file("/sync/conversations/long.jsonl").is_some());
        assert!(server.file("/sync/conversations/old.jsonl").is_none());
        assert_eq!(server.file_paths().len(), 5);
    }

    #[tokio::test]
    async fn test_upload_failure_marks_sidecar_error() {
        let server = MockServer::start().await;
        let device = Device::new();
        let t1 = device.transcript("abc123", "api");
        let manager = manager(&server, &device, device.settings());
        manager.upload(SyncOptions::default()).await;

        append(&t1, r#"{"type":"user","timestamp":"2026-10-13T11:00:00Z","message":{"content":"more"}}"#);
        server.fail_next("PUT", 500, 1);
        let results = manager.upload(SyncOptions::default()).await;
        assert!(!results[0].success);
        assert_eq!(
            read_sidecar(&sidecar_of(&t1)).cloud_sync.sync_state,
            SyncState::Error
        );

        // Error state forces a retry on the next pass
        let retried = manager.upload(SyncOptions::default()).await;
        assert!(retried[0].success && !retried[0].skipped, "{:?}", retried);
        assert_eq!(
            read_sidecar(&sidecar_of(&t1)).cloud_sync.sync_state,
            SyncState::Synced
        );
    }

    #[tokio::test]
    async fn test_download_materializes_cloud_only_and_skips_older() {
        let server = MockServer::start().await;
        let laptop = Device::new();
        laptop.transcript("xyz", "api");
        manager(&server, &laptop, laptop.settings())
            .upload(SyncOptions::default())
            .await;

        let desktop = Device::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let desktop_manager = manager(&server, &desktop, desktop.settings()).with_progress(tx);
        let results = desktop_manager.download(SyncOptions::default()).await;
        assert_eq!(results.len(), 1);
        assert!(results[0].success && !results[0].skipped, "{:?}", results);
        assert_eq!(results[0].project_name, "api");

        let cloud = read_sidecar(&desktop.data.join("cloud").join("xyz.summary.json"));
        assert_eq!(cloud.summary.is_from_cloud, Some(true));
        assert_eq!(cloud.cloud_sync.sync_state, SyncState::Synced);

        let mut phases = Vec::new();
        while let Ok(event) = rx.try_recv() {
            phases.push(event.phase);
        }
        assert!(phases.contains(&SyncPhase::Downloading));
        assert_eq!(phases.last(), Some(&SyncPhase::Complete));

        // Remote last modified before our recorded sync time: not newer
        server.set_modified(
            "/sync/summaries/xyz.summary.json",
            Utc::now() - Duration::hours(1),
        );
        let gets = server.count("GET");
        let again = desktop_manager.download(SyncOptions::default()).await;
        assert!(again[0].skipped);
        assert_eq!(server.count("GET"), gets);
    }

    #[tokio::test]
    async fn test_download_keeps_local_only_change() {
        let server = MockServer::start().await;
        let device = Device::new();
        let t1 = device.transcript("abc123", "api");
        let manager = manager(&server, &device, device.settings());
        manager.upload(SyncOptions::default()).await;
        let before = read_sidecar(&sidecar_of(&t1));

        append(&t1, r#"{"type":"user","timestamp":"2026-10-13T11:00:00Z","message":{"content":"more"}}"#);
        let results = manager.download(SyncOptions::default()).await;
        assert!(results[0].success && results[0].skipped, "{:?}", results);
        assert_eq!(read_sidecar(&sidecar_of(&t1)), before);
    }

    /// Both devices hold a copy of `abc123`; the laptop uploads first and
    /// the desktop adopts its summary.
    async fn shared_conversation(server: &MockServer) -> (Device, PathBuf, Device, PathBuf) {
        let laptop = Device::new();
        let lt = laptop.transcript("abc123", "api");
        manager(server, &laptop, laptop.settings())
            .upload(SyncOptions::default())
            .await;

        let desktop = Device::new();
        let dt = desktop.transcript("abc123", "api");
        let results = manager(server, &desktop, desktop.settings())
            .download(SyncOptions::default())
            .await;
        assert!(results[0].success, "{:?}", results);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        (laptop, lt, desktop, dt)
    }

    const MORE: &str = r#"{"type":"assistant","timestamp":"2026-10-13T12:00:00Z","message":{"content":"laptop"}}"#;
    const OTHER: &str = r#"{"type":"assistant","timestamp":"2026-10-13T12:30:00Z","message":{"content":"desktop"}}"#;

    #[tokio::test]
    async fn test_download_adopts_remote_only_change() {
        let server = MockServer::start().await;
        let (laptop, lt, desktop, dt) = shared_conversation(&server).await;
        // Desktop adopted the laptop's summary next to its own transcript
        let adopted = read_sidecar(&sidecar_of(&dt));
        assert_eq!(adopted.summary.file_path, dt.to_string_lossy());
        assert_eq!(adopted.summary.is_from_cloud, None);

        append(&lt, MORE);
        manager(&server, &laptop, laptop.settings())
            .upload(SyncOptions::default())
            .await;
        server.set_modified("/sync/summaries/abc123.summary.json", later());

        let results = manager(&server, &desktop, desktop.settings())
            .download(SyncOptions::default())
            .await;
        assert!(results[0].success && !results[0].skipped, "{:?}", results);
        assert!(!results[0].conflict_resolved);
        assert_eq!(
            read_sidecar(&sidecar_of(&dt)).cloud_sync.local_hash,
            calculate_file_hash(&lt).unwrap()
        );
    }

    #[tokio::test]
    async fn test_download_conflict_follows_policy() {
        let server = MockServer::start().await;
        let (laptop, lt, desktop, dt) = shared_conversation(&server).await;
        append(&dt, OTHER);
        append(&lt, MORE);
        manager(&server, &laptop, laptop.settings())
            .upload(SyncOptions::default())
            .await;
        server.set_modified("/sync/summaries/abc123.summary.json", later());

        // Default policy asks; the default resolver leaves both sides alone
        let before = read_sidecar(&sidecar_of(&dt));
        let skipped = manager(&server, &desktop, desktop.settings())
            .download(SyncOptions::default())
            .await;
        assert!(skipped[0].skipped, "{:?}", skipped);
        assert_eq!(read_sidecar(&sidecar_of(&dt)), before);

        let mut settings = desktop.settings();
        settings.sync.conflict_policy = ConflictPolicy::RemoteWins;
        let resolved = manager(&server, &desktop, settings)
            .download(SyncOptions::default())
            .await;
        assert!(resolved[0].success && resolved[0].conflict_resolved, "{:?}", resolved);
        assert_eq!(
            read_sidecar(&sidecar_of(&dt)).cloud_sync.local_hash,
            calculate_file_hash(&lt).unwrap()
        );
    }

    #[tokio::test]
    async fn test_upload_conflict_follows_policy() {
        let server = MockServer::start().await;
        let (laptop, lt, desktop, dt) = shared_conversation(&server).await;
        append(&dt, OTHER);
        append(&lt, MORE);
        manager(&server, &laptop, laptop.settings())
            .upload(SyncOptions::default())
            .await;
        server.set_modified("/sync/summaries/abc123.summary.json", later());
        let laptop_hash = calculate_file_hash(&lt).unwrap();
        let remote_hash = |server: &MockServer| {
            let bytes = server.file("/sync/summaries/abc123.summary.json").unwrap();
            CloudSummaryFile::from_slice(&decompress(&bytes).unwrap())
                .unwrap()
                .cloud_sync
                .local_hash
        };

        let skipped = manager(&server, &desktop, desktop.settings())
            .upload(SyncOptions::default())
            .await;
        assert!(skipped[0].skipped, "{:?}", skipped);
        assert_eq!(remote_hash(&server), laptop_hash);

        let mut settings = desktop.settings();
        settings.sync.conflict_policy = ConflictPolicy::LocalWins;
        let resolved = manager(&server, &desktop, settings)
            .upload(SyncOptions::default())
            .await;
        assert!(resolved[0].success && resolved[0].conflict_resolved, "{:?}", resolved);
        assert_eq!(remote_hash(&server), calculate_file_hash(&dt).unwrap());
    }

    #[tokio::test]
    async fn test_encrypted_full_sync_and_fetch() {
        let server = MockServer::start().await;
        let laptop = Device::new();
        let lt = laptop.transcript("abc123", "api");
        let mut settings = laptop.settings();
        settings.sync.encrypt = true;
        settings.sync.mode = SyncMode::Full;

        let without_password = manager(&server, &laptop, settings.clone())
            .upload(SyncOptions::default())
            .await;
        assert_eq!(without_password.len(), 1);
        assert!(!without_password[0].success);

        let results = manager(&server, &laptop, settings)
            .with_encryption_password(Some("hunter2".to_string()))
            .upload(SyncOptions {
                mode: SyncMode::Full,
                ..Default::default()
            })
            .await;
        assert!(results[0].success, "{:?}", results);
        let stored = server.file("/sync/summaries/abc123.summary.json").unwrap();
        assert!(serde_json::from_slice::<serde_json::Value>(&stored).is_err());
        assert!(decompress(&stored).is_err());

        let desktop = Device::new();
        let wrong = manager(&server, &desktop, desktop.settings())
            .with_encryption_password(Some("wrong".to_string()))
            .download(SyncOptions::default())
            .await;
        assert!(!wrong[0].success);

        let desktop_manager = manager(&server, &desktop, desktop.settings())
            .with_encryption_password(Some("hunter2".to_string()));
        let results = desktop_manager.download(SyncOptions::default()).await;
        assert!(results[0].success, "{:?}", results);

        let dest = desktop.data.join("restored").join("abc123.jsonl");
        let written = desktop_manager.fetch_conversation("abc123", &dest).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), std::fs::read(&lt).unwrap());
        assert_eq!(written, std::fs::metadata(&lt).unwrap().len());
    }

    #[tokio::test]
    async fn test_bidirectional_downloads_then_uploads() {
        let server = MockServer::start().await;
        let laptop = Device::new();
        laptop.transcript("aaa", "api");
        manager(&server, &laptop, laptop.settings())
            .upload(SyncOptions::default())
            .await;

        let desktop = Device::new();
        desktop.transcript("bbb", "web");
        let results = manager(&server, &desktop, desktop.settings())
            .sync(SyncOptions::default())
            .await;
        let ops: Vec<(SyncOperation, &str)> = results
            .iter()
            .map(|r| (r.operation, r.session_id.as_str()))
            .collect();
        assert_eq!(
            ops,
            vec![(SyncOperation::Download, "aaa"), (SyncOperation::Upload, "bbb")]
        );
        assert!(server.file("/sync/summaries/bbb.summary.json").is_some());
    }

    #[tokio::test]
    async fn test_download_names_sessions_from_href() {
        let server = MockServer::start().await;
        let laptop = Device::new();
        laptop.transcript("xyz", "api");
        laptop.transcript("abc", "web");
        manager(&server, &laptop, laptop.settings())
            .upload(SyncOptions::default())
            .await;
        server.set_display_name("/sync/summaries/xyz.summary.json", "Conversation xyz");
        server.set_display_name(
            "/sync/summaries/abc.summary.json",
            "../../escaped.summary.json",
        );

        let desktop = Device::new();
        let results = manager(&server, &desktop, desktop.settings())
            .download(SyncOptions::default())
            .await;
        let mut ids: Vec<&str> = results.iter().map(|r| r.session_id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["abc", "xyz"]);
        assert!(results.iter().all(|r| r.success && !r.skipped), "{:?}", results);
        assert!(desktop.data.join("cloud").join("xyz.summary.json").exists());
        assert!(desktop.data.join("cloud").join("abc.summary.json").exists());
        assert!(!desktop.data.join("escaped.summary.json").exists());
        assert!(!desktop.data.parent().unwrap().join("escaped.summary.json").exists());
    }

    #[tokio::test]
    async fn test_download_rejects_unsafe_session_id() {
        let server = MockServer::start().await;
        server.put_file(
            "/sync/summaries/..\\..\\escaped.summary.json",
            b"{}",
            Utc::now(),
        );
        let device = Device::new();
        let results = manager(&server, &device, device.settings())
            .download(SyncOptions::default())
            .await;

        assert_eq!(results.len(), 1);
        assert!(!results[0].success);
        assert!(results[0]
            .error
            .as_deref()
            .unwrap()
            .contains("invalid session id"));
        assert_eq!(server.count("GET"), 0);
        assert!(!device.data.join("cloud").exists());
    }

    #[tokio::test]
    async fn test_listing_failure_stops_the_pass() {
        let server = MockServer::start().await;
        let laptop = Device::new();
        laptop.transcript("aaa", "api");
        manager(&server, &laptop, laptop.settings())
            .upload(SyncOptions::default())
            .await;

        let desktop = Device::new();
        desktop.transcript("bbb", "web");
        let desktop_manager = manager(&server, &desktop, desktop.settings());

        server.fail_next("PROPFIND", 500, 1);
        let results = desktop_manager.download(SyncOptions::default()).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].operation, SyncOperation::Download);
        assert!(!results[0].success);
        assert!(results[0].session_id.is_empty());

        server.fail_next("PROPFIND", 500, 1);
        let puts = server.count("PUT");
        let results = desktop_manager.sync(SyncOptions::default()).await;
        assert_eq!(results.len(), 1, "{:?}", results);
        assert_eq!(results[0].operation, SyncOperation::Download);
        assert!(!results[0].success);
        assert_eq!(server.count("PUT"), puts);
        assert!(server.file("/sync/summaries/bbb.summary.json").is_none());
        assert!(!desktop_manager.is_syncing());
    }

    #[tokio::test]
    async fn test_progress_reported_for_every_item() {
        let server = MockServer::start().await;
        let device = Device::new();
        device.transcript("abc123", "api");
        device.transcript("def456", "web");
        device.transcript("ghi789", "web");
        manager(&server, &device, device.settings())
            .upload(SyncOptions::default())
            .await;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let manager = manager(&server, &device, device.settings()).with_progress(tx);
        let results = manager.upload(SyncOptions::default()).await;
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.skipped), "{:?}", results);

        let mut uploading = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if event.phase == SyncPhase::Uploading {
                uploading.push(event);
            }
        }
        assert_eq!(uploading.len(), results.len());
        assert!(uploading.iter().all(|e| e.total == 3));
        let mut processed: Vec<usize> = uploading.iter().map(|e| e.processed).collect();
        processed.sort();
        assert_eq!(processed, vec![1, 2, 3]);
        assert!(uploading.iter().all(|e| e.bytes_transferred == 0));
    }

    #[tokio::test]
    async fn test_status_counts() {
        let server = MockServer::start().await;
        let device = Device::new();
        let t1 = device.transcript("abc123", "api");
        device.transcript("def456", "api");
        let manager = manager(&server, &device, device.settings());
        manager
            .upload(SyncOptions {
                selected_projects: vec!["api".to_string()],
                ..Default::default()
            })
            .await;
        device.transcript("ghi789", "web");
        append(&t1, MORE);

        let status = manager.status().await.unwrap();
        assert_eq!(
            status,
            SyncStatusReport {
                local_conversations: 3,
                never_synced: 1,
                synced: 1,
                stale: 1,
                needs_attention: 0,
                cloud_only: 0,
            }
        );
    }

    #[tokio::test]
    async fn test_connection_check() {
        let server = MockServer::start().await;
        let device = Device::new();
        let manager = manager(&server, &device, device.settings());
        assert!(!manager.test_connection().await.unwrap());

        device.transcript("abc123", "api");
        manager.upload(SyncOptions::default()).await;
        assert!(manager.test_connection().await.unwrap());
    }
}
