use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Which payloads an upload ships
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SyncMode {
    /// Summaries only
    #[default]
    SummaryOnly,
    /// Summaries plus every full transcript
    Full,
    /// Summaries plus transcripts of recent or long conversations
    Smart,
}

/// Direction of a sync invocation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SyncDirection {
    Upload,
    Download,
    /// Download, then upload
    #[default]
    Bidirectional,
}

/// How a detected conflict is settled
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    LocalWins,
    RemoteWins,
    /// Defer to the configured `ConflictResolver`
    #[default]
    Ask,
}

/// `[sync]` table of the config file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncSection {
    pub mode: SyncMode,
    pub direction: SyncDirection,
    pub conflict_policy: ConflictPolicy,
    pub compress: bool,
    pub encrypt: bool,
    pub max_concurrent_uploads: usize,
    /// Smart mode: ship transcripts of conversations that ended this recently
    pub smart_recent_days: i64,
    /// Smart mode: ship transcripts with at least this many messages
    pub smart_min_messages: usize,
    /// Root of the local transcript tree
    #[serde(skip_serializing_if = "Option::is_none")]
    pub projects_dir: Option<PathBuf>,
    /// Where the device id and cloud-only sidecars live
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            mode: SyncMode::SummaryOnly,
            direction: SyncDirection::Bidirectional,
            conflict_policy: ConflictPolicy::Ask,
            compress: true,
            encrypt: false,
            max_concurrent_uploads: 5,
            smart_recent_days: 7,
            smart_min_messages: 50,
            projects_dir: None,
            data_dir: None,
        }
    }
}

/// `[webdav]` table of the config file. The password is never stored here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct WebDAVSection {
    pub server_url: String,
    pub username: String,
    pub base_path: String,
    pub accept_invalid_certs: bool,
}

/// Settings loaded from `config.toml`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct SyncSettings {
    pub sync: SyncSection,
    pub webdav: WebDAVSection,
}

impl SyncSettings {
    /// Default location: `{config_dir}/convsync/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("convsync").join("config.toml"))
    }

    /// Load from file; a missing file yields defaults
    pub fn load(path: &Path) -> Result<Self, super::SyncError> {
        if !path.exists() {
            log::debug!("Sync: no config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&data)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), super::SyncError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = toml::to_string_pretty(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Data directory, falling back to `{data_dir}/convsync`
    pub fn data_dir(&self) -> PathBuf {
        self.sync.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("convsync")
        })
    }

    /// Transcript tree, falling back to `~/.claude/projects`
    pub fn projects_dir(&self) -> PathBuf {
        match &self.sync.projects_dir {
            Some(dir) => expand_tilde(dir),
            None => dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".claude")
                .join("projects"),
        }
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

/// Options for one sync invocation, validated once at the orchestrator entry
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    pub mode: SyncMode,
    pub direction: SyncDirection,
    /// Skip change detection and transfer everything
    pub force_sync: bool,
    /// Restrict to these project names; empty means all
    pub selected_projects: Vec<String>,
    /// Checked between queued tasks, never mid-transfer
    pub cancel: Option<CancellationToken>,
}

impl SyncOptions {
    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self {
            mode: settings.sync.mode,
            direction: settings.sync.direction,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), super::SyncError> {
        if let Some(bad) = self.selected_projects.iter().find(|p| p.trim().is_empty()) {
            return Err(super::SyncError::InvalidOptions(format!(
                "selected project name must not be empty (got {:?})",
                bad
            )));
        }
        Ok(())
    }

    pub fn includes_project(&self, project_name: &str) -> bool {
        self.selected_projects.is_empty()
            || self.selected_projects.iter().any(|p| p == project_name)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map(|c| c.is_cancelled()).unwrap_or(false)
    }
}

/// Credentials for the remote storage provider
#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncCredentials {
    pub server_url: String,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub base_path: String,
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

impl std::fmt::Debug for SyncCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCredentials")
            .field("server_url", &self.server_url)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("base_path", &self.base_path)
            .field("accept_invalid_certs", &self.accept_invalid_certs)
            .finish()
    }
}

/// Transfer direction of one result
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyncOperation {
    Upload,
    Download,
}

/// Outcome of syncing one conversation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub success: bool,
    pub operation: SyncOperation,
    pub session_id: String,
    pub project_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub skipped: bool,
    pub conflict_resolved: bool,
}

impl SyncResult {
    pub fn success(operation: SyncOperation, session_id: &str, project_name: &str) -> Self {
        Self {
            success: true,
            operation,
            session_id: session_id.to_string(),
            project_name: project_name.to_string(),
            error: None,
            skipped: false,
            conflict_resolved: false,
        }
    }

    pub fn skipped(operation: SyncOperation, session_id: &str, project_name: &str) -> Self {
        Self {
            skipped: true,
            ..Self::success(operation, session_id, project_name)
        }
    }

    pub fn failure(
        operation: SyncOperation,
        session_id: &str,
        project_name: &str,
        error: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::success(operation, session_id, project_name)
        }
    }

    pub fn with_conflict_resolved(mut self) -> Self {
        self.conflict_resolved = true;
        self
    }
}

/// Totals over a list of results
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub conflicts_resolved: usize,
}

impl SyncReport {
    pub fn from_results(results: &[SyncResult]) -> Self {
        let mut report = Self {
            total: results.len(),
            ..Default::default()
        };
        for r in results {
            if !r.success {
                report.failed += 1;
            } else if r.skipped {
                report.skipped += 1;
            } else {
                report.succeeded += 1;
            }
            if r.conflict_resolved {
                report.conflicts_resolved += 1;
            }
        }
        report
    }
}

impl std::fmt::Display for SyncReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} succeeded, {} failed, {} skipped",
            self.succeeded, self.failed, self.skipped
        )?;
        if self.conflicts_resolved > 0 {
            write!(f, " ({} conflicts resolved)", self.conflicts_resolved)?;
        }
        Ok(())
    }
}
