use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};

use convsync_lib::sync::{
    ClaudeProjectsSource, ConflictResolver, CredentialProvider, StoredCredentialProvider,
    SyncManager, SyncSettings, WEBDAV_PROVIDER,
};

/// Environment variable holding the payload encryption password
pub const ENCRYPTION_PASSWORD_ENV: &str = "CONVSYNC_ENCRYPTION_PASSWORD";

/// Shared application state for CLI commands
pub struct App {
    pub config_path: PathBuf,
    pub settings: SyncSettings,
}

impl App {
    /// Load settings from `config` or the default location
    pub fn new(config: Option<PathBuf>) -> Result<Self> {
        let config_path = match config {
            Some(path) => path,
            None => SyncSettings::default_path().context("Failed to get config directory")?,
        };
        let settings = SyncSettings::load(&config_path)
            .with_context(|| format!("Failed to load {}", config_path.display()))?;
        log::debug!("Loaded settings from {}", config_path.display());
        Ok(Self {
            config_path,
            settings,
        })
    }

    pub fn credential_store(&self) -> StoredCredentialProvider {
        StoredCredentialProvider::new(self.settings.data_dir())
    }

    /// Whether credentials for the WebDAV provider are stored
    pub fn has_credentials(&self) -> Result<bool> {
        Ok(self
            .credential_store()
            .get_credentials(WEBDAV_PROVIDER)
            .context("Failed to read stored credentials")?
            .is_some())
    }

    /// Build a sync manager over the local transcript tree
    pub fn manager(&self, resolver: Arc<dyn ConflictResolver>) -> SyncManager {
        let source = Arc::new(ClaudeProjectsSource::new(self.settings.projects_dir()));
        let credentials = Arc::new(self.credential_store());
        SyncManager::new(self.settings.clone(), source, credentials)
            .with_resolver(resolver)
            .with_encryption_password(std::env::var(ENCRYPTION_PASSWORD_ENV).ok())
    }
}
