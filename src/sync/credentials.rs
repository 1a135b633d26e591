use std::io::Write;
use std::path::{Path, PathBuf};

use super::config::SyncCredentials;
use super::manager::SyncError;

const KEYRING_SERVICE: &str = "convsync";

/// Source of provider credentials, injected into the sync manager
pub trait CredentialProvider: Send + Sync {
    /// Credentials for `provider`, `Ok(None)` when none are stored
    fn get_credentials(&self, provider: &str) -> Result<Option<SyncCredentials>, SyncError>;
}

/// Fixed credentials, mostly for tests and one-off invocations
pub struct StaticCredentialProvider {
    credentials: Option<SyncCredentials>,
}

impl StaticCredentialProvider {
    pub fn new(credentials: SyncCredentials) -> Self {
        Self {
            credentials: Some(credentials),
        }
    }

    pub fn empty() -> Self {
        Self { credentials: None }
    }
}

impl CredentialProvider for StaticCredentialProvider {
    fn get_credentials(&self, _provider: &str) -> Result<Option<SyncCredentials>, SyncError> {
        Ok(self.credentials.clone())
    }
}

// ===== Stored credentials (file-based with keyring fallback) =====

/// Credentials persisted under `{data_dir}/.credentials/{provider}` and
/// mirrored to the OS keyring
pub struct StoredCredentialProvider {
    data_dir: PathBuf,
    use_keyring: bool,
}

impl StoredCredentialProvider {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            use_keyring: true,
        }
    }

    /// File store only; the keyring is never touched
    pub fn file_only(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            use_keyring: false,
        }
    }

    fn credentials_file_path(&self, provider: &str) -> PathBuf {
        self.data_dir.join(".credentials").join(provider)
    }

    fn parse_credentials(data: &str) -> Result<SyncCredentials, SyncError> {
        Ok(serde_json::from_str(data)?)
    }

    /// Store credentials: write to file, also try keyring
    pub fn store(&self, provider: &str, credentials: &SyncCredentials) -> Result<(), SyncError> {
        let value = serde_json::to_string(credentials)?;

        let file_path = self.credentials_file_path(provider);
        if let Some(parent) = file_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        write_private(&file_path, value.as_bytes())?;

        // Best-effort
        if self.use_keyring {
            if let Ok(entry) = keyring::Entry::new(KEYRING_SERVICE, provider) {
                if let Err(e) = entry.set_password(&value) {
                    log::debug!("Sync: keyring unavailable for {}: {}", provider, e);
                }
            }
        }

        log::info!("Sync: stored credentials for {}", provider);
        Ok(())
    }

    /// Delete credentials from both stores
    pub fn delete(&self, provider: &str) -> Result<(), SyncError> {
        let file_path = self.credentials_file_path(provider);
        match std::fs::remove_file(&file_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if self.use_keyring {
            if let Ok(entry) = keyring::Entry::new(KEYRING_SERVICE, provider) {
                let _ = entry.delete_credential();
            }
        }
        Ok(())
    }
}

impl CredentialProvider for StoredCredentialProvider {
    /// Try file first, then keyring
    fn get_credentials(&self, provider: &str) -> Result<Option<SyncCredentials>, SyncError> {
        let file_path = self.credentials_file_path(provider);
        if let Ok(data) = std::fs::read_to_string(&file_path) {
            return Self::parse_credentials(data.trim()).map(Some);
        }

        if !self.use_keyring {
            return Ok(None);
        }
        let entry = keyring::Entry::new(KEYRING_SERVICE, provider)
            .map_err(|e| SyncError::Keyring(e.to_string()))?;
        match entry.get_password() {
            Ok(data) => Self::parse_credentials(&data).map(Some),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => {
                log::debug!("Sync: keyring lookup for {} failed: {}", provider, e);
                Ok(None)
            }
        }
    }
}

/// Write a file readable by the owner only, including files that already
/// exist with wider permissions
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }
    file.write_all(contents)
}
