pub mod config;
pub mod conflict;
pub mod credentials;
pub mod manager;
pub mod metadata;
pub mod models;
pub mod progress;
pub mod source;
pub mod store;
pub mod webdav;

pub use config::{
    ConflictPolicy, SyncCredentials, SyncDirection, SyncMode, SyncOperation, SyncOptions,
    SyncReport, SyncResult, SyncSettings,
};
pub use conflict::{Conflict, ConflictChoice, ConflictResolver, SkipResolver};
pub use credentials::{CredentialProvider, StaticCredentialProvider, StoredCredentialProvider};
pub use manager::{SyncError, SyncManager, SyncStatusReport};
pub use models::{CloudSummaryFile, ConversationSummary, SyncState, WEBDAV_PROVIDER};
pub use progress::{SyncPhase, SyncProgress};
pub use source::{ClaudeProjectsSource, ConversationSource};
pub use webdav::{ResourceInfo, WebDAVClient, WebDAVError};
