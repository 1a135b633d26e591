//! Conflict resolution for sync
//!
//! A conflict exists when both the local and the remote copy of a summary
//! changed since the last sync and carry different content.
//! `ConflictPolicy` settles it up front; `Ask` hands the pair to a
//! `ConflictResolver`.

use async_trait::async_trait;

use super::config::{ConflictPolicy, SyncOperation};
use super::models::CloudSummaryFile;

/// Outcome of one conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictChoice {
    UseLocal,
    UseRemote,
    /// Leave both sides untouched
    Skip,
}

/// Both sides of a conflicting summary
#[derive(Debug, Clone)]
pub struct Conflict<'a> {
    pub operation: SyncOperation,
    pub local: &'a CloudSummaryFile,
    pub remote: &'a CloudSummaryFile,
}

impl Conflict<'_> {
    pub fn session_id(&self) -> &str {
        self.local.session_id()
    }
}

/// Decides conflicts under `ConflictPolicy::Ask`
#[async_trait]
pub trait ConflictResolver: Send + Sync {
    async fn resolve(&self, conflict: &Conflict<'_>) -> ConflictChoice;
}

/// Resolver that never touches either side
#[derive(Debug, Default, Clone, Copy)]
pub struct SkipResolver;

#[async_trait]
impl ConflictResolver for SkipResolver {
    async fn resolve(&self, conflict: &Conflict<'_>) -> ConflictChoice {
        log::info!(
            "Sync: conflict on {} left unresolved",
            conflict.session_id()
        );
        ConflictChoice::Skip
    }
}

/// Apply `policy`, consulting `resolver` only for `Ask`
pub async fn resolve_conflict(
    policy: ConflictPolicy,
    resolver: &dyn ConflictResolver,
    conflict: &Conflict<'_>,
) -> ConflictChoice {
    let choice = match policy {
        ConflictPolicy::LocalWins => ConflictChoice::UseLocal,
        ConflictPolicy::RemoteWins => ConflictChoice::UseRemote,
        ConflictPolicy::Ask => resolver.resolve(conflict).await,
    };
    log::info!(
        "Sync: conflict on {} during {:?} resolved as {:?}",
        conflict.session_id(),
        conflict.operation,
        choice
    );
    choice
}
