use std::io::{BufRead, IsTerminal, Write};

use async_trait::async_trait;
use tokio::sync::Mutex;

use convsync_lib::sync::{Conflict, ConflictChoice, ConflictResolver};

/// Asks on the terminal which side of a conflict to keep.
///
/// Prompts are serialized so concurrent transfers never interleave
/// questions. Without a terminal every conflict is skipped.
#[derive(Default)]
pub struct PromptResolver {
    lock: Mutex<()>,
}

impl PromptResolver {
    pub fn new() -> Self {
        Self { lock: Mutex::new(()) }
    }
}

#[async_trait]
impl ConflictResolver for PromptResolver {
    async fn resolve(&self, conflict: &Conflict<'_>) -> ConflictChoice {
        if !std::io::stdin().is_terminal() {
            log::warn!(
                "Sync: conflict on {} left unresolved (no terminal)",
                conflict.session_id()
            );
            return ConflictChoice::Skip;
        }

        let _guard = self.lock.lock().await;
        let question = format!(
            "Conflict on {} ({:?}):\n  local  synced {}, {} messages\n  remote from {} at {}, {} messages\nKeep [l]ocal, [r]emote or [s]kip? ",
            conflict.session_id(),
            conflict.operation,
            conflict.local.cloud_sync.last_sync_time.to_rfc3339(),
            conflict.local.summary.message_count,
            conflict.remote.device_id,
            conflict.remote.updated_at.to_rfc3339(),
            conflict.remote.summary.message_count,
        );

        let answer = tokio::task::spawn_blocking(move || ask(&question))
            .await
            .unwrap_or_default();
        match answer.trim().to_lowercase().as_str() {
            "l" | "local" => ConflictChoice::UseLocal,
            "r" | "remote" => ConflictChoice::UseRemote,
            _ => ConflictChoice::Skip,
        }
    }
}

fn ask(question: &str) -> String {
    eprint!("{}", question);
    let _ = std::io::stderr().flush();
    let mut line = String::new();
    let _ = std::io::stdin().lock().read_line(&mut line);
    line
}

/// Read a secret from the environment, or a line from stdin
pub fn read_secret(env_var: &str, label: &str) -> anyhow::Result<String> {
    if let Ok(value) = std::env::var(env_var) {
        if !value.is_empty() {
            return Ok(value);
        }
    }
    if std::io::stdin().is_terminal() {
        eprint!("{}: ", label);
        std::io::stderr().flush()?;
    }
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    let value = line.trim_end_matches(['\r', '\n']).to_string();
    if value.is_empty() {
        anyhow::bail!("{} must not be empty (set {} or pipe it on stdin)", label, env_var);
    }
    Ok(value)
}
