use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use walkdir::WalkDir;

use super::manager::SyncError;
use super::models::ConversationSummary;

/// Longest first/last message excerpt kept in a summary
const EXCERPT_CHARS: usize = 200;

/// Local conversation parser, injected into the sync manager
#[async_trait]
pub trait ConversationSource: Send + Sync {
    /// Summaries of every local conversation
    async fn get_available_conversations(&self) -> Result<Vec<ConversationSummary>, SyncError>;

    /// Raw transcript bytes
    async fn load_conversation(&self, file_path: &str) -> Result<Vec<u8>, SyncError>;
}

/// Scans a Claude-style `projects/<project-dir>/<sessionId>.jsonl` tree
#[derive(Debug, Clone)]
pub struct ClaudeProjectsSource {
    projects_dir: PathBuf,
}

impl ClaudeProjectsSource {
    pub fn new(projects_dir: PathBuf) -> Self {
        Self { projects_dir }
    }

    fn scan(projects_dir: &Path) -> Vec<ConversationSummary> {
        if !projects_dir.is_dir() {
            log::warn!(
                "Sync: projects directory {} does not exist",
                projects_dir.display()
            );
            return Vec::new();
        }

        let mut summaries: Vec<ConversationSummary> = WalkDir::new(projects_dir)
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_type().is_file()
                    && e.path().extension().and_then(|x| x.to_str()) == Some("jsonl")
            })
            .filter_map(|e| match summarize_transcript(e.path()) {
                Ok(Some(summary)) => Some(summary),
                Ok(None) => {
                    log::debug!("Sync: no messages in {}, skipping", e.path().display());
                    None
                }
                Err(err) => {
                    log::warn!("Sync: could not read {}: {}", e.path().display(), err);
                    None
                }
            })
            .collect();

        summaries.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        log::info!(
            "Sync: found {} conversations under {}",
            summaries.len(),
            projects_dir.display()
        );
        summaries
    }
}

#[async_trait]
impl ConversationSource for ClaudeProjectsSource {
    async fn get_available_conversations(&self) -> Result<Vec<ConversationSummary>, SyncError> {
        let dir = self.projects_dir.clone();
        tokio::task::spawn_blocking(move || Self::scan(&dir))
            .await
            .map_err(|e| SyncError::Parse(format!("scan task failed: {}", e)))
    }

    async fn load_conversation(&self, file_path: &str) -> Result<Vec<u8>, SyncError> {
        Ok(tokio::fs::read(file_path).await?)
    }
}

/// Build a summary from one JSONL transcript; `None` when it holds no
/// timestamped messages
pub fn summarize_transcript(path: &Path) -> std::io::Result<Option<ConversationSummary>> {
    let content = std::fs::read_to_string(path)?;
    let dir_name = path
        .parent()
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .unwrap_or("unknown")
        .to_string();

    let mut session_id = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string();
    let mut cwd: Option<String> = None;
    let mut start: Option<DateTime<Utc>> = None;
    let mut end: Option<DateTime<Utc>> = None;
    let mut message_count = 0usize;
    let mut first_message = String::new();
    let mut last_message = String::new();

    for (line_num, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let json: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                log::debug!("Sync: invalid JSON at {}:{}: {}", path.display(), line_num + 1, e);
                continue;
            }
        };

        if let Some(id) = json.get("sessionId").and_then(|v| v.as_str()) {
            if session_id.is_empty() {
                session_id = id.to_string();
            }
        }
        if cwd.is_none() {
            cwd = json.get("cwd").and_then(|v| v.as_str()).map(|s| s.to_string());
        }

        let is_message = matches!(
            json.get("type").and_then(|v| v.as_str()),
            Some("user") | Some("assistant")
        );
        if !is_message {
            continue;
        }
        let Some(ts) = json
            .get("timestamp")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<DateTime<Utc>>().ok())
        else {
            continue;
        };

        start = Some(start.map_or(ts, |s| s.min(ts)));
        end = Some(end.map_or(ts, |e| e.max(ts)));
        message_count += 1;

        let text = message_text(&json);
        if !text.is_empty() {
            if first_message.is_empty() {
                first_message = excerpt(&text);
            }
            last_message = excerpt(&text);
        }
    }

    let (Some(start_time), Some(end_time)) = (start, end) else {
        return Ok(None);
    };

    let project_path = cwd.unwrap_or_else(|| dir_name.clone());
    let project_name = Path::new(&project_path)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .unwrap_or(dir_name.as_str())
        .to_string();

    Ok(Some(ConversationSummary {
        session_id,
        project_path,
        project_name,
        start_time,
        end_time,
        message_count,
        duration: (end_time - start_time).num_milliseconds().max(0) as u64,
        file_path: path.to_string_lossy().to_string(),
        first_message,
        last_message,
        is_from_cloud: None,
        cloud_sync_metadata: None,
    }))
}

fn message_text(json: &Value) -> String {
    if let Some(content) = json.get("message").and_then(|m| m.get("content")) {
        if let Some(text) = content.as_str() {
            return text.trim().to_string();
        }
        if let Some(parts) = content.as_array() {
            let texts: Vec<&str> = parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|v| v.as_str()))
                .collect();
            return texts.join(" ").trim().to_string();
        }
    }
    json.get("content")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

fn excerpt(text: &str) -> String {
    if text.chars().count() <= EXCERPT_CHARS {
        text.to_string()
    } else {
        let cut: String = text.chars().take(EXCERPT_CHARS).collect();
        format!("{}...", cut)
    }
}
