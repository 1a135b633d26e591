use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use convsync_lib::sync::SkipResolver;

use crate::app::App;
use crate::OutputFormat;

pub async fn run(app: &App, session_id: &str, dest: &Path, format: &OutputFormat) -> Result<()> {
    let bytes = app
        .manager(Arc::new(SkipResolver))
        .fetch_conversation(session_id, dest)
        .await
        .with_context(|| format!("Failed to fetch transcript {}", session_id))?;

    match format {
        OutputFormat::Json => {
            let output = serde_json::json!({
                "sessionId": session_id,
                "path": dest,
                "bytes": bytes,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Plain => {
            println!("Wrote {} ({} bytes)", dest.display(), bytes);
        }
    }
    Ok(())
}
