use std::sync::Arc;

use anyhow::{Context, Result};

use convsync_lib::sync::SkipResolver;

use crate::app::App;
use crate::render::terminal::bold;
use crate::OutputFormat;

pub async fn run(app: &App, format: &OutputFormat, use_color: bool) -> Result<()> {
    let status = app
        .manager(Arc::new(SkipResolver))
        .status()
        .await
        .context("Failed to compute sync status")?;
    let logged_in = app.has_credentials()?;

    match format {
        OutputFormat::Json => {
            let output = serde_json::json!({
                "loggedIn": logged_in,
                "serverUrl": app.settings.webdav.server_url,
                "projectsDir": app.settings.projects_dir(),
                "status": status,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Plain => {
            let server = if app.settings.webdav.server_url.is_empty() {
                "(not configured)"
            } else {
                app.settings.webdav.server_url.as_str()
            };
            println!("{} {}", bold("Server:", use_color), server);
            println!(
                "{} {}",
                bold("Logged in:", use_color),
                if logged_in { "yes" } else { "no" }
            );
            println!(
                "{} {}",
                bold("Projects:", use_color),
                app.settings.projects_dir().display()
            );
            println!();
            println!("  {:>5} local conversations", status.local_conversations);
            println!("  {:>5} synced", status.synced);
            println!("  {:>5} changed since last sync", status.stale);
            println!("  {:>5} never synced", status.never_synced);
            println!("  {:>5} in error or conflict", status.needs_attention);
            println!("  {:>5} cloud-only summaries", status.cloud_only);
        }
    }
    Ok(())
}
