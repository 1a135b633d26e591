use std::io::{IsTerminal, Write};
use std::sync::Arc;

use anyhow::{bail, Result};
use tokio_util::sync::CancellationToken;

use convsync_lib::sync::{SyncDirection, SyncMode, SyncOptions, SyncReport};

use crate::app::App;
use crate::prompt::PromptResolver;
use crate::render::terminal::{render_progress, render_result};
use crate::OutputFormat;

pub struct SyncArgs {
    pub direction: SyncDirection,
    pub mode: Option<SyncMode>,
    pub force: bool,
    pub projects: Vec<String>,
}

/// Run one sync pass and print its results. Returns the report so the caller
/// can pick an exit code.
pub async fn run(
    app: &App,
    args: SyncArgs,
    format: &OutputFormat,
    use_color: bool,
) -> Result<SyncReport> {
    if !app.has_credentials()? {
        bail!("Not logged in. Run `convsync-cli login` first.");
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\nCancelling after in-flight transfers finish...");
                cancel.cancel();
            }
        });
    }

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let draw_progress = matches!(format, OutputFormat::Plain) && std::io::stderr().is_terminal();
    let progress_task = tokio::spawn(async move {
        while let Some(progress) = rx.recv().await {
            if draw_progress {
                eprint!("\r\x1b[2K{}", render_progress(&progress));
                let _ = std::io::stderr().flush();
            }
        }
        if draw_progress {
            eprint!("\r\x1b[2K");
        }
    });

    let mut options = SyncOptions::from_settings(&app.settings);
    options.direction = args.direction;
    if let Some(mode) = args.mode {
        options.mode = mode;
    }
    options.force_sync = args.force;
    options.selected_projects = args.projects;
    options.cancel = Some(cancel);

    let manager = app
        .manager(Arc::new(PromptResolver::new()))
        .with_progress(tx);
    let results = manager.sync(options).await;
    // Closes the progress channel
    drop(manager);
    let _ = progress_task.await;

    let report = SyncReport::from_results(&results);
    match format {
        OutputFormat::Json => {
            let output = serde_json::json!({
                "results": results,
                "report": report,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Plain => {
            for result in results.iter().filter(|r| !r.skipped || !r.success) {
                println!("{}", render_result(result, use_color));
            }
            println!("{}", report);
        }
    }
    Ok(report)
}
