use convsync_lib::sync::{SyncOperation, SyncPhase, SyncProgress, SyncResult};

/// ANSI color codes
pub struct Color;

impl Color {
    pub const RESET: &str = "\x1b[0m";
    pub const BOLD: &str = "\x1b[1m";
    pub const DIM: &str = "\x1b[2m";
    pub const RED: &str = "\x1b[31m";
    pub const GREEN: &str = "\x1b[32m";
    pub const YELLOW: &str = "\x1b[33m";
}

fn paint(text: &str, color: &str, use_color: bool) -> String {
    if use_color {
        format!("{}{}{}", color, text, Color::RESET)
    } else {
        text.to_string()
    }
}

/// One line per result: status, direction, session, project, detail
pub fn render_result(result: &SyncResult, use_color: bool) -> String {
    let (label, color) = if !result.success {
        ("FAIL", Color::RED)
    } else if result.skipped {
        ("skip", Color::DIM)
    } else {
        ("ok", Color::GREEN)
    };
    let arrow = match result.operation {
        SyncOperation::Upload => "up",
        SyncOperation::Download => "down",
    };
    let session = if result.session_id.is_empty() {
        "-"
    } else {
        result.session_id.as_str()
    };

    let mut line = format!(
        "{} {:<4} {}",
        paint(&format!("{:<4}", label), color, use_color),
        arrow,
        session
    );
    if !result.project_name.is_empty() {
        line.push_str(&format!(" ({})", result.project_name));
    }
    if result.conflict_resolved {
        line.push_str(&paint(" [conflict resolved]", Color::YELLOW, use_color));
    }
    if let Some(err) = &result.error {
        line.push_str(&format!(": {}", err));
    }
    line
}

/// Single-line progress, meant to be redrawn with `\r`
pub fn render_progress(progress: &SyncProgress) -> String {
    let phase = match progress.phase {
        SyncPhase::Scanning => "scanning",
        SyncPhase::Uploading => "uploading",
        SyncPhase::Downloading => "downloading",
        SyncPhase::Complete => "complete",
    };
    match &progress.current_item {
        Some(item) => format!(
            "{} {}/{} ({:.0}%) {}",
            phase, progress.processed, progress.total, progress.percentage, item
        ),
        None => format!("{}...", phase),
    }
}

pub fn bold(text: &str, use_color: bool) -> String {
    paint(text, Color::BOLD, use_color)
}
