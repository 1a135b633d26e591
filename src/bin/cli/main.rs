mod app;
mod commands;
mod prompt;
mod render;

use std::io::IsTerminal;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use convsync_lib::sync::{SyncDirection, SyncMode};

#[derive(Parser)]
#[command(
    name = "convsync-cli",
    about = "Sync conversation transcripts and summaries over WebDAV",
    version
)]
struct Cli {
    /// Config file (default: {config_dir}/convsync/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, global = true, default_value = "plain")]
    format: OutputFormat,

    /// Disable ANSI colors
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Plain,
    Json,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum ModeArg {
    SummaryOnly,
    Full,
    Smart,
}

impl From<ModeArg> for SyncMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::SummaryOnly => SyncMode::SummaryOnly,
            ModeArg::Full => SyncMode::Full,
            ModeArg::Smart => SyncMode::Smart,
        }
    }
}

#[derive(clap::Args)]
struct PassArgs {
    /// Transfer everything, skipping change detection
    #[arg(long)]
    force: bool,
    /// Only sync this project (repeatable)
    #[arg(long = "project")]
    projects: Vec<String>,
    /// Which payloads to upload (default: from config)
    #[arg(long)]
    mode: Option<ModeArg>,
}

#[derive(Subcommand)]
enum Command {
    /// Upload changed conversations
    Upload(PassArgs),

    /// Download changed summaries
    Download(PassArgs),

    /// Sync in the configured direction (default: download, then upload)
    Sync(PassArgs),

    /// Show local sync status
    Status,

    /// Check the server with the stored credentials
    TestConnection,

    /// Store WebDAV credentials (password from CONVSYNC_PASSWORD or stdin)
    Login {
        #[arg(long)]
        server_url: String,
        #[arg(long)]
        username: String,
        /// Remote directory all sync data lives under
        #[arg(long)]
        base_path: Option<String>,
        /// Skip TLS certificate verification
        #[arg(long)]
        accept_invalid_certs: bool,
    },

    /// Remove stored credentials
    Logout,

    /// Download a full transcript
    Fetch {
        session_id: String,
        dest: PathBuf,
    },
}

async fn run_pass(
    app: &app::App,
    direction: SyncDirection,
    args: PassArgs,
    format: &OutputFormat,
    use_color: bool,
) -> anyhow::Result<()> {
    let args = commands::sync::SyncArgs {
        direction,
        mode: args.mode.map(SyncMode::from),
        force: args.force,
        projects: args.projects,
    };
    let report = commands::sync::run(app, args, format, use_color).await?;
    if report.failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let use_color = !cli.no_color && std::io::stdout().is_terminal();
    let mut app = app::App::new(cli.config)?;

    match cli.command {
        Command::Upload(args) => {
            run_pass(&app, SyncDirection::Upload, args, &cli.format, use_color).await?;
        }
        Command::Download(args) => {
            run_pass(&app, SyncDirection::Download, args, &cli.format, use_color).await?;
        }
        Command::Sync(args) => {
            let direction = app.settings.sync.direction;
            run_pass(&app, direction, args, &cli.format, use_color).await?;
        }
        Command::Status => {
            commands::status::run(&app, &cli.format, use_color).await?;
        }
        Command::TestConnection => {
            if !commands::connection::run(&app, &cli.format).await? {
                std::process::exit(1);
            }
        }
        Command::Login {
            server_url,
            username,
            base_path,
            accept_invalid_certs,
        } => {
            let args = commands::login::LoginArgs {
                server_url,
                username,
                base_path,
                accept_invalid_certs,
            };
            commands::login::run_login(&mut app, args, &cli.format)?;
        }
        Command::Logout => {
            commands::login::run_logout(&app, &cli.format)?;
        }
        Command::Fetch { session_id, dest } => {
            commands::fetch::run(&app, &session_id, &dest, &cli.format).await?;
        }
    }

    Ok(())
}
