use anyhow::{Context, Result};

use convsync_lib::sync::{SyncCredentials, WEBDAV_PROVIDER};

use crate::app::App;
use crate::prompt::read_secret;
use crate::OutputFormat;

/// Environment variable holding the WebDAV password for `login`
pub const PASSWORD_ENV: &str = "CONVSYNC_PASSWORD";

pub struct LoginArgs {
    pub server_url: String,
    pub username: String,
    pub base_path: Option<String>,
    pub accept_invalid_certs: bool,
}

/// Store credentials and record the server in the config file
pub fn run_login(app: &mut App, args: LoginArgs, format: &OutputFormat) -> Result<()> {
    let base_path = args
        .base_path
        .unwrap_or_else(|| app.settings.webdav.base_path.clone());
    let password = read_secret(PASSWORD_ENV, "WebDAV password")?;
    let credentials = SyncCredentials {
        server_url: args.server_url.clone(),
        username: args.username.clone(),
        password,
        base_path: base_path.clone(),
        accept_invalid_certs: args.accept_invalid_certs,
    };
    app.credential_store()
        .store(WEBDAV_PROVIDER, &credentials)
        .context("Failed to store credentials")?;

    app.settings.webdav.server_url = args.server_url;
    app.settings.webdav.username = args.username;
    app.settings.webdav.base_path = base_path;
    app.settings.webdav.accept_invalid_certs = args.accept_invalid_certs;
    app.settings
        .save(&app.config_path)
        .with_context(|| format!("Failed to write {}", app.config_path.display()))?;

    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "loggedIn": true,
                "serverUrl": app.settings.webdav.server_url,
                "username": app.settings.webdav.username,
            }))?
        ),
        OutputFormat::Plain => println!(
            "Logged in to {} as {}",
            app.settings.webdav.server_url, app.settings.webdav.username
        ),
    }
    Ok(())
}

pub fn run_logout(app: &App, format: &OutputFormat) -> Result<()> {
    app.credential_store()
        .delete(WEBDAV_PROVIDER)
        .context("Failed to delete credentials")?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::json!({ "loggedIn": false })),
        OutputFormat::Plain => println!("Logged out"),
    }
    Ok(())
}
