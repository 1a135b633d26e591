use std::sync::Arc;

use anyhow::Result;

use convsync_lib::sync::SkipResolver;

use crate::app::App;
use crate::OutputFormat;

/// Returns whether the server was reachable with the stored credentials
pub async fn run(app: &App, format: &OutputFormat) -> Result<bool> {
    let result = app.manager(Arc::new(SkipResolver)).test_connection().await;

    match format {
        OutputFormat::Json => {
            let output = match &result {
                Ok(base_exists) => serde_json::json!({
                    "ok": true,
                    "basePathExists": base_exists,
                }),
                Err(e) => serde_json::json!({
                    "ok": false,
                    "error": e.to_string(),
                }),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Plain => match &result {
            Ok(true) => println!("Connection OK"),
            Ok(false) => println!("Connection OK (base path will be created on first upload)"),
            Err(e) => println!("Connection failed: {}", e),
        },
    }
    Ok(result.is_ok())
}
