use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use futures_util::future::join_all;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method, Response, StatusCode, Url};
use thiserror::Error;
use tokio::sync::OnceCell;

use super::propfind::{parse_multistatus, ResourceInfo, PROPFIND_BODY};
use super::retry::RetryPolicy;
use crate::sync::config::SyncCredentials;
use crate::sync::models::RemoteFileInfo;

#[derive(Error, Debug)]
pub enum WebDAVError {
    #[error("Invalid WebDAV configuration: {0}")]
    Configuration(String),
    #[error("WebDAV client used before initialize()")]
    NotInitialized,
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Authentication failed")]
    AuthFailed,
    #[error("Resource not found: {0}")]
    NotFound(String),
    #[error("Server error: {status} - {message}")]
    Server { status: u16, message: String },
    #[error("XML parse error: {0}")]
    XmlParse(String),
    #[error("Could not create remote directory: {0}")]
    DirectoryCreation(String),
}

/// PROPFIND depth
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Depth {
    Zero,
    One,
    Infinity,
}

impl Depth {
    fn as_header(self) -> &'static str {
        match self {
            Depth::Zero => "0",
            Depth::One => "1",
            Depth::Infinity => "infinity",
        }
    }
}

/// Connection settings for one WebDAV endpoint
#[derive(Clone)]
pub struct WebDAVConfig {
    pub server_url: String,
    pub username: String,
    pub password: String,
    /// Folder under `server_url` that holds all sync data
    pub base_path: String,
    /// Set to false to accept self-signed certificates
    pub verify_ssl: bool,
}

impl From<&SyncCredentials> for WebDAVConfig {
    fn from(creds: &SyncCredentials) -> Self {
        Self {
            server_url: creds.server_url.clone(),
            username: creds.username.clone(),
            password: creds.password.clone(),
            base_path: creds.base_path.clone(),
            verify_ssl: !creds.accept_invalid_certs,
        }
    }
}

struct Connection {
    client: Client,
    /// Server URL without trailing slash
    server_url: String,
    /// Normalized `/a/b` form of the base path, empty for the server root
    base_path: String,
    /// URL path that PROPFIND hrefs start with for the base path
    href_prefix: String,
    auth_header: String,
}

/// WebDAV client for sync operations
pub struct WebDAVClient {
    conn: Option<Connection>,
    retry: RetryPolicy,
    /// Directories known to exist, keyed by full path; never invalidated by
    /// external changes
    known_dirs: Mutex<HashSet<String>>,
    /// Directory creations in progress; concurrent callers share one attempt
    in_flight: Mutex<HashMap<String, Arc<OnceCell<Result<(), String>>>>>,
}

impl Default for WebDAVClient {
    fn default() -> Self {
        Self::new()
    }
}

impl WebDAVClient {
    /// Create an unconfigured client; call `initialize` before use
    pub fn new() -> Self {
        Self {
            conn: None,
            retry: RetryPolicy::default(),
            known_dirs: Mutex::new(HashSet::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Create and initialize in one step
    pub fn connect(config: WebDAVConfig) -> Result<Self, WebDAVError> {
        let mut client = Self::new();
        client.initialize(config)?;
        Ok(client)
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Validate the configuration and build the HTTP client
    pub fn initialize(&mut self, config: WebDAVConfig) -> Result<(), WebDAVError> {
        let url = Url::parse(config.server_url.trim()).map_err(|e| {
            WebDAVError::Configuration(format!("invalid server URL {:?}: {}", config.server_url, e))
        })?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(WebDAVError::Configuration(
                "URL must start with http:// or https://".to_string(),
            ));
        }
        if url.host_str().map(|h| h.is_empty()).unwrap_or(true) {
            return Err(WebDAVError::Configuration(format!(
                "server URL {:?} has no host",
                config.server_url
            )));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(300))
            .connect_timeout(Duration::from_secs(30))
            .danger_accept_invalid_certs(!config.verify_ssl)
            .build()?;

        let server_url = config.server_url.trim().trim_end_matches('/').to_string();
        let base_path = normalize_base(&config.base_path);
        let href_prefix = format!("{}{}", url.path().trim_end_matches('/'), base_path);

        log::info!(
            "WebDAV: initialized for {} (base path {:?}, verify_ssl={})",
            server_url,
            base_path,
            config.verify_ssl
        );

        self.conn = Some(Connection {
            client,
            server_url,
            base_path,
            href_prefix,
            auth_header: basic_auth_header(&config.username, &config.password),
        });
        self.known_dirs.lock().unwrap().clear();
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.conn.is_some()
    }

    fn conn(&self) -> Result<&Connection, WebDAVError> {
        self.conn.as_ref().ok_or(WebDAVError::NotInitialized)
    }

    /// Full server path (under the base path) for a relative path
    fn full_path(&self, path: &str) -> Result<String, WebDAVError> {
        Ok(join_remote_path(&self.conn()?.base_path, path))
    }

    fn url_for_full(&self, full_path: &str) -> Result<String, WebDAVError> {
        let conn = self.conn()?;
        let encoded: Vec<String> = full_path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| urlencoding::encode(s).into_owned())
            .collect();
        Ok(format!("{}/{}", conn.server_url, encoded.join("/")))
    }

    fn request(&self, method: Method, full_path: &str) -> Result<reqwest::RequestBuilder, WebDAVError> {
        let conn = self.conn()?;
        let url = self.url_for_full(full_path)?;
        Ok(conn
            .client
            .request(method, url)
            .header(AUTHORIZATION, conn.auth_header.as_str()))
    }

    /// Test connection to the WebDAV server. `Ok(false)` means the server
    /// answered but the base path does not exist yet.
    pub async fn test_connection(&self) -> Result<bool, WebDAVError> {
        let base = self.full_path("")?;
        match self.propfind_full(&base, Depth::Zero).await {
            Ok(_) => Ok(true),
            Err(WebDAVError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// PROPFIND - List directory or get resource properties
    pub async fn propfind(&self, path: &str, depth: Depth) -> Result<Vec<ResourceInfo>, WebDAVError> {
        let full = self.full_path(path)?;
        self.propfind_full(&full, depth).await
    }

    async fn propfind_full(&self, full_path: &str, depth: Depth) -> Result<Vec<ResourceInfo>, WebDAVError> {
        let href_prefix = self.conn()?.href_prefix.clone();
        self.retry
            .run("PROPFIND", || async {
                let response = self
                    .request(dav_method("PROPFIND")?, full_path)?
                    .header("Depth", depth.as_header())
                    .header(CONTENT_TYPE, "application/xml")
                    .body(PROPFIND_BODY)
                    .send()
                    .await?;

                let status = response.status();
                if status != StatusCode::MULTI_STATUS && !status.is_success() {
                    return Err(error_for(response, full_path).await);
                }
                let xml = response.text().await?;
                parse_multistatus(&xml, &href_prefix)
            })
            .await
    }

    /// GET - Download file contents
    pub async fn get(&self, path: &str) -> Result<Vec<u8>, WebDAVError> {
        let full = self.full_path(path)?;
        self.retry
            .run("GET", || async {
                let response = self.request(Method::GET, &full)?.send().await?;
                if !response.status().is_success() {
                    return Err(error_for(response, &full).await);
                }
                Ok(response.bytes().await?.to_vec())
            })
            .await
    }

    /// PUT - Upload file contents, creating missing parent directories first
    pub async fn put(&self, path: &str, data: &[u8]) -> Result<(), WebDAVError> {
        let full = self.full_path(path)?;
        if let Some(parent) = parent_dir(path) {
            self.ensure_directory(parent).await?;
        }

        let result = self
            .retry
            .run("PUT", || async {
                let response = self
                    .request(Method::PUT, &full)?
                    .body(data.to_vec())
                    .send()
                    .await?;
                match response.status() {
                    StatusCode::OK | StatusCode::CREATED | StatusCode::NO_CONTENT => Ok(()),
                    _ => Err(error_for(response, &full).await),
                }
            })
            .await;

        // 409 means the parent vanished behind our cache; forget it so the
        // next attempt recreates it
        if let Err(WebDAVError::Server { status: 409, .. }) | Err(WebDAVError::NotFound(_)) = &result {
            if let Some(parent) = parent_dir(path) {
                let parent_full = self.full_path(parent)?;
                log::warn!("WebDAV: PUT {} failed, dropping cached directory {}", full, parent_full);
                self.known_dirs.lock().unwrap().remove(&parent_full);
            }
        }
        result
    }

    /// DELETE - Remove file or directory; a missing resource is not an error
    pub async fn delete(&self, path: &str) -> Result<(), WebDAVError> {
        let full = self.full_path(path)?;
        self.retry
            .run("DELETE", || async {
                let response = self.request(Method::DELETE, &full)?.send().await?;
                match response.status() {
                    StatusCode::OK | StatusCode::NO_CONTENT | StatusCode::ACCEPTED | StatusCode::NOT_FOUND => Ok(()),
                    _ => Err(error_for(response, &full).await),
                }
            })
            .await
    }

    /// MKCOL - Create a directory; an existing directory is not an error
    pub async fn mkcol(&self, path: &str) -> Result<(), WebDAVError> {
        let full = self.full_path(path)?;
        self.mkcol_full(&full).await
    }

    async fn mkcol_full(&self, full_path: &str) -> Result<(), WebDAVError> {
        self.retry
            .run("MKCOL", || async {
                let response = self.request(dav_method("MKCOL")?, full_path)?.send().await?;
                match response.status() {
                    StatusCode::CREATED | StatusCode::OK | StatusCode::NO_CONTENT => Ok(()),
                    // Directory already exists
                    StatusCode::METHOD_NOT_ALLOWED => Ok(()),
                    _ => Err(error_for(response, full_path).await),
                }
            })
            .await
    }

    /// Check if a resource exists
    pub async fn exists(&self, path: &str) -> Result<bool, WebDAVError> {
        match self.propfind(path, Depth::Zero).await {
            Ok(_) => Ok(true),
            Err(WebDAVError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// List the files (not directories) directly inside `dir`
    pub async fn list_files(&self, dir: &str) -> Result<Vec<ResourceInfo>, WebDAVError> {
        let dir_normalized = dir.trim_matches('/');
        let entries = self.propfind(dir, Depth::One).await?;
        Ok(entries
            .into_iter()
            .filter(|e| !e.is_directory && e.path.trim_matches('/') != dir_normalized)
            .collect())
    }

    /// Make sure `dir` (relative to the base path) exists.
    ///
    /// Concurrent callers for the same directory share one creation attempt
    /// and all observe its outcome.
    pub async fn ensure_directory(&self, dir: &str) -> Result<(), WebDAVError> {
        let full = self.full_path(dir)?;
        if full == "/" || self.known_dirs.lock().unwrap().contains(&full) {
            return Ok(());
        }

        let cell = {
            let mut in_flight = self.in_flight.lock().unwrap();
            in_flight
                .entry(full.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let outcome = cell
            .get_or_init(|| async {
                self.create_directory_chain(&full)
                    .await
                    .map_err(|e| e.to_string())
            })
            .await
            .clone();

        if outcome.is_ok() {
            self.known_dirs.lock().unwrap().insert(full.clone());
        }
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            if in_flight.get(&full).map(|c| Arc::ptr_eq(c, &cell)).unwrap_or(false) {
                in_flight.remove(&full);
            }
        }

        outcome.map_err(WebDAVError::DirectoryCreation)
    }

    async fn create_directory_chain(&self, full: &str) -> Result<(), WebDAVError> {
        match self.propfind_full(full, Depth::Zero).await {
            Ok(_) => {
                self.remember_with_ancestors(full);
                return Ok(());
            }
            Err(WebDAVError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        log::debug!("WebDAV: creating directory chain {}", full);
        let mut current = String::new();
        for segment in full.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            if self.known_dirs.lock().unwrap().contains(&current) {
                continue;
            }
            self.mkcol_full(&current).await?;
            self.known_dirs.lock().unwrap().insert(current.clone());
        }
        Ok(())
    }

    fn remember_with_ancestors(&self, full: &str) {
        let mut known = self.known_dirs.lock().unwrap();
        let mut current = String::new();
        for segment in full.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            known.insert(current.clone());
        }
    }

    /// Batched existence lookup: one depth-1 PROPFIND per distinct parent
    /// directory. A failing directory reports all of its files as absent.
    pub async fn check_remote_files(&self, paths: &[String]) -> HashMap<String, RemoteFileInfo> {
        let mut by_dir: HashMap<String, Vec<String>> = HashMap::new();
        for path in paths {
            let normalized = path.trim_matches('/').to_string();
            let dir = parent_dir(&normalized).unwrap_or("").to_string();
            by_dir.entry(dir).or_default().push(normalized);
        }

        log::debug!(
            "WebDAV: checking {} paths across {} directories",
            paths.len(),
            by_dir.len()
        );

        let lookups = by_dir.into_iter().map(|(dir, files)| async move {
            let listing = match self.propfind(&dir, Depth::One).await {
                Ok(entries) => Some(entries),
                Err(WebDAVError::NotFound(_)) => {
                    log::debug!("WebDAV: directory {:?} does not exist yet", dir);
                    None
                }
                Err(e) => {
                    log::warn!(
                        "WebDAV: existence check for {:?} failed, treating {} files as absent: {}",
                        dir,
                        files.len(),
                        e
                    );
                    None
                }
            };

            let found: HashMap<String, ResourceInfo> = listing
                .unwrap_or_default()
                .into_iter()
                .filter(|e| !e.is_directory)
                .map(|e| (e.path.clone(), e))
                .collect();

            files
                .into_iter()
                .map(|file| {
                    let info = match found.get(&file) {
                        Some(r) => RemoteFileInfo {
                            exists: true,
                            etag: r.etag.clone(),
                            last_modified: r.last_modified.clone(),
                            size: Some(r.size),
                        },
                        None => RemoteFileInfo::missing(),
                    };
                    (file, info)
                })
                .collect::<Vec<_>>()
        });

        let mut result = HashMap::new();
        for entries in join_all(lookups).await {
            result.extend(entries);
        }
        // Report under the caller's spelling of each path
        paths
            .iter()
            .map(|p| {
                let info = result
                    .get(p.trim_matches('/'))
                    .cloned()
                    .unwrap_or_default();
                (p.clone(), info)
            })
            .collect()
    }
}

fn dav_method(name: &'static str) -> Result<Method, WebDAVError> {
    Method::from_bytes(name.as_bytes())
        .map_err(|e| WebDAVError::Configuration(format!("bad HTTP method {}: {}", name, e)))
}

async fn error_for(response: Response, path: &str) -> WebDAVError {
    match response.status() {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => WebDAVError::AuthFailed,
        StatusCode::NOT_FOUND => WebDAVError::NotFound(path.to_string()),
        status => WebDAVError::Server {
            status: status.as_u16(),
            message: response.text().await.unwrap_or_default(),
        },
    }
}

fn normalize_base(base: &str) -> String {
    let joined = join_remote_path(base, "");
    if joined == "/" {
        String::new()
    } else {
        joined
    }
}

/// Join a base path and a sub-path into `/seg/seg` form.
///
/// Empty segments are dropped, so doubled or missing separators on either
/// side never leak into the result; a leading `/` on `sub` is still joined
/// under `base`.
pub fn join_remote_path(base: &str, sub: &str) -> String {
    let segments: Vec<&str> = base
        .split('/')
        .chain(sub.split('/'))
        .filter(|s| !s.is_empty() && *s != ".")
        .collect();
    format!("/{}", segments.join("/"))
}

/// Parent of a relative path, `None` for top-level entries
pub fn parent_dir(path: &str) -> Option<&str> {
    let trimmed = path.trim_matches('/');
    trimmed.rfind('/').map(|i| &trimmed[..i])
}

/// `Authorization` header value for HTTP Basic
pub fn basic_auth_header(username: &str, password: &str) -> String {
    format!("Basic {}", BASE64.encode(format!("{}:{}", username, password)))
}
