//! In-process WebDAV server for tests.
//!
//! Keeps files and collections in memory, records every request, and can be
//! told to fail or slow down specific operations.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use chrono::{DateTime, Utc};

use super::client::basic_auth_header;

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub depth: Option<String>,
    pub authorization: Option<String>,
}

#[derive(Debug, Clone)]
struct MockFile {
    data: Vec<u8>,
    modified: DateTime<Utc>,
}

#[derive(Default)]
struct MockState {
    files: BTreeMap<String, MockFile>,
    dirs: BTreeSet<String>,
    requests: Vec<RecordedRequest>,
    fail_next: HashMap<String, (u16, usize)>,
    fail_paths: HashMap<(String, String), u16>,
    display_names: HashMap<String, String>,
    delay: Duration,
    expected_auth: Option<String>,
}

type SharedState = Arc<Mutex<MockState>>;

pub struct MockServer {
    addr: SocketAddr,
    state: SharedState,
}

impl MockServer {
    pub async fn start() -> Self {
        let mut initial = MockState::default();
        initial.dirs.insert("/".to_string());
        let state: SharedState = Arc::new(Mutex::new(initial));

        let app = Router::new().fallback(handle).with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self { addr, state }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn count(&self, method: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .requests
            .iter()
            .filter(|r| r.method == method)
            .count()
    }

    pub fn count_path(&self, method: &str, path: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .requests
            .iter()
            .filter(|r| r.method == method && r.path == path)
            .count()
    }

    pub fn has_dir(&self, path: &str) -> bool {
        self.state.lock().unwrap().dirs.contains(path)
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .files
            .get(path)
            .map(|f| f.data.clone())
    }

    /// Paths of all stored files
    pub fn file_paths(&self) -> Vec<String> {
        self.state.lock().unwrap().files.keys().cloned().collect()
    }

    /// Store a file directly, creating its parent collections
    pub fn put_file(&self, path: &str, data: &[u8], modified: DateTime<Utc>) {
        let mut state = self.state.lock().unwrap();
        let mut current = String::new();
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        for segment in &segments[..segments.len().saturating_sub(1)] {
            current.push('/');
            current.push_str(segment);
            state.dirs.insert(current.clone());
        }
        state.files.insert(
            path.to_string(),
            MockFile {
                data: data.to_vec(),
                modified,
            },
        );
    }

    pub fn set_modified(&self, path: &str, modified: DateTime<Utc>) {
        if let Some(file) = self.state.lock().unwrap().files.get_mut(path) {
            file.modified = modified;
        }
    }

    /// Answer the next `times` requests of `method` with `status`
    pub fn fail_next(&self, method: &str, status: u16, times: usize) {
        self.state
            .lock()
            .unwrap()
            .fail_next
            .insert(method.to_string(), (status, times));
    }

    /// Always answer `method` on `path` with `status`
    pub fn fail_path(&self, method: &str, path: &str, status: u16) {
        self.state
            .lock()
            .unwrap()
            .fail_paths
            .insert((method.to_string(), path.to_string()), status);
    }

    /// Report `name` as the `displayname` of the file at `path`
    pub fn set_display_name(&self, path: &str, name: &str) {
        self.state
            .lock()
            .unwrap()
            .display_names
            .insert(path.to_string(), name.to_string());
    }

    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().unwrap().delay = delay;
    }

    pub fn require_credentials(&self, username: &str, password: &str) {
        self.state.lock().unwrap().expected_auth = Some(basic_auth_header(username, password));
    }

    /// Delete a collection behind the client's back
    pub fn remove_dir(&self, path: &str) {
        let mut state = self.state.lock().unwrap();
        remove_tree(&mut state, path);
    }

    pub fn clear_requests(&self) {
        self.state.lock().unwrap().requests.clear();
    }
}

fn remove_tree(state: &mut MockState, path: &str) {
    let prefix = format!("{}/", path);
    state.dirs.retain(|d| d != path && !d.starts_with(&prefix));
    state.files.retain(|f, _| !f.starts_with(&prefix));
}

fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(i) => path[..i].to_string(),
    }
}

fn is_direct_child(dir: &str, path: &str) -> bool {
    let prefix = if dir == "/" {
        "/".to_string()
    } else {
        format!("{}/", dir)
    };
    match path.strip_prefix(&prefix) {
        Some(rest) => !rest.is_empty() && !rest.contains('/'),
        None => false,
    }
}

fn encode_href(path: &str) -> String {
    let encoded: Vec<String> = path
        .split('/')
        .map(|s| urlencoding::encode(s).into_owned())
        .collect();
    encoded.join("/")
}

fn http_date(t: &DateTime<Utc>) -> String {
    t.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn dir_entry(path: &str) -> String {
    let href = if path == "/" {
        "/".to_string()
    } else {
        format!("{}/", encode_href(path))
    };
    format!(
        "<d:response><d:href>{}</d:href><d:propstat><d:prop><d:resourcetype><d:collection/></d:resourcetype></d:prop><d:status>HTTP/1.1 200 OK</d:status></d:propstat></d:response>",
        href
    )
}

fn file_entry(path: &str, file: &MockFile, display_name: Option<&String>) -> String {
    let display_name = display_name
        .map(|n| format!("<d:displayname>{}</d:displayname>", n))
        .unwrap_or_default();
    format!(
        "<d:response><d:href>{}</d:href><d:propstat><d:prop>{}<d:resourcetype/><d:getcontentlength>{}</d:getcontentlength><d:getlastmodified>{}</d:getlastmodified><d:getetag>\"{:x}-{}\"</d:getetag></d:prop><d:status>HTTP/1.1 200 OK</d:status></d:propstat></d:response>",
        encode_href(path),
        display_name,
        file.data.len(),
        http_date(&file.modified),
        file.data.len(),
        file.modified.timestamp()
    )
}

async fn handle(
    State(state): State<SharedState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let raw = urlencoding::decode(uri.path())
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| uri.path().to_string());
    let path = match raw.trim_end_matches('/') {
        "" => "/".to_string(),
        p => p.to_string(),
    };
    let method_name = method.as_str().to_string();
    let depth = headers
        .get("Depth")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let authorization = headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let delay = {
        let mut s = state.lock().unwrap();
        s.requests.push(RecordedRequest {
            method: method_name.clone(),
            path: path.clone(),
            depth: depth.clone(),
            authorization: authorization.clone(),
        });
        s.delay
    };
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let mut s = state.lock().unwrap();

    if let Some(expected) = &s.expected_auth {
        if authorization.as_deref() != Some(expected.as_str()) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }
    if let Some(&status) = s.fail_paths.get(&(method_name.clone(), path.clone())) {
        return status_response(status);
    }
    if let Some((status, remaining)) = s.fail_next.get_mut(&method_name) {
        if *remaining > 0 {
            *remaining -= 1;
            return status_response(*status);
        }
    }

    match method_name.as_str() {
        "PROPFIND" => {
            let mut entries = Vec::new();
            if s.dirs.contains(&path) {
                entries.push(dir_entry(&path));
                if depth.as_deref() != Some("0") {
                    for d in s.dirs.iter().filter(|d| is_direct_child(&path, d)) {
                        entries.push(dir_entry(d));
                    }
                    for (p, f) in s.files.iter().filter(|(p, _)| is_direct_child(&path, p)) {
                        entries.push(file_entry(p, f, s.display_names.get(p)));
                    }
                }
            } else if let Some(file) = s.files.get(&path) {
                entries.push(file_entry(&path, file, s.display_names.get(&path)));
            } else {
                return StatusCode::NOT_FOUND.into_response();
            }
            let xml = format!(
                "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<d:multistatus xmlns:d=\"DAV:\">{}</d:multistatus>",
                entries.join("")
            );
            (StatusCode::MULTI_STATUS, xml).into_response()
        }
        "GET" => match s.files.get(&path) {
            Some(file) => (StatusCode::OK, file.data.clone()).into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        },
        "PUT" => {
            if !s.dirs.contains(&parent_of(&path)) {
                return StatusCode::CONFLICT.into_response();
            }
            let existed = s
                .files
                .insert(
                    path,
                    MockFile {
                        data: body.to_vec(),
                        modified: Utc::now(),
                    },
                )
                .is_some();
            if existed {
                StatusCode::NO_CONTENT.into_response()
            } else {
                StatusCode::CREATED.into_response()
            }
        }
        "MKCOL" => {
            if s.dirs.contains(&path) || s.files.contains_key(&path) {
                return StatusCode::METHOD_NOT_ALLOWED.into_response();
            }
            if !s.dirs.contains(&parent_of(&path)) {
                return StatusCode::CONFLICT.into_response();
            }
            s.dirs.insert(path);
            StatusCode::CREATED.into_response()
        }
        "DELETE" => {
            if s.files.remove(&path).is_some() {
                StatusCode::NO_CONTENT.into_response()
            } else if path != "/" && s.dirs.contains(&path) {
                remove_tree(&mut s, &path);
                StatusCode::NO_CONTENT.into_response()
            } else {
                StatusCode::NOT_FOUND.into_response()
            }
        }
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}

fn status_response(status: u16) -> Response {
    StatusCode::from_u16(status)
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
        .into_response()
}
