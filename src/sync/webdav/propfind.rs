use quick_xml::events::Event;
use quick_xml::Reader;
use serde::{Deserialize, Serialize};

use super::client::WebDAVError;

pub(crate) const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8" ?>
<D:propfind xmlns:D="DAV:">
  <D:prop>
    <D:displayname/>
    <D:resourcetype/>
    <D:getcontentlength/>
    <D:getlastmodified/>
    <D:getetag/>
    <D:getcontenttype/>
  </D:prop>
</D:propfind>"#;

/// File/directory info from PROPFIND
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResourceInfo {
    /// Path relative to the client's base path, without leading/trailing `/`
    pub path: String,
    pub name: String,
    pub is_directory: bool,
    pub size: u64,
    pub last_modified: Option<String>,
    pub etag: Option<String>,
    pub content_type: Option<String>,
}

#[derive(Default)]
struct Props {
    display_name: Option<String>,
    is_directory: bool,
    size: Option<u64>,
    last_modified: Option<String>,
    etag: Option<String>,
    content_type: Option<String>,
}

impl Props {
    fn merge(&mut self, other: Props) {
        self.display_name = other.display_name.or(self.display_name.take());
        self.is_directory |= other.is_directory;
        self.size = other.size.or(self.size);
        self.last_modified = other.last_modified.or(self.last_modified.take());
        self.etag = other.etag.or(self.etag.take());
        self.content_type = other.content_type.or(self.content_type.take());
    }
}

/// Parse a 207 multistatus body.
///
/// `strip_prefix` is the URL path that hrefs start with for the client's
/// base path (e.g. `/remote.php/dav/files/me/convsync`). Namespace prefixes
/// are ignored; missing props degrade to defaults, props reported under a
/// non-2xx propstat are dropped.
pub fn parse_multistatus(xml: &str, strip_prefix: &str) -> Result<Vec<ResourceInfo>, WebDAVError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut resources = Vec::new();
    let mut stack: Vec<Vec<u8>> = Vec::new();

    let mut href: Option<String> = None;
    let mut response_props = Props::default();
    let mut propstat_props = Props::default();
    let mut propstat_ok = true;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| WebDAVError::XmlParse(format!("at {}: {}", reader.buffer_position(), e)))?;

        match event {
            Event::Start(e) => {
                let name = e.local_name().as_ref().to_vec();
                match name.as_slice() {
                    b"response" => {
                        href = None;
                        response_props = Props::default();
                    }
                    b"propstat" => {
                        propstat_props = Props::default();
                        propstat_ok = true;
                    }
                    b"collection" => propstat_props.is_directory = true,
                    _ => {}
                }
                stack.push(name);
            }
            Event::Empty(e) => {
                if e.local_name().as_ref() == b"collection" {
                    propstat_props.is_directory = true;
                }
            }
            Event::Text(t) => {
                let text = t
                    .unescape()
                    .map_err(|e| WebDAVError::XmlParse(e.to_string()))?
                    .trim()
                    .to_string();
                apply_text(&stack, text, &mut href, &mut propstat_props, &mut propstat_ok);
            }
            Event::CData(c) => {
                let text = String::from_utf8_lossy(&c.into_inner()).trim().to_string();
                apply_text(&stack, text, &mut href, &mut propstat_props, &mut propstat_ok);
            }
            Event::End(e) => {
                match e.local_name().as_ref() {
                    b"propstat" => {
                        if propstat_ok {
                            response_props.merge(std::mem::take(&mut propstat_props));
                        }
                    }
                    b"response" => {
                        if let Some(h) = href.take() {
                            let props = std::mem::take(&mut response_props);
                            resources.push(build_resource(&h, strip_prefix, props));
                        }
                    }
                    _ => {}
                }
                stack.pop();
            }
            Event::Eof => break,
            _ => {}
        }
    }

    log::debug!("WebDAV: parsed {} resources from multistatus", resources.len());
    Ok(resources)
}

fn apply_text(
    stack: &[Vec<u8>],
    text: String,
    href: &mut Option<String>,
    props: &mut Props,
    propstat_ok: &mut bool,
) {
    if text.is_empty() {
        return;
    }
    let Some(current) = stack.last() else {
        return;
    };
    match current.as_slice() {
        b"href" => *href = Some(text),
        b"displayname" => props.display_name = Some(text),
        b"getcontentlength" => props.size = text.parse().ok(),
        b"getlastmodified" => props.last_modified = Some(text),
        b"getetag" => props.etag = Some(text.trim_matches('"').to_string()),
        b"getcontenttype" => props.content_type = Some(text),
        b"status" => {
            // propstat statuses look like "HTTP/1.1 404 Not Found"
            let in_propstat = stack.iter().any(|n| n.as_slice() == b"propstat");
            if in_propstat {
                *propstat_ok = text
                    .split_whitespace()
                    .nth(1)
                    .map(|code| code.starts_with('2'))
                    .unwrap_or(true);
            }
        }
        _ => {}
    }
}

fn build_resource(href: &str, strip_prefix: &str, props: Props) -> ResourceInfo {
    let path = relative_href(href, strip_prefix);
    let name = props
        .display_name
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| path.rsplit('/').next().unwrap_or_default().to_string());
    ResourceInfo {
        path,
        name,
        is_directory: props.is_directory,
        size: props.size.unwrap_or(0),
        last_modified: props.last_modified,
        etag: props.etag,
        content_type: props.content_type,
    }
}

/// Turn an href (absolute path or full URL) into a path relative to `strip_prefix`
pub(crate) fn relative_href(href: &str, strip_prefix: &str) -> String {
    // Some servers return full URLs in href, most return absolute paths
    let path_part = match href.find("://") {
        Some(scheme_end) => {
            let after_scheme = &href[scheme_end + 3..];
            after_scheme.find('/').map(|i| &after_scheme[i..]).unwrap_or("/")
        }
        None => href,
    };
    let decoded = urlencoding::decode(path_part)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| path_part.to_string());

    let prefix = strip_prefix.trim_end_matches('/');
    let decoded_trimmed = decoded.trim_end_matches('/');
    let rest = if prefix.is_empty() {
        decoded_trimmed
    } else if decoded_trimmed == prefix {
        ""
    } else {
        decoded_trimmed
            .strip_prefix(&format!("{}/", prefix))
            .unwrap_or(decoded_trimmed)
    };
    rest.trim_matches('/').to_string()
}
