//! WebDAV destination store.
//!
//! Maps the [`DestinationStore`] operations onto plain WebDAV verbs with
//! HTTP basic authentication. Works with Nextcloud, ownCloud, Apache
//! `mod_dav`, rclone `serve webdav`, and similar servers.
//!
//! | Operation | Request | Success | Notes |
//! |-----------|---------|---------|-------|
//! | `exists` | `PROPFIND` (`Depth: 0`) | 207, 200 | 404 → `false` |
//! | `read` | `GET` | 200 | 404 → `NotFound` |
//! | `write` | `PUT` | 200, 201, 204 | `If-None-Match: *` when not overwriting; 412 → `AlreadyExists` |
//! | `delete` | `DELETE` | 200, 204 | 404 → `NotFound` |
//! | `ensure_directory` | `MKCOL` per segment | 201 | 405 → already there |
//!
//! Paths are `/`-separated and relative to the configured base URL. Each
//! segment is percent-encoded.

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, IF_NONE_MATCH};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use tracing::{debug, info};

use crate::config::DestinationConfig;
use crate::error::DestinationError;
use crate::traits::DestinationStore;

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?><d:propfind xmlns:d="DAV:"><d:prop><d:resourcetype/></d:prop></d:propfind>"#;

/// WebDAV client rooted at a base URL.
pub struct WebDavStore {
    client: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
}

impl WebDavStore {
    pub fn new(config: &DestinationConfig) -> anyhow::Result<Self> {
        let base_url = config
            .url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("destination.url is not set"))?;
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            username: config.username.clone().unwrap_or_default(),
            password: config.password.clone().unwrap_or_default(),
        })
    }

    fn url(&self, path: &str) -> String {
        let encoded = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(encode_segment)
            .collect::<Vec<_>>()
            .join("/");
        format!("{}/{}", self.base_url, encoded)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, self.url(path))
            .basic_auth(&self.username, Some(&self.password))
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response, DestinationError> {
        Ok(req.send().await?)
    }
}

fn method(name: &'static str) -> Method {
    // Only called with the static verb names below.
    Method::from_bytes(name.as_bytes()).unwrap_or(Method::GET)
}

/// Map statuses every operation treats the same way.
fn common_error(status: StatusCode, path: &str) -> DestinationError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => DestinationError::Auth {
            status: status.as_u16(),
        },
        StatusCode::NOT_FOUND => DestinationError::NotFound(path.to_string()),
        _ => DestinationError::Http {
            status: status.as_u16(),
            path: path.to_string(),
        },
    }
}

#[async_trait]
impl DestinationStore for WebDavStore {
    fn name(&self) -> &str {
        "webdav"
    }

    async fn exists(&self, path: &str) -> Result<bool, DestinationError> {
        let req = self
            .request(method("PROPFIND"), path)
            .header("Depth", "0")
            .header(CONTENT_TYPE, "application/xml; charset=utf-8")
            .body(PROPFIND_BODY);
        let status = self.send(req).await?.status();
        match status {
            StatusCode::MULTI_STATUS | StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(common_error(s, path)),
        }
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, DestinationError> {
        let resp = self.send(self.request(Method::GET, path)).await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(common_error(status, path));
        }
        Ok(resp.bytes().await?.to_vec())
    }

    async fn write(
        &self,
        path: &str,
        bytes: Vec<u8>,
        overwrite: bool,
    ) -> Result<(), DestinationError> {
        let mut req = self
            .request(Method::PUT, path)
            .header(CONTENT_TYPE, "text/markdown; charset=utf-8")
            .body(bytes);
        if !overwrite {
            req = req.header(IF_NONE_MATCH, "*");
        }
        let status = self.send(req).await?.status();
        match status {
            s if s.is_success() => {
                debug!(path, "uploaded");
                Ok(())
            }
            StatusCode::PRECONDITION_FAILED => Err(DestinationError::AlreadyExists(path.to_string())),
            s => Err(common_error(s, path)),
        }
    }

    async fn delete(&self, path: &str) -> Result<(), DestinationError> {
        let status = self
            .send(self.request(Method::DELETE, path))
            .await?
            .status();
        if status.is_success() {
            Ok(())
        } else {
            Err(common_error(status, path))
        }
    }

    async fn ensure_directory(&self, path: &str) -> Result<(), DestinationError> {
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);

            let status = self
                .send(self.request(method("MKCOL"), &current))
                .await?
                .status();
            match status {
                StatusCode::CREATED => info!(path = %current, "created directory"),
                // 405: the collection already exists.
                StatusCode::METHOD_NOT_ALLOWED => {}
                s if s.is_success() => {}
                s => return Err(common_error(s, &current)),
            }
        }
        Ok(())
    }
}

/// Percent-encode one path segment (RFC 3986 unreserved characters and a
/// few sub-delims pass through).
fn encode_segment(segment: &str) -> String {
    let mut result = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z'
            | b'a'..=b'z'
            | b'0'..=b'9'
            | b'-'
            | b'_'
            | b'.'
            | b'~'
            | b'!'
            | b'$'
            | b'\''
            | b'('
            | b')'
            | b','
            | b';'
            | b'='
            | b'@' => result.push(byte as char),
            _ => result.push_str(&format!("%{:02X}", byte)),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(url: &str) -> WebDavStore {
        WebDavStore::new(&DestinationConfig {
            url: Some(url.to_string()),
            username: Some("u".to_string()),
            password: Some("p".to_string()),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_url_encodes_segments() {
        let s = store("https://dav.example.com/remote.php/dav/files/me/");
        assert_eq!(
            s.url("/conversations/Meeting Notes_01022026.md"),
            "https://dav.example.com/remote.php/dav/files/me/conversations/Meeting%20Notes_01022026.md"
        );
    }

    #[test]
    fn test_encode_segment_unicode_and_reserved() {
        assert_eq!(encode_segment("café #1?.md"), "caf%C3%A9%20%231%3F.md");
        assert_eq!(encode_segment("a(b),c.md"), "a(b),c.md");
    }

    #[test]
    fn test_common_error_mapping() {
        assert!(matches!(
            common_error(StatusCode::UNAUTHORIZED, "/a"),
            DestinationError::Auth { status: 401 }
        ));
        assert!(common_error(StatusCode::NOT_FOUND, "/a").is_not_found());
        assert!(matches!(
            common_error(StatusCode::INSUFFICIENT_STORAGE, "/a"),
            DestinationError::Http { status: 507, .. }
        ));
    }
}
