//! Omi conversations connector.
//!
//! Reads the user's conversations, transcripts included, from the Omi
//! developer API one page at a time.
//!
//! # Configuration
//!
//! ```toml
//! [source]
//! base_url = "https://api.omi.me/v1/dev"
//! page_size = 25
//! timeout_secs = 30
//! # api_key = "omi_dev_..."      # or OMI_API_KEY
//! ```
//!
//! # Request
//!
//! ```text
//! GET {base_url}/user/conversations?include_transcript=true&limit={limit}&offset={offset}
//! Authorization: Bearer {api_key}
//! ```
//!
//! # Status mapping
//!
//! | Response | Error |
//! |----------|-------|
//! | 401, 403 | [`SourceError::Auth`] |
//! | 429 | [`SourceError::RateLimited`] with the `Retry-After` seconds, if sent |
//! | other non-2xx | [`SourceError::Http`] |
//! | body is not a JSON array of conversations | [`SourceError::MalformedResponse`] |
//! | client timeout | [`SourceError::Timeout`] |

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;

use crate::config::SourceConfig;
use crate::error::SourceError;
use crate::models::Record;
use crate::traits::RecordSource;

/// HTTP client for the conversations endpoint.
pub struct OmiSource {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OmiSource {
    pub fn new(config: &SourceConfig) -> anyhow::Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| anyhow::anyhow!("source.api_key is not set"))?;
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl RecordSource for OmiSource {
    fn name(&self) -> &str {
        "omi"
    }

    async fn fetch_page(&self, offset: usize, limit: usize) -> Result<Vec<Record>, SourceError> {
        let url = format!("{}/user/conversations", self.base_url);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .query(&[
                ("include_transcript", "true".to_string()),
                ("limit", limit.to_string()),
                ("offset", offset.to_string()),
            ])
            .send()
            .await?;

        let status = resp.status();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(SourceError::Auth {
                    status: status.as_u16(),
                })
            }
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = resp
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_retry_after);
                return Err(SourceError::RateLimited { retry_after });
            }
            s if !s.is_success() => {
                let body = resp.text().await.unwrap_or_default();
                return Err(SourceError::Http {
                    status: s.as_u16(),
                    body: body.chars().take(500).collect(),
                });
            }
            _ => {}
        }

        let bytes = resp.bytes().await?;
        serde_json::from_slice::<Vec<Record>>(&bytes)
            .map_err(|e| SourceError::MalformedResponse(e.to_string()))
    }
}

/// Parse a `Retry-After` value given in seconds.
///
/// HTTP-date values are not used by the API and yield `None`, so the
/// caller's default applies.
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after("30"), Some(Duration::from_secs(30)));
        assert_eq!(parse_retry_after(" 5 "), Some(Duration::from_secs(5)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[test]
    fn test_new_requires_api_key() {
        assert!(OmiSource::new(&SourceConfig::default()).is_err());

        let config = SourceConfig {
            api_key: Some("k".to_string()),
            base_url: "http://localhost:9/v1/dev/".to_string(),
            ..Default::default()
        };
        let source = OmiSource::new(&config).unwrap();
        assert_eq!(source.base_url, "http://localhost:9/v1/dev");
    }
}
