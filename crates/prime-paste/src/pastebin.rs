//! Pastebin form API client.

use async_trait::async_trait;
use prime_core::error::PrimeError;
use prime_core::traits::{Paste, PasteService, Visibility};
use std::time::Duration;
use tracing::{debug, warn};

/// Request timeout for the paste upload.
const PASTE_TIMEOUT_SECS: u64 = 30;

/// Creates pastes through `api_post.php`.
pub struct PastebinClient {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
}

impl PastebinClient {
    /// Build a client for `api_url` authenticated with `api_key`.
    pub fn new(api_url: &str, api_key: &str) -> Result<Self, PrimeError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(PASTE_TIMEOUT_SECS))
            .build()
            .map_err(|e| PrimeError::Paste(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            api_url: api_url.to_string(),
            api_key: api_key.to_string(),
        })
    }

    /// Form fields for one paste, in the order Pastebin documents them.
    fn form_fields(&self, paste: &Paste) -> Vec<(&'static str, String)> {
        vec![
            ("api_dev_key", self.api_key.clone()),
            ("api_option", "paste".to_string()),
            ("api_paste_code", paste.text.clone()),
            ("api_paste_name", paste.title.clone()),
            (
                "api_paste_expire_date",
                paste.expiration.clone().unwrap_or_else(|| "N".to_string()),
            ),
            ("api_paste_private", privacy_flag(paste.visibility).to_string()),
            ("api_paste_format", paste.format.clone()),
        ]
    }
}

/// Pastebin's `api_paste_private` value.
fn privacy_flag(visibility: Visibility) -> u8 {
    match visibility {
        Visibility::Public => 0,
        Visibility::Unlisted => 1,
        Visibility::Private => 2,
    }
}

/// Pastebin answers 200 with either the paste URL or an error sentence.
fn parse_response(body: &str) -> Result<String, PrimeError> {
    let body = body.trim();
    if body.starts_with("https://") || body.starts_with("http://") {
        Ok(body.to_string())
    } else if body.is_empty() {
        Err(PrimeError::Paste("empty response".to_string()))
    } else {
        Err(PrimeError::Paste(body.to_string()))
    }
}

#[async_trait]
impl PasteService for PastebinClient {
    async fn create_paste(&self, paste: &Paste) -> Result<String, PrimeError> {
        if self.api_key.is_empty() {
            return Err(PrimeError::Paste("paste api_key is not configured".to_string()));
        }

        let resp = self
            .client
            .post(&self.api_url)
            .form(&self.form_fields(paste))
            .send()
            .await
            .map_err(|e| PrimeError::Paste(format!("upload failed: {e}")))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| PrimeError::Paste(format!("failed to read response: {e}")))?;

        if !status.is_success() {
            warn!("pastebin: upload returned {status}");
            return Err(PrimeError::Paste(format!("HTTP {status}: {}", body.trim())));
        }

        let url = parse_response(&body)?;
        debug!("pastebin: created {url}");
        Ok(url)
    }
}
