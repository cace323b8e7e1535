//! Repository descriptor fetching and URL list hygiene.

use crate::repository::Repository;
use reqwest::header::{CACHE_CONTROL, CONTENT_TYPE, PRAGMA};
use reqwest::Client;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use url::Url;

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];
const SNIPPET_LEN: usize = 500;
const DISALLOWED_CHARS: &[char] = &['[', ']', '{', '}', '<', '>', '|', '\\'];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("The URL is not valid.")]
    InvalidURL,

    #[error("Received an invalid response from the server.")]
    InvalidResponse,

    #[error("Server returned an invalid status code: {0}.")]
    InvalidStatusCode(u16),

    #[error("The data format is invalid or unexpected.")]
    InvalidFormat,

    #[error("Failed to decode JSON (Content-Type: {content_type}): {cause}\nData Snippet:\n{snippet}")]
    DecodingError {
        cause: String,
        content_type: String,
        snippet: String,
    },

    #[error("Required fields are missing or empty.")]
    MissingRequiredFields,

    #[error("Network error: {0}")]
    NetworkError(String),
}

impl ValidationError {
    /// Transport failures and server errors are worth another attempt;
    /// malformed documents are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            ValidationError::NetworkError(_) => true,
            ValidationError::InvalidStatusCode(code) => *code >= 500,
            _ => false,
        }
    }
}

pub fn default_client() -> reqwest::Result<Client> {
    Client::builder()
        .user_agent(concat!("circlefy/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(30))
        .build()
}

/// Fetches `url` bypassing caches and decodes it as a repository descriptor.
pub async fn validate_repository(client: &Client, url: &str) -> Result<Repository, ValidationError> {
    let parsed = Url::parse(url.trim()).map_err(|_| ValidationError::InvalidURL)?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ValidationError::InvalidURL);
    }

    let response = client
        .get(parsed)
        .header(CACHE_CONTROL, "no-cache")
        .header(PRAGMA, "no-cache")
        .send()
        .await
        .map_err(|e| ValidationError::NetworkError(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(ValidationError::InvalidStatusCode(status.as_u16()));
    }

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "unknown".to_string());

    let body = response.bytes().await.map_err(|e| {
        tracing::debug!(url, "failed to read response body: {}", e);
        ValidationError::InvalidResponse
    })?;

    decode_descriptor(&body, &content_type)
}

/// Decodes a descriptor body; a leading UTF-8 BOM is ignored.
pub fn decode_descriptor(body: &[u8], content_type: &str) -> Result<Repository, ValidationError> {
    let body = body.strip_prefix(UTF8_BOM).unwrap_or(body);
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(ValidationError::InvalidFormat);
    }

    let repository: Repository =
        serde_json::from_slice(body).map_err(|e| ValidationError::DecodingError {
            cause: e.to_string(),
            content_type: content_type.to_string(),
            snippet: String::from_utf8_lossy(&body[..body.len().min(SNIPPET_LEN)]).into_owned(),
        })?;

    if repository.name.is_empty() || repository.identifier.is_empty() {
        return Err(ValidationError::MissingRequiredFields);
    }
    Ok(repository)
}

/// Validates every URL with at most `concurrency` requests in flight.
/// Results come back in input order.
pub async fn validate_all(
    client: &Client,
    urls: &[String],
    concurrency: usize,
) -> Vec<(String, Result<Repository, ValidationError>)> {
    let permits = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut set = JoinSet::new();

    for (index, url) in urls.iter().enumerate() {
        let client = client.clone();
        let url = url.clone();
        let permits = permits.clone();
        set.spawn(async move {
            let _permit = permits.acquire_owned().await;
            let result = validate_repository(&client, &url).await;
            (index, url, result)
        });
    }

    let mut results: Vec<Option<(String, Result<Repository, ValidationError>)>> =
        (0..urls.len()).map(|_| None).collect();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((index, url, result)) => results[index] = Some((url, result)),
            Err(e) => tracing::error!("validation task failed: {}", e),
        }
    }

    results
        .into_iter()
        .zip(urls)
        .map(|(slot, url)| {
            slot.unwrap_or_else(|| {
                (
                    url.clone(),
                    Err(ValidationError::NetworkError("validation task aborted".to_string())),
                )
            })
        })
        .collect()
}

/// Keeps the absolute http(s) URLs in `text`, one per line, in order.
pub fn filter_valid_urls(text: &str) -> Vec<String> {
    text.split('\n')
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !line.contains(DISALLOWED_CHARS))
        .filter(|line| !line.contains(char::is_whitespace))
        .filter(|line| is_absolute_http_url(line))
        .map(str::to_string)
        .collect()
}

fn is_absolute_http_url(line: &str) -> bool {
    match Url::parse(line) {
        Ok(url) => {
            matches!(url.scheme(), "http" | "https")
                && url.host_str().is_some_and(|h| !h.is_empty())
        }
        Err(_) => false,
    }
}

/// Drops repeated dotted lines, keeping the first. Returns the cleaned text
/// and the removed lines in the order they were found.
pub fn deduplicate_url_lines(text: &str) -> (String, Vec<String>) {
    let mut seen = HashSet::new();
    let mut kept = Vec::new();
    let mut removed = Vec::new();

    for line in text.split('\n') {
        let line = line.trim();
        if line.is_empty() {
            kept.push("");
            continue;
        }
        if line.contains('.') && !seen.insert(line) {
            removed.push(line.to_string());
            continue;
        }
        kept.push(line);
    }

    (kept.join("\n"), removed)
}
