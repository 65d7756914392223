use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{error, warn};
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, RETRY_AFTER};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use tokio::time::sleep;
use url::Url;

use crate::error::{CIFetchError, Result};

const USER_AGENT: &str = concat!("cifetch/", env!("CARGO_PKG_VERSION"));

/// How hard to try before giving up on a request
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Counted retries for 5xx, bare 429 and connection failures
    pub max_retries: u32,
    /// Retries for archives that fail to unpack
    pub zip_retries: u32,
    /// First backoff step; doubles on every attempt
    pub base_delay: Duration,
    /// Unit delay for interrupted downloads and corrupt archives
    pub step_delay: Duration,
    /// Added to every provider-dictated rate-limit sleep
    pub rate_limit_padding: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 12,
            zip_retries: 5,
            base_delay: Duration::from_millis(1250),
            step_delay: Duration::from_secs(1),
            rate_limit_padding: Duration::from_secs(1),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        let delay = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt));
        if self.jitter && !delay.is_zero() {
            delay + add_jitter()
        } else {
            delay
        }
    }
}

#[cfg(test)]
impl RetryPolicy {
    pub fn without_delays(max_retries: u32) -> Self {
        Self {
            max_retries,
            zip_retries: 1,
            base_delay: Duration::ZERO,
            step_delay: Duration::ZERO,
            rate_limit_padding: Duration::ZERO,
            jitter: false,
        }
    }
}

fn add_jitter() -> Duration {
    let mut rng = rand::thread_rng();
    Duration::from_millis(rng.gen_range(0..=250))
}

/// HTTP client for one provider API; every request goes through the retry loop
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    is_github: bool,
    retry: RetryPolicy,
}

impl ApiClient {
    pub fn new(
        base_url: &str,
        headers: HeaderMap,
        is_github: bool,
        retry: RetryPolicy,
    ) -> Result<Self> {
        Url::parse(base_url)
            .map_err(|e| CIFetchError::Config(format!("Invalid base URL {base_url:?}: {e}")))?;

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .build()
            .map_err(|e| CIFetchError::Config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            is_github,
            retry,
        })
    }

    /// Resolve an API path, or pass an absolute URL through
    pub fn url(&self, path: &str) -> String {
        let lower = path.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}/{}", self.base_url, path.trim_start_matches('/'))
        }
    }

    pub async fn get_with(
        &self,
        path: &str,
        query: &[(&str, &str)],
        accept: Option<&str>,
    ) -> Result<Response> {
        let url = self.url(path);
        let mut attempt = 0;

        loop {
            let mut request = self.client.get(&url).query(query);
            if let Some(accept) = accept {
                request = request.header(ACCEPT, accept);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) if is_transient(&e) && attempt < self.retry.max_retries => {
                    let delay = self.retry.backoff(attempt);
                    warn!("Request to {url} failed: {e}; waiting {delay:?} & retrying");
                    sleep(delay).await;
                    attempt += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }

            // Provider-dictated cooldowns don't count against the retry budget
            if status == StatusCode::TOO_MANY_REQUESTS
                || (self.is_github && status == StatusCode::FORBIDDEN)
            {
                if let Some(delay) = retry_after(response.headers()) {
                    let delay = delay + self.retry.rate_limit_padding;
                    warn!("Rate limit exceeded; sleeping for {delay:?}");
                    sleep(delay).await;
                    continue;
                }
            }

            if (status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS)
                && attempt < self.retry.max_retries
            {
                let delay = self.retry.backoff(attempt);
                warn!(
                    "Request to {url} returned {}; waiting {delay:?} & retrying",
                    status.as_u16()
                );
                sleep(delay).await;
                attempt += 1;
                continue;
            }

            let reset = rate_limit_reset(response.headers());
            let body = response.text().await.unwrap_or_default();

            if self.is_github
                && status == StatusCode::FORBIDDEN
                && body.contains("API rate limit exceeded")
            {
                if let Some(reset) = reset {
                    let delay = delay_until(reset) + self.retry.rate_limit_padding;
                    warn!("Rate limit exceeded; sleeping for {delay:?}");
                    sleep(delay).await;
                    continue;
                }
                // No reset time given; a rate limit is never an auth failure
                if attempt < self.retry.max_retries {
                    let delay = self.retry.backoff(attempt);
                    warn!("Rate limit exceeded without reset time; waiting {delay:?} & retrying");
                    sleep(delay).await;
                    attempt += 1;
                    continue;
                }
                return Err(CIFetchError::Api {
                    url,
                    status: status.as_u16(),
                    body,
                });
            }

            let status = status.as_u16();
            return Err(match status {
                401 | 403 => CIFetchError::Auth { url, status },
                _ => CIFetchError::Api { url, status, body },
            });
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        let response = self.get_with(path, query, None).await?;
        let body = response.text().await?;
        serde_json::from_str(&body)
            .map_err(|e| CIFetchError::Payload(format!("{}: {e}", self.url(path))))
    }

    /// Stream a response body to `target`, restarting interrupted transfers.
    /// A partial file is never left behind.
    pub async fn download(&self, path: &str, target: &Path, accept: Option<&str>) -> Result<()> {
        let mut attempt = 0;

        loop {
            match self.try_download(path, target, accept).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    let _ = tokio::fs::remove_file(target).await;
                    match e {
                        CIFetchError::Network(ref inner)
                            if (inner.is_body() || inner.is_decode())
                                && attempt < self.retry.max_retries =>
                        {
                            attempt += 1;
                            warn!("Download of {path} interrupted: {inner}; waiting & retrying");
                            sleep(self.retry.step_delay * attempt).await;
                        }
                        _ => {
                            if matches!(e, CIFetchError::Network(_)) {
                                error!("Max retries exceeded downloading {path}");
                            }
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    async fn try_download(&self, path: &str, target: &Path, accept: Option<&str>) -> Result<()> {
        let mut response = self.get_with(path, &[], accept).await?;
        let mut file = tokio::fs::File::create(target).await?;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(())
    }

    /// Download a zip archive and unpack it into `target_dir`, refetching
    /// archives that turn out to be corrupt.
    pub async fn download_zipfile(&self, path: &str, target_dir: &Path) -> Result<()> {
        let mut attempt = 0;

        loop {
            let archive = tempfile::NamedTempFile::new()?;
            self.download(path, archive.path(), Some("*/*")).await?;

            match extract_zip(archive.path(), target_dir) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    let _ = std::fs::remove_dir_all(target_dir);
                    if matches!(e, CIFetchError::Zip(_)) && attempt < self.retry.zip_retries {
                        attempt += 1;
                        error!("Invalid zip file retrieved from {path}: {e}; waiting and retrying");
                        sleep(self.retry.step_delay * attempt * attempt).await;
                    } else {
                        return Err(e);
                    }
                }
            }
        }
    }
}

fn extract_zip(archive: &Path, target_dir: &Path) -> Result<()> {
    let file = std::fs::File::open(archive)?;
    let mut archive = zip::ZipArchive::new(file)?;
    std::fs::create_dir_all(target_dir)?;
    archive.extract(target_dir)?;
    Ok(())
}

fn is_transient(e: &reqwest::Error) -> bool {
    e.is_connect() || e.is_timeout() || e.is_request()
}

/// Parse a `Retry-After` header given either as seconds or as an HTTP date
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_retry_after)
}

pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
        return value.parse().ok().map(Duration::from_secs);
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?;
    Some(delay_until(at.with_timezone(&Utc)))
}

fn rate_limit_reset(headers: &HeaderMap) -> Option<DateTime<Utc>> {
    headers
        .get("x-ratelimit-reset")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<i64>().ok())
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
}

fn delay_until(at: DateTime<Utc>) -> Duration {
    (at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

/// Header value for a credential, hidden from debug output
pub fn secret_header(value: &str) -> Result<HeaderValue> {
    let mut header = HeaderValue::from_str(value)
        .map_err(|_| CIFetchError::Config("token contains invalid characters".to_string()))?;
    header.set_sensitive(true);
    Ok(header)
}
