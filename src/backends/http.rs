//! HTTP plumbing shared by the vendor clients: client construction,
//! response classification and transient-failure retry.

use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::time::Duration;

use super::ApiError;

const CONNECT_TIMEOUT_SECS: u64 = 10;
const ERROR_BODY_LIMIT: usize = 300;

/// Build a client with the per-backend request timeout
pub fn build_client(timeout: Duration) -> Result<Client, ApiError> {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .user_agent(concat!("reportpull/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| ApiError::Data(format!("Failed to build HTTP client: {}", e)))
}

/// Map an HTTP failure status onto the error taxonomy
pub fn classify_status(status: StatusCode, body: &str) -> ApiError {
    let detail = format!("HTTP {}: {}", status.as_u16(), truncate(body));
    match status {
        StatusCode::UNAUTHORIZED => ApiError::Auth(detail),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => ApiError::Transient(detail),
        s if s.is_server_error() => ApiError::Transient(detail),
        _ => ApiError::Data(detail),
    }
}

/// Decode a JSON body, or classify the failure status
pub async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(classify_status(status, &body));
    }

    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes)
        .map_err(|e| ApiError::Data(format!("Malformed response: {}", e)))
}

fn truncate(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= ERROR_BODY_LIMIT {
        trimmed.to_string()
    } else {
        let head: String = trimmed.chars().take(ERROR_BODY_LIMIT).collect();
        format!("{}...", head)
    }
}

/// Exponential backoff for transient failures. Auth and data errors are
/// returned immediately.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }

    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, ApiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Err(ApiError::Transient(msg)) if attempt < self.max_retries => {
                    let delay = self.delay_for(attempt);
                    attempt += 1;
                    tracing::warn!(
                        "{} failed ({}), retry {}/{} in {:?}",
                        label,
                        msg,
                        attempt,
                        self.max_retries,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}
