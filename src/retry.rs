//! Fixed-delay retry around flaky upstream HTTP calls
//!
//! Only server-side failures (5xx) and transport errors are retried. A 4xx
//! answer means the request itself is wrong, so it is handed back at once
//! for the caller to surface.

use crate::error::{FuseError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Number of attempts and the pause between them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Fixed pause between attempts, in milliseconds
    pub delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 1500,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// A single attempt, no retry
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            delay_ms: 0,
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Send a request, retrying on 5xx and network errors
///
/// `build` is called once per attempt because request bodies such as
/// multipart forms are consumed by `send`.
///
/// Returns the first response that is not a server error, which may still be
/// a 4xx the caller has to inspect.
///
/// # Errors
/// - `FuseError::Upstream` with the last status and body when every attempt got a 5xx
/// - `FuseError::Network` when the last attempt failed at the transport level
pub async fn send_with_retry<F>(
    service: &str,
    policy: &RetryPolicy,
    mut build: F,
) -> Result<reqwest::Response>
where
    F: FnMut() -> reqwest::RequestBuilder,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        debug!(service = %service, attempt, attempts, "Calling upstream");

        match build().send().await {
            Ok(response) if !response.status().is_server_error() => {
                if attempt > 1 {
                    debug!(service = %service, attempt, "Upstream recovered after retry");
                }
                return Ok(response);
            },
            Ok(response) => {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                warn!(
                    service = %service,
                    attempt,
                    attempts,
                    status,
                    delay_ms = policy.delay_ms,
                    "Upstream server error, retrying"
                );
                last_error = Some(FuseError::upstream(service, status, body));
            },
            Err(e) => {
                warn!(
                    service = %service,
                    attempt,
                    attempts,
                    error = %e,
                    delay_ms = policy.delay_ms,
                    "Upstream network error, retrying"
                );
                last_error = Some(FuseError::network_error(
                    format!("{} request failed", service),
                    e,
                ));
            },
        }

        if attempt < attempts {
            tokio::time::sleep(policy.delay()).await;
        }
    }

    Err(last_error.unwrap_or_else(|| FuseError::internal("All retry attempts failed")))
}

/// Turn a non-success response into an `Upstream` error carrying its text
pub async fn ensure_success(service: &str, response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(FuseError::upstream(service, status.as_u16(), body))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::from_millis(1))
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.delay(), Duration::from_millis(1500));
        assert_eq!(RetryPolicy::none().max_attempts, 1);
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/edit")
            .with_status(422)
            .with_body("bad image")
            .expect(1)
            .create_async()
            .await;

        let client = reqwest::Client::new();
        let url = format!("{}/edit", server.url());
        let response = send_with_retry("Stability AI", &fast_policy(3), || client.post(&url))
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 422);

        let err = ensure_success("Stability AI", response).await.unwrap_err();
        assert!(matches!(err, FuseError::Upstream { status: 422, .. }));
        assert!(err.to_string().contains("bad image"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_error_exhausts_attempts() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/edit")
            .with_status(503)
            .with_body("overloaded")
            .expect(3)
            .create_async()
            .await;

        let client = reqwest::Client::new();
        let url = format!("{}/edit", server.url());
        let err = send_with_retry("Stability AI", &fast_policy(3), || client.post(&url))
            .await
            .unwrap_err();

        match err {
            FuseError::Upstream { status, body, .. } => {
                assert_eq!(status, 503);
                assert_eq!(body, "overloaded");
            },
            other => panic!("unexpected error: {other}"),
        }
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_network_error_is_retried_then_reported() {
        // Bind and immediately release a port so connections are refused
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = reqwest::Client::new();
        let url = format!("http://{}/edit", addr);
        let mut calls = 0;
        let err = send_with_retry("Stability AI", &fast_policy(2), || {
            calls += 1;
            client.post(&url)
        })
        .await
        .unwrap_err();

        assert_eq!(calls, 2);
        assert!(matches!(err, FuseError::Network(_)));
    }
}
