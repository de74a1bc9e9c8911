//! Remote compute delegation
//!
//! `PUT <url>/run` with `{"checksum", "dunder", "fingertip", "scratch"}`.
//! A 200 answer carries the result checksum, 202 means the job is pending
//! and the same request is repeated after the poll interval, until the
//! delegation timeout runs out.

use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value as Json};
use tracing::{debug, info, warn};

use crate::checksum::Checksum;
use crate::error::{Result, SeamlessError};
use crate::logging::{operations, services, status};

pub struct RemoteCompute {
    client: Client,
    url: String,
    poll_interval: Duration,
    timeout: Duration,
}

impl RemoteCompute {
    pub fn new(url: &str, poll_interval: Duration, timeout: Duration) -> Result<Self> {
        let client = Client::builder().build().context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            poll_interval,
            timeout,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Submit a transformation and wait for its result checksum
    ///
    /// A refused job is reported as a transformation failure carrying the server's text.
    pub async fn run(&self, tf_checksum: &Checksum, dunder: &Json, fingertip: bool, scratch: bool) -> Result<Checksum> {
        let request = json!({
            "checksum": tf_checksum,
            "dunder": dunder,
            "fingertip": fingertip,
            "scratch": scratch,
        });
        let endpoint = format!("{}/run", self.url);
        let started = Instant::now();
        loop {
            let response = self
                .client
                .put(&endpoint)
                .body(request.to_string())
                .send()
                .await
                .map_err(|_| SeamlessError::Connection {
                    service: services::REMOTE_COMPUTE.to_string(),
                })?;
            let code = response.status();
            let body = response.text().await.context("Failed to read compute response")?;
            match code {
                StatusCode::OK => {
                    let result = Checksum::from_hex(body.trim())?;
                    info!(
                        service = services::REMOTE_COMPUTE,
                        operation = operations::EXECUTE,
                        status = status::SUCCESS,
                        checksum = %tf_checksum.short(),
                        result = %result.short(),
                        "Remote job finished"
                    );
                    return Ok(result);
                }
                StatusCode::ACCEPTED => {
                    if started.elapsed() >= self.timeout {
                        warn!(
                            service = services::REMOTE_COMPUTE,
                            status = status::ERROR,
                            checksum = %tf_checksum.short(),
                            timeout_secs = self.timeout.as_secs_f64(),
                            "Remote job still pending, giving up"
                        );
                        return Err(SeamlessError::DelegationTimeout {
                            checksum: *tf_checksum,
                            timeout: self.timeout,
                        });
                    }
                    debug!(
                        service = services::REMOTE_COMPUTE,
                        checksum = %tf_checksum.short(),
                        "Remote job pending"
                    );
                    tokio::time::sleep(self.poll_interval).await;
                }
                other => {
                    return Err(SeamlessError::Transformation {
                        checksum: *tf_checksum,
                        message: format!("remote compute refused the job ({}): {}", other.as_u16(), body),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::calculate_checksum;
    use crate::testing::serve;
    use axum::{http::StatusCode as HttpStatus, routing::put, Router};

    fn compute(url: &str) -> RemoteCompute {
        RemoteCompute::new(url, Duration::from_millis(20), Duration::from_millis(200)).unwrap()
    }

    #[tokio::test]
    async fn test_unreachable_service_is_a_connection_error() {
        let compute = compute("http://127.0.0.1:1/");
        assert_eq!(compute.url(), "http://127.0.0.1:1");
        let err = compute
            .run(&calculate_checksum(b"tf"), &json!({}), false, false)
            .await
            .unwrap_err();
        assert!(matches!(err, SeamlessError::Connection { .. }));
    }

    #[tokio::test]
    async fn test_finished_job_returns_the_result() {
        let result = calculate_checksum(b"42\n");
        let hex = result.to_hex();
        let url = serve(Router::new().route("/run", put(move || async move { hex }))).await;

        let answer = compute(&url)
            .run(&calculate_checksum(b"tf"), &json!({}), false, false)
            .await
            .unwrap();
        assert_eq!(answer, result);
    }

    #[tokio::test]
    async fn test_job_pending_forever_times_out() {
        let url = serve(Router::new().route("/run", put(|| async { HttpStatus::ACCEPTED }))).await;

        let started = Instant::now();
        let err = compute(&url)
            .run(&calculate_checksum(b"tf"), &json!({}), false, false)
            .await
            .unwrap_err();
        assert!(matches!(err, SeamlessError::DelegationTimeout { .. }), "{err}");
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_refused_job_is_a_transformation_error() {
        let url = serve(Router::new().route(
            "/run",
            put(|| async { (HttpStatus::BAD_REQUEST, "unknown transformation") }),
        ))
        .await;

        let err = compute(&url)
            .run(&calculate_checksum(b"tf"), &json!({}), false, false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown transformation"), "{err}");
    }
}
