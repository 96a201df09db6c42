//! One-shot report submission
//!
//! A report is a single form-encoded POST of the six identifier fields to the
//! collection endpoint. The reporter never retries internally and never
//! distinguishes failure causes: transport errors, non-2xx statuses and
//! timeouts all collapse into the same `Failure` outcome, leaving the caller
//! to retry on the next eligible trigger.

use std::time::Duration;

use async_trait::async_trait;

use crate::config::ReportConfig;
use crate::error::{Error, Result};
use crate::identity::DeviceRecord;

/// Outcome of a single submission attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportOutcome {
    /// The server acknowledged the report with a success status.
    Success,
    /// Anything else: unreachable network, non-2xx response, timeout.
    Failure(String),
}

/// Performs the one-shot network submission of a device record.
#[async_trait]
pub trait Reporter: Send + Sync {
    /// Submit a record once. Infallible at the signature level; all errors
    /// are folded into [`ReportOutcome::Failure`].
    async fn submit(&self, record: &DeviceRecord) -> ReportOutcome;
}

/// HTTP reporter targeting the fixed collection endpoint.
pub struct HttpReporter {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpReporter {
    /// Create a reporter from configuration.
    pub fn new(config: &ReportConfig) -> Result<Self> {
        config.validate()?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Report(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: config.endpoint().to_string(),
        })
    }

    /// Returns the configured endpoint URL.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Reporter for HttpReporter {
    async fn submit(&self, record: &DeviceRecord) -> ReportOutcome {
        match self
            .client
            .post(&self.endpoint)
            .form(record)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(endpoint = %self.endpoint, "Report accepted");
                ReportOutcome::Success
            }
            Ok(response) => {
                let reason = format!("server returned {}", response.status());
                tracing::warn!(endpoint = %self.endpoint, %reason, "Report rejected");
                ReportOutcome::Failure(reason)
            }
            Err(e) => {
                let reason = format!("request failed: {}", e);
                tracing::warn!(endpoint = %self.endpoint, %reason, "Report not delivered");
                ReportOutcome::Failure(reason)
            }
        }
    }
}
