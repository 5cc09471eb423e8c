//! Fact extraction over HTTP.
//!
//! The remote service receives one serialized subtree plus its context and
//! answers with structured facts. Transient failures are retried here with
//! exponential backoff, so callers only ever see the final outcome.

use std::time::Duration;

use aeroschema_core::ExtractedFact;
use aeroschema_ingest::Subtree;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::ExtractionError;
use crate::extract::{ExtractionContext, FactExtractor};

#[derive(Serialize)]
struct ExtractRequest<'a> {
    subtree: String,
    context: &'a ExtractionContext,
}

#[derive(Debug, Deserialize)]
struct ExtractResponse {
    facts: Vec<ExtractedFact>,
}

/// Retry policy for transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub max_attempts: u32,
    pub initial: Duration,
    pub max_delay: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial: Duration::from_millis(250),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial.saturating_mul(factor).min(self.max_delay)
    }
}

/// Client for a remote extraction endpoint.
pub struct HttpExtractor {
    client: reqwest::Client,
    endpoint: String,
    request_timeout: Duration,
    backoff: Backoff,
}

impl HttpExtractor {
    /// `endpoint` is the full URL facts are POSTed to.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            request_timeout: Duration::from_secs(60),
            backoff: Backoff::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn call_once(
        &self,
        body: &ExtractRequest<'_>,
    ) -> Result<Vec<ExtractedFact>, ExtractionError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .timeout(self.request_timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| classify(e, self.request_timeout))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ExtractionError::Server {
                status: status.as_u16(),
                body,
            });
        }
        let text = resp
            .text()
            .await
            .map_err(|e| classify(e, self.request_timeout))?;
        parse_response(&text)
    }
}

fn classify(err: reqwest::Error, timeout: Duration) -> ExtractionError {
    if err.is_timeout() {
        ExtractionError::Timeout(timeout)
    } else {
        ExtractionError::Transport(err.to_string())
    }
}

fn parse_response(text: &str) -> Result<Vec<ExtractedFact>, ExtractionError> {
    serde_json::from_str::<ExtractResponse>(text)
        .map(|r| r.facts)
        .map_err(|e| ExtractionError::Malformed(e.to_string()))
}

#[async_trait]
impl FactExtractor for HttpExtractor {
    async fn extract(
        &self,
        subtree: &Subtree,
        ctx: &ExtractionContext,
    ) -> Result<Vec<ExtractedFact>, ExtractionError> {
        let body = ExtractRequest {
            subtree: subtree.root.to_xml(),
            context: ctx,
        };
        let mut attempt = 1;
        loop {
            match self.call_once(&body).await {
                Ok(facts) => {
                    debug!(
                        section_path = %ctx.section_path,
                        ordinal = subtree.ordinal,
                        facts = facts.len(),
                        attempt,
                        "remote extraction succeeded"
                    );
                    return Ok(facts);
                }
                Err(err) if err.is_transient() && attempt < self.backoff.max_attempts => {
                    let delay = self.backoff.delay(attempt);
                    warn!(
                        section_path = %ctx.section_path,
                        ordinal = subtree.ordinal,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "remote extraction failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn name(&self) -> &str {
        "http"
    }
}
