// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock enrichment provider for testing.
//!
//! Deterministic: plays back a script of outcomes, then repeats a fallback
//! outcome forever. Every request is recorded.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{Enrichment, EnrichmentError, EnrichmentResult};

/// Outcome of one mock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockOutcome {
    /// Return a result.
    Succeed,
    /// Fail with [`EnrichmentError::Transient`].
    Transient,
    /// Fail with [`EnrichmentError::Permanent`].
    Permanent,
}

/// A request received by [`MockEnrichment`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockRequest {
    /// Call the request was for.
    pub call_id: String,
    /// Combined payload that was sent.
    pub payload: String,
}

/// Mock enrichment provider.
pub struct MockEnrichment {
    script: Arc<Mutex<VecDeque<MockOutcome>>>,
    fallback: MockOutcome,
    requests: Arc<Mutex<Vec<MockRequest>>>,
    delay: Duration,
    /// Sentiment returned on success.
    pub sentiment: String,
}

impl Default for MockEnrichment {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEnrichment {
    /// Create a mock that always succeeds.
    pub fn new() -> Self {
        Self::scripted([], MockOutcome::Succeed)
    }

    /// Create a mock that always fails transiently.
    pub fn failing() -> Self {
        Self::scripted([], MockOutcome::Transient)
    }

    /// Create a mock that always fails permanently.
    pub fn rejecting() -> Self {
        Self::scripted([], MockOutcome::Permanent)
    }

    /// Play `script` in order, then answer every later request with `then`.
    pub fn scripted(script: impl IntoIterator<Item = MockOutcome>, then: MockOutcome) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into_iter().collect())),
            fallback: then,
            requests: Arc::new(Mutex::new(Vec::new())),
            delay: Duration::ZERO,
            sentiment: "neutral".to_string(),
        }
    }

    /// Sleep for `delay` after recording each request, before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// All requests received so far, oldest first.
    pub async fn requests(&self) -> Vec<MockRequest> {
        self.requests.lock().await.clone()
    }

    /// Number of requests received so far.
    pub async fn request_count(&self) -> usize {
        self.requests.lock().await.len()
    }
}

#[async_trait]
impl Enrichment for MockEnrichment {
    fn provider_name(&self) -> &'static str {
        "mock"
    }

    async fn process(
        &self,
        call_id: &str,
        combined_payload: &str,
    ) -> Result<EnrichmentResult, EnrichmentError> {
        self.requests.lock().await.push(MockRequest {
            call_id: call_id.to_string(),
            payload: combined_payload.to_string(),
        });

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let outcome = self
            .script
            .lock()
            .await
            .pop_front()
            .unwrap_or(self.fallback);

        match outcome {
            MockOutcome::Succeed => Ok(EnrichmentResult {
                transcription: format!(
                    "Transcript of {} ({} bytes)",
                    call_id,
                    combined_payload.len()
                ),
                sentiment: self.sentiment.clone(),
            }),
            MockOutcome::Transient => Err(EnrichmentError::Transient(
                "503 Service Unavailable".to_string(),
            )),
            MockOutcome::Permanent => Err(EnrichmentError::Permanent(
                "422 Unprocessable payload".to_string(),
            )),
        }
    }
}
