// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Simulated flaky enrichment provider.
//!
//! Sleeps for a random latency, then fails with a transient 503 at the
//! configured rate or returns a templated transcription with a weighted
//! random sentiment.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use tracing::{error, info};

use super::{Enrichment, EnrichmentError, EnrichmentResult};

const UNAVAILABLE: &str = "503 Service Unavailable - AI service temporarily unavailable";

const TEMPLATES: [&str; 5] = [
    "Customer inquiry about product features and pricing for call {call}.",
    "Technical support request regarding system integration issues in call {call}.",
    "Sales conversation discussing service packages and contract terms for {call}.",
    "Customer feedback session about recent experience with our services - {call}.",
    "Billing inquiry and account management discussion for call {call}.",
];

const SENTIMENTS: [(&str, f64); 4] = [
    ("positive", 0.4),
    ("neutral", 0.4),
    ("negative", 0.1),
    ("mixed", 0.1),
];

/// Simulated provider configuration.
#[derive(Debug, Clone)]
pub struct SimulatedEnrichmentConfig {
    /// Probability in `[0, 1]` that a request fails transiently.
    pub failure_rate: f64,
    /// Lower latency bound.
    pub min_latency: Duration,
    /// Upper latency bound.
    pub max_latency: Duration,
}

impl Default for SimulatedEnrichmentConfig {
    fn default() -> Self {
        Self {
            failure_rate: 0.25,
            min_latency: Duration::from_secs(1),
            max_latency: Duration::from_secs(3),
        }
    }
}

/// Request counters of a [`SimulatedEnrichment`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EnrichmentStats {
    /// Requests received.
    pub total_requests: u64,
    /// Requests that returned a result.
    pub successful: u64,
    /// Requests that failed.
    pub failed: u64,
    /// Percentage of successful requests, two decimals.
    pub success_rate: f64,
}

/// Unreliable provider used by the standalone service.
pub struct SimulatedEnrichment {
    config: SimulatedEnrichmentConfig,
    requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
}

impl SimulatedEnrichment {
    /// Create a provider with the given behavior.
    pub fn new(config: SimulatedEnrichmentConfig) -> Self {
        Self {
            config,
            requests: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Snapshot of the request counters.
    pub fn stats(&self) -> EnrichmentStats {
        let total_requests = self.requests.load(Ordering::Relaxed);
        let successful = self.successes.load(Ordering::Relaxed);
        let failed = self.failures.load(Ordering::Relaxed);
        let rate = successful as f64 / total_requests.max(1) as f64 * 100.0;
        EnrichmentStats {
            total_requests,
            successful,
            failed,
            success_rate: (rate * 100.0).round() / 100.0,
        }
    }

    fn roll(&self) -> (Duration, bool) {
        let mut rng = rand::thread_rng();
        let min = self.config.min_latency.as_millis() as u64;
        let max = (self.config.max_latency.as_millis() as u64).max(min);
        let latency = Duration::from_millis(rng.gen_range(min..=max));
        let fails = rng.gen_bool(self.config.failure_rate.clamp(0.0, 1.0));
        (latency, fails)
    }
}

/// Templated transcription; the segment count is the number of `_`-separated parts.
fn transcribe(call_id: &str, payload: &str) -> String {
    let template = TEMPLATES[rand::thread_rng().gen_range(0..TEMPLATES.len())];
    let segments = payload.split('_').count();
    format!(
        "{} Audio processed: {} segments analyzed.",
        template.replace("{call}", call_id),
        segments
    )
}

fn pick_sentiment() -> &'static str {
    let mut roll: f64 = rand::thread_rng().gen_range(0.0..1.0);
    for (label, weight) in SENTIMENTS {
        if roll < weight {
            return label;
        }
        roll -= weight;
    }
    SENTIMENTS[SENTIMENTS.len() - 1].0
}

#[async_trait]
impl Enrichment for SimulatedEnrichment {
    fn provider_name(&self) -> &'static str {
        "simulated"
    }

    async fn process(
        &self,
        call_id: &str,
        combined_payload: &str,
    ) -> Result<EnrichmentResult, EnrichmentError> {
        let request_id = self.requests.fetch_add(1, Ordering::Relaxed) + 1;
        info!(request_id, call_id = %call_id, "Enrichment request");

        let (latency, fails) = self.roll();
        tokio::time::sleep(latency).await;

        if fails {
            let failed = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
            error!(
                request_id,
                call_id = %call_id,
                latency_ms = latency.as_millis() as u64,
                failed,
                total = request_id,
                "Enrichment request failed"
            );
            return Err(EnrichmentError::Transient(UNAVAILABLE.to_string()));
        }

        self.successes.fetch_add(1, Ordering::Relaxed);
        let result = EnrichmentResult {
            transcription: transcribe(call_id, combined_payload),
            sentiment: pick_sentiment().to_string(),
        };
        info!(
            request_id,
            call_id = %call_id,
            latency_ms = latency.as_millis() as u64,
            sentiment = %result.sentiment,
            "Enrichment request succeeded"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instant(failure_rate: f64) -> SimulatedEnrichment {
        SimulatedEnrichment::new(SimulatedEnrichmentConfig {
            failure_rate,
            min_latency: Duration::ZERO,
            max_latency: Duration::ZERO,
        })
    }

    #[tokio::test]
    async fn test_never_failing_provider() {
        let provider = instant(0.0);
        let result = provider
            .process("CALL-1", "packet_0 packet_1")
            .await
            .unwrap();

        assert!(result.transcription.contains("CALL-1"));
        assert!(
            result
                .transcription
                .ends_with("Audio processed: 3 segments analyzed.")
        );
        assert!(SENTIMENTS.iter().any(|(s, _)| *s == result.sentiment));

        let stats = provider.stats();
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.successful, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.success_rate, 100.0);
    }

    #[tokio::test]
    async fn test_always_failing_provider() {
        let provider = instant(1.0);
        for _ in 0..3 {
            let err = provider.process("CALL-2", "data").await.unwrap_err();
            assert_eq!(err, EnrichmentError::Transient(UNAVAILABLE.to_string()));
        }

        let stats = provider.stats();
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.failed, 3);
        assert_eq!(stats.success_rate, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_within_bounds() {
        let provider = SimulatedEnrichment::new(SimulatedEnrichmentConfig {
            failure_rate: 0.0,
            min_latency: Duration::from_millis(100),
            max_latency: Duration::from_millis(200),
        });
        let started = tokio::time::Instant::now();
        provider.process("CALL-3", "x").await.unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed <= Duration::from_millis(200));
    }

    #[test]
    fn test_sentiment_weights_sum_to_one() {
        let total: f64 = SENTIMENTS.iter().map(|(_, w)| w).sum();
        assert!((total - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_stats_with_no_requests() {
        let stats = instant(0.0).stats();
        assert_eq!(stats.total_requests, 0);
        assert_eq!(stats.success_rate, 0.0);
    }
}
