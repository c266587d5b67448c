// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::str::FromStr;
use std::time::Duration;

use crate::enrichment::SimulatedEnrichmentConfig;
use crate::processor::CallProcessorConfig;
use crate::retry::RetryPolicy;
use crate::sequence::LatePacketPolicy;

/// Callflow Core configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL
    pub database_url: String,
    /// Delay between processor poll cycles
    pub poll_interval: Duration,
    /// Maximum calls claimed per poll cycle
    pub batch_size: i64,
    /// Enrichment retry policy
    pub retry: RetryPolicy,
    /// Simulated enrichment provider behavior
    pub enrichment: SimulatedEnrichmentConfig,
    /// What late packets do to the missing set
    pub late_packet_policy: LatePacketPolicy,
    /// Age after which a ProcessingEnrichment claim is treated as abandoned
    pub stale_claim_after: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `CALLFLOW_DATABASE_URL`: SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `CALLFLOW_POLL_INTERVAL_SECS`: processor poll interval (default: 5)
    /// - `CALLFLOW_BATCH_SIZE`: calls per poll cycle (default: 100)
    /// - `CALLFLOW_MAX_RETRY_ATTEMPTS`: enrichment attempts per call (default: 5)
    /// - `CALLFLOW_RETRY_INITIAL_WAIT_MS`: first backoff wait (default: 1000)
    /// - `CALLFLOW_RETRY_MAX_WAIT_MS`: backoff cap (default: 60000)
    /// - `CALLFLOW_RETRY_MULTIPLIER`: backoff growth factor (default: 2)
    /// - `CALLFLOW_ENRICHMENT_FAILURE_RATE`: simulated failure probability (default: 0.25)
    /// - `CALLFLOW_ENRICHMENT_MIN_LATENCY_MS` / `_MAX_LATENCY_MS`: simulated latency (default: 1000 / 3000)
    /// - `CALLFLOW_RECONCILE_LATE_PACKETS`: remove filled gaps from the missing set (default: false)
    /// - `CALLFLOW_STALE_CLAIM_SECS`: abandoned-claim age (default: 300); must
    ///   exceed the longest run of one call, every backoff wait plus the
    ///   maximum latency for each attempt
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("CALLFLOW_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("CALLFLOW_DATABASE_URL"))?;

        let poll_interval_secs: u64 = parse_or(
            "CALLFLOW_POLL_INTERVAL_SECS",
            5,
            "must be a non-negative integer",
        )?;

        let batch_size: i64 = parse_or("CALLFLOW_BATCH_SIZE", 100, "must be a positive integer")?;
        if batch_size < 1 {
            return Err(ConfigError::Invalid(
                "CALLFLOW_BATCH_SIZE",
                "must be a positive integer",
            ));
        }

        let max_attempts: u32 = parse_or(
            "CALLFLOW_MAX_RETRY_ATTEMPTS",
            5,
            "must be a positive integer",
        )?;
        if max_attempts < 1 {
            return Err(ConfigError::Invalid(
                "CALLFLOW_MAX_RETRY_ATTEMPTS",
                "must be a positive integer",
            ));
        }

        let initial_wait_ms: u64 = parse_or(
            "CALLFLOW_RETRY_INITIAL_WAIT_MS",
            1000,
            "must be a non-negative integer",
        )?;
        let max_wait_ms: u64 = parse_or(
            "CALLFLOW_RETRY_MAX_WAIT_MS",
            60_000,
            "must be a non-negative integer",
        )?;

        let multiplier: u32 =
            parse_or("CALLFLOW_RETRY_MULTIPLIER", 2, "must be a positive integer")?;
        if multiplier < 1 {
            return Err(ConfigError::Invalid(
                "CALLFLOW_RETRY_MULTIPLIER",
                "must be a positive integer",
            ));
        }

        let failure_rate: f64 = parse_or(
            "CALLFLOW_ENRICHMENT_FAILURE_RATE",
            0.25,
            "must be a number between 0 and 1",
        )?;
        if !(0.0..=1.0).contains(&failure_rate) {
            return Err(ConfigError::Invalid(
                "CALLFLOW_ENRICHMENT_FAILURE_RATE",
                "must be a number between 0 and 1",
            ));
        }

        let min_latency_ms: u64 = parse_or(
            "CALLFLOW_ENRICHMENT_MIN_LATENCY_MS",
            1000,
            "must be a non-negative integer",
        )?;
        let max_latency_ms: u64 = parse_or(
            "CALLFLOW_ENRICHMENT_MAX_LATENCY_MS",
            3000,
            "must be a non-negative integer",
        )?;
        if max_latency_ms < min_latency_ms {
            return Err(ConfigError::Invalid(
                "CALLFLOW_ENRICHMENT_MAX_LATENCY_MS",
                "must not be lower than CALLFLOW_ENRICHMENT_MIN_LATENCY_MS",
            ));
        }

        let reconcile: bool = parse_or(
            "CALLFLOW_RECONCILE_LATE_PACKETS",
            false,
            "must be true or false",
        )?;

        let stale_claim_secs: u64 = parse_or(
            "CALLFLOW_STALE_CLAIM_SECS",
            300,
            "must be a non-negative integer",
        )?;

        let retry = RetryPolicy::new(
            max_attempts,
            Duration::from_millis(initial_wait_ms),
            Duration::from_millis(max_wait_ms),
        )
        .with_multiplier(multiplier);

        let stale_claim_after = Duration::from_secs(stale_claim_secs);
        let longest_run = retry.total_wait().saturating_add(
            Duration::from_millis(max_latency_ms).saturating_mul(max_attempts),
        );
        if stale_claim_after <= longest_run {
            return Err(ConfigError::Invalid(
                "CALLFLOW_STALE_CLAIM_SECS",
                "must exceed the longest possible enrichment run",
            ));
        }

        Ok(Self {
            database_url,
            poll_interval: Duration::from_secs(poll_interval_secs),
            batch_size,
            retry,
            enrichment: SimulatedEnrichmentConfig {
                failure_rate,
                min_latency: Duration::from_millis(min_latency_ms),
                max_latency: Duration::from_millis(max_latency_ms),
            },
            late_packet_policy: if reconcile {
                LatePacketPolicy::Reconcile
            } else {
                LatePacketPolicy::Retain
            },
            stale_claim_after,
        })
    }

    /// Processor settings derived from this configuration.
    pub fn processor_config(&self) -> CallProcessorConfig {
        CallProcessorConfig {
            poll_interval: self.poll_interval,
            batch_size: self.batch_size,
            retry: self.retry.clone(),
            stale_claim_after: self.stale_claim_after,
        }
    }
}

/// Parse `key` if set, otherwise return `default`.
fn parse_or<T: FromStr>(
    key: &'static str,
    default: T,
    expectation: &'static str,
) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(key, expectation)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
