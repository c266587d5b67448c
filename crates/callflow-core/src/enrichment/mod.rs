// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Enrichment providers (transcription and sentiment).
//!
//! The processor only relies on the [`Enrichment`] contract: a result, or an
//! [`EnrichmentError`] whose [`Transient`](EnrichmentError::Transient) variant
//! is the only retryable failure.

mod mock;
mod simulated;

pub use mock::{MockEnrichment, MockOutcome, MockRequest};
pub use simulated::{EnrichmentStats, SimulatedEnrichment, SimulatedEnrichmentConfig};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::retry::Retryable;

/// Output of a successful enrichment call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentResult {
    /// Transcribed text.
    pub transcription: String,
    /// Sentiment label.
    pub sentiment: String,
}

/// Enrichment failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnrichmentError {
    /// The provider is temporarily unavailable; another attempt may succeed.
    #[error("transient enrichment failure: {0}")]
    Transient(String),

    /// The provider rejected the request; retrying will not help.
    #[error("enrichment failure: {0}")]
    Permanent(String),
}

impl Retryable for EnrichmentError {
    fn is_retryable(&self) -> bool {
        matches!(self, EnrichmentError::Transient(_))
    }
}

/// Transcription and sentiment provider.
#[async_trait]
pub trait Enrichment: Send + Sync {
    /// Short name used in logs.
    fn provider_name(&self) -> &'static str;

    /// Enrich the combined payload of call `call_id`.
    async fn process(
        &self,
        call_id: &str,
        combined_payload: &str,
    ) -> Result<EnrichmentResult, EnrichmentError>;
}
