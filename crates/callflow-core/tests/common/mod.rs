// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for callflow-core integration tests.
//!
//! Provides TestContext wiring an in-memory store, the call service, a
//! subscribed notification bus, and a processor backed by a mock provider.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use uuid::Uuid;

use callflow_core::calls::{CallService, PacketInput};
use callflow_core::enrichment::MockEnrichment;
use callflow_core::notifications::{BroadcastBus, CallEvent};
use callflow_core::persistence::{Persistence, SqlitePersistence};
use callflow_core::processor::{CallProcessor, CallProcessorConfig};
use callflow_core::retry::RetryPolicy;

/// Test context that manages the store, service, and event stream.
pub struct TestContext {
    pub store: SqlitePersistence,
    pub persistence: Arc<dyn Persistence>,
    pub bus: Arc<BroadcastBus>,
    pub events: broadcast::Receiver<CallEvent>,
    pub service: CallService,
}

impl TestContext {
    /// Create a context over a fresh in-memory database.
    pub async fn new() -> Self {
        let store = SqlitePersistence::connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory store");
        let persistence: Arc<dyn Persistence> = Arc::new(store.clone());
        let bus = Arc::new(BroadcastBus::new(256));
        let events = bus.subscribe();
        let service = CallService::new(persistence.clone(), bus.clone());

        Self {
            store,
            persistence,
            bus,
            events,
            service,
        }
    }

    /// Processor over this context's store with a fast retry policy.
    pub fn processor(&self, enrichment: Arc<MockEnrichment>, max_attempts: u32) -> CallProcessor {
        self.processor_with(enrichment, fast_config(max_attempts))
    }

    /// Processor over this context's store with an explicit config.
    pub fn processor_with(
        &self,
        enrichment: Arc<MockEnrichment>,
        config: CallProcessorConfig,
    ) -> CallProcessor {
        CallProcessor::new(self.persistence.clone(), enrichment, self.bus.clone(), config)
    }

    /// Ingest `sequence` with payload `p{sequence}`.
    pub async fn send(&self, call_id: &str, sequence: i64) {
        self.service
            .ingest_packet(call_id, packet(sequence, &format!("p{}", sequence)))
            .await
            .expect("Failed to ingest packet");
    }

    /// Drain every event published so far.
    pub fn drain_events(&mut self) -> Vec<CallEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

/// Processor config with millisecond backoff.
pub fn fast_config(max_attempts: u32) -> CallProcessorConfig {
    CallProcessorConfig {
        poll_interval: Duration::from_millis(20),
        batch_size: 100,
        retry: RetryPolicy::new(max_attempts, Duration::from_millis(1), Duration::from_millis(5)),
        stale_claim_after: Duration::from_secs(300),
    }
}

/// Build a valid packet.
pub fn packet(sequence: i64, payload: &str) -> PacketInput {
    PacketInput {
        sequence,
        payload: payload.to_string(),
        client_timestamp: 1_700_000_000.0 + sequence as f64,
    }
}

/// Unique call ID for a test.
pub fn call_id(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4())
}
