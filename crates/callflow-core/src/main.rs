// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Callflow Core - Call Lifecycle Engine
//!
//! Runs the enrichment processor against the configured database until
//! interrupted. Packet ingestion is driven by whatever embeds
//! `callflow_core::CallService`; this binary only hosts the background side.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use callflow_core::config::Config;
use callflow_core::enrichment::SimulatedEnrichment;
use callflow_core::notifications::BroadcastBus;
use callflow_core::persistence::{Persistence, SqlitePersistence};
use callflow_core::processor::CallProcessor;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("callflow_core=info")),
        )
        .init();

    info!("Starting Callflow Core");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        database_url = %config.database_url,
        poll_interval_secs = config.poll_interval.as_secs(),
        batch_size = config.batch_size,
        max_attempts = config.retry.max_attempts,
        late_packet_policy = ?config.late_packet_policy,
        "Configuration loaded"
    );

    info!("Connecting to database...");
    let store = SqlitePersistence::connect(&config.database_url).await?;
    store.health_check().await?;
    info!("Database health check passed");

    let pool = store.pool().clone();
    let persistence: Arc<dyn Persistence> = Arc::new(store);
    let bus = Arc::new(BroadcastBus::default());

    let enrichment = Arc::new(SimulatedEnrichment::new(config.enrichment.clone()));
    let processor = Arc::new(CallProcessor::new(
        persistence,
        enrichment.clone(),
        bus.clone(),
        config.processor_config(),
    ));

    let processor_handle = {
        let processor = processor.clone();
        tokio::spawn(async move { processor.run().await })
    };

    let mut events = bus.subscribe();
    let events_handle = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => info!(
                    call_id = %event.call_id,
                    event_type = event.event_type(),
                    "Call event"
                ),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    info!(skipped, "Event listener lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    info!("Callflow Core initialized successfully");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    processor.stop();
    if let Err(e) = processor_handle.await {
        error!("Processor task error: {}", e);
    }
    events_handle.abort();

    let stats = processor.stats();
    let provider = enrichment.stats();
    info!(
        cycles = stats.cycles,
        processed = stats.processed,
        enriched = stats.enriched,
        failed = stats.failed,
        provider_requests = provider.total_requests,
        provider_success_rate = provider.success_rate,
        "Processor stopped"
    );

    pool.close().await;
    info!("Shutdown complete");

    Ok(())
}
