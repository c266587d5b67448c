// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background enrichment processor.
//!
//! Periodically polls for completed calls that have not been enriched,
//! claims each one by moving it to ProcessingEnrichment, sends the combined
//! packet payload to the enrichment provider under the retry policy, and
//! records the outcome.
//!
//! A claim is a conditional status write that hands out a new claim
//! generation. Every later write for that call is fenced on the generation,
//! and the owner refreshes the claim while the provider works, so a live
//! claim is never released by another processor's stale-claim sweep. Claims
//! that stop being refreshed (process killed mid-enrichment) are released
//! back to Completed after `stale_claim_after`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::enrichment::{Enrichment, EnrichmentError};
use crate::error::{CoreError, Result};
use crate::notifications::{CallEvent, NotificationBus};
use crate::persistence::{CallRecord, EnrichmentUpdate, PacketRecord, Persistence};
use crate::retry::{RetryError, RetryPolicy, retry_with_backoff};
use crate::state_machine::{CallStateMachine, CallStatus};

/// Call processor configuration.
#[derive(Debug, Clone)]
pub struct CallProcessorConfig {
    /// How often to poll for completed calls
    pub poll_interval: Duration,
    /// Maximum calls to process per poll
    pub batch_size: i64,
    /// Enrichment retry policy
    pub retry: RetryPolicy,
    /// Claims not refreshed for this long are released back to Completed
    pub stale_claim_after: Duration,
}

impl CallProcessorConfig {
    /// How often a live claim is refreshed while the provider works.
    pub fn heartbeat_interval(&self) -> Duration {
        (self.stale_claim_after / 4).max(Duration::from_millis(1))
    }
}

impl Default for CallProcessorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 100,
            retry: RetryPolicy::default(),
            stale_claim_after: Duration::from_secs(300),
        }
    }
}

/// What happened to one eligible call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// Another writer changed the call first; nothing was done.
    Skipped,
    /// Enrichment succeeded and the call is back in Completed.
    Enriched,
    /// The call ended in Failed.
    Failed,
    /// The claim was lost during enrichment, so the result was discarded.
    /// Provider calls already made are still added to the attempt count.
    Superseded,
}

/// Summary of one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Abandoned claims released back to Completed.
    pub recovered: usize,
    /// Calls found eligible.
    pub eligible: usize,
    /// Calls enriched successfully.
    pub enriched: usize,
    /// Calls that ended in Failed.
    pub failed: usize,
    /// Calls skipped because their claim failed or was superseded.
    pub skipped: usize,
}

/// Processor counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessorStats {
    /// Whether [`CallProcessor::run`] is active.
    pub running: bool,
    /// Poll cycles completed.
    pub cycles: u64,
    /// Calls claimed and driven to an outcome.
    pub processed: u64,
    /// Calls enriched successfully.
    pub enriched: u64,
    /// Calls that ended in Failed.
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    cycles: AtomicU64,
    processed: AtomicU64,
    enriched: AtomicU64,
    failed: AtomicU64,
}

/// Enrichment processor that runs as a background task.
pub struct CallProcessor {
    persistence: Arc<dyn Persistence>,
    enrichment: Arc<dyn Enrichment>,
    notifications: Arc<dyn NotificationBus>,
    config: CallProcessorConfig,
    shutdown: Notify,
    stop_requested: AtomicBool,
    running: AtomicBool,
    counters: Counters,
}

impl CallProcessor {
    /// Create a new call processor.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        enrichment: Arc<dyn Enrichment>,
        notifications: Arc<dyn NotificationBus>,
        config: CallProcessorConfig,
    ) -> Self {
        Self {
            persistence,
            enrichment,
            notifications,
            config,
            shutdown: Notify::new(),
            stop_requested: AtomicBool::new(false),
            running: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    /// Ask [`run`](Self::run) to exit.
    ///
    /// A call that is being reconciled is finished first; calls not yet
    /// claimed in the current cycle are left for the next run.
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.shutdown.notify_one();
    }

    /// Snapshot of the processor counters.
    pub fn stats(&self) -> ProcessorStats {
        ProcessorStats {
            running: self.running.load(Ordering::SeqCst),
            cycles: self.counters.cycles.load(Ordering::Relaxed),
            processed: self.counters.processed.load(Ordering::Relaxed),
            enriched: self.counters.enriched.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Run the processor loop until [`stop`](Self::stop) is called.
    pub async fn run(&self) {
        self.running.store(true, Ordering::SeqCst);
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            batch_size = self.config.batch_size,
            max_attempts = self.config.retry.max_attempts,
            provider = self.enrichment.provider_name(),
            "Call processor started"
        );

        // Poll first, then wait; the sweep runs at the start of every cycle
        loop {
            if self.stop_requested.load(Ordering::SeqCst) {
                break;
            }
            if let Err(e) = self.run_once().await {
                error!(error = %e, "Failed to process completed calls");
            }
            tokio::select! {
                biased;
                _ = self.shutdown.notified() => {
                    break;
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!("Call processor shutting down");
    }

    /// Run a single poll cycle.
    pub async fn run_once(&self) -> Result<CycleReport> {
        let mut report = CycleReport {
            recovered: self.recover_stale_claims().await?,
            ..CycleReport::default()
        };

        let calls = self
            .persistence
            .calls_awaiting_enrichment(self.config.batch_size)
            .await?;
        report.eligible = calls.len();
        info!(count = calls.len(), "Polled for completed calls");

        for call in calls {
            if self.stop_requested.load(Ordering::SeqCst) {
                info!("Stop requested, leaving remaining calls for the next run");
                break;
            }

            match self.process_call(&call).await {
                CallOutcome::Enriched => report.enriched += 1,
                CallOutcome::Failed => report.failed += 1,
                CallOutcome::Skipped | CallOutcome::Superseded => report.skipped += 1,
            }
        }

        self.counters.cycles.fetch_add(1, Ordering::Relaxed);
        Ok(report)
    }

    /// Claim, enrich, and reconcile one call. Never returns an error; every
    /// failure ends in a logged outcome.
    pub async fn process_call(&self, call: &CallRecord) -> CallOutcome {
        let call_id = call.external_id.as_str();

        let claim = match CallStateMachine::transition(
            call_id,
            call.status,
            CallStatus::ProcessingEnrichment,
        ) {
            Ok(claim) if !claim.is_noop() => claim,
            Ok(_) | Err(_) => {
                debug!(call_id = %call_id, status = %call.status, "Call not claimable");
                return CallOutcome::Skipped;
            }
        };

        let claim = match self.persistence.claim_call(call_id, &claim).await {
            Ok(Some(generation)) => generation,
            Ok(None) => {
                debug!(call_id = %call_id, "Call claimed or changed by another writer, skipping");
                return CallOutcome::Skipped;
            }
            Err(e) => {
                error!(call_id = %call_id, error = %e, "Failed to claim call");
                return CallOutcome::Skipped;
            }
        };

        info!(call_id = %call_id, claim, "Claimed call for enrichment");
        self.notifications.publish(CallEvent::call_update(
            call_id,
            CallStatus::ProcessingEnrichment,
            None,
        ));

        let outcome = match self.enrich(call_id, claim).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(call_id = %call_id, error = %e, "Unexpected error while processing call");
                self.fail_unexpected(call_id, claim, &e).await
            }
        };

        self.counters.processed.fetch_add(1, Ordering::Relaxed);
        match outcome {
            CallOutcome::Enriched => {
                self.counters.enriched.fetch_add(1, Ordering::Relaxed);
            }
            CallOutcome::Failed => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
            }
            CallOutcome::Skipped | CallOutcome::Superseded => {}
        }
        outcome
    }

    /// Send the combined payload to the provider and record the outcome.
    ///
    /// The claim is refreshed every [`CallProcessorConfig::heartbeat_interval`]
    /// while the provider works. If a refresh finds the claim gone, the
    /// provider call is dropped and only its attempts are recorded.
    async fn enrich(&self, call_id: &str, claim: i64) -> Result<CallOutcome> {
        let packets = self.persistence.packets_for_call(call_id).await?;
        let payload = combine_payloads(packets);
        debug!(
            call_id = %call_id,
            payload_len = payload.len(),
            "Sending combined payload to enrichment"
        );

        let enrichment = &self.enrichment;
        let combined = payload.as_str();
        let started = AtomicU32::new(0);
        let started_ref = &started;
        let work = retry_with_backoff(
            &self.config.retry,
            move |attempt| {
                started_ref.store(attempt, Ordering::Relaxed);
                enrichment.process(call_id, combined)
            },
            |attempt, err: &EnrichmentError, wait| {
                warn!(
                    call_id = %call_id,
                    attempt,
                    wait_ms = wait.as_millis() as u64,
                    error = %err,
                    "Enrichment attempt failed, retrying"
                );
            },
        );
        tokio::pin!(work);

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick fires immediately
        heartbeat.tick().await;

        let result = loop {
            tokio::select! {
                result = &mut work => break result,
                _ = heartbeat.tick() => {
                    match self.persistence.touch_claim(call_id, claim).await {
                        Ok(true) => {}
                        Ok(false) => {
                            let attempts = started.load(Ordering::Relaxed);
                            warn!(
                                call_id = %call_id,
                                attempts,
                                "Enrichment claim lost, abandoning provider call"
                            );
                            self.persistence.record_attempts(call_id, attempts).await?;
                            return Ok(CallOutcome::Superseded);
                        }
                        Err(e) => {
                            warn!(call_id = %call_id, error = %e, "Failed to refresh enrichment claim");
                        }
                    }
                }
            }
        };

        match result {
            Ok(retried) => {
                let done = CallStateMachine::transition(
                    call_id,
                    CallStatus::ProcessingEnrichment,
                    CallStatus::Completed,
                )?;
                let update = EnrichmentUpdate::Enriched {
                    transcription: retried.value.transcription.clone(),
                    sentiment: retried.value.sentiment.clone(),
                    attempts: retried.attempts,
                    enriched_at: Utc::now(),
                };
                if !self
                    .persistence
                    .finish_enrichment(call_id, claim, &done, &update)
                    .await?
                {
                    warn!(
                        call_id = %call_id,
                        attempts = retried.attempts,
                        "Enrichment claim lost, discarding result"
                    );
                    return Ok(CallOutcome::Superseded);
                }

                info!(
                    call_id = %call_id,
                    attempts = retried.attempts,
                    sentiment = %retried.value.sentiment,
                    "Enriched call"
                );
                self.notifications.publish(CallEvent::ai_result(
                    call_id,
                    retried.value.transcription,
                    retried.value.sentiment,
                ));
                self.notifications.publish(CallEvent::call_update(
                    call_id,
                    CallStatus::Completed,
                    None,
                ));
                Ok(CallOutcome::Enriched)
            }
            Err(failure) => self.fail_enrichment(call_id, claim, failure).await,
        }
    }

    async fn fail_enrichment(
        &self,
        call_id: &str,
        claim: i64,
        failure: RetryError<EnrichmentError>,
    ) -> Result<CallOutcome> {
        let message = if failure.exhausted {
            format!(
                "Enrichment failed after {} attempts: {}",
                failure.attempts, failure.error
            )
        } else {
            format!("Enrichment failed: {}", failure.error)
        };

        let fail = CallStateMachine::transition(
            call_id,
            CallStatus::ProcessingEnrichment,
            CallStatus::Failed,
        )?;
        let update = EnrichmentUpdate::Failed {
            attempts: failure.attempts,
            error_message: message.clone(),
        };
        if !self
            .persistence
            .finish_enrichment(call_id, claim, &fail, &update)
            .await?
        {
            warn!(
                call_id = %call_id,
                attempts = failure.attempts,
                "Enrichment claim lost, discarding failure"
            );
            return Ok(CallOutcome::Superseded);
        }

        error!(
            call_id = %call_id,
            attempts = failure.attempts,
            error = %failure.error,
            "Enrichment failed"
        );
        self.publish_failed(call_id, &message, Some(failure.attempts));
        Ok(CallOutcome::Failed)
    }

    /// Best-effort move to Failed after a non-enrichment error.
    async fn fail_unexpected(&self, call_id: &str, claim: i64, cause: &CoreError) -> CallOutcome {
        let message = format!("Unexpected error: {}", cause);
        let fail = match CallStateMachine::transition(
            call_id,
            CallStatus::ProcessingEnrichment,
            CallStatus::Failed,
        ) {
            Ok(t) => t,
            Err(e) => {
                error!(call_id = %call_id, error = %e, "Failed to mark call as failed");
                return CallOutcome::Skipped;
            }
        };

        match self
            .persistence
            .release_claim(call_id, claim, &fail, Some(&message))
            .await
        {
            Ok(true) => {
                self.publish_failed(call_id, &message, None);
                CallOutcome::Failed
            }
            Ok(false) => {
                warn!(call_id = %call_id, "Enrichment claim lost before the call could be failed");
                CallOutcome::Superseded
            }
            Err(e) => {
                // Left claimed; the stale-claim sweep releases it later
                error!(call_id = %call_id, error = %e, "Failed to mark call as failed");
                CallOutcome::Skipped
            }
        }
    }

    fn publish_failed(&self, call_id: &str, message: &str, attempts: Option<u32>) {
        let mut data = Map::new();
        data.insert("error".to_string(), Value::from(message));
        if let Some(attempts) = attempts {
            data.insert("attempts".to_string(), Value::from(attempts));
        }
        self.notifications.publish(CallEvent::call_update(
            call_id,
            CallStatus::Failed,
            Some(data),
        ));
    }

    /// Release claims not refreshed for `stale_claim_after` back to Completed.
    ///
    /// Each release is fenced on the generation read with the stale row, so a
    /// claim refreshed or re-taken in the meantime is left alone.
    pub async fn recover_stale_claims(&self) -> Result<usize> {
        let age = chrono::Duration::from_std(self.config.stale_claim_after).map_err(|e| {
            CoreError::ValidationError {
                field: "stale_claim_after".to_string(),
                message: e.to_string(),
            }
        })?;
        let stale = self
            .persistence
            .stale_claims(Utc::now() - age, self.config.batch_size)
            .await?;

        let mut recovered = 0;
        for call in stale {
            let call_id = call.external_id.as_str();
            let release = CallStateMachine::transition(
                call_id,
                CallStatus::ProcessingEnrichment,
                CallStatus::Completed,
            )?;
            match self
                .persistence
                .release_claim(call_id, call.claim_generation, &release, None)
                .await
            {
                Ok(true) => {
                    warn!(
                        call_id = %call_id,
                        claimed_since = %call.updated_at,
                        "Released abandoned enrichment claim"
                    );
                    recovered += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    error!(call_id = %call_id, error = %e, "Failed to release abandoned claim");
                    // Continue with other claims
                }
            }
        }

        Ok(recovered)
    }
}

/// Join payloads in sequence order, separated by a single space.
///
/// Duplicates are kept; equal sequences keep their arrival order.
pub fn combine_payloads(mut packets: Vec<PacketRecord>) -> String {
    packets.sort_by_key(|p| p.sequence);
    packets
        .iter()
        .map(|p| p.payload.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(id: i64, sequence: i64, payload: &str) -> PacketRecord {
        PacketRecord {
            id,
            call_id: "CALL-1".to_string(),
            sequence,
            payload: payload.to_string(),
            client_timestamp: 1.0,
            received_at: Utc::now(),
        }
    }

    #[test]
    fn test_combine_payloads_in_sequence_order() {
        let packets = vec![
            packet(1, 2, "c"),
            packet(2, 0, "a"),
            packet(3, 1, "b"),
            packet(4, 0, "a2"),
        ];
        assert_eq!(combine_payloads(packets), "a a2 b c");
    }

    #[test]
    fn test_combine_no_packets() {
        assert_eq!(combine_payloads(Vec::new()), "");
    }

    #[test]
    fn test_processor_config_default() {
        let config = CallProcessorConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.stale_claim_after, Duration::from_secs(300));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(75));
    }

    #[test]
    fn test_heartbeat_interval_never_zero() {
        let config = CallProcessorConfig {
            stale_claim_after: Duration::ZERO,
            ..CallProcessorConfig::default()
        };
        assert_eq!(config.heartbeat_interval(), Duration::from_millis(1));
    }
}
