// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Call ingestion, completion, and query operations.
//!
//! These run on the fast path. None of them waits on enrichment; they only
//! touch the store and publish best-effort notifications.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::error::{CoreError, Result};
use crate::notifications::{CallEvent, NotificationBus};
use crate::persistence::{CallRecord, PacketWrite, Persistence};
use crate::sequence::{Arrival, LatePacketPolicy, SequenceTracker};
use crate::state_machine::{CallStateMachine, CallStatus};

/// Optimistic write attempts per operation before giving up.
const MAX_WRITE_ATTEMPTS: usize = 16;

/// Default result cap for [`CallService::list_calls`].
pub const DEFAULT_LIST_LIMIT: i64 = 100;

/// Largest accepted result cap for [`CallService::list_calls`].
pub const MAX_LIST_LIMIT: i64 = 1000;

/// One inbound packet as received at the boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketInput {
    /// Sequence number, `>= 0`.
    pub sequence: i64,
    /// Non-empty payload.
    pub payload: String,
    /// Client timestamp in seconds, `> 0`.
    pub client_timestamp: f64,
}

impl PacketInput {
    /// Reject malformed packets before they reach the sequence tracker.
    pub fn validate(&self) -> Result<()> {
        if self.sequence < 0 {
            return Err(CoreError::validation("sequence", "must be >= 0"));
        }
        if self.payload.is_empty() {
            return Err(CoreError::validation("payload", "must not be empty"));
        }
        if !self.client_timestamp.is_finite() || self.client_timestamp <= 0.0 {
            return Err(CoreError::validation(
                "client_timestamp",
                "must be a positive number",
            ));
        }
        Ok(())
    }
}

/// How a packet was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Arrived in order.
    Accepted,
    /// Stored, but arrived out of order or as a duplicate.
    AcceptedWithWarning,
}

/// Acknowledgement of a stored packet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestReceipt {
    /// External call ID.
    pub call_id: String,
    /// Stored packet ID.
    pub packet_id: i64,
    /// Sequence number the packet carried.
    pub sequence: i64,
    /// Whether the packet carried exactly the expected sequence.
    pub in_order: bool,
    /// Boundary status string.
    pub disposition: Disposition,
    /// Server receive time.
    pub received_at: DateTime<Utc>,
}

/// A call with its packet count.
#[derive(Debug, Clone, Serialize)]
pub struct CallDetail {
    /// The call row.
    #[serde(flatten)]
    pub call: CallRecord,
    /// Stored packets, duplicates included.
    pub packets_count: i64,
}

impl CallDetail {
    /// Missing sequences in ascending order.
    pub fn missing_sequences(&self) -> Vec<i64> {
        self.call.missing_sequences.to_vec()
    }
}

/// Ingestion, completion, and query operations over a [`Persistence`] backend.
pub struct CallService {
    persistence: Arc<dyn Persistence>,
    notifications: Arc<dyn NotificationBus>,
    tracker: SequenceTracker,
}

impl CallService {
    /// Create a service that keeps late packets listed as missing.
    pub fn new(persistence: Arc<dyn Persistence>, notifications: Arc<dyn NotificationBus>) -> Self {
        Self {
            persistence,
            notifications,
            tracker: SequenceTracker::default(),
        }
    }

    /// Use `policy` for late packets that fill a recorded gap.
    pub fn with_late_packet_policy(mut self, policy: LatePacketPolicy) -> Self {
        self.tracker = SequenceTracker::new(policy);
        self
    }

    /// Create the call if it does not exist yet. Idempotent.
    #[instrument(skip(self))]
    pub async fn open_call(&self, call_id: &str) -> Result<CallRecord> {
        validate_call_id(call_id)?;
        let (call, created) = self.persistence.create_call_if_absent(call_id).await?;
        if created {
            info!("Created new call");
        }
        Ok(call)
    }

    /// Store one packet and fold it into the call's sequence state.
    ///
    /// Creates the call on its first packet. Concurrent packets for the same
    /// call are serialized by an optimistic version check; the losing writer
    /// re-reads and recomputes.
    ///
    /// # Errors
    ///
    /// - [`CoreError::ValidationError`] for malformed input, or for a sequence
    ///   that would overflow the cursor or leave more than
    ///   [`MAX_MISSING_SEQUENCES`](crate::sequence::MAX_MISSING_SEQUENCES)
    ///   sequences missing. Nothing is stored for a rejected packet.
    /// - [`CoreError::ConcurrentModification`] if every write attempt lost a race
    #[instrument(skip(self, packet), fields(sequence = packet.sequence))]
    pub async fn ingest_packet(&self, call_id: &str, packet: PacketInput) -> Result<IngestReceipt> {
        validate_call_id(call_id)?;
        packet.validate()?;

        let (mut call, created) = self.persistence.create_call_if_absent(call_id).await?;
        if created {
            info!("Created new call");
        }

        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let ingested = self
                .tracker
                .ingest(&call.sequence_state(), packet.sequence)
                .map_err(|rejected| {
                    warn!(error = %rejected, "Rejected packet");
                    CoreError::validation("sequence", rejected.to_string())
                })?;
            let write = PacketWrite {
                call_id: call_id.to_string(),
                observed_version: call.version,
                state: ingested.state,
                sequence: packet.sequence,
                payload: packet.payload.clone(),
                client_timestamp: packet.client_timestamp,
                received_at: Utc::now(),
            };

            if let Some(stored) = self.persistence.append_packet(&write).await? {
                log_arrival(&ingested.arrival, call.expected_sequence);
                let in_order = ingested.arrival.is_in_order();
                return Ok(IngestReceipt {
                    call_id: call_id.to_string(),
                    packet_id: stored.id,
                    sequence: stored.sequence,
                    in_order,
                    disposition: if in_order {
                        Disposition::Accepted
                    } else {
                        Disposition::AcceptedWithWarning
                    },
                    received_at: stored.received_at,
                });
            }

            debug!(attempt, "Call changed while ingesting packet, retrying");
            call = self
                .persistence
                .get_call(call_id)
                .await?
                .ok_or_else(|| CoreError::CallNotFound {
                    call_id: call_id.to_string(),
                })?;
        }

        warn!("Giving up on packet after repeated concurrent modifications");
        Err(CoreError::ConcurrentModification {
            call_id: call_id.to_string(),
        })
    }

    /// Mark a call as completed, making it eligible for enrichment.
    ///
    /// Completing an already completed call succeeds without changes.
    ///
    /// # Errors
    ///
    /// - [`CoreError::CallNotFound`] if the call does not exist
    /// - [`CoreError::InvalidTransition`] if the call is Failed or Archived
    #[instrument(skip(self))]
    pub async fn complete_call(&self, call_id: &str) -> Result<CallRecord> {
        self.move_call(call_id, CallStatus::Completed).await
    }

    /// Archive a call. Legal from Completed, ProcessingEnrichment, and Failed.
    #[instrument(skip(self))]
    pub async fn archive_call(&self, call_id: &str) -> Result<CallRecord> {
        self.move_call(call_id, CallStatus::Archived).await
    }

    /// Fetch a call with its packet count.
    pub async fn get_call(&self, call_id: &str) -> Result<CallDetail> {
        let call = self.require_call(call_id).await?;
        let packets_count = self.persistence.count_packets(call_id).await?;
        Ok(CallDetail {
            call,
            packets_count,
        })
    }

    /// Most recently updated calls, optionally filtered by status.
    ///
    /// `limit` defaults to [`DEFAULT_LIST_LIMIT`] and is clamped to `1..=MAX_LIST_LIMIT`.
    pub async fn list_calls(
        &self,
        status: Option<CallStatus>,
        limit: Option<i64>,
    ) -> Result<Vec<CallRecord>> {
        let limit = limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT);
        self.persistence.list_calls(status, limit).await
    }

    async fn require_call(&self, call_id: &str) -> Result<CallRecord> {
        self.persistence
            .get_call(call_id)
            .await?
            .ok_or_else(|| CoreError::CallNotFound {
                call_id: call_id.to_string(),
            })
    }

    /// Validate and apply `to`, re-reading if the status moved underneath us.
    async fn move_call(&self, call_id: &str, to: CallStatus) -> Result<CallRecord> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let call = self.require_call(call_id).await?;
            let transition = CallStateMachine::transition(call_id, call.status, to)?;

            if transition.is_noop() {
                info!(status = %to, "Call already in requested status");
                return Ok(call);
            }

            if self
                .persistence
                .apply_transition(call_id, &transition, None)
                .await?
            {
                info!(from = %transition.from(), to = %to, "Call status changed");
                self.notifications
                    .publish(CallEvent::call_update(call_id, to, None));
                return self.require_call(call_id).await;
            }

            debug!(observed = %call.status, "Call status changed concurrently, retrying");
        }

        Err(CoreError::ConcurrentModification {
            call_id: call_id.to_string(),
        })
    }
}

fn validate_call_id(call_id: &str) -> Result<()> {
    if call_id.trim().is_empty() {
        return Err(CoreError::validation("call_id", "must not be empty"));
    }
    Ok(())
}

fn log_arrival(arrival: &Arrival, expected: i64) {
    match *arrival {
        Arrival::InOrder => {}
        Arrival::Gap {
            first_missing,
            received,
        } => {
            warn!(
                first_missing,
                last_missing = received - 1,
                count = received - first_missing,
                expected,
                received,
                "Missing packets detected"
            );
        }
        Arrival::Late { filled_gap } => {
            warn!(expected, filled_gap, "Late or duplicate packet received");
        }
    }
}
